pub mod blocking;
pub mod health;
pub mod lease;
#[allow(clippy::module_inception)]
pub mod pool;
pub mod session;

pub use blocking::BlockingPool;
pub use health::HealthReport;
pub use lease::SessionLease;
pub use pool::{ConnectionPool, PoolStatus, PurposeStatus};
pub use session::{SessionInfo, SessionMetrics};
