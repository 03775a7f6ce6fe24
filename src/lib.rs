pub mod admin;
pub mod config;
pub mod errors;
pub mod metrics;
pub mod pool;
pub mod registry;
pub mod shared_types;
pub mod transport;

pub use config::Config;
pub use errors::PoolError;
pub use metrics::{MetricsSink, NoopMetrics, PoolMetrics};
pub use pool::{BlockingPool, ConnectionPool, SessionLease};
pub use registry::ClientIdRegistry;
pub use shared_types::{ClientId, Purpose, SessionState};
pub use transport::{TcpTransportFactory, TransportError, TransportFactory};
