pub mod allocation;
#[allow(clippy::module_inception)]
pub mod registry;
pub mod store;

pub use allocation::Allocation;
pub use registry::{ClientIdRegistry, CleanupReport, PurposeUsage, RegistryStats};
pub use store::{RegistryCounters, RegistryError};
