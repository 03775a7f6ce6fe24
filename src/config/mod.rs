pub mod cli;
#[allow(clippy::module_inception)]
pub mod config;
pub mod limits;
pub mod settings;
pub mod types;

pub use config::{Config, ConfigError};
pub use limits::{LimitsError, LimitsTable, PurposeLimit};
pub use settings::{GatewayEndpoint, PoolSettings, RegistrySettings};
pub use types::LogLevel;
