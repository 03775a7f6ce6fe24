use serde::Deserialize;
use std::{path::PathBuf, time::Duration};

use super::types::de_duration;

// -----------------------------------------------------------------------------
// ----- GatewayEndpoint -------------------------------------------------------

/// Where the trading gateway listens and how patiently we dial it.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayEndpoint {
    pub host: String,
    pub port: u16,
    #[serde(deserialize_with = "de_duration")]
    pub connect_timeout: Duration,
    pub read_only: bool,
}

impl Default for GatewayEndpoint {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4002,
            connect_timeout: Duration::from_secs(30),
            read_only: true,
        }
    }
}

impl GatewayEndpoint {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// -----------------------------------------------------------------------------
// ----- PoolSettings ----------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Probe run before a reused session is handed out, and right after a
    /// fresh connect (silent-connection detection).
    #[serde(deserialize_with = "de_duration")]
    pub validation_timeout: Duration,

    #[serde(deserialize_with = "de_duration")]
    pub health_probe_timeout: Duration,

    #[serde(deserialize_with = "de_duration")]
    pub health_check_interval: Duration,

    #[serde(deserialize_with = "de_duration")]
    pub idle_timeout: Duration,

    pub max_health_failures: u32,

    /// Upper bound on waiting for a session to free up once a purpose is at cap.
    #[serde(deserialize_with = "de_duration")]
    pub acquire_timeout: Duration,

    /// How many ascending candidate ids a single creation attempt walks.
    pub candidate_span: u32,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            validation_timeout: Duration::from_secs(3),
            health_probe_timeout: Duration::from_secs(5),
            health_check_interval: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(5 * 60),
            max_health_failures: 3,
            acquire_timeout: Duration::from_secs(30),
            candidate_span: 20,
        }
    }
}

// -----------------------------------------------------------------------------
// ----- RegistrySettings ------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    /// JSON snapshot location. `None` keeps the registry in memory only.
    pub state_file: Option<PathBuf>,

    /// Inactive allocations unseen for longer than this are reclaimed.
    #[serde(deserialize_with = "de_duration")]
    pub stale_after: Duration,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            state_file: None,
            stale_after: Duration::from_secs(60 * 60),
        }
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
