use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use serde::Deserialize;
use std::{collections::HashMap, path::Path, sync::Arc};
use thiserror::Error;
use tokio::fs;

use super::{
    cli::CliConfig,
    limits::{LimitsError, LimitsFileEntry, LimitsTable},
    settings::{GatewayEndpoint, PoolSettings, RegistrySettings},
    types::LogLevel,
};

// -----------------------------------------------------------------------------
// ----- Global Singleton ------------------------------------------------------

static ROOT_CONFIG: OnceCell<Arc<RwLock<Config>>> = OnceCell::new();

// -----------------------------------------------------------------------------
// ----- Config ----------------------------------------------------------------

/// Process-wide configuration. Only the binary reads the singleton; library
/// components are handed the pieces they need.
#[derive(Clone, Debug)]
pub struct Config {
    pub log_level: LogLevel,
    pub gateway: GatewayEndpoint,
    pub pool: PoolSettings,
    pub registry: RegistrySettings,
    pub limits: LimitsTable,
}

// -----------------------------------------------------------------------------
// ----- Config: Static --------------------------------------------------------

impl Config {
    /// Async because the config file is read with non-blocking IO.
    /// Panics on any error: a bad limits table must stop startup.
    pub async fn init() {
        CliConfig::init();
        let cli = CliConfig::snapshot();

        let mut next = match &cli.config_file_location {
            Some(path) => Self::from_file_async(path)
                .await
                .unwrap_or_else(|e| panic!("failed to load config from {:?}: {e}", path)),
            None => Self::parse("").unwrap_or_else(|e| panic!("invalid default config: {e}")),
        };

        next.log_level = cli.log_level;
        if let Some(host) = cli.gateway_host {
            next.gateway.host = host;
        }
        if let Some(port) = cli.gateway_port {
            next.gateway.port = port;
        }
        if let Some(read_only) = cli.read_only {
            next.gateway.read_only = read_only;
        }
        if let Some(state_file) = cli.state_file_location {
            next.registry.state_file = Some(state_file);
        }

        if ROOT_CONFIG.set(Arc::new(RwLock::new(next))).is_err() {
            panic!("Config::init called twice");
        }
    }

    pub fn snapshot() -> Config {
        Self::handle().read().clone()
    }

    pub fn parse(raw: &str) -> Result<Config, ConfigError> {
        let doc: ConfigFile = toml::from_str(raw).map_err(|e| ConfigError::Toml { source: e })?;

        let limits = match doc.limits {
            Some(entries) => LimitsTable::from_file_entries(entries)?,
            None => LimitsTable::default(),
        };

        if doc.pool.max_health_failures == 0 {
            return Err(ConfigError::InvalidField("pool.max_health_failures".into()));
        }
        if doc.pool.candidate_span == 0 {
            return Err(ConfigError::InvalidField("pool.candidate_span".into()));
        }
        if doc.gateway.host.trim().is_empty() {
            return Err(ConfigError::InvalidField("gateway.host".into()));
        }

        Ok(Config {
            log_level: LogLevel::Info,
            gateway: doc.gateway,
            pool: doc.pool,
            registry: doc.registry,
            limits,
        })
    }
}

// -----------------------------------------------------------------------------
// ----- Config: Private -------------------------------------------------------

impl Config {
    async fn from_file_async(path: &Path) -> Result<Config, ConfigError> {
        let raw = fs::read_to_string(path).await.map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::parse(&raw)
    }

    fn handle() -> Arc<RwLock<Config>> {
        ROOT_CONFIG
            .get()
            .expect("Config not initialized; call Config::init().await first")
            .clone()
    }
}

// -----------------------------------------------------------------------------
// ----- Internal: On-disk format ----------------------------------------------

#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    gateway: GatewayEndpoint,
    #[serde(default)]
    pool: PoolSettings,
    #[serde(default)]
    registry: RegistrySettings,
    #[serde(default)]
    limits: Option<HashMap<String, LimitsFileEntry>>,
}

// -----------------------------------------------------------------------------
// ----- Errors ----------------------------------------------------------------

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read error for {path:?}: {source}")]
    Io {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[error("toml parse error: {source}")]
    Toml { source: toml::de::Error },

    #[error(transparent)]
    Limits(#[from] LimitsError),

    #[error("invalid or missing field '{0}'")]
    InvalidField(String),
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared_types::Purpose;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    fn write_tmp(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn empty_file_yields_defaults() {
        let cfg = Config::parse("").unwrap();
        assert_eq!(cfg.gateway.port, 4002);
        assert_eq!(cfg.pool.idle_timeout, Duration::from_secs(300));
        assert_eq!(cfg.pool.candidate_span, 20);
        assert_eq!(cfg.registry.stale_after, Duration::from_secs(3600));
        assert_eq!(cfg.limits, LimitsTable::default());
    }

    #[tokio::test]
    async fn parses_durations_and_limits() {
        let toml = r#"
            [gateway]
            host = "10.0.0.5"
            port = 7497
            connect_timeout = "10s"
            read_only = false

            [pool]
            validation_timeout = 1500
            idle_timeout = "2m"
            max_health_failures = 2

            [registry]
            state_file = "/tmp/ids.json"
            stale_after = "30m"

            [limits.api]
            id_range = [1, 4]
            max_concurrent = 2

            [limits.backfill]
            id_range = [5, 8]
            max_concurrent = 1

            [limits.interactive]
            id_range = [9, 9]
            max_concurrent = 1

            [limits.test]
            id_range = [10, 12]
            max_concurrent = 1

            [limits.reserved]
            id_range = [13, 13]
            max_concurrent = 1
        "#;

        let tmp = write_tmp(toml);
        let cfg = Config::from_file_async(tmp.path()).await.unwrap();

        assert_eq!(cfg.gateway.addr(), "10.0.0.5:7497");
        assert_eq!(cfg.gateway.connect_timeout, Duration::from_secs(10));
        assert!(!cfg.gateway.read_only);
        assert_eq!(cfg.pool.validation_timeout, Duration::from_millis(1500));
        assert_eq!(cfg.pool.idle_timeout, Duration::from_secs(120));
        assert_eq!(cfg.pool.max_health_failures, 2);
        assert_eq!(cfg.pool.acquire_timeout, Duration::from_secs(30));
        assert_eq!(cfg.registry.stale_after, Duration::from_secs(1800));
        assert_eq!(cfg.limits.get(Purpose::Api).max_id, 4);
        assert_eq!(cfg.limits.get(Purpose::Reserved).capacity(), 1);
    }

    #[test]
    fn partial_limits_table_is_rejected() {
        let toml = r#"
            [limits.api]
            id_range = [1, 4]
            max_concurrent = 2
        "#;

        let err = Config::parse(toml).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Limits(LimitsError::MissingLimit { .. })
        ));
    }

    #[test]
    fn unknown_purpose_is_rejected() {
        let toml = r#"
            [limits.scanner]
            id_range = [1, 4]
            max_concurrent = 2
        "#;

        let err = Config::parse(toml).unwrap_err();
        match err {
            ConfigError::Limits(LimitsError::UnknownPurpose { name }) => assert_eq!(name, "scanner"),
            other => panic!("expected UnknownPurpose, got {other:?}"),
        }
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
