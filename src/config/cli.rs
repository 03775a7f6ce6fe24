use clap::Parser;
use parking_lot::RwLock;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
};

use super::types::LogLevel;

// -----------------------------------------------------------------------------
// ----- Global Singleton ------------------------------------------------------

static CLI_CONFIG: OnceLock<Arc<RwLock<CliConfig>>> = OnceLock::new();

// -----------------------------------------------------------------------------
// ----- CliConfig -------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct CliConfig {
    pub gateway_host: Option<String>,
    pub gateway_port: Option<u16>,
    pub config_file_location: Option<PathBuf>,
    pub state_file_location: Option<PathBuf>,
    pub log_level: LogLevel,
    pub read_only: Option<bool>,
}

impl CliConfig {
    pub fn init() {
        CLI_CONFIG.get_or_init(|| {
            let cfg = Self::from_args();
            cfg.validate();
            Arc::new(RwLock::new(cfg))
        });
    }

    pub fn snapshot() -> CliConfig {
        handle().read().clone()
    }
}

// -----------------------------------------------------------------------------
// ----- CliConfig: Private ----------------------------------------------------

impl CliConfig {
    fn from_args() -> Self {
        let args = Args::try_parse().unwrap_or_else(|e| panic!("Invalid CLI/ENV: {e}"));

        Self {
            gateway_host: args.host,
            gateway_port: args.port,
            config_file_location: args.config_file,
            state_file_location: args.state_file,
            log_level: args.log_level,
            read_only: args.read_only,
        }
    }

    fn validate(&self) {
        if let Some(path) = &self.config_file_location {
            must_exist_file(path, "--config / gatecrab.toml");
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Args ------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "gatecrab", version, about = "Trading gateway session pooler")]
struct Args {
    // Overrides [gateway].host from the config file.
    #[arg(long = "host", short = 'H', env = "GATECRAB_HOST")]
    host: Option<String>,

    // Overrides [gateway].port from the config file.
    #[arg(long = "port", short = 'p', env = "GATECRAB_PORT")]
    port: Option<u16>,

    // Not required via CLI or ENV (defaults to info).
    #[arg(long = "log", default_value = "info")]
    log_level: LogLevel,

    // Optional; must exist when given.
    #[arg(long = "config", env = "GATECRAB_CONFIG_FILE")]
    config_file: Option<PathBuf>,

    // Overrides [registry].state_file from the config file.
    #[arg(long = "state-file", env = "GATECRAB_STATE_FILE")]
    state_file: Option<PathBuf>,

    #[arg(long = "read-only", env = "GATECRAB_READ_ONLY")]
    read_only: Option<bool>,
}

// -----------------------------------------------------------------------------
// ----- Private Utils ---------------------------------------------------------

fn handle() -> Arc<RwLock<CliConfig>> {
    CLI_CONFIG
        .get()
        .expect("cli config not initialized; call CliConfig::init() first")
        .clone()
}

fn must_exist_file(path: &Path, hint: &str) {
    let md = fs::metadata(path).unwrap_or_else(|_| {
        panic!("required file missing: {} (from {hint})", path.display());
    });

    if !md.is_file() {
        panic!("path is not a file: {} (from {hint})", path.display());
    }
}

// -----------------------------------------------------------------------------
// -----------------------------------------------------------------------------
