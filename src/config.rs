//! Server configuration from environment variables.
//!
//! | Variable | Default | Meaning |
//! |---|---|---|
//! | `LOGRELAY_SYSLOG_ADDR` | `127.0.0.1:6514` | syslog ingest listener |
//! | `LOGRELAY_REPLICATION_ADDR` | `127.0.0.1:6515` | replication listener |
//! | `LOGRELAY_API_ADDR` | `127.0.0.1:8080` | HTTP query listener |
//! | `LOGRELAY_BUFFER_CAPACITY` | `10000` | per-application ring capacity |
//! | `LOGRELAY_SNAPSHOT_PATH` | unset | snapshot file, loaded at boot and written at shutdown |
//! | `LOGRELAY_LEADER_ADDR` | unset | static leader to follow, a stand-in for discovery |

use std::env;
use std::path::PathBuf;

use crate::ring;

pub const DEFAULT_SYSLOG_ADDR: &str = "127.0.0.1:6514";
pub const DEFAULT_REPLICATION_ADDR: &str = "127.0.0.1:6515";
pub const DEFAULT_API_ADDR: &str = "127.0.0.1:8080";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub syslog_addr: String,
    pub replication_addr: String,
    pub api_addr: String,
    pub buffer_capacity: usize,
    pub snapshot_path: Option<PathBuf>,
    pub leader_addr: Option<String>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            syslog_addr: DEFAULT_SYSLOG_ADDR.to_string(),
            replication_addr: DEFAULT_REPLICATION_ADDR.to_string(),
            api_addr: DEFAULT_API_ADDR.to_string(),
            buffer_capacity: ring::DEFAULT_CAPACITY,
            snapshot_path: None,
            leader_addr: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Config, ConfigError> {
        let mut config = Config::default();

        if let Ok(value) = env::var("LOGRELAY_SYSLOG_ADDR") {
            config.syslog_addr = value;
        }
        if let Ok(value) = env::var("LOGRELAY_REPLICATION_ADDR") {
            config.replication_addr = value;
        }
        if let Ok(value) = env::var("LOGRELAY_API_ADDR") {
            config.api_addr = value;
        }
        if let Ok(value) = env::var("LOGRELAY_BUFFER_CAPACITY") {
            config.buffer_capacity = value.parse().map_err(|_| ConfigError::InvalidValue {
                name: "LOGRELAY_BUFFER_CAPACITY",
                value,
            })?;
        }
        if let Ok(value) = env::var("LOGRELAY_SNAPSHOT_PATH") {
            config.snapshot_path = Some(PathBuf::from(value));
        }
        if let Ok(value) = env::var("LOGRELAY_LEADER_ADDR") {
            config.leader_addr = Some(value);
        }

        Ok(config)
    }
}
