//! General configuration settings for the protocol server.

use serde_derive::{Deserialize, Serialize};

/// `[general]` section of the TOML config file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct General {
    #[serde(default = "General::default_host")]
    pub host: String,

    #[serde(default = "General::default_port")]
    pub port: u16,

    #[serde(default = "General::default_worker_threads")]
    pub worker_threads: usize,

    #[serde(default = "General::default_max_connections")]
    pub max_connections: u64,

    /// Bounded-join timeout for graceful shutdown, in milliseconds.
    #[serde(default = "General::default_shutdown_timeout")]
    pub shutdown_timeout: u64,

    /// Sent in the `server_version` `ParameterStatus` during startup.
    #[serde(default = "General::default_server_version")]
    pub server_version: String,

    #[serde(default = "General::default_log_client_connections")]
    pub log_client_connections: bool,

    /// When set, logs go to syslog under this program name instead of
    /// stdout (see `app::logger`).
    pub syslog_prog_name: Option<String>,
}

impl General {
    pub fn default_host() -> String {
        "0.0.0.0".into()
    }

    pub fn default_port() -> u16 {
        5432
    }

    pub fn default_worker_threads() -> usize {
        num_cpus::get().max(1)
    }

    pub fn default_max_connections() -> u64 {
        1024
    }

    pub fn default_shutdown_timeout() -> u64 {
        500
    }

    pub fn default_server_version() -> String {
        "8.4.7".to_string()
    }

    pub fn default_log_client_connections() -> bool {
        true
    }
}

impl Default for General {
    fn default() -> General {
        General {
            host: Self::default_host(),
            port: Self::default_port(),
            worker_threads: Self::default_worker_threads(),
            max_connections: Self::default_max_connections(),
            shutdown_timeout: Self::default_shutdown_timeout(),
            server_version: Self::default_server_version(),
            log_client_connections: Self::default_log_client_connections(),
            syslog_prog_name: None,
        }
    }
}

/// `[database]` section: names which `SessionFactory` to construct. Kept
/// abstract per spec §1's out-of-scope collaborators — this crate only
/// ships one backend (`reference`), but the field exists so a deployment
/// wiring in a real engine has somewhere to name it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DatabaseConfig {
    #[serde(default = "DatabaseConfig::default_backend")]
    pub backend: String,
}

impl DatabaseConfig {
    pub fn default_backend() -> String {
        "reference".to_string()
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            backend: Self::default_backend(),
        }
    }
}
