//! Configuration: a TOML file overlaid with CLI args/env vars, held behind
//! an `ArcSwap` so it can be hot-reloaded on `SIGHUP` without locking
//! readers out (spec SPEC_FULL §A.3).

use arc_swap::ArcSwap;
use log::info;
use once_cell::sync::Lazy;
use serde_derive::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::AsyncReadExt;

use crate::errors::Error;

mod general;
#[cfg(test)]
mod tests;

pub use general::{DatabaseConfig, General};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

static CONFIG: Lazy<ArcSwap<Config>> = Lazy::new(|| ArcSwap::from_pointee(Config::default()));

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    #[serde(skip)]
    pub path: String,

    #[serde(default)]
    pub general: General,

    #[serde(default)]
    pub database: DatabaseConfig,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            path: Self::default_path(),
            general: General::default(),
            database: DatabaseConfig::default(),
        }
    }
}

impl Config {
    pub fn default_path() -> String {
        String::from("doorframe.toml")
    }

    pub fn show(&self) {
        info!("host: {}", self.general.host);
        info!("port: {}", self.general.port);
        info!("worker_threads: {}", self.general.worker_threads);
        info!("max_connections: {}", self.general.max_connections);
        info!("shutdown_timeout: {}ms", self.general.shutdown_timeout);
        info!("server_version: {}", self.general.server_version);
        info!("database backend: {}", self.database.backend);
    }
}

/// Get a read-only snapshot of the configuration from anywhere in the app.
/// `ArcSwap` makes this cheap: a load is a single atomic pointer read.
pub fn get_config() -> Config {
    (*(*CONFIG.load())).clone()
}

async fn load_file(path: &str) -> Result<String, Error> {
    let mut contents = String::new();
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|err| Error::BadConfig(format!("could not open '{path}': {err}")))?;
    file.read_to_string(&mut contents)
        .await
        .map_err(|err| Error::BadConfig(format!("could not read config file: {err}")))?;
    Ok(contents)
}

/// Parse the TOML file at `path` and install it as the active config.
pub async fn parse(path: &str) -> Result<(), Error> {
    let contents = load_file(path).await?;
    let mut config: Config = toml::from_str(&contents)
        .map_err(|err| Error::BadConfig(format!("could not parse config file {path}: {err}")))?;
    config.path = path.to_string();
    CONFIG.store(Arc::new(config));
    Ok(())
}

/// Re-read the config file at its previously loaded path. Returns whether
/// anything actually changed (called on `SIGHUP`; see `app::server`).
pub async fn reload() -> Result<bool, Error> {
    let old = get_config();
    parse(&old.path).await?;
    let new = get_config();
    Ok(old != new)
}
