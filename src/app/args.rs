//! Command-line arguments, layered the same way the teacher's `Args`
//! layers them: `clap` derive, `env` fallback on every flag (SPEC_FULL §A.3).

use clap::{Parser, ValueEnum};
use tracing::Level;

/// doorframe: a Postgres v3 frontend/backend wire-protocol server.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to the TOML configuration file.
    #[arg(default_value_t = String::from("doorframe.toml"), env)]
    pub config_file: String,

    #[arg(short, long, default_value_t = tracing::Level::INFO, env)]
    pub log_level: Level,

    #[clap(short = 'F', long, value_enum, default_value_t = LogFormat::Text, env)]
    pub log_format: LogFormat,

    #[arg(short, long, default_value_t = false, env, help = "disable colors in the log output")]
    pub no_color: bool,

    /// Override `[general].host` from the config file.
    #[arg(long, env)]
    pub host: Option<String>,

    /// Override `[general].port` from the config file.
    #[arg(long, env)]
    pub port: Option<u16>,

    #[arg(short = 't', long = "test-config", default_value_t = false, help = "test configuration file and exit")]
    pub test_config: bool,
}

pub fn parse() -> Args {
    Args::parse()
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Structured,
    Debug,
}
