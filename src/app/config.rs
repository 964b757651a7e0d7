//! Config loading at startup: parse the TOML file, apply CLI overrides,
//! exit cleanly on a bad file rather than panicking (SPEC_FULL §A.3).

use std::io::{self, IsTerminal, Write};

use log::error;
use tokio::runtime::Builder;

use crate::app::args::Args;
use crate::config::{get_config, Config};

pub fn init_config(args: &Args) -> Result<Config, Box<dyn std::error::Error>> {
    // A tiny one-off runtime: parsing the config is the one thing we need
    // to do before the real multi-threaded runtime (sized from the config
    // itself) is built.
    {
        let runtime = Builder::new_multi_thread().worker_threads(1).enable_all().build()?;
        runtime.block_on(async {
            if let Err(err) = crate::config::parse(args.config_file.as_str()).await {
                let stdin = io::stdin();
                if stdin.is_terminal() {
                    eprintln!("Config parse error: {err}");
                    io::stdout().flush().unwrap();
                } else {
                    error!("Config parse error: {err}");
                }
                std::process::exit(exitcode::CONFIG);
            }
        });
    }

    let mut config = get_config();
    if let Some(host) = &args.host {
        config.general.host = host.clone();
    }
    if let Some(port) = args.port {
        config.general.port = port;
    }
    Ok(config)
}
