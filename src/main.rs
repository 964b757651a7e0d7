#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::process;

use doorframe::app;

fn main() {
    let args = app::parse();

    app::install_panic_hook();

    let config = match app::init_config(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load configuration: {err}");
            process::exit(exitcode::CONFIG);
        }
    };

    if args.test_config {
        config.show();
        println!("configuration file {} is valid", args.config_file);
        process::exit(exitcode::OK);
    }

    if let Err(err) = app::init_logging(&args, &config) {
        eprintln!("failed to initialize logging: {err}");
        process::exit(exitcode::SOFTWARE);
    }

    config.show();

    if let Err(err) = app::run_server(args, config) {
        log::error!("server exited with error: {err}");
        process::exit(exitcode::SOFTWARE);
    }
}
