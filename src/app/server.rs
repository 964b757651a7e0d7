//! Boots the tokio runtime sized from config and runs the protocol server
//! until shutdown (SPEC_FULL §A.5). The accept loop, signal handling and
//! per-connection spawning live in `crate::server::Server`; this module's
//! job is purely the process-level wiring the teacher's `app::server` does:
//! runtime construction, session-backend selection, top-level error
//! reporting.

use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use tokio::runtime::Builder;

use crate::app::args::Args;
use crate::collaborators::SessionFactory;
use crate::config::Config;
use crate::reference_engine::ReferenceSessionFactory;
use crate::server::Server;

pub fn run_server(_args: Args, config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = Builder::new_multi_thread()
        .worker_threads(config.general.worker_threads)
        .enable_all()
        .thread_name("doorframe-worker")
        .build()?;

    runtime.block_on(async move {
        let session_factory = build_session_factory(&config)?;
        let shutdown_timeout = Duration::from_millis(config.general.shutdown_timeout);

        let server = Server::bind(
            &config.general.host,
            config.general.port,
            session_factory,
            config.general.server_version.clone(),
            shutdown_timeout,
            config.general.max_connections,
            config.general.log_client_connections,
        )?;

        let stats = server.stats();
        let result = server.run().await;
        let snap = stats.snapshot();
        info!(
            "shut down: accepted {} connections, {} errors, {} cancel requests",
            snap.accepted_total, snap.errors_total, snap.cancel_requests_total
        );
        if !snap.errors_by_code.is_empty() {
            let breakdown = snap
                .errors_by_code
                .iter()
                .map(|(code, count)| format!("{code}={count}"))
                .collect::<Vec<_>>()
                .join(", ");
            info!("error counts by category: {breakdown}");
        }
        result
    })?;

    Ok(())
}

/// Select the `SessionFactory` named by `[database].backend`. Per spec §1's
/// out-of-scope collaborators, this crate only ships the in-memory
/// `reference` backend used for exercising the dispatcher; a real
/// deployment registers its own engine here instead.
fn build_session_factory(config: &Config) -> Result<Arc<dyn SessionFactory>, crate::errors::Error> {
    match config.database.backend.as_str() {
        "reference" => Ok(Arc::new(ReferenceSessionFactory)),
        other => {
            error!("unknown database backend {other:?}, falling back to \"reference\"");
            Ok(Arc::new(ReferenceSessionFactory))
        }
    }
}
