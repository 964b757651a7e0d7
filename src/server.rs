//! Listen socket, per-connection `(pid, secret)` allocation, connection
//! registry, cancellation lookup, graceful shutdown (spec §4.4).

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use log::{info, warn};
use socket2::{Domain, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::collaborators::SessionFactory;
use crate::connection::{self, Connection, ConnectionRegistry};
use crate::errors::Error;
use crate::messages::StartupFrame;
use crate::stats::Stats;

pub struct Server {
    listener: TcpListener,
    registry: ConnectionRegistry,
    session_factory: Arc<dyn SessionFactory>,
    stats: Arc<Stats>,
    server_version: String,
    next_pid: AtomicI32,
    shutdown_timeout: Duration,
    max_connections: u64,
    log_client_connections: bool,
}

impl Server {
    #[allow(clippy::too_many_arguments)]
    pub fn bind(
        host: &str,
        port: u16,
        session_factory: Arc<dyn SessionFactory>,
        server_version: String,
        shutdown_timeout: Duration,
        max_connections: u64,
        log_client_connections: bool,
    ) -> Result<Self, Error> {
        let addr = format!("{host}:{port}")
            .parse::<std::net::SocketAddr>()
            .map_err(|e| Error::SocketError(format!("invalid listen address: {e}")))?;

        let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
        let socket = Socket::new(domain, Type::STREAM, None)
            .map_err(|e| Error::SocketError(format!("failed to create socket: {e}")))?;
        socket
            .set_reuse_address(true)
            .map_err(|e| Error::SocketError(format!("failed to set SO_REUSEADDR: {e}")))?;
        socket
            .set_nodelay(true)
            .map_err(|e| Error::SocketError(format!("failed to set TCP_NODELAY: {e}")))?;
        socket
            .bind(&addr.into())
            .map_err(|e| Error::SocketError(format!("failed to bind {addr}: {e}")))?;
        socket
            .listen(1024)
            .map_err(|e| Error::SocketError(format!("failed to listen on {addr}: {e}")))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| Error::SocketError(format!("failed to set non-blocking: {e}")))?;

        let listener = TcpListener::from_std(socket.into())
            .map_err(|e| Error::SocketError(format!("failed to adopt listener: {e}")))?;

        info!("listening on {addr}");

        Ok(Server {
            listener,
            registry: Arc::new(DashMap::new()),
            session_factory,
            stats: Arc::new(Stats::default()),
            server_version,
            next_pid: AtomicI32::new(rand::random::<i32>().rem_euclid(1_000_000) + 1),
            shutdown_timeout,
            max_connections,
            log_client_connections,
        })
    }

    pub fn stats(&self) -> Arc<Stats> {
        self.stats.clone()
    }

    /// Accept connections until SIGTERM/SIGINT; SIGHUP re-reads the config
    /// file in place via `config::reload` (new `host`/`port` take effect
    /// only on the next restart, since the listener is already bound, but
    /// `general.*` knobs consulted per-connection/per-accept pick up the
    /// change immediately).
    pub async fn run(self) -> Result<(), Error> {
        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let mut handles: Vec<JoinHandle<()>> = Vec::new();

        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| Error::SocketError(format!("failed to install SIGTERM handler: {e}")))?;
        let mut sigint = signal(SignalKind::interrupt())
            .map_err(|e| Error::SocketError(format!("failed to install SIGINT handler: {e}")))?;
        let mut sighup = signal(SignalKind::hangup())
            .map_err(|e| Error::SocketError(format!("failed to install SIGHUP handler: {e}")))?;

        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("received SIGTERM, starting graceful shutdown");
                    break;
                }
                _ = sigint.recv() => {
                    info!("received SIGINT, starting graceful shutdown");
                    break;
                }
                _ = sighup.recv() => {
                    match crate::config::reload().await {
                        Ok(changed) => info!("received SIGHUP, reloaded config (changed: {changed})"),
                        Err(e) => warn!("received SIGHUP, failed to reload config: {e}"),
                    }
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("accept failed: {e}");
                            continue;
                        }
                    };
                    self.stats.on_accept();
                    let shutdown_rx = shutdown_tx.subscribe();
                    let registry = self.registry.clone();
                    let session_factory = self.session_factory.clone();
                    let stats = self.stats.clone();
                    let server_version = self.server_version.clone();
                    let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
                    let max_connections = self.max_connections;
                    let log_client_connections = self.log_client_connections;

                    handles.push(tokio::spawn(async move {
                        if stats.live_connections.load(Ordering::Relaxed) > max_connections {
                            warn!("connection {pid} ({peer}): too many clients already");
                            let _ = reject_too_many_connections(stream, pid, peer, registry, session_factory, server_version, &stats).await;
                            stats.on_disconnect();
                            return;
                        }

                        if let Err(e) = handle_stream(
                            stream,
                            peer.to_string(),
                            pid,
                            registry,
                            session_factory,
                            server_version,
                            shutdown_rx,
                            &stats,
                            log_client_connections,
                        ).await {
                            if e.is_io_fatal() {
                                warn!("connection {pid} ({peer}): {e}");
                            }
                        }
                        stats.on_disconnect();
                    }));
                }
            }
        }

        let _ = shutdown_tx.send(());
        let shutdown_timeout = self.shutdown_timeout;
        let join_all = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(shutdown_timeout, join_all).await.is_err() {
            warn!("graceful shutdown timed out after {shutdown_timeout:?}; abandoning remaining connections");
        }
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_stream(
    stream: TcpStream,
    peer: String,
    pid: i32,
    registry: ConnectionRegistry,
    session_factory: Arc<dyn SessionFactory>,
    server_version: String,
    shutdown: broadcast::Receiver<()>,
    stats: &Arc<Stats>,
    log_client_connections: bool,
) -> Result<(), Error> {
    let secret_key: i32 = rand::random();
    let mut conn = Connection::new(
        stream,
        pid,
        secret_key,
        peer,
        registry.clone(),
        session_factory,
        server_version,
        stats.clone(),
        log_client_connections,
    );

    loop {
        match conn.read_next_startup().await? {
            StartupFrame::Ssl => {
                conn.refuse_negotiation(b'N').await?;
            }
            StartupFrame::GssEncMode => {
                conn.refuse_negotiation(b'G').await?;
                return Ok(());
            }
            StartupFrame::Cancel { process_id, secret_key: target_secret } => {
                stats.on_cancel_request();
                connection::handle_cancel_request(&registry, process_id, target_secret);
                return Ok(());
            }
            StartupFrame::Startup(body) => {
                let params = connection::parse_startup_params(body)?;
                return conn.run(params, shutdown).await;
            }
        }
    }
}

/// Cap hit (`[general].max_connections`): negotiate past SSL/GSSENCMODE
/// like a normal connection would, then refuse the real startup with a
/// `FATAL` `ErrorResponse` instead of proceeding to authentication.
#[allow(clippy::too_many_arguments)]
async fn reject_too_many_connections(
    stream: TcpStream,
    pid: i32,
    peer: String,
    registry: ConnectionRegistry,
    session_factory: Arc<dyn SessionFactory>,
    server_version: String,
    stats: &Arc<Stats>,
) -> Result<(), Error> {
    let secret_key: i32 = rand::random();
    let mut conn = Connection::new(
        stream,
        pid,
        secret_key,
        peer,
        registry,
        session_factory,
        server_version,
        stats.clone(),
        false,
    );

    loop {
        match conn.read_next_startup().await? {
            StartupFrame::Ssl => {
                conn.refuse_negotiation(b'N').await?;
            }
            StartupFrame::GssEncMode => {
                conn.refuse_negotiation(b'G').await?;
                return Ok(());
            }
            StartupFrame::Cancel { .. } => return Ok(()),
            StartupFrame::Startup(_) => {
                return conn.reject_too_many_connections().await;
            }
        }
    }
}
