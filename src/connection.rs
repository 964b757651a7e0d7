//! Per-client state machine: handshake, dispatch, prepared-statement and
//! portal registries, error framing, skip-until-sync recovery (spec §3,
//! §4.3).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::broadcast;

use crate::collaborators::{BoundPortal, ResultFormats, Session, SessionFactory, Statement};
use crate::errors::Error;
use crate::messages::constants::{frontend, TARGET_PORTAL, TARGET_STATEMENT};
use crate::messages::{FieldFormat, Framer, ParamValue, StartupFrame};
use crate::stats::Stats;

/// Probe JDBC/ODBC drivers issue right after connecting to learn how the
/// server represents `lo` (large object) OIDs. We don't have a `pg_type`
/// catalog, so we recognize the literal text and answer without involving
/// the parser/compiler at all (spec §4.3.1).
const ODBC_LO_PROBE: &str = "select oid, typbasetype from pg_type where typname = 'lo'";

/// What the dispatcher should do if the handler it's about to call raises
/// a query-level error. `None` means the error is not ours to catch: it
/// propagates and the connection dies (spec §4.3's error-mode table, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorMode {
    None,
    Simple,
    Extended,
}

/// A live connection's entry in the server's cancellation registry
/// (spec §4.4, §5, §9).
pub struct ConnectionHandle {
    pub secret_key: i32,
    pub cancel: Arc<AtomicBool>,
}

pub type ConnectionRegistry = Arc<dashmap::DashMap<i32, ConnectionHandle>>;

pub struct Connection<S> {
    framer: Framer<ReadHalf<S>, WriteHalf<S>>,
    pid: i32,
    secret_key: i32,
    peer: String,
    registry: ConnectionRegistry,
    session_factory: Arc<dyn SessionFactory>,
    server_version: String,
    stats: Arc<Stats>,
    log_client_connections: bool,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stream: S,
        pid: i32,
        secret_key: i32,
        peer: String,
        registry: ConnectionRegistry,
        session_factory: Arc<dyn SessionFactory>,
        server_version: String,
        stats: Arc<Stats>,
        log_client_connections: bool,
    ) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Connection {
            framer: Framer::new(reader, writer),
            pid,
            secret_key,
            peer,
            registry,
            session_factory,
            server_version,
            stats,
            log_client_connections,
        }
    }

    /// Read one untyped startup-shaped frame (spec §4.3's `Startup` state).
    /// Callers loop on `Ssl`/`GssEncMode` (refusing and reading again) until
    /// a `Cancel` or real `Startup` frame arrives.
    pub async fn read_next_startup(&mut self) -> Result<StartupFrame, Error> {
        self.framer.read_startup().await
    }

    pub async fn refuse_negotiation(&mut self, byte: u8) -> Result<(), Error> {
        self.framer.refuse_negotiation(byte).await
    }

    /// Send a FATAL `ErrorResponse` for `[general].max_connections` and
    /// close, instead of proceeding to authentication.
    pub async fn reject_too_many_connections(&mut self) -> Result<(), Error> {
        self.framer
            .error_response("FATAL", "sorry, too many clients already");
        self.framer.flush().await
    }

    /// Drive this connection from just after `readStartup` returned a
    /// regular startup frame through to close. Returns normally on a
    /// graceful end (EOF, Terminate, shutdown signal); returns `Err` only
    /// for I/O-level failures that tear the connection down directly.
    pub async fn run(
        mut self,
        startup_params: HashMap<String, String>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), Error> {
        let mut framer = self.framer;
        let cancel_handle = framer.cancel_handle();

        let user = startup_params
            .get("user")
            .cloned()
            .unwrap_or_else(|| "postgres".to_string());
        let database = startup_params
            .get("database")
            .cloned()
            .unwrap_or_else(|| user.clone());
        if let Some(encoding) = startup_params.get("client_encoding") {
            framer.set_encoding(encoding);
        }

        RunningConnection {
            framer,
            pid: self.pid,
            secret_key: self.secret_key,
            peer: self.peer.clone(),
            registry: self.registry.clone(),
            startup_params,
            prepared: AHashMap::new(),
            portals: AHashMap::new(),
            ignore_until_sync: false,
            server_version: self.server_version.clone(),
            stats: self.stats.clone(),
            log_client_connections: self.log_client_connections,
        }
        .authenticate_and_serve(user, database, &self.session_factory, cancel_handle, &mut shutdown)
        .await
    }
}

/// Handle a `CancelRequest` read during `Startup` (spec §4.3, §4.4): look
/// the target up by pid, and if the secret matches, set its cancel flag.
/// Fire-and-forget: we never learn whether the target observed it, and we
/// close this connection either way (spec §9 open question).
pub fn handle_cancel_request(registry: &ConnectionRegistry, pid: i32, secret_key: i32) {
    if let Some(entry) = registry.get(&pid) {
        if entry.secret_key == secret_key {
            entry.cancel.store(true, Ordering::SeqCst);
        }
    }
}

/// Parse the startup message's `(key, value)*` list, terminated by an
/// empty-string key (spec §6).
pub fn parse_startup_params(mut body: bytes::BytesMut) -> Result<HashMap<String, String>, Error> {
    use bytes::Buf;
    let mut params = HashMap::new();
    loop {
        let key = read_cstr(&mut body)?;
        if key.is_empty() {
            break;
        }
        let value = read_cstr(&mut body)?;
        params.insert(key, value);
    }
    let _ = body.remaining();
    Ok(params)
}

fn read_cstr(body: &mut bytes::BytesMut) -> Result<String, Error> {
    use bytes::Buf;
    let end = body
        .as_ref()
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| Error::ClientBadStartup("unterminated string in startup".into()))?;
    let s = String::from_utf8_lossy(&body[..end]).into_owned();
    body.advance(end + 1);
    Ok(s)
}

/// The part of a `Connection` that exists once a session has been
/// constructed: split out of `Connection` so `run` can hand it the
/// `Framer` (which itself owns the split stream halves).
struct RunningConnection<R, W> {
    framer: Framer<R, W>,
    pid: i32,
    secret_key: i32,
    peer: String,
    registry: ConnectionRegistry,
    startup_params: HashMap<String, String>,
    prepared: AHashMap<String, Box<dyn Statement>>,
    portals: AHashMap<String, Box<dyn BoundPortal>>,
    ignore_until_sync: bool,
    server_version: String,
    stats: Arc<Stats>,
    log_client_connections: bool,
}

impl<R, W> RunningConnection<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    async fn authenticate_and_serve(
        mut self,
        user: String,
        database: String,
        session_factory: &Arc<dyn SessionFactory>,
        cancel_handle: Arc<AtomicBool>,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), Error> {
        self.framer.auth_cleartext_password();
        self.framer.flush().await?;

        let password_frame = match self.framer.read_frame().await? {
            Some(f) => f,
            None => return Ok(()),
        };
        if password_frame.msg_type != frontend::PASSWORD {
            return Err(Error::ProtocolError(
                "expected password message after AuthenticationCleartextPassword".into(),
            ));
        }
        // Per spec: password is never validated, any value is accepted.
        let mut password_frame = password_frame;
        let _password = password_frame.read_cstr()?;

        let ctx = session_factory.connect(&database, &user)?;
        let mut session = ctx.session;
        let parser = ctx.parser;
        let compiler = ctx.compiler;

        self.framer.auth_ok();
        let client_encoding = self.framer.encoding().to_string();
        self.framer
            .parameter_status("client_encoding", &client_encoding);
        self.framer
            .parameter_status("server_encoding", &client_encoding);
        self.framer
            .parameter_status("server_version", &self.server_version);
        self.framer
            .parameter_status("session_authorization", &user);
        self.framer.backend_key_data(self.pid, self.secret_key);
        self.framer.ready_for_query(session.transaction_status());
        self.framer.flush().await?;

        self.registry.insert(
            self.pid,
            ConnectionHandle {
                secret_key: self.secret_key,
                cancel: cancel_handle,
            },
        );
        let _remove_on_exit = scopeguard::guard(self.pid, {
            let registry = self.registry.clone();
            move |pid| {
                registry.remove(&pid);
            }
        });

        if self.log_client_connections {
            match self.startup_params.get("application_name") {
                Some(app) if !app.is_empty() => info!(
                    "connection {} ({}): authenticated as {user} (application_name={app})",
                    self.pid, self.peer
                ),
                _ => info!("connection {} ({}): authenticated as {user}", self.pid, self.peer),
            }
        }

        let result = self
            .dispatch_loop(session.as_mut(), parser.as_ref(), compiler.as_ref(), shutdown)
            .await;

        match &result {
            Ok(()) => debug!("connection {}: closed", self.pid),
            Err(e) => warn!("connection {} ({}): {e}", self.pid, self.peer),
        }
        result
    }

    async fn dispatch_loop(
        &mut self,
        session: &mut dyn Session,
        parser: &dyn crate::collaborators::Parser,
        compiler: &dyn crate::collaborators::Compiler,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), Error> {
        loop {
            let frame = tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    info!("connection {}: shutting down", self.pid);
                    return Ok(());
                }
                frame = self.framer.read_frame() => frame,
            };

            let frame = match frame {
                Ok(f) => f,
                // The cancel flag is observed at this I/O boundary, not tied to
                // any particular frame (spec §5, §7): it is never I/O-fatal.
                // Already mid skip-until-sync, it's just another frame to
                // discard (invariant 3: no second `ErrorResponse` before the
                // next Sync); otherwise it behaves like a Simple-mode error.
                Err(Error::QueryCanceled) => {
                    self.stats.on_error(Error::QueryCanceled.code());
                    if !self.ignore_until_sync {
                        self.framer.error_response("ERROR", &Error::QueryCanceled.to_string());
                        self.framer.ready_for_query(session.transaction_status());
                        self.framer.flush().await?;
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };

            let mut frame = match frame {
                Some(f) => f,
                None => return Ok(()),
            };

            if self.ignore_until_sync {
                match frame.msg_type {
                    frontend::SYNC => {
                        self.ignore_until_sync = false;
                        self.framer.ready_for_query(session.transaction_status());
                        self.framer.flush().await?;
                    }
                    frontend::TERMINATE => return Ok(()),
                    _ => {}
                }
                continue;
            }

            let error_mode = match frame.msg_type {
                frontend::QUERY => ErrorMode::Simple,
                frontend::PARSE
                | frontend::BIND
                | frontend::DESCRIBE
                | frontend::EXECUTE => ErrorMode::Extended,
                frontend::CLOSE | frontend::SYNC | frontend::TERMINATE => ErrorMode::None,
                _ => ErrorMode::None,
            };

            let outcome = match frame.msg_type {
                frontend::QUERY => {
                    self.handle_simple_query(&mut frame, session, parser, compiler).await
                }
                frontend::PARSE => self.handle_parse(&mut frame, parser, compiler).await,
                frontend::BIND => self.handle_bind(&mut frame).await,
                frontend::DESCRIBE => self.handle_describe(&mut frame).await,
                frontend::EXECUTE => self.handle_execute(&mut frame, session).await,
                frontend::CLOSE => self.handle_close(&mut frame).await,
                frontend::SYNC => {
                    self.framer.ready_for_query(session.transaction_status());
                    Ok(())
                }
                frontend::TERMINATE => return Ok(()),
                other => Err(Error::ProtocolError(format!(
                    "unrecognized frame type {:?}",
                    other as char
                ))),
            };

            if let Err(e) = outcome {
                self.stats.on_error(e.code());
                match error_mode {
                    ErrorMode::None => return Err(e),
                    ErrorMode::Simple => {
                        self.framer.error_response("ERROR", &e.to_string());
                        self.framer.ready_for_query(session.transaction_status());
                    }
                    ErrorMode::Extended => {
                        self.framer.error_response("ERROR", &e.to_string());
                        self.ignore_until_sync = true;
                    }
                }
            }

            self.framer.flush().await?;
        }
    }

    async fn handle_simple_query(
        &mut self,
        frame: &mut crate::messages::FrameReader,
        session: &mut dyn Session,
        parser: &dyn crate::collaborators::Parser,
        compiler: &dyn crate::collaborators::Compiler,
    ) -> Result<(), Error> {
        let sql = frame.read_cstr()?;

        if sql.trim() == ODBC_LO_PROBE {
            self.framer.command_complete("SELECT");
            self.framer.ready_for_query(session.transaction_status());
            return Ok(());
        }

        let trees = parser.parse(&sql)?;
        for tree in &trees {
            if !tree.is_cursor() {
                return Err(Error::NotSelect);
            }
            let statement = compiler.compile(tree.as_ref(), &[])?;
            self.framer.row_description(&statement.row_description());
            let batch = statement.execute(session, -1)?;
            for row in &batch.rows {
                self.framer.data_row(row);
            }
            self.framer.command_complete("SELECT");
        }
        self.framer.ready_for_query(session.transaction_status());
        Ok(())
    }

    async fn handle_parse(
        &mut self,
        frame: &mut crate::messages::FrameReader,
        parser: &dyn crate::collaborators::Parser,
        compiler: &dyn crate::collaborators::Compiler,
    ) -> Result<(), Error> {
        let stmt_name = frame.read_cstr()?;
        let sql = frame.read_cstr()?;
        let nparams = frame.read_i16()?;
        let mut param_oids = Vec::with_capacity(nparams.max(0) as usize);
        for _ in 0..nparams {
            param_oids.push(frame.read_i32()?);
        }

        let trees = parser.parse(&sql)?;
        let tree = trees
            .first()
            .ok_or_else(|| Error::ParseError("empty statement".to_string()))?;
        if !tree.is_cursor() {
            return Err(Error::NotSelect);
        }
        let statement = compiler.compile(tree.as_ref(), &param_oids)?;
        self.prepared.insert(stmt_name, statement);
        self.framer.parse_complete();
        Ok(())
    }

    async fn handle_bind(&mut self, frame: &mut crate::messages::FrameReader) -> Result<(), Error> {
        let portal_name = frame.read_cstr()?;
        let stmt_name = frame.read_cstr()?;

        let n_param_formats = frame.read_i16()?;
        let mut param_formats = Vec::with_capacity(n_param_formats.max(0) as usize);
        for _ in 0..n_param_formats {
            param_formats.push(FieldFormat::from_code(frame.read_i16()?)?);
        }

        let n_params = frame.read_i16()?;
        let mut params = Vec::with_capacity(n_params.max(0) as usize);
        for i in 0..n_params as usize {
            let format = match param_formats.len() {
                0 => FieldFormat::Text,
                1 => param_formats[0],
                _ => param_formats[i],
            };
            let value = frame.read_value()?;
            params.push(match value {
                None => ParamValue::Null,
                Some(bytes) => {
                    if format == FieldFormat::Binary {
                        return Err(Error::ProtocolError(
                            "Don't know how to parse binary format.".to_string(),
                        ));
                    }
                    ParamValue::Text(String::from_utf8_lossy(&bytes).into_owned())
                }
            });
        }

        let n_result_formats = frame.read_i16()?;
        let mut result_formats = Vec::with_capacity(n_result_formats.max(0) as usize);
        for _ in 0..n_result_formats {
            result_formats.push(FieldFormat::from_code(frame.read_i16()?)?);
        }
        let result_formats = match result_formats.len() {
            0 => ResultFormats::AllText,
            1 => ResultFormats::Single(result_formats[0]),
            _ => ResultFormats::PerColumn(result_formats),
        };

        let statement = self
            .prepared
            .get(&stmt_name)
            .ok_or_else(|| Error::UnknownName(stmt_name.clone()))?;
        let portal = statement.bind(&params, result_formats)?;
        self.portals.insert(portal_name, portal);
        self.framer.bind_complete();
        Ok(())
    }

    async fn handle_describe(
        &mut self,
        frame: &mut crate::messages::FrameReader,
    ) -> Result<(), Error> {
        let target = frame.read_u8()?;
        let name = frame.read_cstr()?;
        let columns = match target {
            TARGET_STATEMENT => self
                .prepared
                .get(&name)
                .ok_or_else(|| Error::UnknownName(name.clone()))?
                .row_description(),
            TARGET_PORTAL => self
                .portals
                .get(&name)
                .ok_or_else(|| Error::UnknownName(name.clone()))?
                .row_description(),
            other => {
                return Err(Error::ProtocolError(format!(
                    "unknown describe target {:?}",
                    other as char
                )))
            }
        };
        self.framer.row_description(&columns);
        Ok(())
    }

    async fn handle_execute(
        &mut self,
        frame: &mut crate::messages::FrameReader,
        session: &mut dyn Session,
    ) -> Result<(), Error> {
        let portal_name = frame.read_cstr()?;
        let max_rows = frame.read_i32()?;
        let portal = self
            .portals
            .get(&portal_name)
            .ok_or_else(|| Error::UnknownName(portal_name.clone()))?;
        let batch = portal.execute(session, max_rows)?;
        for row in &batch.rows {
            self.framer.data_row(row);
        }
        self.framer.command_complete("SELECT");
        Ok(())
    }

    async fn handle_close(&mut self, frame: &mut crate::messages::FrameReader) -> Result<(), Error> {
        let target = frame.read_u8()?;
        let name = frame.read_cstr()?;
        match target {
            TARGET_STATEMENT => {
                self.prepared.remove(&name);
            }
            TARGET_PORTAL => {
                self.portals.remove(&name);
            }
            other => {
                return Err(Error::ProtocolError(format!(
                    "unknown close target {:?}",
                    other as char
                )))
            }
        }
        self.framer.close_complete();
        Ok(())
    }
}
