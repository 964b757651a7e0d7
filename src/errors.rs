//! Errors.

use std::io;

/// Errors raised anywhere in the protocol core.
///
/// Variants are grouped the way spec §7's error taxonomy groups them:
/// I/O errors tear the connection down, protocol errors are surfaced as
/// an `ErrorResponse` and (depending on where they were raised) either
/// close the connection or put it into skip-until-sync.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Socket read/write failure. Always fatal to the connection.
    #[error("socket error: {0}")]
    SocketError(String),

    /// The client's startup message was malformed (bad length, missing
    /// `user` key, uneven key/value pairs, not UTF-8, ...).
    #[error("bad startup message: {0}")]
    ClientBadStartup(String),

    /// A frame's type byte, length, or sub-structure didn't make sense:
    /// unknown frame type, malformed length, unknown Describe/Close
    /// source byte, or a binary-format parameter in Bind.
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// A typed reader tried to read past the end of the frame body, or
    /// a length prefix implied more bytes than `MAX_MESSAGE_SIZE` allows.
    #[error("frame too large or truncated: {0}")]
    FrameSizeError(String),

    /// The SQL text could not be parsed by the `Parser` collaborator.
    #[error("syntax error: {0}")]
    ParseError(String),

    /// The parsed tree could not be compiled by the `Compiler` collaborator.
    #[error("could not compile statement: {0}")]
    CompileError(String),

    /// A Simple or Parse query did not resolve to a cursor node (SELECT).
    #[error("not a SELECT")]
    NotSelect,

    /// The connection's cancel flag was observed at an I/O boundary.
    #[error("canceling statement due to user request")]
    QueryCanceled,

    /// Execute/Describe/Close referenced a statement or portal name that
    /// is not registered.
    #[error("prepared statement or portal {0:?} does not exist")]
    UnknownName(String),

    /// No pool/session backend is configured for the requested database.
    #[error("no session configured for database {0:?}")]
    NoSession(String),

    /// The config file was missing, unreadable, or failed to parse.
    #[error("configuration error: {0}")]
    BadConfig(String),
}

impl Error {
    /// True for errors raised outside any dispatched handler (framer-level
    /// I/O, a corrupt startup message): no `ErrorResponse` is attempted and
    /// the connection is torn down directly, per spec §7's propagation
    /// policy. Errors raised *inside* a handler are never fatal by
    /// themselves — whether they close the connection or fall into
    /// skip-until-sync depends on the error mode the dispatcher was in
    /// when the handler ran, not on the error's own kind.
    pub fn is_io_fatal(&self) -> bool {
        matches!(
            self,
            Error::SocketError(_) | Error::ClientBadStartup(_) | Error::FrameSizeError(_)
        )
    }

    /// The SQLSTATE-shaped error code to report. This core never emits a
    /// `C` (SQLSTATE) field (spec §6, §9 open question), this is purely
    /// for internal logging.
    pub fn code(&self) -> &'static str {
        match self {
            Error::SocketError(_) => "08000",
            Error::ClientBadStartup(_) => "08P01",
            Error::ProtocolError(_) => "08P01",
            Error::FrameSizeError(_) => "54000",
            Error::ParseError(_) => "42601",
            Error::CompileError(_) => "42P01",
            Error::NotSelect => "42601",
            Error::QueryCanceled => "57014",
            Error::UnknownName(_) => "26000",
            Error::NoSession(_) => "3D000",
            Error::BadConfig(_) => "F0000",
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::SocketError(err.to_string())
    }
}
