//! Wire-level constants for the Postgres v3 frontend/backend protocol.

/// Regular startup packet: protocol version 3.0 (major=3, minor=0).
pub const PROTOCOL_VERSION_NUMBER: i32 = 196_608;

/// Special startup code meaning "I'd like to cancel a running query".
pub const CANCEL_REQUEST_CODE: i32 = 80_877_102;

/// Special startup code meaning "can we talk over TLS instead?".
pub const SSL_REQUEST_CODE: i32 = 80_877_103;

/// Special startup code for GSSAPI encryption negotiation. Not supported;
/// answered with a single `'G'` byte the same way an SSL request that we
/// can't satisfy is answered with `'N'`.
pub const REQUEST_GSSENCMODE_CODE: i32 = 80_877_104;

/// Upper bound on any single typed frame's length prefix (including the
/// 4-byte length field itself). Matches the teacher's guard against a
/// hostile or corrupt length prefix forcing an unbounded allocation.
pub const MAX_MESSAGE_SIZE: i32 = 256 * 1024 * 1024;

/// Upper bound on the untyped startup packet, before we know the client
/// well enough to trust anything it says.
pub const MAX_STARTUP_SIZE: i32 = 8 * 1024;

pub mod frontend {
    /// Simple query.
    pub const QUERY: u8 = b'Q';
    /// Parse.
    pub const PARSE: u8 = b'P';
    /// Bind.
    pub const BIND: u8 = b'B';
    /// Describe.
    pub const DESCRIBE: u8 = b'D';
    /// Execute.
    pub const EXECUTE: u8 = b'E';
    /// Close.
    pub const CLOSE: u8 = b'C';
    /// Sync.
    pub const SYNC: u8 = b'S';
    /// Terminate.
    pub const TERMINATE: u8 = b'X';
    /// Password message (also used as the one and only auth response we accept).
    pub const PASSWORD: u8 = b'p';
}

pub mod backend {
    /// Authentication (various sub-codes in the i32 payload).
    pub const AUTHENTICATION: u8 = b'R';
    /// ParameterStatus.
    pub const PARAMETER_STATUS: u8 = b'S';
    /// BackendKeyData.
    pub const BACKEND_KEY_DATA: u8 = b'K';
    /// ParseComplete.
    pub const PARSE_COMPLETE: u8 = b'1';
    /// BindComplete.
    pub const BIND_COMPLETE: u8 = b'2';
    /// CloseComplete.
    pub const CLOSE_COMPLETE: u8 = b'3';
    /// NoData.
    pub const NO_DATA: u8 = b'n';
    /// RowDescription.
    pub const ROW_DESCRIPTION: u8 = b'T';
    /// DataRow.
    pub const DATA_ROW: u8 = b'D';
    /// CommandComplete.
    pub const COMMAND_COMPLETE: u8 = b'C';
    /// ErrorResponse.
    pub const ERROR_RESPONSE: u8 = b'E';
    /// ReadyForQuery.
    pub const READY_FOR_QUERY: u8 = b'Z';
}

/// Describe/Close source byte: the name refers to a prepared statement.
pub const TARGET_STATEMENT: u8 = b'S';
/// Describe/Close source byte: the name refers to a bound portal.
pub const TARGET_PORTAL: u8 = b'P';
