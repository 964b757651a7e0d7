//! Builders for backend messages. Each function stages bytes onto a
//! `Framer` via `begin_message`/`write_*`/`end_message`; callers decide
//! when to `flush` (spec §4.1, §4.2).

use crate::messages::constants::backend::*;
use crate::messages::frame::Framer;
use crate::messages::types::{ColumnDescriptor, FieldValue};
use tokio::io::{AsyncRead, AsyncWrite};

impl<R, W> Framer<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// `AuthenticationCleartextPassword`.
    pub fn auth_cleartext_password(&mut self) -> &mut Self {
        self.begin_message(AUTHENTICATION);
        self.write_i32(3);
        self.end_message();
        self
    }

    /// `AuthenticationOk`.
    pub fn auth_ok(&mut self) -> &mut Self {
        self.begin_message(AUTHENTICATION);
        self.write_i32(0);
        self.end_message();
        self
    }

    pub fn parameter_status(&mut self, name: &str, value: &str) -> &mut Self {
        self.begin_message(PARAMETER_STATUS);
        self.write_cstr(name);
        self.write_cstr(value);
        self.end_message();
        self
    }

    pub fn backend_key_data(&mut self, process_id: i32, secret_key: i32) -> &mut Self {
        self.begin_message(BACKEND_KEY_DATA);
        self.write_i32(process_id);
        self.write_i32(secret_key);
        self.end_message();
        self
    }

    /// `ReadyForQuery`. `status` is `'I'`/`'T'`/`'E'` (idle / in-transaction
    /// / failed-transaction), sourced from `Session::transaction_status`.
    pub fn ready_for_query(&mut self, status: char) -> &mut Self {
        self.begin_message(READY_FOR_QUERY);
        self.write_bytes(&[status as u8]);
        self.end_message();
        self
    }

    pub fn parse_complete(&mut self) -> &mut Self {
        self.begin_message(PARSE_COMPLETE);
        self.end_message();
        self
    }

    pub fn bind_complete(&mut self) -> &mut Self {
        self.begin_message(BIND_COMPLETE);
        self.end_message();
        self
    }

    pub fn close_complete(&mut self) -> &mut Self {
        self.begin_message(CLOSE_COMPLETE);
        self.end_message();
        self
    }

    pub fn no_data(&mut self) -> &mut Self {
        self.begin_message(NO_DATA);
        self.end_message();
        self
    }

    pub fn command_complete(&mut self, tag: &str) -> &mut Self {
        self.begin_message(COMMAND_COMPLETE);
        self.write_cstr(tag);
        self.end_message();
        self
    }

    pub fn row_description(&mut self, columns: &[ColumnDescriptor]) -> &mut Self {
        self.begin_message(ROW_DESCRIPTION);
        self.write_i16(columns.len() as i16);
        for col in columns {
            self.write_cstr(&col.name);
            self.write_i32(col.table_oid);
            self.write_i16(col.column_id);
            self.write_i32(col.type_oid);
            self.write_i16(col.type_size);
            self.write_i32(col.type_modifier);
            self.write_i16(col.format.code());
        }
        self.end_message();
        self
    }

    pub fn data_row(&mut self, values: &[FieldValue]) -> &mut Self {
        self.begin_message(DATA_ROW);
        self.write_i16(values.len() as i16);
        for value in values {
            match value {
                None => {
                    self.write_i32(-1);
                }
                Some(bytes) => {
                    self.write_i32(bytes.len() as i32);
                    self.write_bytes(bytes);
                }
            }
        }
        self.end_message();
        self
    }

    /// `ErrorResponse`. Field `S` (severity) and `M` (message) are always
    /// sent; a SQLSTATE `C` field is deliberately never emitted (spec §9
    /// open question — we have no catalog of real SQLSTATEs to be honest
    /// about, and a fabricated one is worse than none).
    pub fn error_response(&mut self, severity: &str, message: &str) -> &mut Self {
        self.begin_message(ERROR_RESPONSE);
        self.write_bytes(b"S");
        self.write_cstr(severity);
        self.write_bytes(b"M");
        self.write_cstr(message);
        self.write_bytes(&[0]);
        self.end_message();
        self
    }

}
