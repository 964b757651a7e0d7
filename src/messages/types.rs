//! Small shared value types used by frame encoding/decoding.

use crate::errors::Error;

/// Column result format, per-column in `RowDescription`/parameter list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldFormat {
    Text,
    Binary,
}

impl FieldFormat {
    pub fn from_code(code: i16) -> Result<Self, Error> {
        match code {
            0 => Ok(FieldFormat::Text),
            1 => Ok(FieldFormat::Binary),
            other => Err(Error::ProtocolError(format!(
                "unknown format code {other}"
            ))),
        }
    }

    pub fn code(self) -> i16 {
        match self {
            FieldFormat::Text => 0,
            FieldFormat::Binary => 1,
        }
    }
}

/// One column of a `RowDescription`, as handed to us by a `Statement`.
///
/// This core treats type information opaquely: the `Statement`/`Compiler`
/// collaborator is the authority on OIDs, sizes and modifiers (spec §4.2).
#[derive(Debug, Clone)]
pub struct ColumnDescriptor {
    pub name: String,
    /// OID of the table the column comes from, or 0 if none.
    pub table_oid: i32,
    /// Attribute number within that table, or 0 if none.
    pub column_id: i16,
    /// The column's data type OID.
    pub type_oid: i32,
    /// `pg_type.typlen`, or -1 for variable-length types.
    pub type_size: i16,
    /// Type-specific modifier (e.g. a `numeric`'s precision/scale), or -1.
    pub type_modifier: i32,
    /// Format this column will be sent in.
    pub format: FieldFormat,
}

impl ColumnDescriptor {
    /// Convenience constructor for a variable-length text-formatted column,
    /// the overwhelmingly common case for this core's supported SQL surface
    /// (SELECT-shaped statements with no binary result format negotiated).
    pub fn text(name: impl Into<String>, type_oid: i32) -> Self {
        ColumnDescriptor {
            name: name.into(),
            table_oid: 0,
            column_id: 0,
            type_oid,
            type_size: -1,
            type_modifier: -1,
            format: FieldFormat::Text,
        }
    }
}

/// A single value in a `DataRow`. `None` is SQL NULL.
pub type FieldValue = Option<Vec<u8>>;

/// A decoded (or still-opaque) bind parameter. Per spec Non-goals, binary
/// parameter payloads are rejected rather than decoded; only the text
/// form ever reaches a `Statement`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    Null,
    Text(String),
}
