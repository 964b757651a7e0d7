//! Postgres v3 wire protocol: frame I/O and message construction.

pub mod builder;
pub mod constants;
pub mod frame;
pub mod types;

pub use constants::*;
pub use frame::{FrameReader, Framer, StartupFrame};
pub use types::{ColumnDescriptor, FieldFormat, FieldValue, ParamValue};
