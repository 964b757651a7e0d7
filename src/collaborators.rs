//! Typed interfaces to the SQL engine this core fronts. `Connection` only
//! ever talks to these traits — never to a concrete parser/compiler/engine
//! — so the engine underneath is swappable at connection construction
//! (spec §9: "two implementations ... selectable at connection
//! construction").
//!
//! `Statement::execute`/`BoundPortal::execute` return the rows gathered
//! rather than writing `DataRow` frames themselves: a trait object's
//! methods can't be generic over the caller's concrete `Framer<R, W>`, so
//! the frame-writing stays in `Connection`, which does own a concrete
//! `Framer`. Everything else mirrors the interface as specified.

use std::any::Any;

use crate::errors::Error;
use crate::messages::{ColumnDescriptor, FieldFormat, FieldValue, ParamValue};

/// A parsed SQL statement, opaque beyond the one bit the dispatcher needs:
/// whether it's a result-returning SELECT (a "cursor node"). `as_any` lets
/// a `Compiler` downcast back to its own concrete tree type; `Connection`
/// itself only ever calls `is_cursor`.
pub trait ParseTree: Send {
    fn is_cursor(&self) -> bool;
    fn as_any(&self) -> &dyn Any;
}

/// SQL text → parse trees. A simple query's text may hold several
/// semicolon-separated statements; a Parse frame's text holds exactly one.
pub trait Parser: Send + Sync {
    fn parse(&self, sql: &str) -> Result<Vec<Box<dyn ParseTree>>, Error>;
}

/// Parse tree (+ optional parameter type hints) → executable `Statement`.
pub trait Compiler: Send + Sync {
    fn compile(
        &self,
        tree: &dyn ParseTree,
        param_oids: &[i32],
    ) -> Result<Box<dyn Statement>, Error>;
}

/// Per-column result format, as negotiated by a Bind frame (spec §4.3.3).
#[derive(Debug, Clone)]
pub enum ResultFormats {
    /// `nResultFormats == 0`: every column comes back as text.
    AllText,
    /// `nResultFormats == 1`: this one format applies to every column.
    Single(FieldFormat),
    /// `nResultFormats > 1`: explicit per-column list; columns beyond the
    /// list's length use its last entry as the default.
    PerColumn(Vec<FieldFormat>),
}

impl ResultFormats {
    pub fn format_for(&self, column_index: usize) -> FieldFormat {
        match self {
            ResultFormats::AllText => FieldFormat::Text,
            ResultFormats::Single(f) => *f,
            ResultFormats::PerColumn(list) => {
                list.get(column_index).copied().unwrap_or_else(|| {
                    *list.last().expect("Bind with nResultFormats > 1 but empty list")
                })
            }
        }
    }
}

/// Rows gathered by an `execute` call, ready to be streamed out as
/// `DataRow` frames by the caller.
pub struct RowBatch {
    pub rows: Vec<Vec<FieldValue>>,
}

impl RowBatch {
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// A compiled, stateless-across-executions statement (spec §4.2, §3).
pub trait Statement: Send {
    fn row_description(&self) -> Vec<ColumnDescriptor>;

    /// `max_rows < 0` or `== 0` both mean unbounded (matches libpq).
    fn execute(&self, session: &mut dyn Session, max_rows: i32) -> Result<RowBatch, Error>;

    /// Bind parameter text values and a result-format negotiation into a
    /// portal. Per spec Non-goals, binary parameters are rejected before
    /// this is ever called — every `ParamValue` here is `Null` or `Text`.
    fn bind(
        &self,
        params: &[ParamValue],
        result_formats: ResultFormats,
    ) -> Result<Box<dyn BoundPortal>, Error>;
}

/// A `Statement` bound to concrete parameters and result formats.
pub trait BoundPortal: Send {
    fn row_description(&self) -> Vec<ColumnDescriptor>;

    /// May be invoked more than once per spec's `Execute` handling is
    /// silent on repeats; this core only ever calls it once per Execute
    /// frame as the dispatcher demands (§4.2 invariant).
    fn execute(&self, session: &mut dyn Session, max_rows: i32) -> Result<RowBatch, Error>;
}

/// Per-connection session state. Transaction status is surfaced so the
/// dispatcher can fill in `ReadyForQuery`'s status byte without owning any
/// transaction logic itself (SPEC_FULL supplement; spec's `TransactionService`
/// is otherwise fully opaque and unused by the protocol core).
pub trait Session: Send {
    /// `'I'` idle, `'T'` in a transaction, `'E'` in a failed transaction.
    /// Defaults to always-idle, matching a core with no transaction
    /// lifecycle of its own to report.
    fn transaction_status(&self) -> char {
        'I'
    }
}

/// Produces a fresh `(Session, Parser, Compiler)` triple for one connection,
/// given the `database`/`user` startup properties (spec §3: "Session/parser/
/// compiler: created in Startup").
pub trait SessionFactory: Send + Sync {
    fn connect(&self, database: &str, user: &str) -> Result<ConnectionContext, Error>;
}

pub struct ConnectionContext {
    pub session: Box<dyn Session>,
    pub parser: Box<dyn Parser>,
    pub compiler: Box<dyn Compiler>,
}
