//! A minimal in-memory stand-in for the `Parser`/`Compiler`/`Statement`/
//! `Session` collaborators (spec §1's "external collaborators, consumed
//! through typed interfaces"). There is no real SQL engine in this
//! exercise, so this gives the crate something concrete to run and to
//! test the dispatcher's wiring against — it recognizes a handful of
//! literal shapes (`SELECT <int>`, `SELECT $1`, anything else) rather than
//! evaluating SQL. A real deployment swaps this module out entirely by
//! providing its own `SessionFactory`.

use std::any::Any;

use crate::collaborators::{
    BoundPortal, Compiler, ConnectionContext, ParseTree, Parser, ResultFormats, RowBatch, Session,
    SessionFactory, Statement,
};
use crate::errors::Error;
use crate::messages::{ColumnDescriptor, ParamValue};

const OID_INT4: i32 = 23;
const OID_TEXT: i32 = 25;

struct SqlTree {
    sql: String,
    is_cursor: bool,
}

impl ParseTree for SqlTree {
    fn is_cursor(&self) -> bool {
        self.is_cursor
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Splits `sql` on top-level `;` and classifies each piece as a SELECT
/// (cursor node) or not by its leading keyword. No actual grammar.
pub struct ReferenceParser;

impl Parser for ReferenceParser {
    fn parse(&self, sql: &str) -> Result<Vec<Box<dyn ParseTree>>, Error> {
        let trees = sql
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|stmt| {
                let is_cursor = stmt.to_ascii_lowercase().starts_with("select");
                Box::new(SqlTree {
                    sql: stmt.to_string(),
                    is_cursor,
                }) as Box<dyn ParseTree>
            })
            .collect();
        Ok(trees)
    }
}

/// Number of distinct `$n` parameter references in `sql`.
fn count_params(sql: &str) -> usize {
    let mut max_index = 0usize;
    let mut chars = sql.char_indices().peekable();
    while let Some((_, c)) = chars.next() {
        if c != '$' {
            continue;
        }
        let mut digits = String::new();
        while let Some(&(_, d)) = chars.peek() {
            if d.is_ascii_digit() {
                digits.push(d);
                chars.next();
            } else {
                break;
            }
        }
        if let Ok(n) = digits.parse::<usize>() {
            max_index = max_index.max(n);
        }
    }
    max_index
}

/// Parses a bare `SELECT <integer literal>` into its value, if that's all
/// the statement is.
fn constant_int(sql: &str) -> Option<i64> {
    let lower = sql.trim();
    let rest = lower.strip_prefix("SELECT").or_else(|| {
        if lower.len() >= 6 && lower[..6].eq_ignore_ascii_case("select") {
            Some(&lower[6..])
        } else {
            None
        }
    })?;
    rest.trim().parse::<i64>().ok()
}

pub struct ReferenceCompiler;

impl Compiler for ReferenceCompiler {
    fn compile(
        &self,
        tree: &dyn ParseTree,
        param_oids: &[i32],
    ) -> Result<Box<dyn Statement>, Error> {
        if !tree.is_cursor() {
            return Err(Error::NotSelect);
        }
        let sql = tree
            .as_any()
            .downcast_ref::<SqlTree>()
            .expect("ReferenceCompiler only ever sees trees from ReferenceParser")
            .sql
            .clone();
        let nparams = count_params(&sql).max(param_oids.len());
        Ok(Box::new(ReferenceStatement { sql, nparams }))
    }
}

struct ReferenceStatement {
    sql: String,
    nparams: usize,
}

impl ReferenceStatement {
    fn describe(&self) -> Vec<ColumnDescriptor> {
        if constant_int(&self.sql).is_some() {
            vec![ColumnDescriptor::text("?column?", OID_INT4)]
        } else {
            vec![ColumnDescriptor::text("?column?", OID_TEXT)]
        }
    }

    fn rows_unbound(&self) -> RowBatch {
        let value = constant_int(&self.sql)
            .map(|n| n.to_string())
            .unwrap_or_else(|| self.sql.clone());
        RowBatch {
            rows: vec![vec![Some(value.into_bytes())]],
        }
    }
}

impl Statement for ReferenceStatement {
    fn row_description(&self) -> Vec<ColumnDescriptor> {
        self.describe()
    }

    fn execute(&self, _session: &mut dyn Session, max_rows: i32) -> Result<RowBatch, Error> {
        let mut batch = self.rows_unbound();
        if max_rows > 0 {
            batch.rows.truncate(max_rows as usize);
        }
        Ok(batch)
    }

    fn bind(
        &self,
        params: &[ParamValue],
        result_formats: ResultFormats,
    ) -> Result<Box<dyn BoundPortal>, Error> {
        if params.len() != self.nparams {
            return Err(Error::CompileError(format!(
                "expected {} parameters, got {}",
                self.nparams,
                params.len()
            )));
        }
        Ok(Box::new(ReferencePortal {
            sql: self.sql.clone(),
            params: params.to_vec(),
            result_formats,
        }))
    }
}

struct ReferencePortal {
    sql: String,
    params: Vec<ParamValue>,
    result_formats: ResultFormats,
}

impl ReferencePortal {
    fn value(&self) -> String {
        if let Some(n) = constant_int(&self.sql) {
            return n.to_string();
        }
        if self.sql.contains('$') {
            if let Some(ParamValue::Text(s)) = self.params.first() {
                return s.clone();
            }
            if let Some(ParamValue::Null) = self.params.first() {
                return String::new();
            }
        }
        self.sql.clone()
    }
}

impl BoundPortal for ReferencePortal {
    fn row_description(&self) -> Vec<ColumnDescriptor> {
        let mut col = if constant_int(&self.sql).is_some() {
            ColumnDescriptor::text("?column?", OID_INT4)
        } else {
            ColumnDescriptor::text("?column?", OID_TEXT)
        };
        col.format = self.result_formats.format_for(0);
        vec![col]
    }

    fn execute(&self, _session: &mut dyn Session, max_rows: i32) -> Result<RowBatch, Error> {
        if constant_int(&self.sql).is_none() && self.sql.contains('$') {
            if let Some(ParamValue::Null) = self.params.first() {
                let mut batch = RowBatch {
                    rows: vec![vec![None]],
                };
                if max_rows > 0 {
                    batch.rows.truncate(max_rows as usize);
                }
                return Ok(batch);
            }
        }
        let mut batch = RowBatch {
            rows: vec![vec![Some(self.value().into_bytes())]],
        };
        if max_rows > 0 {
            batch.rows.truncate(max_rows as usize);
        }
        Ok(batch)
    }
}

pub struct ReferenceSession;

impl Session for ReferenceSession {}

pub struct ReferenceSessionFactory;

impl SessionFactory for ReferenceSessionFactory {
    fn connect(&self, _database: &str, _user: &str) -> Result<ConnectionContext, Error> {
        Ok(ConnectionContext {
            session: Box::new(ReferenceSession),
            parser: Box::new(ReferenceParser),
            compiler: Box::new(ReferenceCompiler),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_select_as_cursor() {
        let parser = ReferenceParser;
        let trees = parser.parse("SELECT 1").unwrap();
        assert_eq!(trees.len(), 1);
        assert!(trees[0].is_cursor());
    }

    #[test]
    fn rejects_non_select() {
        let parser = ReferenceParser;
        let trees = parser.parse("DELETE FROM foo").unwrap();
        assert!(!trees[0].is_cursor());
    }

    #[test]
    fn counts_dollar_params() {
        assert_eq!(count_params("SELECT $1, $2"), 2);
        assert_eq!(count_params("SELECT 1"), 0);
    }

    #[test]
    fn parses_constant_int() {
        assert_eq!(constant_int("SELECT 1"), Some(1));
        assert_eq!(constant_int("select  42"), Some(42));
        assert_eq!(constant_int("SELECT $1"), None);
    }
}
