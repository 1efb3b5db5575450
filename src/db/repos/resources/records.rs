//! Generic row access for the migration tables.
//!
//! SQLite cannot bind identifiers, so table and column names go through
//! [`quote_ident`] (validated, double-quoted) and every value is bound.

use std::sync::OnceLock;

use regex::Regex;
use rusqlite::types::{ToSql, ToSqlOutput};
use rusqlite::Connection;

use crate::error::AppError;

fn ident_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,63}$").expect("static regex"))
}

/// Validate an SQL identifier and return it double-quoted.
pub fn quote_ident(name: &str) -> Result<String, AppError> {
    if !ident_pattern().is_match(name) {
        return Err(AppError::Validation(format!("Invalid SQL identifier: {name:?}")));
    }
    Ok(format!("\"{name}\""))
}

/// SQL fragment: the column holds a non-empty value.
pub fn non_empty(column: &str) -> Result<String, AppError> {
    let col = quote_ident(column)?;
    Ok(format!("({col} IS NOT NULL AND {col} <> '')"))
}

/// What a migration writes into one column of one row.
///
/// `NotPresent` and `Retired` both store SQL NULL. They are kept apart because
/// "the source never had this field" and "this column was cleared after its
/// value moved elsewhere" mean different things to anyone reading the row
/// history or the logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnWrite {
    Value(String),
    NotPresent,
    Retired,
}

impl ColumnWrite {
    pub fn from_option(value: Option<String>) -> Self {
        value.map_or(ColumnWrite::NotPresent, ColumnWrite::Value)
    }

    pub fn as_value(&self) -> Option<&str> {
        match self {
            ColumnWrite::Value(v) => Some(v),
            ColumnWrite::NotPresent | ColumnWrite::Retired => None,
        }
    }
}

impl ToSql for ColumnWrite {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        match self {
            ColumnWrite::Value(v) => v.to_sql(),
            ColumnWrite::NotPresent | ColumnWrite::Retired => Ok(ToSqlOutput::from(rusqlite::types::Null)),
        }
    }
}

/// A single-row UPDATE keyed by primary key.
#[derive(Debug, Clone)]
pub struct RowUpdate {
    pub id: i64,
    pub columns: Vec<(&'static str, ColumnWrite)>,
}

impl RowUpdate {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            columns: Vec::new(),
        }
    }

    pub fn set(mut self, column: &'static str, write: ColumnWrite) -> Self {
        self.columns.push((column, write));
        self
    }

    pub fn push(&mut self, column: &'static str, write: ColumnWrite) {
        self.columns.push((column, write));
    }

    pub fn get(&self, column: &str) -> Option<&ColumnWrite> {
        self.columns.iter().find(|(c, _)| *c == column).map(|(_, w)| w)
    }

    pub fn writes_any_value(&self) -> bool {
        self.columns.iter().any(|(_, w)| w.as_value().is_some())
    }

    /// Execute the UPDATE. Returns the number of rows affected (0 or 1).
    pub fn apply(&self, conn: &Connection, table: &str) -> Result<usize, AppError> {
        if self.columns.is_empty() {
            return Err(AppError::Validation(format!(
                "Row {} in {table}: update has no columns",
                self.id
            )));
        }

        let mut sets = Vec::with_capacity(self.columns.len());
        let mut values: Vec<&dyn ToSql> = Vec::with_capacity(self.columns.len() + 1);
        for (idx, (column, write)) in self.columns.iter().enumerate() {
            sets.push(format!("{} = ?{}", quote_ident(column)?, idx + 1));
            values.push(write);
        }
        values.push(&self.id);

        let sql = format!(
            "UPDATE {} SET {} WHERE id = ?{}",
            quote_ident(table)?,
            sets.join(", "),
            values.len()
        );
        Ok(conn.execute(&sql, values.as_slice())?)
    }
}

/// `SELECT COUNT(*) FROM table WHERE predicate`. The predicate is built from
/// validated identifiers only.
pub fn count_where(conn: &Connection, table: &str, predicate: &str) -> Result<i64, AppError> {
    let sql = format!("SELECT COUNT(*) FROM {} WHERE {}", quote_ident(table)?, predicate);
    Ok(conn.query_row(&sql, [], |row| row.get::<_, i64>(0))?)
}
