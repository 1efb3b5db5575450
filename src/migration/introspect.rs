use std::collections::HashMap;
use std::sync::Mutex;

use rusqlite::params;

use crate::db::DbPool;
use crate::error::AppError;

/// Cached answers to "does this table / column exist?".
///
/// The schema is assumed not to change while an introspector is alive, so a
/// result is cached for its whole lifetime. Build one per run and share it.
pub struct ColumnIntrospector {
    pool: DbPool,
    /// `(table, None)` caches table existence, `(table, Some(column))` a column.
    cache: Mutex<HashMap<(String, Option<String>), bool>>,
}

impl ColumnIntrospector {
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn table_exists(&self, table: &str) -> Result<bool, AppError> {
        let key = (table.to_string(), None);
        if let Some(hit) = self.cached(&key)? {
            return Ok(hit);
        }

        let conn = self.pool.get()?;
        let exists = conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![table],
            |row| row.get::<_, i64>(0),
        )? > 0;

        self.store(key, exists)?;
        Ok(exists)
    }

    pub fn column_exists(&self, table: &str, column: &str) -> Result<bool, AppError> {
        let key = (table.to_string(), Some(column.to_string()));
        if let Some(hit) = self.cached(&key)? {
            return Ok(hit);
        }

        let exists = if self.table_exists(table)? {
            let conn = self.pool.get()?;
            conn.query_row(
                "SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name = ?2",
                params![table, column],
                |row| row.get::<_, i64>(0),
            )? > 0
        } else {
            false
        };

        self.store(key, exists)?;
        Ok(exists)
    }

    /// The subset of `columns` absent from `table` (all of them if the table is absent).
    pub fn missing_columns<'a>(&self, table: &str, columns: &[&'a str]) -> Result<Vec<&'a str>, AppError> {
        let mut missing = Vec::new();
        for column in columns {
            if !self.column_exists(table, column)? {
                missing.push(*column);
            }
        }
        Ok(missing)
    }

    pub fn has_columns(&self, table: &str, columns: &[&str]) -> Result<bool, AppError> {
        Ok(self.missing_columns(table, columns)?.is_empty())
    }

    /// Number of cached answers.
    pub fn cached_len(&self) -> Result<usize, AppError> {
        let cache = self
            .cache
            .lock()
            .map_err(|_| AppError::Internal("Column cache lock poisoned".into()))?;
        Ok(cache.len())
    }

    fn cached(&self, key: &(String, Option<String>)) -> Result<Option<bool>, AppError> {
        let cache = self
            .cache
            .lock()
            .map_err(|_| AppError::Internal("Column cache lock poisoned".into()))?;
        Ok(cache.get(key).copied())
    }

    fn store(&self, key: (String, Option<String>), exists: bool) -> Result<(), AppError> {
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| AppError::Internal("Column cache lock poisoned".into()))?;
        cache.insert(key, exists);
        Ok(())
    }
}
