use std::iter::Sum;
use std::ops::Add;

use rusqlite::Connection;
use serde::Serialize;

use crate::db::repos::resources::records;
use crate::error::AppError;
use crate::migration::introspect::ColumnIntrospector;

/// Raw counts for one physical table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableCounts {
    pub total: i64,
    pub migrated: i64,
}

impl Add for TableCounts {
    type Output = TableCounts;

    fn add(self, rhs: TableCounts) -> TableCounts {
        TableCounts {
            total: self.total + rhs.total,
            migrated: self.migrated + rhs.migrated,
        }
    }
}

impl Sum for TableCounts {
    fn sum<I: Iterator<Item = TableCounts>>(iter: I) -> TableCounts {
        iter.fold(TableCounts::default(), Add::add)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationPhase {
    NotStarted,
    InProgress,
    Complete,
}

/// Progress of one migration, aggregated over every table it touches.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationStatus {
    pub total: i64,
    pub migrated: i64,
    pub pending: i64,
    pub percent: f64,
    pub is_complete: bool,
}

impl MigrationStatus {
    /// Derive pending, percent and completion from summed counts. An empty
    /// dataset is 100% complete.
    pub fn from_counts(counts: TableCounts) -> Self {
        let pending = (counts.total - counts.migrated).max(0);
        let percent = if counts.total == 0 {
            100.0
        } else {
            round2(counts.migrated as f64 / counts.total as f64 * 100.0)
        };
        Self {
            total: counts.total,
            migrated: counts.migrated,
            pending,
            percent,
            is_complete: pending == 0,
        }
    }

    pub fn phase(&self) -> MigrationPhase {
        if self.is_complete {
            MigrationPhase::Complete
        } else if self.migrated == 0 {
            MigrationPhase::NotStarted
        } else {
            MigrationPhase::InProgress
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Predicates that define one table's share of a migration.
///
/// `migrated` must imply `total`, so `total - migrated` is exactly the set of
/// rows still waiting for the migration.
#[derive(Debug, Clone)]
pub struct StatusQuery {
    pub total: String,
    pub migrated: String,
}

/// Count `total` / `migrated` rows for one table. A table that does not exist,
/// or lacks any of `required_columns`, contributes zero.
pub fn count_table_status(
    conn: &Connection,
    introspector: &ColumnIntrospector,
    table: &str,
    required_columns: &[&str],
    query: &StatusQuery,
) -> Result<TableCounts, AppError> {
    if !introspector.table_exists(table)? || !introspector.has_columns(table, required_columns)? {
        tracing::debug!(table, "Table not eligible, counting as empty");
        return Ok(TableCounts::default());
    }

    Ok(TableCounts {
        total: records::count_where(conn, table, &query.total)?,
        migrated: records::count_where(conn, table, &format!("({}) AND ({})", query.total, query.migrated))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db;
    use crate::db::repos::resources::records::non_empty;

    #[test]
    fn test_from_counts() {
        let status = MigrationStatus::from_counts(TableCounts { total: 3, migrated: 1 });
        assert_eq!(status.pending, 2);
        assert_eq!(status.percent, 33.33);
        assert!(!status.is_complete);
        assert_eq!(status.phase(), MigrationPhase::InProgress);
    }

    #[test]
    fn test_empty_dataset_is_complete() {
        let status = MigrationStatus::from_counts(TableCounts::default());
        assert_eq!(status.percent, 100.0);
        assert!(status.is_complete);
        assert_eq!(status.phase(), MigrationPhase::Complete);
    }

    #[test]
    fn test_not_started() {
        let status = MigrationStatus::from_counts(TableCounts { total: 5, migrated: 0 });
        assert_eq!(status.percent, 0.0);
        assert_eq!(status.phase(), MigrationPhase::NotStarted);
    }

    #[test]
    fn test_counts_are_summed_not_averaged() {
        let a = TableCounts { total: 10, migrated: 0 };
        let b = TableCounts { total: 0, migrated: 0 };
        let status = MigrationStatus::from_counts([a, b].into_iter().sum());
        assert_eq!(status.total, 10);
        assert_eq!(status.percent, 0.0);

        let c = TableCounts { total: 90, migrated: 90 };
        let status = MigrationStatus::from_counts([a, c].into_iter().sum());
        assert_eq!(status.percent, 90.0);
    }

    #[test]
    fn test_count_table_status_absent_table_is_zero() {
        let pool = init_test_db().unwrap();
        let conn = pool.get().unwrap();
        let introspector = ColumnIntrospector::new(pool.clone());
        let query = StatusQuery {
            total: non_empty("email").unwrap(),
            migrated: non_empty("email_hash").unwrap(),
        };

        let counts = count_table_status(&conn, &introspector, "wp_missing", &["email"], &query).unwrap();
        assert_eq!(counts, TableCounts::default());
    }

    #[test]
    fn test_count_table_status_counts_rows() {
        let pool = init_test_db().unwrap();
        let conn = pool.get().unwrap();
        conn.execute_batch(
            "INSERT INTO submissions (email, email_hash) VALUES ('a@b.c', 'h1');
             INSERT INTO submissions (email) VALUES ('d@e.f');
             INSERT INTO submissions (email) VALUES (NULL);",
        )
        .unwrap();
        let introspector = ColumnIntrospector::new(pool.clone());
        let query = StatusQuery {
            total: non_empty("email").unwrap(),
            migrated: non_empty("email_hash").unwrap(),
        };

        let counts =
            count_table_status(&conn, &introspector, "submissions", &["email", "email_hash"], &query).unwrap();
        assert_eq!(counts, TableCounts { total: 2, migrated: 1 });
    }
}
