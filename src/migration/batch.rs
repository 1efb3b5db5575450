use serde::Serialize;
use serde_json::json;

use crate::activity::{ActivityLogger, LogLevel};
use crate::error::AppError;

/// A selected row that can be migrated on its own.
pub trait BatchRow {
    fn id(&self) -> i64;
}

/// What happened to one row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowOutcome {
    Updated,
    Failed(String),
}

/// Result of one bounded batch over one or more tables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchResult {
    pub processed: usize,
    pub errors: Vec<String>,
}

impl BatchResult {
    pub fn record(&mut self, outcome: RowOutcome) {
        match outcome {
            RowOutcome::Updated => self.processed += 1,
            RowOutcome::Failed(message) => self.errors.push(message),
        }
    }

    /// Fold another table's result into this one.
    pub fn absorb(&mut self, other: BatchResult) {
        self.processed += other.processed;
        self.errors.extend(other.errors);
    }
}

pub fn format_row_error(table: &str, id: i64, message: &str) -> String {
    format!("Row {id} in {table}: {message}")
}

/// Run `migrate` on every row in order, isolating failures.
///
/// A failing row is recorded and skipped; it stays pending and is picked up
/// again by the next batch. Emits a `migration_batch_completed` activity entry
/// at the end.
pub fn process_rows<R, F>(
    table: &str,
    rows: &[R],
    logger: &dyn ActivityLogger,
    mut migrate: F,
) -> BatchResult
where
    R: BatchRow,
    F: FnMut(&R) -> Result<(), AppError>,
{
    let mut result = BatchResult::default();

    for row in rows {
        let outcome = match migrate(row) {
            Ok(()) => RowOutcome::Updated,
            Err(e) => {
                let message = format_row_error(table, row.id(), &e.to_string());
                tracing::warn!(table, row_id = row.id(), error = %e, "Row migration failed");
                logger.log(
                    "migration_row_failed",
                    LogLevel::Error,
                    json!({ "table": table, "row_id": row.id(), "error": e.to_string() }),
                );
                RowOutcome::Failed(message)
            }
        };
        result.record(outcome);
    }

    tracing::info!(
        table,
        selected = rows.len(),
        processed = result.processed,
        errors = result.errors.len(),
        "Migration batch completed"
    );
    logger.log(
        "migration_batch_completed",
        LogLevel::Info,
        json!({
            "table": table,
            "processed": result.processed,
            "errors": result.errors.len(),
        }),
    );

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::tests::RecordingLogger;

    struct Row(i64);

    impl BatchRow for Row {
        fn id(&self) -> i64 {
            self.0
        }
    }

    #[test]
    fn test_bad_row_does_not_abort_batch() {
        let logger = RecordingLogger::default();
        let rows = [Row(1), Row(2), Row(3)];
        let mut seen = Vec::new();

        let result = process_rows("submissions", &rows, &logger, |row| {
            seen.push(row.id());
            if row.id() == 2 {
                return Err(AppError::Validation("cannot decrypt".into()));
            }
            Ok(())
        });

        assert_eq!(seen, vec![1, 2, 3]);
        assert_eq!(result.processed, 2);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("Row 2 in submissions"));
        assert!(result.errors[0].contains("cannot decrypt"));

        let completed = logger.events_named("migration_batch_completed");
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].1["processed"], 2);
        assert_eq!(completed[0].1["errors"], 1);
        assert_eq!(logger.events_named("migration_row_failed").len(), 1);
    }

    #[test]
    fn test_empty_batch() {
        let logger = RecordingLogger::default();
        let result = process_rows::<Row, _>("appointments", &[], &logger, |_| Ok(()));
        assert_eq!(result, BatchResult::default());
    }

    #[test]
    fn test_absorb() {
        let mut a = BatchResult {
            processed: 2,
            errors: vec!["x".into()],
        };
        a.absorb(BatchResult {
            processed: 3,
            errors: vec!["y".into()],
        });
        assert_eq!(a.processed, 5);
        assert_eq!(a.errors, vec!["x".to_string(), "y".to_string()]);
    }
}
