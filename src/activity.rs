use serde::Serialize;
use serde_json::Value;

use crate::db::repos::resources::activity_log;
use crate::db::DbPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }
}

/// Fire-and-forget activity sink. Implementations must never fail the caller.
pub trait ActivityLogger: Send + Sync {
    fn log(&self, event: &str, level: LogLevel, context: Value);
}

/// Appends to the `activity_log` table.
pub struct DbActivityLogger {
    pool: DbPool,
}

impl DbActivityLogger {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

impl ActivityLogger for DbActivityLogger {
    fn log(&self, event: &str, level: LogLevel, context: Value) {
        let context = match context {
            Value::Null => None,
            other => Some(other.to_string()),
        };
        if let Err(e) = activity_log::insert(&self.pool, event, level.as_str(), context.as_deref()) {
            tracing::debug!(event, error = %e, "Activity log write failed");
        }
    }
}

/// Discards everything.
pub struct NoopActivityLogger;

impl ActivityLogger for NoopActivityLogger {
    fn log(&self, _event: &str, _level: LogLevel, _context: Value) {}
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Captures events in memory for assertions.
    #[derive(Default)]
    pub(crate) struct RecordingLogger {
        pub events: Mutex<Vec<(String, LogLevel, Value)>>,
    }

    impl RecordingLogger {
        pub fn events_named(&self, name: &str) -> Vec<(LogLevel, Value)> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|(e, _, _)| e == name)
                .map(|(_, l, c)| (*l, c.clone()))
                .collect()
        }
    }

    impl ActivityLogger for RecordingLogger {
        fn log(&self, event: &str, level: LogLevel, context: Value) {
            self.events.lock().unwrap().push((event.to_string(), level, context));
        }
    }

    #[test]
    fn test_db_logger_writes_json_context() {
        let pool = crate::db::init_test_db().unwrap();
        let logger = DbActivityLogger::new(pool.clone());
        logger.log(
            "migration_batch_completed",
            LogLevel::Info,
            serde_json::json!({ "table": "submissions", "processed": 2 }),
        );

        let entries = activity_log::get_by_event(&pool, "migration_batch_completed", 5).unwrap();
        assert_eq!(entries.len(), 1);
        let ctx: Value = serde_json::from_str(entries[0].context.as_deref().unwrap()).unwrap();
        assert_eq!(ctx["processed"], 2);
    }

    #[test]
    fn test_db_logger_swallows_failures() {
        let pool = crate::db::init_test_db().unwrap();
        pool.get().unwrap().execute_batch("DROP TABLE activity_log;").unwrap();
        let logger = DbActivityLogger::new(pool);
        logger.log("anything", LogLevel::Error, Value::Null);
    }
}
