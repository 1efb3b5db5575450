use rusqlite::{params, Row};

use crate::db::models::ActivityEntry;
use crate::db::DbPool;
use crate::error::AppError;

fn row_to_entry(row: &Row) -> rusqlite::Result<ActivityEntry> {
    Ok(ActivityEntry {
        id: row.get("id")?,
        event: row.get("event")?,
        level: row.get("level")?,
        context: row.get("context")?,
        created_at: row.get("created_at")?,
    })
}

// ---------------------------------------------------------------------------
// Insert (append-only, no update or delete)
// ---------------------------------------------------------------------------

/// Append a new entry to the activity log.
pub fn insert(
    pool: &DbPool,
    event: &str,
    level: &str,
    context: Option<&str>,
) -> Result<(), AppError> {
    let conn = pool.get()?;
    let id = uuid::Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO activity_log (id, event, level, context, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![id, event, level, context, now],
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Entries for one event name, newest first.
pub fn get_by_event(pool: &DbPool, event: &str, limit: u32) -> Result<Vec<ActivityEntry>, AppError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT id, event, level, context, created_at
         FROM activity_log
         WHERE event = ?1
         ORDER BY created_at DESC
         LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![event, limit], row_to_entry)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(AppError::Database)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db;

    #[test]
    fn test_insert_and_query() {
        let pool = init_test_db().unwrap();

        insert(&pool, "migration_batch_completed", "info", Some(r#"{"processed":3}"#)).unwrap();
        insert(&pool, "identifier_length_unrecognized", "warning", None).unwrap();

        let batches = get_by_event(&pool, "migration_batch_completed", 10).unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].level, "info");
        assert_eq!(batches[0].context.as_deref(), Some(r#"{"processed":3}"#));

        let warnings = get_by_event(&pool, "identifier_length_unrecognized", 10).unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].context, None);
    }

    #[test]
    fn test_rejects_unknown_level() {
        let pool = init_test_db().unwrap();
        assert!(insert(&pool, "x", "critical", None).is_err());
    }
}
