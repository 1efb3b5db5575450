use serde_json::json;

use crate::activity::{ActivityLogger, LogLevel};
use crate::db::repos::core::settings;
use crate::db::settings_keys;
use crate::db::DbPool;
use crate::error::AppError;
use crate::migration::status::MigrationStatus;

/// Record the completion timestamp the first time a migration reports zero
/// pending rows. Later calls leave the original timestamp in place.
/// Returns true when this call wrote it.
pub fn mark_complete(
    pool: &DbPool,
    logger: &dyn ActivityLogger,
    migration_key: &str,
    status: &MigrationStatus,
) -> Result<bool, AppError> {
    let now = chrono::Utc::now().to_rfc3339();
    let written = settings::set_if_absent(pool, &settings_keys::migration_completed_at(migration_key), &now)?;

    if written {
        tracing::info!(migration = migration_key, total = status.total, "Migration complete");
        logger.log(
            "migration_completed",
            LogLevel::Info,
            json!({ "migration": migration_key, "total": status.total, "completed_at": now }),
        );
    }
    Ok(written)
}

/// When the migration first completed, if it has.
pub fn completed_at(pool: &DbPool, migration_key: &str) -> Result<Option<String>, AppError> {
    settings::get(pool, &settings_keys::migration_completed_at(migration_key))
}
