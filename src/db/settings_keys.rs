/// Canonical settings key constants for `app_settings` table.
///
/// Use these instead of raw string literals to prevent typo-based key mismatches.

/// Prefix for per-migration state keys (`migration:{key}:...`).
pub const MIGRATION_PREFIX: &str = "migration:";

/// RFC 3339 timestamp written once when a migration first reports zero pending rows.
pub fn migration_completed_at(migration_key: &str) -> String {
    format!("{MIGRATION_PREFIX}{migration_key}:completed_at")
}
