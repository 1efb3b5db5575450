use rusqlite::Connection;

use crate::error::AppError;

/// Run the base schema. Creates the tables with their legacy plaintext
/// columns; encrypted and split columns come from the incremental upgrades.
pub fn run(conn: &Connection) -> Result<(), AppError> {
    tracing::debug!("Running database migrations");

    conn.execute_batch(SCHEMA)?;

    tracing::info!("Database migrations complete");
    Ok(())
}

const SCHEMA: &str = r#"

-- ============================================================================
-- Form Submissions
-- ============================================================================

CREATE TABLE IF NOT EXISTS submissions (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    form_id          INTEGER NOT NULL DEFAULT 0,
    data             TEXT,
    user_ip          TEXT,
    email            TEXT,
    cpf_rf           TEXT,
    status           TEXT NOT NULL DEFAULT 'publish',
    submission_date  TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE INDEX IF NOT EXISTS idx_submissions_form   ON submissions(form_id);
CREATE INDEX IF NOT EXISTS idx_submissions_status ON submissions(status);

-- ============================================================================
-- Appointments
-- ============================================================================

CREATE TABLE IF NOT EXISTS appointments (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    calendar_id       INTEGER NOT NULL DEFAULT 0,
    name              TEXT,
    email             TEXT,
    cpf_rf            TEXT,
    user_ip           TEXT,
    status            TEXT NOT NULL DEFAULT 'pending',
    appointment_date  TEXT,
    created_at        TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE INDEX IF NOT EXISTS idx_appointments_calendar ON appointments(calendar_id);

-- ============================================================================
-- App Settings (key/value)
-- ============================================================================

CREATE TABLE IF NOT EXISTS app_settings (
    key         TEXT PRIMARY KEY,
    value       TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

-- ============================================================================
-- Activity Log (append-only, never updated or deleted)
-- ============================================================================

CREATE TABLE IF NOT EXISTS activity_log (
    id          TEXT PRIMARY KEY,
    event       TEXT NOT NULL,
    level       TEXT NOT NULL CHECK(level IN ('debug', 'info', 'warning', 'error')),
    context     TEXT,
    created_at  TEXT NOT NULL DEFAULT (datetime('now'))
);
CREATE INDEX IF NOT EXISTS idx_activity_event   ON activity_log(event);
CREATE INDEX IF NOT EXISTS idx_activity_created ON activity_log(created_at DESC);

"#;

/// Encrypted/hash columns for the sensitive fields, per table.
const ENCRYPTION_COLUMNS: &[(&str, &[&str])] = &[
    (
        "submissions",
        &[
            "email_encrypted",
            "email_hash",
            "cpf_rf_encrypted",
            "cpf_rf_hash",
            "user_ip_encrypted",
            "data_encrypted",
        ],
    ),
    (
        "appointments",
        &[
            "email_encrypted",
            "email_hash",
            "cpf_rf_encrypted",
            "cpf_rf_hash",
            "user_ip_encrypted",
        ],
    ),
];

/// Typed identifier columns that replace `cpf_rf`.
const SPLIT_COLUMNS: &[&str] = &["cpf", "cpf_encrypted", "cpf_hash", "rf", "rf_encrypted", "rf_hash"];

const HASH_INDEXES: &[(&str, &str, &str)] = &[
    ("idx_submissions_email_hash", "submissions", "email_hash"),
    ("idx_submissions_cpf_rf_hash", "submissions", "cpf_rf_hash"),
    ("idx_appointments_email_hash", "appointments", "email_hash"),
    ("idx_appointments_cpf_rf_hash", "appointments", "cpf_rf_hash"),
];

const SPLIT_INDEXES: &[(&str, &str, &str)] = &[
    ("idx_submissions_cpf_hash", "submissions", "cpf_hash"),
    ("idx_submissions_rf_hash", "submissions", "rf_hash"),
    ("idx_appointments_cpf_hash", "appointments", "cpf_hash"),
    ("idx_appointments_rf_hash", "appointments", "rf_hash"),
];

/// Incremental migrations for columns added after the initial schema.
pub fn run_incremental(conn: &Connection) -> Result<(), AppError> {
    upgrade_encryption_columns(conn)?;
    upgrade_split_columns(conn)?;
    Ok(())
}

/// Add the encrypted + hash columns for email, identifier, IP and data.
pub fn upgrade_encryption_columns(conn: &Connection) -> Result<(), AppError> {
    for (table, columns) in ENCRYPTION_COLUMNS {
        for column in *columns {
            add_text_column_if_missing(conn, table, column)?;
        }
    }
    create_indexes(conn, HASH_INDEXES)
}

/// Add the typed `cpf_*` / `rf_*` columns that the identifier split fills.
pub fn upgrade_split_columns(conn: &Connection) -> Result<(), AppError> {
    for table in ["submissions", "appointments"] {
        for column in SPLIT_COLUMNS {
            add_text_column_if_missing(conn, table, column)?;
        }
    }
    create_indexes(conn, SPLIT_INDEXES)
}

/// "ADD COLUMN IF NOT EXISTS" equivalent via a PRAGMA table_info check.
/// Table and column names come from the constants above, never from input.
fn add_text_column_if_missing(conn: &Connection, table: &str, column: &str) -> Result<(), AppError> {
    let exists: bool = conn
        .prepare("SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name = ?2")?
        .query_row([table, column], |row| row.get::<_, i64>(0))
        .map(|c| c > 0)
        .unwrap_or(false);

    if !exists {
        conn.execute_batch(&format!("ALTER TABLE \"{table}\" ADD COLUMN \"{column}\" TEXT;"))?;
        tracing::info!(table, column, "Added column");
    }
    Ok(())
}

fn create_indexes(conn: &Connection, indexes: &[(&str, &str, &str)]) -> Result<(), AppError> {
    for (name, table, column) in indexes {
        conn.execute_batch(&format!(
            "CREATE INDEX IF NOT EXISTS \"{name}\" ON \"{table}\"(\"{column}\");"
        ))?;
    }
    Ok(())
}
