use crate::config::MigrationConfig;
use crate::db::repos::resources::records::{non_empty, quote_ident, ColumnWrite, RowUpdate};
use crate::error::{AppError, PreconditionError};
use crate::migration::batch::{process_rows, BatchResult, BatchRow};
use crate::migration::identifier::{classify, warn_unrecognized};
use crate::migration::status::{count_table_status, MigrationStatus, StatusQuery, TableCounts};
use crate::migration::{
    require_crypto, state, ExecuteOutcome, MigrationContext, MigrationStrategy, APPOINTMENTS_TABLE,
    SUBMISSIONS_TABLE,
};

/// Columns the split reads from and writes to. The legacy `cpf_rf` plaintext
/// and the typed `cpf` / `rf` plaintext columns are optional.
const REQUIRED_COLUMNS: &[&str] = &[
    "cpf_rf_encrypted",
    "cpf_rf_hash",
    "cpf_encrypted",
    "cpf_hash",
    "rf_encrypted",
    "rf_hash",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Layout {
    table: &'static str,
    legacy_plaintext: bool,
    typed_plaintext: bool,
}

fn typed_predicate() -> Result<String, AppError> {
    Ok(format!("{} OR {}", non_empty("cpf_hash")?, non_empty("rf_hash")?))
}

/// Has the combined hash but neither typed hash.
fn pending_predicate() -> Result<String, AppError> {
    Ok(format!("{} AND NOT ({})", non_empty("cpf_rf_hash")?, typed_predicate()?))
}

fn status_query() -> Result<StatusQuery, AppError> {
    let typed = typed_predicate()?;
    Ok(StatusQuery {
        total: format!("{} OR {}", non_empty("cpf_rf_hash")?, typed),
        migrated: typed,
    })
}

#[derive(Debug)]
struct PendingRow {
    id: i64,
    legacy: Option<String>,
    encrypted: Option<String>,
}

impl BatchRow for PendingRow {
    fn id(&self) -> i64 {
        self.id
    }
}

/// Combined `cpf_rf` → typed `cpf_*` / `rf_*` columns, retiring the combined ones.
pub struct IdentifierSplitMigration {
    ctx: MigrationContext,
}

impl IdentifierSplitMigration {
    pub const KEY: &'static str = "split_cpf_rf";

    pub fn new(ctx: MigrationContext) -> Self {
        Self { ctx }
    }

    fn layout(&self, table: &'static str) -> Result<Option<Layout>, AppError> {
        let introspector = &self.ctx.introspector;
        if !introspector.table_exists(table)? || !introspector.has_columns(table, REQUIRED_COLUMNS)? {
            return Ok(None);
        }
        Ok(Some(Layout {
            table,
            legacy_plaintext: introspector.column_exists(table, "cpf_rf")?,
            typed_plaintext: introspector.has_columns(table, &["cpf", "rf"])?,
        }))
    }

    /// Submissions first, then appointments when that table carries the split columns.
    fn layouts(&self) -> Result<Vec<Layout>, AppError> {
        let mut layouts = Vec::with_capacity(2);
        for table in [SUBMISSIONS_TABLE, APPOINTMENTS_TABLE] {
            match self.layout(table)? {
                Some(layout) => layouts.push(layout),
                None => tracing::debug!(table, "Skipping table without split columns"),
            }
        }
        Ok(layouts)
    }

    fn select_pending(&self, layout: &Layout, limit: i64) -> Result<Vec<PendingRow>, AppError> {
        let legacy = if layout.legacy_plaintext {
            quote_ident("cpf_rf")?
        } else {
            "NULL".to_string()
        };
        let sql = format!(
            "SELECT id, {legacy}, \"cpf_rf_encrypted\" FROM {} WHERE {} ORDER BY id LIMIT ?1",
            quote_ident(layout.table)?,
            pending_predicate()?,
        );

        let conn = self.ctx.pool.get()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([limit], |row| {
            Ok(PendingRow {
                id: row.get(0)?,
                legacy: row.get(1)?,
                encrypted: row.get(2)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(AppError::Database)
    }

    /// Legacy plaintext if present, otherwise decrypt the combined ciphertext.
    fn resolve_plaintext(&self, row: &PendingRow) -> Result<String, AppError> {
        if let Some(plain) = row.legacy.as_deref().filter(|v| !v.is_empty()) {
            return Ok(plain.to_string());
        }
        match row.encrypted.as_deref().filter(|v| !v.is_empty()) {
            Some(ciphertext) => Ok(self.ctx.crypto.decrypt(ciphertext)?),
            None => Err(AppError::Validation(
                "no plaintext or encrypted identifier to split".into(),
            )),
        }
    }

    fn build_update(&self, layout: &Layout, row: &PendingRow) -> Result<RowUpdate, AppError> {
        let plaintext = self.resolve_plaintext(row)?;
        let c = classify(&plaintext);
        if c.digits.is_empty() {
            return Err(AppError::Validation("identifier contains no digits".into()));
        }
        if !c.recognized {
            warn_unrecognized(self.ctx.logger.as_ref(), layout.table, row.id, c.digits.len());
        }

        let crypto = self.ctx.crypto.as_ref();
        let mut update = RowUpdate::new(row.id)
            .set(c.kind.encrypted_column(), ColumnWrite::Value(crypto.encrypt(&c.digits)?))
            .set(c.kind.hash_column(), ColumnWrite::Value(crypto.hash(&c.digits)?));
        if layout.typed_plaintext {
            update.push(c.kind.plaintext_column(), ColumnWrite::Retired);
        }

        // The combined columns are retired once the row is classified.
        if layout.legacy_plaintext {
            update.push("cpf_rf", ColumnWrite::Retired);
        }
        update.push("cpf_rf_encrypted", ColumnWrite::Retired);
        update.push("cpf_rf_hash", ColumnWrite::Retired);
        Ok(update)
    }

    fn migrate_table(&self, layout: &Layout, config: &MigrationConfig) -> Result<BatchResult, AppError> {
        let rows = self.select_pending(layout, config.limit())?;
        tracing::debug!(table = layout.table, selected = rows.len(), "Selected rows for identifier split");

        let conn = self.ctx.pool.get()?;
        Ok(process_rows(layout.table, &rows, self.ctx.logger.as_ref(), |row| {
            let update = self.build_update(layout, row)?;
            match update.apply(&conn, layout.table)? {
                0 => Err(AppError::NotFound(format!("row {} disappeared before update", row.id))),
                _ => Ok(()),
            }
        }))
    }
}

impl MigrationStrategy for IdentifierSplitMigration {
    fn name(&self) -> &str {
        "Split CPF/RF identifiers"
    }

    fn can_run(&self, _key: &str, _config: &MigrationConfig) -> Result<(), PreconditionError> {
        require_crypto(self.ctx.crypto.as_ref())?;

        let missing = self
            .ctx
            .introspector
            .missing_columns(SUBMISSIONS_TABLE, REQUIRED_COLUMNS)
            .map_err(|e| PreconditionError {
                code: PreconditionError::MISSING_COLUMNS,
                message: format!("Could not inspect {SUBMISSIONS_TABLE}: {e}"),
            })?;
        if !missing.is_empty() {
            return Err(PreconditionError::missing_columns(SUBMISSIONS_TABLE, &missing));
        }
        Ok(())
    }

    fn calculate_status(&self, _key: &str, _config: &MigrationConfig) -> Result<MigrationStatus, AppError> {
        let conn = self.ctx.pool.get()?;
        let query = status_query()?;
        let counts: TableCounts = [SUBMISSIONS_TABLE, APPOINTMENTS_TABLE]
            .into_iter()
            .map(|table| count_table_status(&conn, &self.ctx.introspector, table, REQUIRED_COLUMNS, &query))
            .collect::<Result<Vec<TableCounts>, _>>()?
            .into_iter()
            .sum();
        Ok(MigrationStatus::from_counts(counts))
    }

    fn execute(&self, key: &str, config: &MigrationConfig, batch_number: u32) -> Result<ExecuteOutcome, AppError> {
        self.can_run(key, config)?;
        config.validate()?;

        let mut batch = BatchResult::default();
        for layout in self.layouts()? {
            batch.absorb(self.migrate_table(&layout, config)?);
        }

        let status = self.calculate_status(key, config)?;
        if status.is_complete {
            state::mark_complete(&self.ctx.pool, self.ctx.logger.as_ref(), key, &status)?;
        }
        Ok(ExecuteOutcome::from_batch(batch, &status, batch_number))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{init_legacy_test_db, init_test_db, migrations, DbPool};
    use crate::migration::test_support::{context, unconfigured_context};

    const KEY: &str = IdentifierSplitMigration::KEY;

    /// A row as left behind by the encryption migration before the split
    /// columns existed: plaintext plus combined ciphertext/hash.
    fn insert_combined(pool: &DbPool, table: &str, ctx: &MigrationContext, plain: Option<&str>, digits: &str) -> i64 {
        let conn = pool.get().unwrap();
        let encrypted = ctx.crypto.encrypt(digits).unwrap();
        let hash = ctx.crypto.hash(digits).unwrap();
        conn.execute(
            &format!("INSERT INTO \"{table}\" (cpf_rf, cpf_rf_encrypted, cpf_rf_hash) VALUES (?1, ?2, ?3)"),
            rusqlite::params![plain, encrypted, hash],
        )
        .unwrap();
        conn.last_insert_rowid()
    }

    fn column(pool: &DbPool, table: &str, id: i64, col: &str) -> Option<String> {
        pool.get()
            .unwrap()
            .query_row(&format!("SELECT \"{col}\" FROM \"{table}\" WHERE id = ?1"), [id], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn test_formatted_cpf_is_split_and_combined_retired() {
        let pool = init_test_db().unwrap();
        let (ctx, _) = context(pool.clone());
        let id = insert_combined(&pool, "submissions", &ctx, Some("123.456.789-01"), "12345678901");
        let crypto = ctx.crypto.clone();

        let outcome = IdentifierSplitMigration::new(ctx)
            .execute(KEY, &MigrationConfig::default(), 1)
            .unwrap();
        assert!(outcome.success, "{:?}", outcome.errors);
        assert_eq!(outcome.processed, 1);
        assert!(!outcome.has_more);

        let cpf_enc = column(&pool, "submissions", id, "cpf_encrypted").unwrap();
        assert_eq!(crypto.decrypt(&cpf_enc).unwrap(), "12345678901");
        assert_eq!(
            column(&pool, "submissions", id, "cpf_hash").unwrap(),
            crypto.hash("12345678901").unwrap()
        );
        for col in ["cpf_rf", "cpf_rf_encrypted", "cpf_rf_hash", "rf_encrypted", "rf_hash", "cpf"] {
            assert_eq!(column(&pool, "submissions", id, col), None, "{col}");
        }
    }

    #[test]
    fn test_rf_decrypted_from_ciphertext_when_plaintext_gone() {
        let pool = init_test_db().unwrap();
        let (ctx, _) = context(pool.clone());
        let id = insert_combined(&pool, "submissions", &ctx, None, "7654321");

        IdentifierSplitMigration::new(ctx)
            .execute(KEY, &MigrationConfig::default(), 1)
            .unwrap();

        assert!(column(&pool, "submissions", id, "rf_hash").is_some());
        assert_eq!(column(&pool, "submissions", id, "cpf_hash"), None);
        assert_eq!(column(&pool, "submissions", id, "cpf_rf_hash"), None);
    }

    #[test]
    fn test_unknown_length_goes_to_cpf_with_warning() {
        let pool = init_test_db().unwrap();
        let (ctx, logger) = context(pool.clone());
        let id = insert_combined(&pool, "submissions", &ctx, Some("123456789"), "123456789");

        IdentifierSplitMigration::new(ctx)
            .execute(KEY, &MigrationConfig::default(), 1)
            .unwrap();

        assert!(column(&pool, "submissions", id, "cpf_hash").is_some());
        assert_eq!(column(&pool, "submissions", id, "cpf_rf_hash"), None);
        let warnings = logger.events_named("identifier_length_unrecognized");
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].1["row_id"], id);
        assert_eq!(warnings[0].1["table"], "submissions");
        assert_eq!(warnings[0].1["length"], 9);
    }

    #[test]
    fn test_undecryptable_row_is_reported_and_skipped() {
        let pool = init_test_db().unwrap();
        let (ctx, _) = context(pool.clone());
        pool.get()
            .unwrap()
            .execute(
                "INSERT INTO submissions (cpf_rf, cpf_rf_encrypted, cpf_rf_hash) VALUES (NULL, 'garbage', 'h')",
                [],
            )
            .unwrap();
        let good = insert_combined(&pool, "submissions", &ctx, Some("1234567"), "1234567");

        let migration = IdentifierSplitMigration::new(ctx);
        let outcome = migration.execute(KEY, &MigrationConfig::default(), 1).unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.processed, 1);
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].contains("in submissions"));
        assert!(outcome.has_more);
        assert!(column(&pool, "submissions", good, "rf_hash").is_some());

        // Still pending on the next call, still failing.
        let again = migration.execute(KEY, &MigrationConfig::default(), 2).unwrap();
        assert_eq!(again.processed, 0);
        assert_eq!(again.errors.len(), 1);
    }

    #[test]
    fn test_unresolvable_row_is_an_error() {
        let pool = init_test_db().unwrap();
        let (ctx, _) = context(pool.clone());
        pool.get()
            .unwrap()
            .execute("INSERT INTO submissions (cpf_rf_hash) VALUES ('h')", [])
            .unwrap();

        let outcome = IdentifierSplitMigration::new(ctx)
            .execute(KEY, &MigrationConfig::default(), 1)
            .unwrap();
        assert_eq!(outcome.processed, 0);
        assert!(outcome.errors[0].contains("no plaintext or encrypted identifier"));
    }

    #[test]
    fn test_processes_submissions_then_appointments() {
        let pool = init_test_db().unwrap();
        let (ctx, logger) = context(pool.clone());
        for _ in 0..3 {
            insert_combined(&pool, "submissions", &ctx, Some("12345678901"), "12345678901");
        }
        let appt = insert_combined(&pool, "appointments", &ctx, Some("1234567"), "1234567");

        let migration = IdentifierSplitMigration::new(ctx);
        let status = migration.calculate_status(KEY, &MigrationConfig::default()).unwrap();
        assert_eq!((status.total, status.pending), (4, 4));

        let outcome = migration.execute(KEY, &MigrationConfig::default(), 1).unwrap();
        assert_eq!(outcome.processed, 4);
        assert!(!outcome.has_more);
        assert!(column(&pool, "appointments", appt, "rf_hash").is_some());

        let tables: Vec<String> = logger
            .events_named("migration_batch_completed")
            .into_iter()
            .map(|(_, ctx)| ctx["table"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(tables, vec!["submissions", "appointments"]);

        let status = migration.calculate_status(KEY, &MigrationConfig::default()).unwrap();
        assert_eq!((status.total, status.migrated, status.pending), (4, 4, 0));
        assert!(state::completed_at(&pool, KEY).unwrap().is_some());
    }

    #[test]
    fn test_missing_appointments_table_is_ignored() {
        let pool = init_test_db().unwrap();
        pool.get().unwrap().execute_batch("DROP TABLE appointments;").unwrap();
        let (ctx, _) = context(pool.clone());
        for _ in 0..10 {
            insert_combined(&pool, "submissions", &ctx, None, "12345678901");
        }

        let migration = IdentifierSplitMigration::new(ctx);
        let status = migration.calculate_status(KEY, &MigrationConfig::default()).unwrap();
        assert_eq!(status.total, 10);
        assert_eq!(status.pending, 10);

        let outcome = migration.execute(KEY, &MigrationConfig::with_batch_size(4), 1).unwrap();
        assert_eq!(outcome.processed, 4);
        assert!(outcome.has_more);
    }

    #[test]
    fn test_rows_already_typed_are_left_alone() {
        let pool = init_test_db().unwrap();
        let (ctx, _) = context(pool.clone());
        let id = insert_combined(&pool, "submissions", &ctx, Some("12345678901"), "12345678901");
        pool.get()
            .unwrap()
            .execute("UPDATE submissions SET cpf_hash = cpf_rf_hash WHERE id = ?1", [id])
            .unwrap();

        let outcome = IdentifierSplitMigration::new(ctx)
            .execute(KEY, &MigrationConfig::default(), 1)
            .unwrap();
        assert_eq!(outcome.processed, 0);
        assert!(column(&pool, "submissions", id, "cpf_rf_hash").is_some());
    }

    #[test]
    fn test_can_run_requires_split_columns() {
        let pool = init_legacy_test_db().unwrap();
        migrations::upgrade_encryption_columns(&pool.get().unwrap()).unwrap();
        let (ctx, _) = context(pool);

        let err = IdentifierSplitMigration::new(ctx)
            .can_run(KEY, &MigrationConfig::default())
            .unwrap_err();
        assert_eq!(err.code, PreconditionError::MISSING_COLUMNS);
        assert!(err.message.contains("cpf_hash"));
        assert!(err.message.contains("rf_hash"));
    }

    #[test]
    fn test_can_run_requires_crypto() {
        let pool = init_test_db().unwrap();
        let (ctx, _) = unconfigured_context(pool);
        let err = IdentifierSplitMigration::new(ctx)
            .can_run(KEY, &MigrationConfig::default())
            .unwrap_err();
        assert_eq!(err.code, PreconditionError::ENCRYPTION_NOT_CONFIGURED);
    }
}
