use serde::Serialize;

use crate::config::MigrationConfig;
use crate::error::AppError;
use crate::migration::{
    EncryptionMigration, IdentifierSplitMigration, MigrationContext, MigrationStatus, MigrationStrategy,
};

/// Strategies keyed by migration name, kept in registration order.
#[derive(Default)]
pub struct MigrationRegistry {
    entries: Vec<(String, Box<dyn MigrationStrategy>)>,
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encryption first, then the identifier split that depends on its output.
    pub fn with_defaults(ctx: MigrationContext) -> Self {
        let encryption: Box<dyn MigrationStrategy> = Box::new(EncryptionMigration::new(ctx.clone()));
        let split: Box<dyn MigrationStrategy> = Box::new(IdentifierSplitMigration::new(ctx));
        Self {
            entries: vec![
                (EncryptionMigration::KEY.to_string(), encryption),
                (IdentifierSplitMigration::KEY.to_string(), split),
            ],
        }
    }

    pub fn register(&mut self, key: &str, strategy: Box<dyn MigrationStrategy>) -> Result<(), AppError> {
        if self.entries.iter().any(|(k, _)| k == key) {
            return Err(AppError::Validation(format!("Migration {key} is already registered")));
        }
        self.entries.push((key.to_string(), strategy));
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<&dyn MigrationStrategy, AppError> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, s)| s.as_ref())
            .ok_or_else(|| AppError::NotFound(format!("Migration {key}")))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Complete,
    /// A batch migrated nothing while rows were still pending: every
    /// remaining row is failing and needs attention.
    Stalled,
    BatchLimit,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub key: String,
    pub batches: u32,
    pub processed: usize,
    pub errors: Vec<String>,
    pub stopped: StopReason,
    pub status: MigrationStatus,
}

/// Call `execute` until nothing is pending, a batch stalls, or `max_batches`
/// calls have been made. A failed precondition stops before the first batch.
pub fn run_to_completion(
    strategy: &dyn MigrationStrategy,
    key: &str,
    config: &MigrationConfig,
    max_batches: u32,
) -> Result<RunSummary, AppError> {
    strategy.can_run(key, config)?;

    let before = strategy.calculate_status(key, config)?;
    tracing::info!(
        migration = key,
        total = before.total,
        pending = before.pending,
        "Starting migration: {}",
        strategy.name()
    );

    let mut batches = 0;
    let mut processed = 0;
    let mut errors = Vec::new();
    let mut stopped = StopReason::BatchLimit;

    while batches < max_batches {
        batches += 1;
        let outcome = strategy.execute(key, config, batches)?;
        tracing::info!(migration = key, batch = batches, "{}", outcome.message);

        processed += outcome.processed;
        let batch_processed = outcome.processed;
        errors.extend(outcome.errors);

        if !outcome.has_more {
            stopped = StopReason::Complete;
            break;
        }
        if batch_processed == 0 {
            stopped = StopReason::Stalled;
            tracing::warn!(migration = key, batch = batches, "No progress in batch, stopping");
            break;
        }
    }

    Ok(RunSummary {
        key: key.to_string(),
        batches,
        processed,
        errors,
        stopped,
        status: strategy.calculate_status(key, config)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db;
    use crate::error::PreconditionError;
    use crate::migration::test_support::{context, unconfigured_context};

    #[test]
    fn test_defaults_in_order() {
        let (ctx, _) = context(init_test_db().unwrap());
        let registry = MigrationRegistry::with_defaults(ctx);
        let keys: Vec<&str> = registry.keys().collect();
        assert_eq!(keys, vec!["encrypt_sensitive_fields", "split_cpf_rf"]);
        assert_eq!(registry.get("split_cpf_rf").unwrap().name(), "Split CPF/RF identifiers");
        assert!(matches!(registry.get("nope"), Err(AppError::NotFound(_))));
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let (ctx, _) = context(init_test_db().unwrap());
        let mut registry = MigrationRegistry::with_defaults(ctx.clone());
        let err = registry
            .register(EncryptionMigration::KEY, Box::new(EncryptionMigration::new(ctx)))
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[test]
    fn test_run_to_completion_converges_within_ceil_n_over_b() {
        let pool = init_test_db().unwrap();
        {
            let conn = pool.get().unwrap();
            for i in 0..23 {
                conn.execute("INSERT INTO submissions (email) VALUES (?1)", [format!("p{i}@x.org")])
                    .unwrap();
            }
        }
        let (ctx, _) = context(pool);
        let registry = MigrationRegistry::with_defaults(ctx);
        let strategy = registry.get(EncryptionMigration::KEY).unwrap();

        let summary =
            run_to_completion(strategy, EncryptionMigration::KEY, &MigrationConfig::with_batch_size(5), 100).unwrap();
        assert_eq!(summary.stopped, StopReason::Complete);
        assert_eq!(summary.batches, 5);
        assert_eq!(summary.processed, 23);
        assert!(summary.status.is_complete);
        assert_eq!(summary.status.migrated, 23);
    }

    #[test]
    fn test_run_stops_when_stalled() {
        let pool = init_test_db().unwrap();
        pool.get()
            .unwrap()
            .execute("INSERT INTO submissions (cpf_rf) VALUES ('---')", [])
            .unwrap();
        let (ctx, _) = context(pool);
        let strategy = EncryptionMigration::new(ctx);

        let summary = run_to_completion(&strategy, EncryptionMigration::KEY, &MigrationConfig::default(), 10).unwrap();
        assert_eq!(summary.stopped, StopReason::Stalled);
        assert_eq!(summary.batches, 1);
        assert_eq!(summary.errors.len(), 1);
        assert_eq!(summary.status.pending, 1);
    }

    #[test]
    fn test_run_respects_batch_limit() {
        let pool = init_test_db().unwrap();
        {
            let conn = pool.get().unwrap();
            for i in 0..10 {
                conn.execute("INSERT INTO submissions (email) VALUES (?1)", [format!("p{i}@x.org")])
                    .unwrap();
            }
        }
        let (ctx, _) = context(pool);
        let strategy = EncryptionMigration::new(ctx);

        let summary =
            run_to_completion(&strategy, EncryptionMigration::KEY, &MigrationConfig::with_batch_size(3), 2).unwrap();
        assert_eq!(summary.stopped, StopReason::BatchLimit);
        assert_eq!(summary.processed, 6);
        assert_eq!(summary.status.pending, 4);
    }

    #[test]
    fn test_precondition_failure_runs_nothing() {
        let (ctx, _) = unconfigured_context(init_test_db().unwrap());
        let strategy = IdentifierSplitMigration::new(ctx);
        let err = run_to_completion(&strategy, IdentifierSplitMigration::KEY, &MigrationConfig::default(), 5)
            .unwrap_err();
        match err {
            AppError::Precondition(PreconditionError { code, .. }) => {
                assert_eq!(code, PreconditionError::ENCRYPTION_NOT_CONFIGURED)
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
