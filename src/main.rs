use std::process::ExitCode;
use std::sync::Arc;

use certificate_vault::activity::DbActivityLogger;
use certificate_vault::config::AppConfig;
use certificate_vault::crypto::AesGcmProvider;
use certificate_vault::migration::{run_to_completion, MigrationContext, MigrationRegistry, StopReason};
use certificate_vault::{db, logging, AppError};

fn main() -> ExitCode {
    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            // Logging is not up yet: the format itself comes from config.
            eprintln!("Invalid configuration: {e}");
            return ExitCode::from(2);
        }
    };
    logging::init(config.log_format);

    match run(&config) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            tracing::error!(error = %e, "Migration run aborted");
            ExitCode::from(1)
        }
    }
}

/// Run every registered migration in order. Returns false when any of them
/// finished with row errors, stalled, or hit the batch ceiling.
fn run(config: &AppConfig) -> Result<bool, AppError> {
    tracing::info!(db = %config.db_path.display(), "Opening database");
    let pool = db::init_db(&config.db_path)?;

    let crypto = match config.field_key.as_deref() {
        Some(key) => AesGcmProvider::from_base64(key)?,
        None => {
            tracing::warn!("CERTVAULT_FIELD_KEY not set, encryption is unavailable");
            AesGcmProvider::unconfigured()
        }
    };

    let logger = Arc::new(DbActivityLogger::new(pool.clone()));
    let ctx = MigrationContext::new(pool, Arc::new(crypto), logger);
    let registry = MigrationRegistry::with_defaults(ctx);

    let mut clean = true;
    for key in registry.keys() {
        let strategy = registry.get(key)?;
        match run_to_completion(strategy, key, &config.migration, config.max_batches) {
            Ok(summary) => {
                tracing::info!(
                    migration = key,
                    batches = summary.batches,
                    processed = summary.processed,
                    errors = summary.errors.len(),
                    pending = summary.status.pending,
                    percent = summary.status.percent,
                    stopped = ?summary.stopped,
                    "Migration finished"
                );
                for err in &summary.errors {
                    tracing::warn!(migration = key, "{err}");
                }
                if summary.stopped != StopReason::Complete || !summary.errors.is_empty() {
                    clean = false;
                }
            }
            Err(AppError::Precondition(e)) => {
                tracing::warn!(migration = key, code = e.code, "Skipping migration: {}", e.message);
                clean = false;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(clean)
}
