//! Encrypted-field migrations
//!
//! Idempotent, batch-resumable transformations over the `submissions` and
//! `appointments` tables:
//!
//! - [`EncryptionMigration`] moves email, CPF/RF, IP and form data from
//!   plaintext columns into encrypted + keyed-hash columns.
//! - [`IdentifierSplitMigration`] re-partitions the combined `cpf_rf`
//!   columns into typed `cpf_*` / `rf_*` columns by digit count, then retires
//!   the combined columns.
//!
//! # Batching
//!
//! Each `execute` selects at most `batch_size` pending rows per table with no
//! OFFSET. A migrated row no longer matches the selection predicate, so the
//! next call picks up the next slice; a failed row still matches and is
//! retried. Overlapping calls can at worst migrate a row twice, which writes
//! equivalent values.
//!
//! # Driving
//!
//! ```rust,ignore
//! let registry = MigrationRegistry::with_defaults(ctx);
//! for key in registry.keys() {
//!     let summary = run_to_completion(registry.get(key)?, key, &config, 1000)?;
//! }
//! ```

pub mod batch;
pub mod encryption;
pub mod identifier;
pub mod identifier_split;
pub mod introspect;
pub mod registry;
pub mod state;
pub mod status;

use std::sync::Arc;

use serde::Serialize;

use crate::activity::ActivityLogger;
use crate::config::MigrationConfig;
use crate::crypto::CryptoProvider;
use crate::db::DbPool;
use crate::error::{AppError, PreconditionError};

pub use batch::{BatchResult, RowOutcome};
pub use encryption::EncryptionMigration;
pub use identifier::{classify, IdentifierKind};
pub use identifier_split::IdentifierSplitMigration;
pub use introspect::ColumnIntrospector;
pub use registry::{run_to_completion, MigrationRegistry, RunSummary, StopReason};
pub use status::{MigrationPhase, MigrationStatus, TableCounts};

pub const SUBMISSIONS_TABLE: &str = "submissions";
pub const APPOINTMENTS_TABLE: &str = "appointments";

/// Shared collaborators, built once per run and handed to every strategy.
#[derive(Clone)]
pub struct MigrationContext {
    pub pool: DbPool,
    pub crypto: Arc<dyn CryptoProvider>,
    pub introspector: Arc<ColumnIntrospector>,
    pub logger: Arc<dyn ActivityLogger>,
}

impl MigrationContext {
    pub fn new(pool: DbPool, crypto: Arc<dyn CryptoProvider>, logger: Arc<dyn ActivityLogger>) -> Self {
        let introspector = Arc::new(ColumnIntrospector::new(pool.clone()));
        Self {
            pool,
            crypto,
            introspector,
            logger,
        }
    }
}

/// Result of one `execute` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecuteOutcome {
    /// True iff no row failed in this batch.
    pub success: bool,
    pub processed: usize,
    /// Pending rows remain, measured after this batch's writes.
    pub has_more: bool,
    pub message: String,
    pub errors: Vec<String>,
}

impl ExecuteOutcome {
    pub fn from_batch(batch: BatchResult, status: &MigrationStatus, batch_number: u32) -> Self {
        let message = if status.is_complete {
            format!("Batch {batch_number}: processed {} records. Migration complete.", batch.processed)
        } else {
            format!(
                "Batch {batch_number}: processed {} records, {} remaining ({}% done).",
                batch.processed, status.pending, status.percent
            )
        };
        Self {
            success: batch.errors.is_empty(),
            processed: batch.processed,
            has_more: status.pending > 0,
            message,
            errors: batch.errors,
        }
    }
}

/// Uniform contract every migration exposes to drivers.
pub trait MigrationStrategy: Send + Sync {
    /// Human label.
    fn name(&self) -> &str;

    /// Check preconditions. A driver must not call `execute` after an error.
    fn can_run(&self, key: &str, config: &MigrationConfig) -> Result<(), PreconditionError>;

    fn calculate_status(&self, key: &str, config: &MigrationConfig) -> Result<MigrationStatus, AppError>;

    /// Migrate one bounded batch. Row failures are reported in the outcome;
    /// only precondition, config and storage-level failures return `Err`.
    fn execute(&self, key: &str, config: &MigrationConfig, batch_number: u32) -> Result<ExecuteOutcome, AppError>;
}

/// Shared crypto precondition.
pub(crate) fn require_crypto(crypto: &dyn CryptoProvider) -> Result<(), PreconditionError> {
    if crypto.is_configured() {
        Ok(())
    } else {
        Err(PreconditionError::encryption_not_configured())
    }
}
