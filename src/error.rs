use serde::Serialize;

use crate::crypto::CryptoError;

/// Crate-wide error type. Every fallible function returns `Result<T, AppError>`.
/// Serializes as `{ error, kind }` so drivers (cron jobs, admin screens) get
/// structured error messages.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Precondition(#[from] PreconditionError),

    #[error("{0}")]
    Internal(String),
}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("AppError", 2)?;
        s.serialize_field("error", &self.to_string())?;
        s.serialize_field(
            "kind",
            match self {
                AppError::Database(_) => "database",
                AppError::Pool(_) => "pool",
                AppError::Io(_) => "io",
                AppError::Serde(_) => "serde",
                AppError::Crypto(_) => "crypto",
                AppError::Validation(_) => "validation",
                AppError::NotFound(_) => "not_found",
                AppError::Precondition(_) => "precondition",
                AppError::Internal(_) => "internal",
            },
        )?;
        s.end()
    }
}

/// A migration cannot start. Carries a machine-readable `code` for drivers
/// and a human message for operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("{message} ({code})")]
pub struct PreconditionError {
    pub code: &'static str,
    pub message: String,
}

impl PreconditionError {
    pub const ENCRYPTION_NOT_CONFIGURED: &'static str = "encryption_not_configured";
    pub const MISSING_COLUMNS: &'static str = "missing_columns";

    pub fn encryption_not_configured() -> Self {
        Self {
            code: Self::ENCRYPTION_NOT_CONFIGURED,
            message: "Encryption keys are not configured".into(),
        }
    }

    pub fn missing_columns(table: &str, columns: &[&str]) -> Self {
        Self {
            code: Self::MISSING_COLUMNS,
            message: format!(
                "Table {table} is missing required columns: {}. Run the schema upgrade first.",
                columns.join(", ")
            ),
        }
    }
}
