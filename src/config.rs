use std::path::PathBuf;

use serde::Deserialize;

use crate::error::AppError;

pub const DEFAULT_BATCH_SIZE: usize = 50;
pub const DEFAULT_MAX_BATCHES: u32 = 1000;
pub const DEFAULT_DB_PATH: &str = "certificates.db";

/// Per-run options passed to every strategy call.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Rows per `execute` call, per table.
    pub batch_size: usize,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl MigrationConfig {
    pub fn with_batch_size(batch_size: usize) -> Self {
        Self { batch_size }
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.batch_size == 0 {
            return Err(AppError::Validation("batch_size must be at least 1".into()));
        }
        Ok(())
    }

    /// Batch size as an SQLite LIMIT value.
    pub fn limit(&self) -> i64 {
        i64::try_from(self.batch_size).unwrap_or(i64::MAX)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Settings for the driver binary, read from the environment (and `.env`).
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    /// Base64 master secret. `None` leaves the crypto provider unconfigured.
    pub field_key: Option<String>,
    pub migration: MigrationConfig,
    pub max_batches: u32,
    pub log_format: LogFormat,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, AppError> {
        // A missing .env file is normal in production.
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let batch_size = match lookup("CERTVAULT_BATCH_SIZE") {
            Some(raw) => parse_number::<usize>("CERTVAULT_BATCH_SIZE", &raw)?,
            None => DEFAULT_BATCH_SIZE,
        };
        let max_batches = match lookup("CERTVAULT_MAX_BATCHES") {
            Some(raw) => parse_number::<u32>("CERTVAULT_MAX_BATCHES", &raw)?,
            None => DEFAULT_MAX_BATCHES,
        };
        let log_format = match lookup("CERTVAULT_LOG_FORMAT").as_deref().map(str::trim) {
            None | Some("") | Some("pretty") => LogFormat::Pretty,
            Some("json") => LogFormat::Json,
            Some(other) => {
                return Err(AppError::Validation(format!(
                    "CERTVAULT_LOG_FORMAT must be 'pretty' or 'json', got {other:?}"
                )))
            }
        };

        let migration = MigrationConfig::with_batch_size(batch_size);
        migration.validate()?;

        Ok(Self {
            db_path: lookup("CERTVAULT_DB_PATH")
                .filter(|p| !p.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH)),
            field_key: lookup("CERTVAULT_FIELD_KEY").filter(|k| !k.trim().is_empty()),
            migration,
            max_batches,
            log_format,
        })
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T, AppError> {
    raw.trim()
        .parse()
        .map_err(|_| AppError::Validation(format!("{name} must be a positive integer, got {raw:?}")))
}
