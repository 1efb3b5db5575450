//! CPF / RF classification of the combined `cpf_rf` identifier.
//!
//! The legacy column holds either identifier type and only the digit count
//! tells them apart: 11 digits is a CPF, 7 digits an RF. Anything else is
//! filed as a CPF and reported, so malformed legacy data never blocks a batch.
//! That fallback keeps compatibility with existing rows; it is not a claim
//! that such values are valid CPFs.

use serde::Serialize;
use serde_json::json;

use crate::activity::{ActivityLogger, LogLevel};

pub const CPF_DIGITS: usize = 11;
pub const RF_DIGITS: usize = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentifierKind {
    Cpf,
    Rf,
}

impl IdentifierKind {
    pub fn plaintext_column(self) -> &'static str {
        match self {
            IdentifierKind::Cpf => "cpf",
            IdentifierKind::Rf => "rf",
        }
    }

    pub fn encrypted_column(self) -> &'static str {
        match self {
            IdentifierKind::Cpf => "cpf_encrypted",
            IdentifierKind::Rf => "rf_encrypted",
        }
    }

    pub fn hash_column(self) -> &'static str {
        match self {
            IdentifierKind::Cpf => "cpf_hash",
            IdentifierKind::Rf => "rf_hash",
        }
    }

    pub fn other(self) -> IdentifierKind {
        match self {
            IdentifierKind::Cpf => IdentifierKind::Rf,
            IdentifierKind::Rf => IdentifierKind::Cpf,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub digits: String,
    pub kind: IdentifierKind,
    /// False when the digit count matched neither type and `kind` is the fallback.
    pub recognized: bool,
}

/// Keep ASCII digits only: `"123.456.789-01"` becomes `"12345678901"`.
pub fn strip_non_digits(raw: &str) -> String {
    raw.chars().filter(char::is_ascii_digit).collect()
}

pub fn classify(raw: &str) -> Classification {
    let digits = strip_non_digits(raw);
    let (kind, recognized) = match digits.len() {
        CPF_DIGITS => (IdentifierKind::Cpf, true),
        RF_DIGITS => (IdentifierKind::Rf, true),
        _ => (IdentifierKind::Cpf, false),
    };
    Classification {
        digits,
        kind,
        recognized,
    }
}

/// Report a fallback classification. Never fails the row.
pub fn warn_unrecognized(logger: &dyn ActivityLogger, table: &str, row_id: i64, digits: usize) {
    tracing::warn!(table, row_id, digits, "Identifier length matches neither CPF nor RF, storing as CPF");
    logger.log(
        "identifier_length_unrecognized",
        LogLevel::Warning,
        json!({ "table": table, "row_id": row_id, "length": digits }),
    );
}
