use crate::config::MigrationConfig;
use crate::crypto::normalize_email;
use crate::db::repos::resources::records::{non_empty, quote_ident, ColumnWrite, RowUpdate};
use crate::error::{AppError, PreconditionError};
use crate::migration::batch::{process_rows, BatchResult, BatchRow};
use crate::migration::identifier::{classify, warn_unrecognized, IdentifierKind};
use crate::migration::status::{count_table_status, MigrationStatus, StatusQuery, TableCounts};
use crate::migration::{
    require_crypto, state, ExecuteOutcome, MigrationContext, MigrationStrategy, APPOINTMENTS_TABLE,
    SUBMISSIONS_TABLE,
};

const TABLES: [&str; 2] = [SUBMISSIONS_TABLE, APPOINTMENTS_TABLE];

/// A table takes part only if it has these.
const EMAIL_COLUMNS: &[&str] = &["email", "email_encrypted", "email_hash"];
const IDENTIFIER_COLUMNS: &[&str] = &["cpf_rf", "cpf_rf_encrypted", "cpf_rf_hash"];
const TYPED_COLUMNS: &[&str] = &["cpf_encrypted", "cpf_hash", "rf_encrypted", "rf_hash"];
const IP_COLUMNS: &[&str] = &["user_ip", "user_ip_encrypted"];
const DATA_COLUMNS: &[&str] = &["data", "data_encrypted"];

/// One plaintext source column and the columns whose population means that
/// source has been migrated.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Field {
    source: &'static str,
    done: Vec<&'static str>,
}

impl Field {
    fn done_predicate(&self) -> Result<String, AppError> {
        any_non_empty(&self.done)
    }

    /// Source holds a value its own destination does not.
    fn pending_predicate(&self) -> Result<String, AppError> {
        Ok(format!("({} AND NOT ({}))", non_empty(self.source)?, self.done_predicate()?))
    }
}

/// Which optional field groups one table carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Layout {
    table: &'static str,
    identifier: bool,
    typed: bool,
    ip: bool,
    data: bool,
}

impl Layout {
    /// Email is keyed on its encrypted column alone: a hash without
    /// ciphertext still leaves the plaintext as the only readable copy.
    fn email(&self) -> Field {
        Field {
            source: "email",
            done: vec!["email_encrypted"],
        }
    }

    fn identifier(&self) -> Option<Field> {
        self.identifier.then(|| {
            let mut done = vec!["cpf_rf_hash"];
            if self.typed {
                done.extend(["cpf_hash", "rf_hash"]);
            }
            Field { source: "cpf_rf", done }
        })
    }

    fn ip(&self) -> Option<Field> {
        self.ip.then(|| Field {
            source: "user_ip",
            done: vec!["user_ip_encrypted"],
        })
    }

    fn data(&self) -> Option<Field> {
        self.data.then(|| Field {
            source: "data",
            done: vec!["data_encrypted"],
        })
    }

    fn fields(&self) -> Vec<Field> {
        let mut fields = vec![self.email()];
        fields.extend(self.identifier());
        fields.extend(self.ip());
        fields.extend(self.data());
        fields
    }

    /// Any field still waiting for its own destination.
    fn pending_predicate(&self) -> Result<String, AppError> {
        let parts = self
            .fields()
            .iter()
            .map(Field::pending_predicate)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(parts.join(" OR "))
    }

    /// Rows that ever held sensitive data count toward the total; a row is
    /// migrated once no field is pending.
    fn status_query(&self) -> Result<StatusQuery, AppError> {
        let fields = self.fields();
        let sources: Vec<&str> = fields.iter().map(|f| f.source).collect();
        let markers: Vec<&str> = fields.iter().flat_map(|f| f.done.iter().copied()).collect();
        Ok(StatusQuery {
            total: format!("({}) OR ({})", any_non_empty(&sources)?, any_non_empty(&markers)?),
            migrated: format!("NOT ({})", self.pending_predicate()?),
        })
    }

    /// Source value and done flag for an optional field, or constants when the
    /// table lacks it.
    fn select_field(field: Option<Field>) -> Result<(String, String), AppError> {
        match field {
            Some(f) => Ok((quote_ident(f.source)?, format!("({})", f.done_predicate()?))),
            None => Ok(("NULL".into(), "0".into())),
        }
    }
}

fn any_non_empty(columns: &[&str]) -> Result<String, AppError> {
    let parts = columns
        .iter()
        .map(|c| non_empty(c))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(parts.join(" OR "))
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

/// A selected source value plus whether its destination is already filled.
#[derive(Debug)]
struct SourceValue {
    value: Option<String>,
    done: bool,
}

impl SourceValue {
    fn pending(&self) -> Option<&str> {
        if self.done {
            None
        } else {
            present(&self.value)
        }
    }
}

#[derive(Debug)]
struct PendingRow {
    id: i64,
    email: SourceValue,
    identifier: SourceValue,
    ip: SourceValue,
    data: SourceValue,
}

impl BatchRow for PendingRow {
    fn id(&self) -> i64 {
        self.id
    }
}

/// The writes for one row, plus a reason to report it as failed after they
/// are applied.
struct PlannedUpdate {
    update: RowUpdate,
    rejected: Option<&'static str>,
}

/// Plaintext → encrypted + hash for email, CPF/RF, IP and form data.
pub struct EncryptionMigration {
    ctx: MigrationContext,
}

impl EncryptionMigration {
    pub const KEY: &'static str = "encrypt_sensitive_fields";

    pub fn new(ctx: MigrationContext) -> Self {
        Self { ctx }
    }

    /// `None` when the table is absent or has not had the encryption columns added.
    fn layout(&self, table: &'static str) -> Result<Option<Layout>, AppError> {
        let introspector = &self.ctx.introspector;
        if !introspector.table_exists(table)? || !introspector.has_columns(table, EMAIL_COLUMNS)? {
            return Ok(None);
        }
        let identifier = introspector.has_columns(table, IDENTIFIER_COLUMNS)?;
        Ok(Some(Layout {
            table,
            identifier,
            typed: identifier && introspector.has_columns(table, TYPED_COLUMNS)?,
            ip: introspector.has_columns(table, IP_COLUMNS)?,
            data: introspector.has_columns(table, DATA_COLUMNS)?,
        }))
    }

    fn select_pending(&self, layout: &Layout, limit: i64) -> Result<Vec<PendingRow>, AppError> {
        let email = layout.email();
        let (identifier, identifier_done) = Layout::select_field(layout.identifier())?;
        let (ip, ip_done) = Layout::select_field(layout.ip())?;
        let (data, data_done) = Layout::select_field(layout.data())?;
        let sql = format!(
            "SELECT id, {}, {identifier}, {ip}, {data}, ({}), {identifier_done}, {ip_done}, {data_done}
             FROM {} WHERE {} ORDER BY id LIMIT ?1",
            quote_ident(email.source)?,
            email.done_predicate()?,
            quote_ident(layout.table)?,
            layout.pending_predicate()?,
        );

        let conn = self.ctx.pool.get()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([limit], |row| {
            Ok(PendingRow {
                id: row.get(0)?,
                email: SourceValue {
                    value: row.get(1)?,
                    done: row.get(5)?,
                },
                identifier: SourceValue {
                    value: row.get(2)?,
                    done: row.get(6)?,
                },
                ip: SourceValue {
                    value: row.get(3)?,
                    done: row.get(7)?,
                },
                data: SourceValue {
                    value: row.get(4)?,
                    done: row.get(8)?,
                },
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(AppError::Database)
    }

    /// Compute the column writes for one row. A field whose destination is
    /// already filled is left untouched; an empty, unmigrated field is written
    /// as `NotPresent` so the UPDATE states it explicitly.
    fn build_update(&self, layout: &Layout, row: &PendingRow) -> Result<PlannedUpdate, AppError> {
        let crypto = self.ctx.crypto.as_ref();
        let mut update = RowUpdate::new(row.id);
        let mut rejected = None;

        if !row.email.done {
            match row.email.pending() {
                Some(email) => {
                    update.push("email_encrypted", ColumnWrite::Value(crypto.encrypt(email)?));
                    update.push("email_hash", ColumnWrite::Value(crypto.hash(&normalize_email(email))?));
                }
                None => {
                    update.push("email_encrypted", ColumnWrite::NotPresent);
                    update.push("email_hash", ColumnWrite::NotPresent);
                }
            }
        }

        if layout.identifier && !row.identifier.done {
            match row.identifier.pending().map(classify) {
                Some(c) if c.digits.is_empty() => rejected = Some("identifier contains no digits"),
                Some(c) => {
                    if !c.recognized {
                        warn_unrecognized(self.ctx.logger.as_ref(), layout.table, row.id, c.digits.len());
                    }
                    let encrypted = crypto.encrypt(&c.digits)?;
                    let hash = crypto.hash(&c.digits)?;
                    // Typed columns reuse the combined ciphertext and hash. The
                    // combined columns stay populated, and since a typed hash
                    // is already set the split never selects or retires them.
                    if layout.typed {
                        update.push(c.kind.encrypted_column(), ColumnWrite::Value(encrypted.clone()));
                        update.push(c.kind.hash_column(), ColumnWrite::Value(hash.clone()));
                        push_not_present(&mut update, c.kind.other());
                    }
                    update.push("cpf_rf_encrypted", ColumnWrite::Value(encrypted));
                    update.push("cpf_rf_hash", ColumnWrite::Value(hash));
                }
                None => {
                    update.push("cpf_rf_encrypted", ColumnWrite::NotPresent);
                    update.push("cpf_rf_hash", ColumnWrite::NotPresent);
                    if layout.typed {
                        push_not_present(&mut update, IdentifierKind::Cpf);
                        push_not_present(&mut update, IdentifierKind::Rf);
                    }
                }
            }
        }

        if layout.ip && !row.ip.done {
            let write = row.ip.pending().map(|ip| crypto.encrypt(ip)).transpose()?;
            update.push("user_ip_encrypted", ColumnWrite::from_option(write));
        }

        if layout.data && !row.data.done {
            let write = row.data.pending().map(|data| crypto.encrypt(data)).transpose()?;
            update.push("data_encrypted", ColumnWrite::from_option(write));
        }

        if rejected.is_none() && !update.writes_any_value() {
            return Err(AppError::Validation("no field holds a value that can be encrypted".into()));
        }
        Ok(PlannedUpdate { update, rejected })
    }

    fn migrate_table(&self, layout: &Layout, config: &MigrationConfig) -> Result<BatchResult, AppError> {
        let rows = self.select_pending(layout, config.limit())?;
        tracing::debug!(table = layout.table, selected = rows.len(), "Selected rows for encryption");

        let conn = self.ctx.pool.get()?;
        Ok(process_rows(layout.table, &rows, self.ctx.logger.as_ref(), |row| {
            let plan = self.build_update(layout, row)?;
            // The usable fields are written even when the row is then reported.
            if plan.update.writes_any_value() && plan.update.apply(&conn, layout.table)? == 0 {
                return Err(AppError::NotFound(format!("row {} disappeared before update", row.id)));
            }
            match plan.rejected {
                Some(reason) => Err(AppError::Validation(reason.into())),
                None => Ok(()),
            }
        }))
    }
}

fn push_not_present(update: &mut RowUpdate, kind: IdentifierKind) {
    update.push(kind.encrypted_column(), ColumnWrite::NotPresent);
    update.push(kind.hash_column(), ColumnWrite::NotPresent);
}

impl MigrationStrategy for EncryptionMigration {
    fn name(&self) -> &str {
        "Encrypt sensitive fields"
    }

    fn can_run(&self, _key: &str, _config: &MigrationConfig) -> Result<(), PreconditionError> {
        require_crypto(self.ctx.crypto.as_ref())
    }

    fn calculate_status(&self, _key: &str, _config: &MigrationConfig) -> Result<MigrationStatus, AppError> {
        let conn = self.ctx.pool.get()?;
        let mut counts = TableCounts::default();
        for table in TABLES {
            if let Some(layout) = self.layout(table)? {
                counts = counts
                    + count_table_status(&conn, &self.ctx.introspector, table, EMAIL_COLUMNS, &layout.status_query()?)?;
            }
        }
        Ok(MigrationStatus::from_counts(counts))
    }

    fn execute(&self, key: &str, config: &MigrationConfig, batch_number: u32) -> Result<ExecuteOutcome, AppError> {
        self.can_run(key, config)?;
        config.validate()?;

        let mut batch = BatchResult::default();
        for table in TABLES {
            match self.layout(table)? {
                Some(layout) => batch.absorb(self.migrate_table(&layout, config)?),
                None => tracing::debug!(table, "Skipping table without encryption columns"),
            }
        }

        let status = self.calculate_status(key, config)?;
        if status.is_complete {
            state::mark_complete(&self.ctx.pool, self.ctx.logger.as_ref(), key, &status)?;
        }
        Ok(ExecuteOutcome::from_batch(batch, &status, batch_number))
    }
}
