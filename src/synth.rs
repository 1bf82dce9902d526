//! Row-to-SQL synthesis.
//!
//! Every source row becomes a self-contained INSERT for the target and a
//! DELETE that removes exactly that row again.

use crate::catalog::QueryTemplate;
use crate::codec::{encode_literal, encode_predicate, quote_text};
use crate::dialect::Dialect;
use crate::error::{MigrateError, MigrateResult};
use crate::value::SqlValue;

/// Columns rewritten to the acting operator on every migrated row.
pub const DEFAULT_AUDIT_COLUMNS: [&str; 3] = ["USER_ID", "FREEZE_USER_ID", "COMPLETE_USER_ID"];

/// The statements generated for one row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatementPair {
    pub insert: String,
    pub delete: String,
}

/// Builds INSERT/DELETE pairs in one dialect.
#[derive(Debug, Clone)]
pub struct Synthesizer {
    dialect: Dialect,
    audit_columns: Vec<String>,
}

impl Synthesizer {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            audit_columns: DEFAULT_AUDIT_COLUMNS.iter().map(|c| c.to_string()).collect(),
        }
    }

    pub fn with_audit_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.audit_columns = columns.into_iter().map(|c| c.as_ref().to_string()).collect();
        self
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn is_audit_column(&self, column: &str) -> bool {
        self.audit_columns
            .iter()
            .any(|c| c.eq_ignore_ascii_case(column))
    }

    /// Generate the INSERT and rollback DELETE for one row of `template`.
    ///
    /// Audit columns carry `actor` in both statements, so the DELETE matches
    /// the row as it was inserted rather than as it was read.
    pub fn synthesize(
        &self,
        template: &QueryTemplate,
        columns: &[String],
        row: &[SqlValue],
        actor: &str,
    ) -> MigrateResult<StatementPair> {
        let table = &template.table_name;
        if columns.is_empty() {
            return Err(MigrateError::Synthesis(format!("select on {} returned no columns", table)));
        }
        if columns.len() != row.len() {
            return Err(MigrateError::Synthesis(format!(
                "row for {} has {} values for {} columns",
                table,
                row.len(),
                columns.len()
            )));
        }

        let actor_value = SqlValue::Text(actor.to_string());

        let values = columns
            .iter()
            .zip(row)
            .map(|(column, value)| {
                if self.is_audit_column(column) {
                    Ok(quote_text(actor, self.dialect))
                } else {
                    encode_literal(value, self.dialect).map_err(|e| match e {
                        MigrateError::UnsupportedType(msg) => {
                            MigrateError::UnsupportedType(format!("{}.{}: {}", table, column, msg))
                        }
                        other => other,
                    })
                }
            })
            .collect::<MigrateResult<Vec<_>>>()?;

        let insert = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table,
            columns.join(", "),
            values.join(", ")
        );

        let key = template.key_indexes(columns).map_err(MigrateError::Synthesis)?;
        let mut conditions = Vec::with_capacity(key.len());
        for idx in key {
            let column = &columns[idx];
            let value = if self.is_audit_column(column) {
                &actor_value
            } else {
                &row[idx]
            };
            match encode_predicate(column, value, self.dialect)? {
                Some(condition) => conditions.push(condition),
                None => tracing::debug!(
                    "Leaving {}.{} ({}) out of the delete key",
                    table,
                    column,
                    value.kind()
                ),
            }
        }

        if conditions.is_empty() {
            return Err(MigrateError::Synthesis(format!(
                "no comparable key columns for {}; refusing an unconstrained DELETE",
                table
            )));
        }

        let delete = format!(
            "DELETE FROM {} WHERE {}; COMMIT;",
            table,
            conditions.join(" AND ")
        );

        Ok(StatementPair { insert, delete })
    }
}
