//! Migration orchestration.
//!
//! [`Migrator`] drives one invocation: every requested account is validated,
//! its templates are replayed against the source, the resulting rows become
//! INSERT/DELETE pairs, inserts run on the target and both statement lists
//! are handed to the [`AuditSink`]. Nothing that happens to one account
//! stops the next one from being attempted.

use serde::{Deserialize, Deserializer, Serialize};

use crate::audit::{AuditSink, ScriptKind};
use crate::catalog::Catalog;
use crate::config::{normalize_connection_name, MigrationSettings, DEFAULT_ANCHOR_QUERY};
use crate::connection::{Connection, ConnectionResolver};
use crate::error::MigrateResult;
use crate::executor::{self, CommitPolicy};
use crate::report::{AccountResult, Failure, FailureKind, MigrationReport};
use crate::synth::{Synthesizer, DEFAULT_AUDIT_COLUMNS};
use crate::validator::{AccountValidator, ValidationOutcome};
use crate::value::SqlValue;

/// One migration request.
///
/// ```json
/// {
///   "account_ids": ["3003", 4004],
///   "user_id": "jdoe",
///   "source_connection_name": "PROD",
///   "target_connection_name": "test"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRequest {
    #[serde(deserialize_with = "deserialize_account_ids")]
    pub account_ids: Vec<String>,
    pub user_id: String,
    pub source_connection_name: String,
    pub target_connection_name: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AccountIdInput {
    Text(String),
    Signed(i64),
    Unsigned(u64),
}

fn deserialize_account_ids<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let ids = Vec::<AccountIdInput>::deserialize(deserializer)?;
    Ok(ids
        .into_iter()
        .map(|id| match id {
            AccountIdInput::Text(s) => s,
            AccountIdInput::Signed(n) => n.to_string(),
            AccountIdInput::Unsigned(n) => n.to_string(),
        })
        .collect())
}

impl MigrationRequest {
    pub fn new<I, S>(account_ids: I, user_id: &str, source: &str, target: &str) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            account_ids: account_ids.into_iter().map(Into::into).collect(),
            user_id: user_id.to_string(),
            source_connection_name: source.to_string(),
            target_connection_name: target.to_string(),
        }
    }

    /// Trimmed account ids (blanks dropped), upper-case actor, case-folded
    /// connection names.
    pub fn normalized(&self) -> Self {
        Self {
            account_ids: self
                .account_ids
                .iter()
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty())
                .collect(),
            user_id: self.user_id.trim().to_uppercase(),
            source_connection_name: normalize_connection_name(&self.source_connection_name),
            target_connection_name: normalize_connection_name(&self.target_connection_name),
        }
    }
}

/// Knobs for one [`Migrator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationOptions {
    pub anchor_query: String,
    pub audit_columns: Vec<String>,
    pub commit_policy: CommitPolicy,
    /// Generate and persist statements without touching the target.
    pub dry_run: bool,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            anchor_query: DEFAULT_ANCHOR_QUERY.to_string(),
            audit_columns: DEFAULT_AUDIT_COLUMNS.iter().map(|c| c.to_string()).collect(),
            commit_policy: CommitPolicy::default(),
            dry_run: false,
        }
    }
}

impl From<&MigrationSettings> for MigrationOptions {
    fn from(settings: &MigrationSettings) -> Self {
        Self {
            anchor_query: settings.anchor_query.clone(),
            audit_columns: settings.audit_columns.clone(),
            commit_policy: settings.commit_policy,
            dry_run: false,
        }
    }
}

pub struct Migrator {
    catalog: Catalog,
    validator: AccountValidator,
    options: MigrationOptions,
    sink: Box<dyn AuditSink>,
}

impl Migrator {
    pub fn new(
        catalog: Catalog,
        options: MigrationOptions,
        sink: Box<dyn AuditSink>,
    ) -> MigrateResult<Self> {
        let validator = AccountValidator::new(&options.anchor_query)?;
        Ok(Self {
            catalog,
            validator,
            options,
            sink,
        })
    }

    pub fn options(&self) -> &MigrationOptions {
        &self.options
    }

    /// Resolve both connections, migrate, and close them again.
    ///
    /// Only failures to obtain a connection are returned as `Err`; everything
    /// else ends up in the report.
    pub async fn run(
        &self,
        resolver: &dyn ConnectionResolver,
        request: &MigrationRequest,
    ) -> MigrateResult<MigrationReport> {
        let request = request.normalized();

        let mut source = resolver.resolve(&request.source_connection_name).await?;
        let mut target = match resolver.resolve(&request.target_connection_name).await {
            Ok(target) => target,
            Err(e) => {
                close(source).await;
                return Err(e);
            }
        };

        let report = self.migrate(&mut *source, &mut *target, &request).await;

        close(source).await;
        close(target).await;
        Ok(report)
    }

    /// Migrate every requested account over already-open connections.
    pub async fn migrate(
        &self,
        source: &mut dyn Connection,
        target: &mut dyn Connection,
        request: &MigrationRequest,
    ) -> MigrationReport {
        let request = request.normalized();
        let synth = Synthesizer::new(target.dialect())
            .with_audit_columns(&self.options.audit_columns);
        let mut report = MigrationReport::new(self.options.dry_run);

        tracing::info!(
            "Migrating {} account(s) from {} to {} as {}{}",
            request.account_ids.len(),
            source.name(),
            target.name(),
            request.user_id,
            if self.options.dry_run { " (dry run)" } else { "" }
        );

        for account_id in &request.account_ids {
            let result = self
                .migrate_account(account_id, &request.user_id, &synth, source, target, &mut report)
                .await;
            tracing::info!("Account ID {}: {}", account_id, result.status);
            report.push(result);
        }

        match self.sink.write_report(&report) {
            Ok(path) => report.report_path = Some(path),
            Err(e) => tracing::error!("Could not store the migration report: {}", e),
        }

        tracing::info!("Migration finished with status {}", report.status);
        report
    }

    async fn migrate_account(
        &self,
        account_id: &str,
        actor: &str,
        synth: &Synthesizer,
        source: &mut dyn Connection,
        target: &mut dyn Connection,
        report: &mut MigrationReport,
    ) -> AccountResult {
        tracing::info!("Processing account ID {}", account_id);

        match self.validator.validate(account_id, source, target).await {
            Ok(ValidationOutcome::Proceed) => {}
            Ok(ValidationOutcome::NotFoundInSource) => {
                tracing::warn!("Account ID {} not found in {}", account_id, source.name());
                return AccountResult::not_found(account_id);
            }
            Ok(ValidationOutcome::AlreadyInTarget) => {
                tracing::warn!("Account ID {} already present in {}", account_id, target.name());
                return AccountResult::already_present(account_id);
            }
            Err(e) => {
                tracing::error!("Validating account ID {} failed: {}", account_id, e);
                return AccountResult::failed(
                    account_id,
                    Failure::new(FailureKind::Validation, e.to_string()),
                );
            }
        }

        let mut inserts = Vec::new();
        let mut deletes = Vec::new();
        let mut failures = Vec::new();
        let param = [SqlValue::from(account_id)];

        for template in self.catalog.templates() {
            let sql = template.bind_sql(source.dialect());
            let rows = match source.query(&sql, &param).await {
                Ok(rows) => rows,
                Err(e) => {
                    tracing::error!(
                        "Select on {} failed for account ID {}: {}",
                        template.table_name,
                        account_id,
                        e
                    );
                    failures.push(
                        Failure::new(FailureKind::Select, e.to_string())
                            .with_table(&template.table_name)
                            .with_statement(&template.sql),
                    );
                    continue;
                }
            };
            tracing::debug!("{} row(s) from {}", rows.len(), template.table_name);

            for row in &rows.rows {
                match synth.synthesize(template, &rows.columns, row, actor) {
                    Ok(pair) => {
                        inserts.push(pair.insert);
                        deletes.push(pair.delete);
                    }
                    Err(e) => {
                        tracing::error!(
                            "Could not generate statements for a {} row of account ID {}: {}",
                            template.table_name,
                            account_id,
                            e
                        );
                        failures.push(
                            Failure::new(FailureKind::Synthesis, e.to_string())
                                .with_table(&template.table_name),
                        );
                    }
                }
            }
        }

        let insert_script = self.persist(account_id, ScriptKind::Insert, &inserts, &mut failures);

        if self.options.dry_run {
            tracing::info!(
                "Dry run: {} insert(s) for account ID {} not executed",
                inserts.len(),
                account_id
            );
        } else {
            let errors =
                executor::execute(target, &inserts, account_id, self.options.commit_policy).await;
            failures.extend(errors.iter().map(Failure::from));
            report.extend_errors(errors);
        }

        let delete_script = self.persist(account_id, ScriptKind::Delete, &deletes, &mut failures);

        let mut result =
            AccountResult::processed(account_id, inserts.len(), deletes.len(), failures);
        result.insert_script = insert_script;
        result.delete_script = delete_script;
        result
    }

    fn persist(
        &self,
        account_id: &str,
        kind: ScriptKind,
        statements: &[String],
        failures: &mut Vec<Failure>,
    ) -> Option<std::path::PathBuf> {
        match self.sink.write(account_id, kind, statements) {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::error!(
                    "Could not store {:?} statements for account ID {}: {}",
                    kind,
                    account_id,
                    e
                );
                failures.push(Failure::new(FailureKind::Persistence, e.to_string()));
                None
            }
        }
    }
}

async fn close(conn: Box<dyn Connection>) {
    let name = conn.name().to_string();
    if let Err(e) = conn.close().await {
        tracing::warn!("Closing {} failed: {}", name, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_request_accepts_numeric_ids() {
        let request: MigrationRequest = serde_json::from_str(
            r#"{
                "account_ids": ["3003", 4004, " 5005 ", ""],
                "user_id": " jdoe ",
                "source_connection_name": "PROD",
                "target_connection_name": " Test "
            }"#,
        )
        .unwrap();

        let normalized = request.normalized();
        assert_eq!(normalized.account_ids, vec!["3003", "4004", "5005"]);
        assert_eq!(normalized.user_id, "JDOE");
        assert_eq!(normalized.source_connection_name, "prod");
        assert_eq!(normalized.target_connection_name, "test");
    }

    #[test]
    fn test_options_from_settings() {
        let settings = MigrationSettings {
            commit_policy: CommitPolicy::AllOrNothing,
            ..Default::default()
        };
        let options = MigrationOptions::from(&settings);
        assert_eq!(options.commit_policy, CommitPolicy::AllOrNothing);
        assert_eq!(options.anchor_query, DEFAULT_ANCHOR_QUERY);
        assert!(!options.dry_run);
    }
}
