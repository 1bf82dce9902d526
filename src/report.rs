//! Per-run migration report.
//!
//! A [`MigrationReport`] is created fresh for every invocation and threaded
//! through the run; nothing is accumulated across runs.

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

use crate::executor::ExecutionError;

/// Outcome of one account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AccountStatus {
    #[serde(rename = "Error")]
    SkippedNotFound,
    #[serde(rename = "Warning")]
    SkippedAlreadyPresent,
    /// Validation itself could not run.
    #[serde(rename = "Error")]
    Failed,
    #[serde(rename = "Partial")]
    PartialError,
    Success,
}

impl AccountStatus {
    pub fn label(&self) -> &'static str {
        match self {
            AccountStatus::SkippedNotFound | AccountStatus::Failed => "Error",
            AccountStatus::SkippedAlreadyPresent => "Warning",
            AccountStatus::PartialError => "Partial",
            AccountStatus::Success => "Success",
        }
    }

    /// Whether this outcome makes the overall report an error.
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            AccountStatus::SkippedNotFound | AccountStatus::Failed | AccountStatus::PartialError
        )
    }
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Validation,
    Select,
    Synthesis,
    Execution,
    ConstraintViolation,
    Persistence,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Validation => "validation",
            FailureKind::Select => "select",
            FailureKind::Synthesis => "synthesis",
            FailureKind::Execution => "execution",
            FailureKind::ConstraintViolation => "constraint_violation",
            FailureKind::Persistence => "persistence",
        };
        f.write_str(s)
    }
}

/// A non-fatal problem recorded against an account.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Failure {
    pub kind: FailureKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statement: Option<String>,
    pub message: String,
}

impl Failure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            table: None,
            statement: None,
            message: message.into(),
        }
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn with_statement(mut self, statement: impl Into<String>) -> Self {
        self.statement = Some(statement.into());
        self
    }
}

impl From<&ExecutionError> for Failure {
    fn from(e: &ExecutionError) -> Self {
        let failure = Failure::new(e.kind, e.message.clone());
        match &e.statement {
            Some(statement) => failure.with_statement(statement.clone()),
            None => failure,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountResult {
    pub account_id: String,
    pub status: AccountStatus,
    pub message: String,
    pub insert_count: usize,
    pub delete_count: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<Failure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub insert_script: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delete_script: Option<PathBuf>,
}

impl AccountResult {
    fn skipped(account_id: &str, status: AccountStatus, message: String) -> Self {
        Self {
            account_id: account_id.to_string(),
            status,
            message,
            insert_count: 0,
            delete_count: 0,
            failures: Vec::new(),
            insert_script: None,
            delete_script: None,
        }
    }

    pub fn not_found(account_id: &str) -> Self {
        Self::skipped(
            account_id,
            AccountStatus::SkippedNotFound,
            format!("Account ID {} not found in the source database.", account_id),
        )
    }

    pub fn already_present(account_id: &str) -> Self {
        Self::skipped(
            account_id,
            AccountStatus::SkippedAlreadyPresent,
            format!("Account ID {} already present in the target database.", account_id),
        )
    }

    /// Validation could not be performed.
    pub fn failed(account_id: &str, failure: Failure) -> Self {
        let mut result = Self::skipped(
            account_id,
            AccountStatus::Failed,
            format!("Account ID {} could not be validated: {}", account_id, failure.message),
        );
        result.failures.push(failure);
        result
    }

    /// An account that went through generation and execution.
    pub fn processed(
        account_id: &str,
        insert_count: usize,
        delete_count: usize,
        failures: Vec<Failure>,
    ) -> Self {
        let (status, message) = if failures.is_empty() {
            (
                AccountStatus::Success,
                format!(
                    "Migrated account ID {}: {} rows inserted.",
                    account_id, insert_count
                ),
            )
        } else {
            (
                AccountStatus::PartialError,
                format!(
                    "Migrated account ID {} with {} failure(s): {} statements generated.",
                    account_id,
                    failures.len(),
                    insert_count
                ),
            )
        };
        Self {
            account_id: account_id.to_string(),
            status,
            message,
            insert_count,
            delete_count,
            failures,
            insert_script: None,
            delete_script: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReportStatus {
    Success,
    Error,
}

impl fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportStatus::Success => f.write_str("Success"),
            ReportStatus::Error => f.write_str("Error"),
        }
    }
}

/// Everything one invocation did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationReport {
    pub status: ReportStatus,
    pub dry_run: bool,
    pub accounts: Vec<AccountResult>,
    pub execution_errors: Vec<ExecutionError>,
    /// Where the sink stored this report, once written.
    #[serde(skip)]
    pub report_path: Option<PathBuf>,
}

impl MigrationReport {
    pub fn new(dry_run: bool) -> Self {
        Self {
            status: ReportStatus::Success,
            dry_run,
            accounts: Vec::new(),
            execution_errors: Vec::new(),
            report_path: None,
        }
    }

    pub fn push(&mut self, result: AccountResult) {
        self.accounts.push(result);
        self.refresh_status();
    }

    pub fn extend_errors(&mut self, errors: impl IntoIterator<Item = ExecutionError>) {
        self.execution_errors.extend(errors);
        self.refresh_status();
    }

    pub fn is_success(&self) -> bool {
        self.status == ReportStatus::Success
    }

    pub fn account(&self, account_id: &str) -> Option<&AccountResult> {
        self.accounts.iter().find(|a| a.account_id == account_id)
    }

    fn refresh_status(&mut self) {
        let failed = !self.execution_errors.is_empty()
            || self.accounts.iter().any(|a| a.status.is_error());
        self.status = if failed {
            ReportStatus::Error
        } else {
            ReportStatus::Success
        };
    }
}
