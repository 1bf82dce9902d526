//! Durable copies of generated statements and run reports.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{MigrateError, MigrateResult};
use crate::report::MigrationReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptKind {
    Insert,
    Delete,
}

impl ScriptKind {
    fn file_prefix(&self) -> &'static str {
        match self {
            ScriptKind::Insert => "Insert_queries_for_",
            ScriptKind::Delete => "Delete_queries_for_",
        }
    }
}

/// Receives every statement list and report a run produces.
pub trait AuditSink: Send + Sync {
    /// Store the statements of one kind for one account.
    fn write(&self, account_id: &str, kind: ScriptKind, statements: &[String])
        -> MigrateResult<PathBuf>;

    fn write_report(&self, report: &MigrationReport) -> MigrateResult<PathBuf>;
}

/// Writes scripts and reports as files under one directory.
#[derive(Debug, Clone)]
pub struct FileAuditSink {
    dir: PathBuf,
}

impl FileAuditSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the script `kind` for `account_id`.
    pub fn script_path(&self, account_id: &str, kind: ScriptKind) -> PathBuf {
        self.dir
            .join(format!("{}{}.sql", kind.file_prefix(), sanitize(account_id)))
    }

    fn write_file(&self, path: &Path, content: &str) -> MigrateResult<()> {
        fs::create_dir_all(&self.dir)
            .map_err(|e| MigrateError::persistence(&self.dir, e.to_string()))?;
        fs::write(path, content).map_err(|e| MigrateError::persistence(path, e.to_string()))
    }
}

impl AuditSink for FileAuditSink {
    fn write(
        &self,
        account_id: &str,
        kind: ScriptKind,
        statements: &[String],
    ) -> MigrateResult<PathBuf> {
        let path = self.script_path(account_id, kind);
        let mut content = match kind {
            ScriptKind::Insert => statements
                .iter()
                .map(|s| format!("{};", s))
                .collect::<Vec<_>>()
                .join("\n"),
            ScriptKind::Delete => statements.join("\n"),
        };
        if !content.is_empty() {
            content.push('\n');
        }

        self.write_file(&path, &content)?;
        tracing::info!(
            "Wrote {} statements for account ID {} to {}",
            statements.len(),
            account_id,
            path.display()
        );
        Ok(path)
    }

    fn write_report(&self, report: &MigrationReport) -> MigrateResult<PathBuf> {
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%SZ");
        let path = self.dir.join(format!("migration_report_{}.json", stamp));
        let json = serde_json::to_string_pretty(report)
            .map_err(|e| MigrateError::persistence(&path, e.to_string()))?;
        self.write_file(&path, &json)?;
        tracing::info!("Report written to {}", path.display());
        Ok(path)
    }
}

/// Keep account ids usable as a file name component.
fn sanitize(account_id: &str) -> String {
    let cleaned: String = account_id
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}
