//! Statement replay against the target.
//!
//! Each statement runs independently; failures are collected and the batch
//! keeps going. What happens to the statements that did succeed is decided
//! by [`CommitPolicy`]. A statement that times out ends the batch: the
//! session state is unknown, so the transaction is always rolled back.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::connection::Connection;
use crate::error::MigrateError;
use crate::report::FailureKind;

const SAVEPOINT: &str = "acctmig_stmt";

/// What to do with the successful statements of a batch that had failures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitPolicy {
    /// Commit once after all statements; partial application is accepted.
    #[default]
    BestEffort,
    /// Roll the whole batch back if any statement failed.
    AllOrNothing,
}

/// A statement (or transaction control call) that failed on the target.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionError {
    pub account_id: String,
    pub kind: FailureKind,
    pub message: String,
    /// `None` when begin/commit/rollback itself failed.
    pub statement: Option<String>,
}

impl ExecutionError {
    fn new(account_id: &str, error: &MigrateError, statement: Option<&str>) -> Self {
        let kind = match error {
            MigrateError::ConstraintViolation(_) => FailureKind::ConstraintViolation,
            _ => FailureKind::Execution,
        };
        Self {
            account_id: account_id.to_string(),
            kind,
            message: error.to_string(),
            statement: statement.map(str::to_string),
        }
    }
}

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.statement {
            Some(statement) => write!(
                f,
                "{}\nError executing query for account ID {}: {}",
                self.message, self.account_id, statement
            ),
            None => write!(f, "{} (account ID {})", self.message, self.account_id),
        }
    }
}

/// Run `statements` on `conn` inside one transaction.
pub async fn execute(
    conn: &mut dyn Connection,
    statements: &[String],
    account_id: &str,
    policy: CommitPolicy,
) -> Vec<ExecutionError> {
    let mut errors = Vec::new();
    if statements.is_empty() {
        return errors;
    }

    if let Err(e) = conn.begin().await {
        tracing::error!("Could not open a transaction for account ID {}: {}", account_id, e);
        errors.push(ExecutionError::new(account_id, &e, None));
        return errors;
    }

    let isolate = conn.dialect().aborts_transaction_on_error();
    let mut timed_out = false;

    for statement in statements {
        if isolate {
            if let Err(e) = conn.execute(&format!("SAVEPOINT {}", SAVEPOINT)).await {
                errors.push(ExecutionError::new(account_id, &e, None));
                break;
            }
        }

        match conn.execute(statement).await {
            Ok(_) => {
                tracing::debug!("Executed for account ID {}: {}", account_id, statement);
                if isolate {
                    let release = format!("RELEASE SAVEPOINT {}", SAVEPOINT);
                    if let Err(e) = conn.execute(&release).await {
                        errors.push(ExecutionError::new(account_id, &e, None));
                        break;
                    }
                }
            }
            Err(e @ MigrateError::Timeout { .. }) => {
                let error = ExecutionError::new(account_id, &e, Some(statement.as_str()));
                tracing::error!("{}", error);
                errors.push(error);
                timed_out = true;
                break;
            }
            Err(e) => {
                let error = ExecutionError::new(account_id, &e, Some(statement.as_str()));
                tracing::error!("{}", error);
                errors.push(error);
                if isolate {
                    let rollback = format!("ROLLBACK TO SAVEPOINT {}", SAVEPOINT);
                    if let Err(e) = conn.execute(&rollback).await {
                        errors.push(ExecutionError::new(account_id, &e, None));
                        break;
                    }
                }
            }
        }
    }

    let finish = if timed_out {
        tracing::warn!(
            "Rolling back account ID {} after a statement timed out; remaining statements skipped",
            account_id
        );
        conn.rollback().await
    } else if policy == CommitPolicy::AllOrNothing && !errors.is_empty() {
        tracing::warn!(
            "Rolling back {} statements for account ID {} after {} failure(s)",
            statements.len(),
            account_id,
            errors.len()
        );
        conn.rollback().await
    } else {
        conn.commit().await
    };

    if let Err(e) = finish {
        tracing::error!("Finishing the transaction for account ID {} failed: {}", account_id, e);
        errors.push(ExecutionError::new(account_id, &e, None));
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::RowSet;
    use crate::dialect::Dialect;
    use crate::error::MigrateResult;
    use crate::value::SqlValue;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    /// Records every call; statements containing `dup`, `fail` or `slow` are
    /// rejected, `slow` with a timeout.
    struct Recorder {
        dialect: Dialect,
        log: Vec<String>,
    }

    impl Recorder {
        fn new(dialect: Dialect) -> Self {
            Self { dialect, log: Vec::new() }
        }
    }

    #[async_trait]
    impl Connection for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn dialect(&self) -> Dialect {
            self.dialect
        }

        async fn query(&mut self, _sql: &str, _params: &[SqlValue]) -> MigrateResult<RowSet> {
            Ok(RowSet::default())
        }

        async fn execute(&mut self, sql: &str) -> MigrateResult<u64> {
            self.log.push(sql.to_string());
            if sql.contains("dup") {
                Err(MigrateError::ConstraintViolation("unique constraint violated".into()))
            } else if sql.contains("fail") {
                Err(MigrateError::Execution("table does not exist".into()))
            } else if sql.contains("slow") {
                Err(MigrateError::Timeout {
                    operation: sql.to_string(),
                    seconds: 300,
                })
            } else {
                Ok(1)
            }
        }

        async fn begin(&mut self) -> MigrateResult<()> {
            self.log.push("BEGIN".into());
            Ok(())
        }

        async fn commit(&mut self) -> MigrateResult<()> {
            self.log.push("COMMIT".into());
            Ok(())
        }

        async fn rollback(&mut self) -> MigrateResult<()> {
            self.log.push("ROLLBACK".into());
            Ok(())
        }

        async fn close(self: Box<Self>) -> MigrateResult<()> {
            Ok(())
        }
    }

    fn stmts(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_best_effort_commits_after_failures() {
        let mut conn = Recorder::new(Dialect::Oracle);
        let batch = stmts(&["ok 1", "dup 2", "fail 3", "ok 4"]);
        let errors = execute(&mut conn, &batch, "42", CommitPolicy::BestEffort).await;

        assert_eq!(conn.log, vec!["BEGIN", "ok 1", "dup 2", "fail 3", "ok 4", "COMMIT"]);
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].kind, FailureKind::ConstraintViolation);
        assert_eq!(errors[1].kind, FailureKind::Execution);
        assert_eq!(errors[1].statement.as_deref(), Some("fail 3"));
        assert_eq!(
            errors[1].to_string(),
            "Execution error: table does not exist\n\
             Error executing query for account ID 42: fail 3"
        );
    }

    #[tokio::test]
    async fn test_all_or_nothing_rolls_back() {
        let mut conn = Recorder::new(Dialect::MySql);
        let batch = stmts(&["ok 1", "fail 2"]);
        let errors = execute(&mut conn, &batch, "7", CommitPolicy::AllOrNothing).await;
        assert_eq!(errors.len(), 1);
        assert_eq!(conn.log.last().map(String::as_str), Some("ROLLBACK"));

        let mut conn = Recorder::new(Dialect::MySql);
        let errors = execute(&mut conn, &stmts(&["ok 1"]), "7", CommitPolicy::AllOrNothing).await;
        assert!(errors.is_empty());
        assert_eq!(conn.log.last().map(String::as_str), Some("COMMIT"));
    }

    #[tokio::test]
    async fn test_postgres_statements_run_under_savepoints() {
        let mut conn = Recorder::new(Dialect::Postgres);
        let batch = stmts(&["ok 1", "fail 2"]);
        let errors = execute(&mut conn, &batch, "9", CommitPolicy::BestEffort).await;
        assert_eq!(errors.len(), 1);
        assert_eq!(
            conn.log,
            vec![
                "BEGIN",
                "SAVEPOINT acctmig_stmt",
                "ok 1",
                "RELEASE SAVEPOINT acctmig_stmt",
                "SAVEPOINT acctmig_stmt",
                "fail 2",
                "ROLLBACK TO SAVEPOINT acctmig_stmt",
                "COMMIT",
            ]
        );
    }

    #[tokio::test]
    async fn test_timeout_ends_batch_and_rolls_back() {
        let mut conn = Recorder::new(Dialect::Oracle);
        let batch = stmts(&["ok 1", "slow 2", "ok 3"]);
        let errors = execute(&mut conn, &batch, "5", CommitPolicy::BestEffort).await;

        assert_eq!(conn.log, vec!["BEGIN", "ok 1", "slow 2", "ROLLBACK"]);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, FailureKind::Execution);
        assert_eq!(errors[0].statement.as_deref(), Some("slow 2"));
        assert!(errors[0].message.starts_with("Timed out after 300s"));
    }

    #[tokio::test]
    async fn test_timeout_skips_savepoint_rollback() {
        let mut conn = Recorder::new(Dialect::Postgres);
        let batch = stmts(&["slow 1", "ok 2"]);
        let errors = execute(&mut conn, &batch, "6", CommitPolicy::BestEffort).await;

        assert_eq!(errors.len(), 1);
        assert_eq!(conn.log, vec!["BEGIN", "SAVEPOINT acctmig_stmt", "slow 1", "ROLLBACK"]);
    }

    #[tokio::test]
    async fn test_empty_batch_touches_nothing() {
        let mut conn = Recorder::new(Dialect::Oracle);
        assert!(execute(&mut conn, &[], "1", CommitPolicy::BestEffort).await.is_empty());
        assert!(conn.log.is_empty());
    }
}
