//! Account presence checks.

use crate::catalog::QueryTemplate;
use crate::connection::Connection;
use crate::error::{MigrateError, MigrateResult};
use crate::value::SqlValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationOutcome {
    Proceed,
    NotFoundInSource,
    AlreadyInTarget,
}

/// Runs the anchor count against source and target.
#[derive(Debug, Clone)]
pub struct AccountValidator {
    anchor: QueryTemplate,
}

impl AccountValidator {
    /// `anchor_sql` must be a count with exactly one `:account_id`.
    pub fn new(anchor_sql: &str) -> MigrateResult<Self> {
        let anchor = QueryTemplate::from_select(anchor_sql)
            .map_err(|e| MigrateError::Config(format!("anchor query: {}", e)))?;
        Ok(Self { anchor })
    }

    pub async fn validate(
        &self,
        account_id: &str,
        source: &mut dyn Connection,
        target: &mut dyn Connection,
    ) -> MigrateResult<ValidationOutcome> {
        if self.count(account_id, source).await? == 0 {
            return Ok(ValidationOutcome::NotFoundInSource);
        }
        if self.count(account_id, target).await? > 0 {
            return Ok(ValidationOutcome::AlreadyInTarget);
        }
        Ok(ValidationOutcome::Proceed)
    }

    async fn count(&self, account_id: &str, conn: &mut dyn Connection) -> MigrateResult<i64> {
        let sql = self.anchor.bind_sql(conn.dialect());
        let rows = conn.query(&sql, &[SqlValue::from(account_id)]).await?;
        let count = rows.scalar().and_then(SqlValue::as_i64).ok_or_else(|| {
            MigrateError::Query(format!(
                "anchor query on {} did not return a count",
                conn.name()
            ))
        })?;
        tracing::debug!("Account ID {} count on {}: {}", account_id, conn.name(), count);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_ANCHOR_QUERY;
    use crate::connection::RowSet;
    use crate::dialect::Dialect;
    use async_trait::async_trait;

    struct Counts {
        name: &'static str,
        count: Option<i64>,
        queries: usize,
    }

    #[async_trait]
    impl Connection for Counts {
        fn name(&self) -> &str {
            self.name
        }

        fn dialect(&self) -> Dialect {
            Dialect::Oracle
        }

        async fn query(&mut self, sql: &str, params: &[SqlValue]) -> MigrateResult<RowSet> {
            assert!(sql.ends_with("acct_id = :1"));
            assert_eq!(params, &[SqlValue::from("55")]);
            self.queries += 1;
            match self.count {
                Some(n) => Ok(RowSet::new(vec!["COUNT(*)".into()], vec![vec![SqlValue::from(n)]])),
                None => Err(MigrateError::Query("ORA-00942: table or view does not exist".into())),
            }
        }

        async fn execute(&mut self, _sql: &str) -> MigrateResult<u64> {
            Ok(0)
        }

        async fn begin(&mut self) -> MigrateResult<()> {
            Ok(())
        }

        async fn commit(&mut self) -> MigrateResult<()> {
            Ok(())
        }

        async fn rollback(&mut self) -> MigrateResult<()> {
            Ok(())
        }

        async fn close(self: Box<Self>) -> MigrateResult<()> {
            Ok(())
        }
    }

    fn conn(name: &'static str, count: Option<i64>) -> Counts {
        Counts { name, count, queries: 0 }
    }

    #[tokio::test]
    async fn test_outcomes() {
        let validator = AccountValidator::new(DEFAULT_ANCHOR_QUERY).unwrap();

        let (mut source, mut target) = (conn("src", Some(0)), conn("tgt", Some(1)));
        let outcome = validator.validate("55", &mut source, &mut target).await.unwrap();
        assert_eq!(outcome, ValidationOutcome::NotFoundInSource);
        assert_eq!(target.queries, 0);

        let (mut source, mut target) = (conn("src", Some(1)), conn("tgt", Some(3)));
        let outcome = validator.validate("55", &mut source, &mut target).await.unwrap();
        assert_eq!(outcome, ValidationOutcome::AlreadyInTarget);

        let (mut source, mut target) = (conn("src", Some(2)), conn("tgt", Some(0)));
        let outcome = validator.validate("55", &mut source, &mut target).await.unwrap();
        assert_eq!(outcome, ValidationOutcome::Proceed);
    }

    #[tokio::test]
    async fn test_repeat_validation_stays_already_present() {
        let validator = AccountValidator::new(DEFAULT_ANCHOR_QUERY).unwrap();
        let (mut source, mut target) = (conn("src", Some(1)), conn("tgt", Some(1)));
        for _ in 0..3 {
            let outcome = validator.validate("55", &mut source, &mut target).await.unwrap();
            assert_eq!(outcome, ValidationOutcome::AlreadyInTarget);
        }
    }

    #[tokio::test]
    async fn test_query_errors_propagate() {
        let validator = AccountValidator::new(DEFAULT_ANCHOR_QUERY).unwrap();
        let (mut source, mut target) = (conn("src", None), conn("tgt", Some(0)));
        let err = validator.validate("55", &mut source, &mut target).await.unwrap_err();
        assert!(matches!(err, MigrateError::Query(_)));
    }

    #[test]
    fn test_anchor_needs_placeholder() {
        let err = AccountValidator::new("SELECT COUNT(*) FROM ci_acct").unwrap_err();
        assert!(err.is_fatal());
    }
}
