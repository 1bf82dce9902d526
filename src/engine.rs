//! sqlx-backed [`Connection`] implementation.
//!
//! Each connection is a pool capped at one physical connection, so a
//! migration run holds exactly one session per database. The driver is
//! picked from the dialect: `postgres://`, `mysql://` and `sqlite://` URLs
//! are supported. Rows are decoded per driver from the column's declared
//! type, falling back to the value's own type where the driver reports none.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use sqlx::database::HasArguments;
use sqlx::error::ErrorKind;
use sqlx::mysql::MySqlRow;
use sqlx::pool::PoolOptions;
use sqlx::postgres::PgRow;
use sqlx::query::Query;
use sqlx::sqlite::SqliteRow;
use sqlx::types::{Decimal, Uuid};
use sqlx::{
    Column, ColumnIndex, Database, MySql, Pool, Postgres, Row, Sqlite, Transaction, TypeInfo,
    ValueRef,
};
use std::future::Future;
use std::time::Duration;

use crate::config::{normalize_connection_name, password_env_var, Config, ConnectOptions};
use crate::connection::{Connection, ConnectionResolver, RowSet};
use crate::dialect::Dialect;
use crate::error::{MigrateError, MigrateResult};
use crate::value::{LargeObject, Number, SqlValue};

/// One pool plus the transaction currently open on it.
struct Session<DB: Database> {
    pool: Pool<DB>,
    tx: Option<Transaction<'static, DB>>,
}

impl<DB: Database> Session<DB> {
    fn new(pool: Pool<DB>) -> Self {
        Self { pool, tx: None }
    }

    fn statement<'q>(&self, sql: &'q str) -> Query<'q, DB, <DB as HasArguments<'q>>::Arguments> {
        sqlx::query(sql)
    }

    async fn begin(&mut self) -> Result<(), sqlx::Error> {
        self.tx = Some(self.pool.begin().await?);
        Ok(())
    }

    async fn finish(&mut self, commit: bool) -> Result<(), sqlx::Error> {
        match self.tx.take() {
            Some(tx) if commit => tx.commit().await,
            Some(tx) => tx.rollback().await,
            None => Ok(()),
        }
    }

    async fn close(mut self, name: &str) {
        if let Some(tx) = self.tx.take() {
            if let Err(e) = tx.rollback().await {
                tracing::warn!("Rolling back open transaction on {} failed: {}", name, e);
            }
        }
        self.pool.close().await;
    }
}

enum Backend {
    Postgres(Session<Postgres>),
    MySql(Session<MySql>),
    Sqlite(Session<Sqlite>),
}

/// Expand `$body` once per driver with `$session` bound to its session.
macro_rules! with_session {
    ($backend:expr, $session:ident => $body:expr) => {
        match $backend {
            Backend::Postgres($session) => $body,
            Backend::MySql($session) => $body,
            Backend::Sqlite($session) => $body,
        }
    };
}

/// Bind positional parameters, returning early on values with no bind form.
macro_rules! bind_params {
    ($query:expr, $params:expr) => {{
        let mut query = $query;
        for param in $params {
            query = match param {
                SqlValue::Null => query.bind(None::<String>),
                SqlValue::Bool(v) => query.bind(*v),
                SqlValue::Text(s) | SqlValue::Lob(LargeObject::Text(s)) => query.bind(s.clone()),
                SqlValue::Number(Number::Int(v)) => query.bind(*v),
                SqlValue::Number(Number::Float(v)) => query.bind(*v),
                SqlValue::Number(Number::Decimal(s)) => query.bind(s.clone()),
                SqlValue::Timestamp(ts) => query.bind(*ts),
                SqlValue::Lob(LargeObject::Binary(b)) => query.bind(b.clone()),
                other => {
                    return Err(MigrateError::UnsupportedType(format!(
                        "cannot bind a {} parameter",
                        other.kind()
                    )));
                }
            };
        }
        query
    }};
}

/// A live connection to one database.
pub struct SqlxConnection {
    name: String,
    dialect: Dialect,
    backend: Backend,
    statement_timeout: Duration,
}

impl SqlxConnection {
    /// Connect to `url`, retrying transient failures per `options`.
    pub async fn connect(
        name: &str,
        url: &str,
        dialect: Option<Dialect>,
        options: &ConnectOptions,
    ) -> MigrateResult<Self> {
        let dialect = dialect.or_else(|| Dialect::from_url(url)).ok_or_else(|| {
            MigrateError::Config(format!("connection '{}': cannot tell dialect from url", name))
        })?;

        let backend = match dialect {
            Dialect::Postgres => {
                Backend::Postgres(Session::new(open_pool(name, url, options).await?))
            }
            Dialect::MySql => Backend::MySql(Session::new(open_pool(name, url, options).await?)),
            Dialect::Sqlite => Backend::Sqlite(Session::new(open_pool(name, url, options).await?)),
            Dialect::Oracle => {
                return Err(MigrateError::Config(format!(
                    "connection '{}': no bundled driver for {}",
                    name, dialect
                )));
            }
        };

        tracing::info!("Connection established for {} ({})", name, dialect);
        Ok(Self {
            name: name.to_string(),
            dialect,
            backend,
            statement_timeout: options.statement_timeout,
        })
    }

    /// Drop the open transaction after a statement timed out. sqlx rolls a
    /// dropped transaction back before the connection is used again.
    fn abandon_transaction(&mut self) {
        let abandoned = with_session!(&mut self.backend, session => session.tx.take().is_some());
        if abandoned {
            tracing::warn!("Abandoned the open transaction on {} after a timeout", self.name);
        }
    }

    fn settle<T>(&mut self, outcome: MigrateResult<T>) -> MigrateResult<T> {
        if matches!(outcome, Err(MigrateError::Timeout { .. })) {
            self.abandon_transaction();
        }
        outcome
    }
}

async fn open_pool<DB: Database>(
    name: &str,
    url: &str,
    options: &ConnectOptions,
) -> MigrateResult<Pool<DB>> {
    let mut attempt = 1;
    loop {
        let result = PoolOptions::<DB>::new()
            .max_connections(1)
            .acquire_timeout(options.connect_timeout)
            .connect(url)
            .await;

        match result {
            Ok(pool) => return Ok(pool),
            Err(e) if attempt < options.attempts && is_transient(&e) => {
                tracing::warn!(
                    "Connecting to {} failed (attempt {}/{}): {}",
                    name,
                    attempt,
                    options.attempts,
                    e
                );
                tokio::time::sleep(options.backoff).await;
                attempt += 1;
            }
            Err(e) => return Err(MigrateError::Connection(format!("{}: {}", name, e))),
        }
    }
}

fn is_transient(e: &sqlx::Error) -> bool {
    matches!(
        e,
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::Tls(_)
    )
}

/// Type names of one result column, upper-cased.
///
/// `declared` is what the driver reports for the column; `runtime` is the
/// type of the value actually stored. They differ for SQLite, where a
/// column's declaration is only an affinity and expression columns have
/// none at all.
#[derive(Debug)]
struct ColumnType {
    declared: String,
    runtime: String,
}

/// Per-driver mapping of non-null column values into [`SqlValue`].
trait DecodeRow: Row {
    fn decode_column(&self, idx: usize, ty: &ColumnType) -> Result<SqlValue, sqlx::Error>;
}

impl DecodeRow for PgRow {
    fn decode_column(&self, idx: usize, ty: &ColumnType) -> Result<SqlValue, sqlx::Error> {
        Ok(match ty.declared.as_str() {
            "BOOL" => SqlValue::Bool(self.try_get(idx)?),
            "INT2" => SqlValue::from(i64::from(self.try_get::<i16, _>(idx)?)),
            "INT4" => SqlValue::from(i64::from(self.try_get::<i32, _>(idx)?)),
            "INT8" => SqlValue::from(self.try_get::<i64, _>(idx)?),
            "FLOAT4" => SqlValue::from(f64::from(self.try_get::<f32, _>(idx)?)),
            "FLOAT8" => SqlValue::from(self.try_get::<f64, _>(idx)?),
            "NUMERIC" => decimal(self.try_get(idx)?),
            "TEXT" | "VARCHAR" | "CHAR" | "BPCHAR" | "NAME" | "CITEXT" => {
                SqlValue::Text(self.try_get(idx)?)
            }
            "BYTEA" => SqlValue::Lob(LargeObject::Binary(self.try_get(idx)?)),
            "DATE" => midnight(self.try_get(idx)?),
            "TIMESTAMP" => SqlValue::Timestamp(self.try_get(idx)?),
            "TIMESTAMPTZ" => {
                SqlValue::Timestamp(self.try_get::<DateTime<Utc>, _>(idx)?.naive_utc())
            }
            "TIME" => time_of_day(self.try_get(idx)?),
            "UUID" => SqlValue::Text(self.try_get::<Uuid, _>(idx)?.to_string()),
            other => unsupported(other),
        })
    }
}

impl DecodeRow for MySqlRow {
    fn decode_column(&self, idx: usize, ty: &ColumnType) -> Result<SqlValue, sqlx::Error> {
        let name = ty.declared.as_str();
        if name.ends_with("UNSIGNED") {
            let v = self.try_get::<u64, _>(idx)?;
            return Ok(match i64::try_from(v) {
                Ok(v) => SqlValue::from(v),
                Err(_) => SqlValue::Number(Number::Decimal(v.to_string())),
            });
        }
        Ok(match name {
            "BOOLEAN" => SqlValue::Bool(self.try_get(idx)?),
            "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" => {
                SqlValue::from(self.try_get::<i64, _>(idx)?)
            }
            "FLOAT" => SqlValue::from(f64::from(self.try_get::<f32, _>(idx)?)),
            "DOUBLE" => SqlValue::from(self.try_get::<f64, _>(idx)?),
            "DECIMAL" => decimal(self.try_get(idx)?),
            "DATE" => midnight(self.try_get(idx)?),
            "DATETIME" | "TIMESTAMP" => SqlValue::Timestamp(self.try_get(idx)?),
            "TIME" => time_of_day(self.try_get(idx)?),
            "CHAR" | "VARCHAR" | "TEXT" | "TINYTEXT" | "MEDIUMTEXT" | "LONGTEXT" | "ENUM"
            | "SET" => SqlValue::Text(self.try_get(idx)?),
            "BINARY" | "VARBINARY" | "BLOB" | "TINYBLOB" | "MEDIUMBLOB" | "LONGBLOB" => {
                SqlValue::Lob(LargeObject::Binary(self.try_get(idx)?))
            }
            other => unsupported(other),
        })
    }
}

impl DecodeRow for SqliteRow {
    fn decode_column(&self, idx: usize, ty: &ColumnType) -> Result<SqlValue, sqlx::Error> {
        match ty.declared.as_str() {
            "DATETIME" | "TIMESTAMP" => return Ok(SqlValue::Timestamp(self.try_get(idx)?)),
            "DATE" => return Ok(midnight(self.try_get(idx)?)),
            "BOOLEAN" => return Ok(SqlValue::Bool(self.try_get(idx)?)),
            _ => {}
        }
        Ok(match ty.runtime.as_str() {
            "INTEGER" => SqlValue::from(self.try_get::<i64, _>(idx)?),
            "REAL" => SqlValue::from(self.try_get::<f64, _>(idx)?),
            "TEXT" => SqlValue::Text(self.try_get(idx)?),
            "BLOB" => SqlValue::Lob(LargeObject::Binary(self.try_get(idx)?)),
            other => unsupported(other),
        })
    }
}

fn decimal(v: Decimal) -> SqlValue {
    SqlValue::Number(Number::Decimal(v.to_string()))
}

fn midnight(date: NaiveDate) -> SqlValue {
    SqlValue::Timestamp(date.and_time(NaiveTime::default()))
}

fn time_of_day(time: NaiveTime) -> SqlValue {
    SqlValue::Text(time.format("%H:%M:%S%.f").to_string())
}

fn unsupported(type_name: &str) -> SqlValue {
    SqlValue::Unsupported {
        type_name: type_name.to_string(),
    }
}

/// Decode one row into the closed value set. NULL is checked on the value
/// itself before any type mapping.
fn decode_row<R>(row: &R) -> Vec<SqlValue>
where
    R: DecodeRow,
    usize: ColumnIndex<R>,
{
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, column)| {
            let ty = match row.try_get_raw(i) {
                Ok(raw) if raw.is_null() => return SqlValue::Null,
                Ok(raw) => {
                    let runtime = raw.type_info().name().to_ascii_uppercase();
                    let declared = column.type_info();
                    let declared = if declared.is_null() {
                        runtime.clone()
                    } else {
                        declared.name().to_ascii_uppercase()
                    };
                    ColumnType { declared, runtime }
                }
                Err(e) => {
                    tracing::debug!("Column {} could not be read: {}", column.name(), e);
                    return unsupported(column.type_info().name());
                }
            };

            row.decode_column(i, &ty).unwrap_or_else(|e| {
                tracing::debug!("Column {} ({}) did not decode: {}", column.name(), ty.declared, e);
                unsupported(&ty.declared)
            })
        })
        .collect()
}

fn to_row_set<R>(rows: &[R]) -> RowSet
where
    R: DecodeRow,
    usize: ColumnIndex<R>,
{
    let columns: Vec<String> = rows
        .first()
        .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
        .unwrap_or_default();
    RowSet::new(columns, rows.iter().map(decode_row).collect())
}

/// Constraint failures are told apart from every other database error.
fn classify_execution_error(e: sqlx::Error) -> MigrateError {
    match &e {
        sqlx::Error::Database(db) if !matches!(db.kind(), ErrorKind::Other) => {
            MigrateError::ConstraintViolation(db.to_string())
        }
        _ => MigrateError::Execution(e.to_string()),
    }
}

async fn timed<T, F>(limit: Duration, sql: &str, fut: F) -> MigrateResult<Result<T, sqlx::Error>>
where
    F: Future<Output = Result<T, sqlx::Error>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| MigrateError::Timeout {
            operation: preview(sql),
            seconds: limit.as_secs(),
        })
}

fn preview(sql: &str) -> String {
    const MAX: usize = 120;
    match sql.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &sql[..idx]),
        None => sql.to_string(),
    }
}

#[async_trait]
impl Connection for SqlxConnection {
    fn name(&self) -> &str {
        &self.name
    }

    fn dialect(&self) -> Dialect {
        self.dialect
    }

    async fn query(&mut self, sql: &str, params: &[SqlValue]) -> MigrateResult<RowSet> {
        let limit = self.statement_timeout;
        let outcome = with_session!(&mut self.backend, session => {
            let query = bind_params!(session.statement(sql), params);
            timed(limit, sql, async move {
                match session.tx.as_mut() {
                    Some(tx) => query.fetch_all(&mut **tx).await,
                    None => query.fetch_all(&session.pool).await,
                }
            })
            .await
            .map(|fetched| fetched.map(|rows| to_row_set(&rows)))
        });

        self.settle(outcome)?
            .map_err(|e| MigrateError::Query(e.to_string()))
    }

    async fn execute(&mut self, sql: &str) -> MigrateResult<u64> {
        let limit = self.statement_timeout;
        let outcome = with_session!(&mut self.backend, session => {
            let query = session.statement(sql);
            timed(limit, sql, async move {
                match session.tx.as_mut() {
                    Some(tx) => query.execute(&mut **tx).await,
                    None => query.execute(&session.pool).await,
                }
            })
            .await
            .map(|done| done.map(|done| done.rows_affected()))
        });

        self.settle(outcome)?.map_err(classify_execution_error)
    }

    async fn begin(&mut self) -> MigrateResult<()> {
        let result = with_session!(&mut self.backend, session => {
            if session.tx.is_some() {
                return Err(MigrateError::Execution(format!(
                    "{}: transaction already open",
                    self.name
                )));
            }
            session.begin().await
        });
        result.map_err(|e| MigrateError::Execution(e.to_string()))
    }

    async fn commit(&mut self) -> MigrateResult<()> {
        with_session!(&mut self.backend, session => session.finish(true).await)
            .map_err(|e| MigrateError::Execution(e.to_string()))
    }

    async fn rollback(&mut self) -> MigrateResult<()> {
        with_session!(&mut self.backend, session => session.finish(false).await)
            .map_err(|e| MigrateError::Execution(e.to_string()))
    }

    async fn close(self: Box<Self>) -> MigrateResult<()> {
        let this = *self;
        let name = this.name;
        with_session!(this.backend, session => session.close(&name).await);
        tracing::info!("Connection closed for {}", name);
        Ok(())
    }
}

/// Resolves names against the `[connections]` table of a [`Config`].
#[derive(Debug, Clone)]
pub struct SqlxResolver {
    config: Config,
    options: ConnectOptions,
}

impl SqlxResolver {
    pub fn new(config: Config) -> Self {
        let options = config.migration.connect_options();
        Self { config, options }
    }
}

#[async_trait]
impl ConnectionResolver for SqlxResolver {
    async fn resolve(&self, name: &str) -> MigrateResult<Box<dyn Connection>> {
        let name = normalize_connection_name(name);
        tracing::info!("Getting connection for {}", name);

        let conn = self.config.connection(&name)?;
        let password = std::env::var(password_env_var(&name)).ok();
        let url = conn.to_url(&name, password.as_deref())?;

        let connection =
            SqlxConnection::connect(&name, &url, conn.dialect(), &self.options).await?;
        Ok(Box::new(connection))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::QueryTemplate;
    use crate::synth::Synthesizer;
    use crate::validator::{AccountValidator, ValidationOutcome};
    use chrono::NaiveDateTime;
    use pretty_assertions::assert_eq;

    const ACCT_TABLE: &str = "CREATE TABLE ci_acct (\
        acct_id TEXT PRIMARY KEY, setup_dt DATETIME, bal NUMERIC(15,2), active BOOLEAN)";

    async fn memory() -> SqlxConnection {
        SqlxConnection::connect("mem", "sqlite::memory:", None, &ConnectOptions::default())
            .await
            .unwrap()
    }

    async fn seeded() -> SqlxConnection {
        let mut conn = memory().await;
        conn.execute(ACCT_TABLE).await.unwrap();
        conn.execute("INSERT INTO ci_acct VALUES ('3003', '2023-06-01 08:30:00', 10.50, 1)")
            .await
            .unwrap();
        conn
    }

    fn setup_dt() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2023, 6, 1)
            .unwrap()
            .and_hms_opt(8, 30, 0)
            .unwrap()
    }

    #[test]
    fn test_preview_truncates() {
        let long = "x".repeat(200);
        assert_eq!(preview(&long).len(), 123);
        assert_eq!(preview("SELECT 1"), "SELECT 1");
    }

    #[tokio::test]
    async fn test_sqlite_query_and_transaction() {
        let mut conn = memory().await;
        assert_eq!(conn.dialect(), Dialect::Sqlite);

        conn.execute("CREATE TABLE acct (acct_id TEXT PRIMARY KEY, bal INTEGER, note TEXT)")
            .await
            .unwrap();

        conn.begin().await.unwrap();
        conn.execute("INSERT INTO acct VALUES ('1', 10, NULL)").await.unwrap();
        let dup = conn.execute("INSERT INTO acct VALUES ('1', 11, NULL)").await;
        assert!(matches!(dup, Err(MigrateError::ConstraintViolation(_))));
        conn.commit().await.unwrap();

        let rows = conn
            .query("SELECT acct_id, bal, note FROM acct WHERE acct_id = ?", &[SqlValue::from("1")])
            .await
            .unwrap();
        assert_eq!(rows.columns, vec!["acct_id", "bal", "note"]);
        assert_eq!(
            rows.rows,
            vec![vec![SqlValue::from("1"), SqlValue::from(10i64), SqlValue::Null]]
        );

        let count = conn
            .query("SELECT COUNT(*) FROM acct WHERE acct_id = ?", &[SqlValue::from("2")])
            .await
            .unwrap();
        assert_eq!(count.scalar().and_then(SqlValue::as_i64), Some(0));

        Box::new(conn).close().await.unwrap();
    }

    #[tokio::test]
    async fn test_dates_and_numerics_decode_and_replay() {
        let mut source = seeded().await;
        let template = QueryTemplate::from_select(
            "SELECT * FROM ci_acct WHERE acct_id = :account_id",
        )
        .unwrap();

        let rows = source
            .query(&template.bind_sql(Dialect::Sqlite), &[SqlValue::from("3003")])
            .await
            .unwrap();
        assert_eq!(
            rows.rows,
            vec![vec![
                SqlValue::from("3003"),
                SqlValue::Timestamp(setup_dt()),
                SqlValue::from(10.5),
                SqlValue::Bool(true),
            ]]
        );

        let pair = Synthesizer::new(Dialect::Sqlite)
            .synthesize(&template, &rows.columns, &rows.rows[0], "jdoe")
            .unwrap();
        assert_eq!(
            pair.insert,
            "INSERT INTO ci_acct (acct_id, setup_dt, bal, active) VALUES ('3003', \
             strftime('%Y-%m-%d %H:%M:%S', '2023-06-01 08:30:00'), 10.5, 1)"
        );

        let mut target = memory().await;
        target.execute(ACCT_TABLE).await.unwrap();
        assert_eq!(target.execute(&pair.insert).await.unwrap(), 1);
        let copied = target.query("SELECT * FROM ci_acct", &[]).await.unwrap();
        assert_eq!(copied, rows);
    }

    #[tokio::test]
    async fn test_expression_columns_are_not_null() {
        let mut conn = seeded().await;

        let count = conn
            .query("SELECT COUNT(*) FROM ci_acct WHERE acct_id = ?", &[SqlValue::from("3003")])
            .await
            .unwrap();
        assert_eq!(count.scalar().and_then(SqlValue::as_i64), Some(1));

        let rows = conn
            .query("SELECT acct_id || 'x', 1 + 1, NULL FROM ci_acct", &[])
            .await
            .unwrap();
        assert_eq!(
            rows.rows,
            vec![vec![SqlValue::from("3003x"), SqlValue::from(2i64), SqlValue::Null]]
        );
    }

    #[tokio::test]
    async fn test_validator_counts_on_live_connections() {
        let mut source = seeded().await;
        let mut target = memory().await;
        target.execute(ACCT_TABLE).await.unwrap();

        let validator =
            AccountValidator::new("SELECT COUNT(*) FROM ci_acct WHERE acct_id = :account_id")
                .unwrap();
        let outcome = validator.validate("3003", &mut source, &mut target).await.unwrap();
        assert_eq!(outcome, ValidationOutcome::Proceed);

        let outcome = validator.validate("9", &mut source, &mut target).await.unwrap();
        assert_eq!(outcome, ValidationOutcome::NotFoundInSource);

        let mut populated = seeded().await;
        let outcome = validator.validate("3003", &mut source, &mut populated).await.unwrap();
        assert_eq!(outcome, ValidationOutcome::AlreadyInTarget);
    }

    #[tokio::test]
    async fn test_oracle_has_no_driver() {
        let err = SqlxConnection::connect(
            "ora",
            "oracle://db:1521/cis",
            None,
            &ConnectOptions::default(),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, MigrateError::Config(_)));
    }

    #[tokio::test]
    async fn test_unknown_connection_is_config_error() {
        let resolver = SqlxResolver::new(Config::default());
        let err = resolver.resolve("nowhere").await.err().unwrap();
        assert!(err.is_fatal());
    }
}
