//! Configuration file.
//!
//! ```toml
//! [migration]
//! catalog = "check.sql"
//! output_dir = "scripts"
//! commit_policy = "best_effort"
//!
//! [connections.prod]
//! driver = "postgres"
//! host = "db.internal"
//! database = "cis"
//! user = "migrator"
//!
//! [connections.test]
//! url = "postgres://migrator@db-test.internal/cis"
//! ```
//!
//! Connection names are case-insensitive. A password can also be supplied
//! through `ACCTMIG_<NAME>_PASSWORD`.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::dialect::Dialect;
use crate::error::{MigrateError, MigrateResult};
use crate::executor::CommitPolicy;
use crate::synth::DEFAULT_AUDIT_COLUMNS;

/// Anchor count used to check whether an account exists.
pub const DEFAULT_ANCHOR_QUERY: &str =
    "SELECT COUNT(*) FROM cisadm.ci_acct WHERE acct_id = :account_id";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub migration: MigrationSettings,

    #[serde(default)]
    pub connections: BTreeMap<String, ConnectionConfig>,
}

/// Engine settings under `[migration]`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MigrationSettings {
    /// Path to the select-statement catalog.
    pub catalog: Option<PathBuf>,

    /// Directory receiving insert/delete scripts and reports.
    pub output_dir: PathBuf,

    pub anchor_query: String,

    /// Columns overwritten with the operator id on every row.
    pub audit_columns: Vec<String>,

    pub commit_policy: CommitPolicy,

    pub connect_timeout_secs: u64,

    pub statement_timeout_secs: u64,

    /// Total connect attempts for transient failures (1 = no retry).
    pub connect_attempts: u32,

    pub retry_backoff_ms: u64,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            catalog: None,
            output_dir: PathBuf::from("migration-scripts"),
            anchor_query: DEFAULT_ANCHOR_QUERY.to_string(),
            audit_columns: DEFAULT_AUDIT_COLUMNS.iter().map(|c| c.to_string()).collect(),
            commit_policy: CommitPolicy::default(),
            connect_timeout_secs: 30,
            statement_timeout_secs: 300,
            connect_attempts: 3,
            retry_backoff_ms: 500,
        }
    }
}

/// Timeouts and retry budget for opening connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    pub connect_timeout: Duration,
    pub statement_timeout: Duration,
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        MigrationSettings::default().connect_options()
    }
}

impl MigrationSettings {
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            connect_timeout: Duration::from_secs(self.connect_timeout_secs.max(1)),
            statement_timeout: Duration::from_secs(self.statement_timeout_secs.max(1)),
            attempts: self.connect_attempts.max(1),
            backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }
}

/// One entry under `[connections.<name>]`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectionConfig {
    /// Full connection URL; wins over the individual fields.
    pub url: Option<String>,
    pub driver: Option<Dialect>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl ConnectionConfig {
    /// Dialect of this connection, from `driver` or the URL scheme.
    pub fn dialect(&self) -> Option<Dialect> {
        self.driver
            .or_else(|| self.url.as_deref().and_then(Dialect::from_url))
    }

    /// Build the connection URL, using `password` in place of the configured one.
    pub fn to_url(&self, name: &str, password: Option<&str>) -> MigrateResult<String> {
        if let Some(url) = self.url.as_deref().map(str::trim).filter(|u| !u.is_empty()) {
            return Ok(url.to_string());
        }

        let driver = self.driver.ok_or_else(|| {
            MigrateError::Config(format!("connection '{}' needs either url or driver", name))
        })?;
        let database = self.database.as_deref().unwrap_or_default();

        let scheme = match driver {
            Dialect::Sqlite => return Ok(format!("sqlite://{}", database)),
            Dialect::Postgres => "postgres",
            Dialect::MySql => "mysql",
            Dialect::Oracle => {
                return Err(MigrateError::Config(format!(
                    "connection '{}': no bundled driver for oracle; \
                     provide a url for a supported backend",
                    name
                )));
            }
        };

        let host = self.host.as_deref().ok_or_else(|| {
            MigrateError::Config(format!("connection '{}' is missing host", name))
        })?;
        let invalid = |what: &str| {
            MigrateError::Config(format!("connection '{}' has an invalid {}", name, what))
        };

        let mut url =
            Url::parse(&format!("{}://localhost", scheme)).map_err(|_| invalid("driver"))?;
        // IPv6 literals must be bracketed to parse as a host.
        let host = if host.contains(':') && !host.starts_with('[') {
            format!("[{}]", host)
        } else {
            host.to_string()
        };
        url.set_host(Some(&host)).map_err(|_| invalid("host"))?;
        url.set_port(self.port).map_err(|_| invalid("port"))?;
        if let Some(user) = self.user.as_deref() {
            url.set_username(user).map_err(|_| invalid("user"))?;
            url.set_password(password.or(self.password.as_deref()))
                .map_err(|_| invalid("password"))?;
        }
        url.set_path(database);
        Ok(url.to_string())
    }
}

/// Environment variable holding the password override for `name`.
pub fn password_env_var(name: &str) -> String {
    let normalized: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("ACCTMIG_{}_PASSWORD", normalized)
}

/// Connection names are matched case-insensitively.
pub fn normalize_connection_name(name: &str) -> String {
    name.trim().to_lowercase()
}

impl Config {
    /// Parse configuration from TOML text.
    pub fn parse(content: &str) -> MigrateResult<Self> {
        let mut config: Config = toml::from_str(content)
            .map_err(|e| MigrateError::Config(format!("invalid TOML: {}", e)))?;

        config.connections = config
            .connections
            .into_iter()
            .map(|(name, conn)| (normalize_connection_name(&name), conn))
            .collect();
        Ok(config)
    }

    /// Load configuration from a file.
    pub fn load(path: impl AsRef<Path>) -> MigrateResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            MigrateError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::parse(&content)?;
        tracing::info!(
            "Loaded configuration from {} ({} connections)",
            path.display(),
            config.connections.len()
        );
        Ok(config)
    }

    /// `<config dir>/acctmig/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("acctmig").join("config.toml"))
    }

    /// Load `path` if given, otherwise the default path if present,
    /// otherwise built-in defaults.
    pub fn load_or_default(path: Option<&Path>) -> MigrateResult<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(default) if default.exists() => Self::load(default),
            _ => {
                tracing::debug!("No configuration file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn connection(&self, name: &str) -> MigrateResult<&ConnectionConfig> {
        let key = normalize_connection_name(name);
        self.connections
            .get(&key)
            .ok_or_else(|| MigrateError::Config(format!("connection '{}' is not configured", key)))
    }
}
