//! SQL dialects understood by the codec and the executor.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A target/source database flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    #[default]
    Oracle,
    Postgres,
    MySql,
    Sqlite,
}

impl Dialect {
    /// Guess the dialect from a connection URL scheme.
    pub fn from_url(url: &str) -> Option<Self> {
        let scheme = url.split(':').next()?.to_ascii_lowercase();
        match scheme.as_str() {
            "postgres" | "postgresql" => Some(Self::Postgres),
            "mysql" | "mariadb" => Some(Self::MySql),
            "sqlite" => Some(Self::Sqlite),
            "oracle" => Some(Self::Oracle),
            _ => None,
        }
    }

    /// Positional bind placeholder for the 1-based `index`.
    pub fn placeholder(&self, index: usize) -> String {
        match self {
            Self::Oracle => format!(":{}", index),
            Self::Postgres => format!("${}", index),
            Self::MySql | Self::Sqlite => "?".to_string(),
        }
    }

    /// Whether a failed statement leaves the open transaction unusable
    /// until it is rolled back (to a savepoint).
    pub fn aborts_transaction_on_error(&self) -> bool {
        matches!(self, Self::Postgres)
    }

    /// Whether backslash is an escape character inside string literals.
    pub fn escapes_backslash(&self) -> bool {
        matches!(self, Self::MySql)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Oracle => "oracle",
            Self::Postgres => "postgres",
            Self::MySql => "mysql",
            Self::Sqlite => "sqlite",
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dialect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "oracle" => Ok(Self::Oracle),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            "mysql" | "mariadb" => Ok(Self::MySql),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(format!("Unknown dialect: '{}'", other)),
        }
    }
}
