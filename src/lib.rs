//! # acctmig — account-scoped data migration
//!
//! Copies everything that belongs to one account from a source database to
//! a target database by replaying a catalog of select statements, turning
//! each returned row into a literal INSERT, and keeping a matching DELETE
//! for every row so a migration can be undone by hand.
//!
//! ## Quick Example
//!
//! ```rust,ignore
//! use acctmig::prelude::*;
//!
//! let config = Config::load("acctmig.toml")?;
//! let catalog = Catalog::load("check.sql")?;
//! let migrator = Migrator::new(
//!     catalog,
//!     MigrationOptions::from(&config.migration),
//!     Box::new(FileAuditSink::new(&config.migration.output_dir)),
//! )?;
//!
//! let request = MigrationRequest::new(["3003"], "jdoe", "prod", "test");
//! let report = migrator.run(&SqlxResolver::new(config), &request).await?;
//! // => status "Success", Insert_queries_for_3003.sql / Delete_queries_for_3003.sql
//! ```
//!
//! ## Statement shapes
//!
//! | Row value  | Literal (Oracle)                           |
//! |------------|--------------------------------------------|
//! | NULL       | `NULL` / `col IS NULL` in delete keys      |
//! | text       | `'O''Brien'`                               |
//! | timestamp  | `TO_DATE('2023-06-01 08:30:00', ...)`      |
//! | CLOB       | `TO_CLOB('...') \|\| TO_CLOB('...')`        |
//! | BLOB       | `HEXTORAW('CAFE')`                         |
//! | geometry   | `MDSYS.SDO_GEOMETRY(...)`                  |

pub mod audit;
pub mod catalog;
pub mod codec;
pub mod config;
pub mod connection;
pub mod dialect;
pub mod engine;
pub mod error;
pub mod executor;
pub mod migrate;
pub mod report;
pub mod synth;
pub mod validator;
pub mod value;

pub mod prelude {
    pub use crate::audit::{AuditSink, FileAuditSink, ScriptKind};
    pub use crate::catalog::{Catalog, DeleteKey, QueryTemplate};
    pub use crate::codec::{encode_literal, encode_predicate};
    pub use crate::config::Config;
    pub use crate::connection::{Connection, ConnectionResolver, RowSet};
    pub use crate::dialect::Dialect;
    pub use crate::engine::{SqlxConnection, SqlxResolver};
    pub use crate::error::*;
    pub use crate::executor::{CommitPolicy, ExecutionError};
    pub use crate::migrate::{MigrationOptions, MigrationRequest, Migrator};
    pub use crate::report::{
        AccountResult, AccountStatus, Failure, FailureKind, MigrationReport, ReportStatus,
    };
    pub use crate::synth::{StatementPair, Synthesizer};
    pub use crate::validator::{AccountValidator, ValidationOutcome};
    pub use crate::value::SqlValue;
}
