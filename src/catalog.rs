//! Select-statement catalog.
//!
//! A catalog is an ordered list of [`QueryTemplate`]s. Order matters: it is
//! the order in which INSERT and DELETE statements are generated.
//!
//! Two file formats are accepted:
//!
//! ```text
//! # check.sql: one select per line, table taken from the FROM clause
//! SELECT * FROM cisadm.ci_acct WHERE acct_id = :account_id
//! SELECT * FROM cisadm.ci_acct_char WHERE acct_id = :account_id
//! ```
//!
//! ```toml
//! # catalog.toml: explicit table and delete key per template
//! [[template]]
//! table = "cisadm.ci_acct_char"
//! sql = "SELECT * FROM cisadm.ci_acct_char WHERE acct_id = :account_id"
//! key_columns = ["ACCT_ID", "CHAR_TYPE_CD", "EFFDT"]
//! ```

use nom::{
    branch::alt,
    bytes::complete::{tag_no_case, take_while1},
    character::complete::{char, multispace1},
    combinator::recognize,
    multi::many0,
    sequence::{delimited, pair},
    IResult,
};
use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::dialect::Dialect;
use crate::error::{MigrateError, MigrateResult};

/// Token substituted with the account id when a template runs.
pub const ACCOUNT_PLACEHOLDER: &str = ":account_id";

/// Number of leading columns used as the delete key when none is declared.
pub const DEFAULT_KEY_PREFIX: usize = 12;

/// Which columns of a row identify it in the rollback DELETE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteKey {
    /// The first `n` columns of the result set.
    Prefix(usize),
    /// Named columns, in the order given.
    Columns(Vec<String>),
}

impl Default for DeleteKey {
    fn default() -> Self {
        DeleteKey::Prefix(DEFAULT_KEY_PREFIX)
    }
}

/// A parameterized select for one source table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryTemplate {
    pub table_name: String,
    pub sql: String,
    pub key: DeleteKey,
}

impl QueryTemplate {
    /// Build a template, checking that `sql` has exactly one account placeholder.
    pub fn new(table_name: impl Into<String>, sql: impl Into<String>) -> MigrateResult<Self> {
        let table_name = table_name.into();
        let sql = sql.into();
        check_placeholder(&sql).map_err(|msg| MigrateError::catalog(table_name.as_str(), msg))?;
        Ok(Self {
            table_name,
            sql,
            key: DeleteKey::default(),
        })
    }

    /// Build a template whose table name is read from its FROM clause.
    pub fn from_select(sql: impl Into<String>) -> MigrateResult<Self> {
        let sql = sql.into();
        let table = extract_table(&sql).map(str::to_string).ok_or_else(|| {
            MigrateError::catalog(sql.as_str(), "no table name found after FROM")
        })?;
        Self::new(table, sql)
    }

    pub fn with_key(mut self, key: DeleteKey) -> Self {
        self.key = key;
        self
    }

    /// The template SQL with the placeholder swapped for a bind marker.
    pub fn bind_sql(&self, dialect: Dialect) -> String {
        match placeholder_positions(&self.sql).first() {
            Some(&at) => format!(
                "{}{}{}",
                &self.sql[..at],
                dialect.placeholder(1),
                &self.sql[at + ACCOUNT_PLACEHOLDER.len()..]
            ),
            None => self.sql.clone(),
        }
    }

    /// Indexes into `columns` that make up this template's delete key.
    pub fn key_indexes(&self, columns: &[String]) -> Result<Vec<usize>, String> {
        match &self.key {
            DeleteKey::Prefix(n) => Ok((0..(*n).min(columns.len())).collect()),
            DeleteKey::Columns(names) => names
                .iter()
                .map(|name| {
                    columns
                        .iter()
                        .position(|c| c.eq_ignore_ascii_case(name))
                        .ok_or_else(|| {
                            format!(
                                "key column {} is not returned by the select on {}",
                                name, self.table_name
                            )
                        })
                })
                .collect(),
        }
    }
}

/// Byte offsets of whole-word `:account_id` tokens; `:account_ids` is not one.
fn placeholder_positions(sql: &str) -> Vec<usize> {
    sql.match_indices(ACCOUNT_PLACEHOLDER)
        .map(|(at, _)| at)
        .filter(|&at| {
            !sql[at + ACCOUNT_PLACEHOLDER.len()..]
                .starts_with(|c: char| c.is_alphanumeric() || c == '_' || c == '$' || c == '#')
        })
        .collect()
}

fn check_placeholder(sql: &str) -> Result<(), String> {
    match placeholder_positions(sql).len() {
        1 => Ok(()),
        n => Err(format!(
            "expected exactly one {} placeholder, found {}",
            ACCOUNT_PLACEHOLDER, n
        )),
    }
}

/// Ordered, immutable set of templates for one run.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    templates: Vec<QueryTemplate>,
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(rename = "template", default)]
    templates: Vec<TemplateEntry>,
}

#[derive(Debug, Deserialize)]
struct TemplateEntry {
    table: Option<String>,
    sql: String,
    key_columns: Option<Vec<String>>,
    key_prefix: Option<usize>,
}

impl Catalog {
    pub fn new(templates: Vec<QueryTemplate>) -> Self {
        Self { templates }
    }

    /// Load a catalog file; `.toml` files use the structured format.
    pub fn load(path: impl AsRef<Path>) -> MigrateResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            MigrateError::catalog(path.display().to_string(), format!("failed to read: {}", e))
        })?;
        let name = path.display().to_string();

        let catalog = if path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("toml")) {
            Self::parse_toml(&name, &content)?
        } else {
            Self::parse_text(&name, &content)?
        };

        tracing::info!("Loaded {} select templates from {}", catalog.len(), name);
        Ok(catalog)
    }

    /// Parse the one-select-per-line format.
    pub fn parse_text(name: &str, content: &str) -> MigrateResult<Self> {
        let mut templates = Vec::new();

        for (idx, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with("--") {
                continue;
            }
            let sql = line.trim_end_matches(';').trim_end();
            let location = format!("{}:{}", name, idx + 1);

            let table = extract_table(sql)
                .ok_or_else(|| MigrateError::catalog(&location, "no table name found after FROM"))?;
            check_placeholder(sql).map_err(|msg| MigrateError::catalog(&location, msg))?;

            tracing::debug!("Template {} reads table {}", location, table);
            templates.push(QueryTemplate {
                table_name: table.to_string(),
                sql: sql.to_string(),
                key: DeleteKey::default(),
            });
        }

        Ok(Self { templates })
    }

    /// Parse the `[[template]]` TOML format.
    pub fn parse_toml(name: &str, content: &str) -> MigrateResult<Self> {
        let file: CatalogFile = toml::from_str(content)
            .map_err(|e| MigrateError::catalog(name, format!("invalid TOML: {}", e)))?;

        let mut templates = Vec::with_capacity(file.templates.len());
        for (idx, entry) in file.templates.into_iter().enumerate() {
            let location = format!("{} template #{}", name, idx + 1);
            let sql = entry.sql.trim().trim_end_matches(';').trim_end().to_string();

            check_placeholder(&sql).map_err(|msg| MigrateError::catalog(&location, msg))?;

            let table_name = match entry.table.as_deref().map(str::trim) {
                Some(t) if !t.is_empty() => t.to_string(),
                _ => extract_table(&sql)
                    .ok_or_else(|| {
                        MigrateError::catalog(&location, "no table given and none found after FROM")
                    })?
                    .to_string(),
            };

            let key = match (entry.key_columns, entry.key_prefix) {
                (Some(_), Some(_)) => {
                    return Err(MigrateError::catalog(
                        &location,
                        "key_columns and key_prefix are mutually exclusive",
                    ));
                }
                (Some(cols), None) if cols.is_empty() => {
                    return Err(MigrateError::catalog(&location, "key_columns is empty"));
                }
                (Some(cols), None) => DeleteKey::Columns(cols),
                (None, Some(0)) => {
                    return Err(MigrateError::catalog(&location, "key_prefix must be at least 1"));
                }
                (None, Some(n)) => DeleteKey::Prefix(n),
                (None, None) => DeleteKey::default(),
            };

            templates.push(QueryTemplate { table_name, sql, key });
        }

        Ok(Self { templates })
    }

    pub fn templates(&self) -> &[QueryTemplate] {
        &self.templates
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

/// Find the first `FROM <table>` in a select and return the table name.
pub fn extract_table(sql: &str) -> Option<&str> {
    let mut prev: Option<char> = None;
    for (idx, c) in sql.char_indices() {
        let at_word_start = prev.is_none_or(|p| p.is_whitespace() || p == ')');
        prev = Some(c);
        if !at_word_start || !(c == 'f' || c == 'F') {
            continue;
        }
        if let Ok((_, table)) = parse_from_table(&sql[idx..]) {
            return Some(table);
        }
    }
    None
}

/// Parse `FROM schema.table`.
fn parse_from_table(input: &str) -> IResult<&str, &str> {
    let (input, _) = tag_no_case("from")(input)?;
    let (input, _) = multispace1(input)?;
    parse_qualified_identifier(input)
}

/// Parse a possibly schema-qualified identifier.
fn parse_qualified_identifier(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        parse_identifier,
        many0(pair(char('.'), parse_identifier)),
    ))(input)
}

/// Parse a bare or double-quoted identifier.
fn parse_identifier(input: &str) -> IResult<&str, &str> {
    alt((
        recognize(delimited(char('"'), take_while1(|c: char| c != '"'), char('"'))),
        take_while1(|c: char| c.is_alphanumeric() || c == '_' || c == '$' || c == '#'),
    ))(input)
}
