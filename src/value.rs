//! Column values read from the source database.
//!
//! The set of variants is closed: every backend decodes into one of these,
//! and anything it cannot classify becomes [`SqlValue::Unsupported`] so the
//! codec can reject that row instead of guessing a literal.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// A typed value from a result row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SqlValue {
    Null,
    /// A native boolean column; rendered per dialect, never as a number.
    Bool(bool),
    Text(String),
    Number(Number),
    Timestamp(NaiveDateTime),
    Lob(LargeObject),
    Geometry(Geometry),
    /// A column type outside the closed set, tagged with the driver's name for it.
    Unsupported { type_name: String },
}

/// Numeric values. `Decimal` keeps the driver's text to avoid losing precision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Number {
    Int(i64),
    Float(f64),
    Decimal(String),
}

/// Contents of a large-object column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LargeObject {
    Text(String),
    Binary(Vec<u8>),
}

/// A spatial geometry in the Oracle `SDO_GEOMETRY` layout. Every field may be null.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    pub gtype: Option<i64>,
    pub srid: Option<i64>,
    pub point: Option<GeometryPoint>,
    pub elem_info: Option<Vec<Number>>,
    pub ordinates: Option<Vec<Number>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeometryPoint {
    pub x: Option<Number>,
    pub y: Option<Number>,
    pub z: Option<Number>,
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Try to read the value as an integer count.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Number(Number::Int(v)) => Some(*v),
            SqlValue::Number(Number::Float(v)) if v.fract() == 0.0 => Some(*v as i64),
            SqlValue::Number(Number::Decimal(s)) => s.trim().parse::<i64>().ok(),
            SqlValue::Text(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        }
    }

    /// Short type label used in log lines and error messages.
    pub fn kind(&self) -> &str {
        match self {
            SqlValue::Null => "null",
            SqlValue::Bool(_) => "boolean",
            SqlValue::Text(_) => "text",
            SqlValue::Number(_) => "number",
            SqlValue::Timestamp(_) => "timestamp",
            SqlValue::Lob(LargeObject::Text(_)) => "clob",
            SqlValue::Lob(LargeObject::Binary(_)) => "blob",
            SqlValue::Geometry(_) => "geometry",
            SqlValue::Unsupported { type_name } => type_name,
        }
    }
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::Number(Number::Int(v as i64))
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Number(Number::Int(v))
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Number(Number::Float(v))
    }
}

impl From<NaiveDateTime> for SqlValue {
    fn from(v: NaiveDateTime) -> Self {
        SqlValue::Timestamp(v)
    }
}

impl From<Geometry> for SqlValue {
    fn from(v: Geometry) -> Self {
        SqlValue::Geometry(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(SqlValue::Null)
    }
}
