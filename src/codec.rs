//! Value codec: renders a single [`SqlValue`] as a SQL literal.
//!
//! Literals are built for trusted source data. Quote doubling keeps the
//! statement well-formed; it is not a defense against hostile input.

use chrono::{NaiveDateTime, Timelike};

use crate::dialect::Dialect;
use crate::error::{MigrateError, MigrateResult};
use crate::value::{Geometry, LargeObject, Number, SqlValue};

/// Oracle rejects character literals longer than this many bytes.
const ORACLE_MAX_LITERAL_BYTES: usize = 4000;
/// Characters per `TO_CLOB` chunk; four bytes per char stays under the limit.
const ORACLE_CLOB_CHUNK_CHARS: usize = 1000;
/// `HEXTORAW` input is capped at 4000 hex digits.
const ORACLE_MAX_RAW_BYTES: usize = 2000;

/// Render `value` as a literal usable in a VALUES list.
pub fn encode_literal(value: &SqlValue, dialect: Dialect) -> MigrateResult<String> {
    match value {
        SqlValue::Null => Ok("NULL".to_string()),
        SqlValue::Bool(b) => Ok(encode_bool(*b, dialect)),
        SqlValue::Text(s) => Ok(quote_text(s, dialect)),
        SqlValue::Number(n) => encode_number(n),
        SqlValue::Timestamp(ts) => Ok(encode_timestamp(ts, dialect)),
        SqlValue::Lob(lob) => encode_lob(lob, dialect),
        SqlValue::Geometry(geom) => encode_geometry(geom, dialect),
        SqlValue::Unsupported { type_name } => Err(MigrateError::UnsupportedType(format!(
            "no literal form for column type {}",
            type_name
        ))),
    }
}

/// Render an equality condition on `column` for a DELETE predicate.
///
/// Returns `Ok(None)` for large objects and geometries, which cannot be
/// compared with `=`.
pub fn encode_predicate(
    column: &str,
    value: &SqlValue,
    dialect: Dialect,
) -> MigrateResult<Option<String>> {
    match value {
        SqlValue::Null => Ok(Some(format!("{} IS NULL", column))),
        SqlValue::Lob(_) | SqlValue::Geometry(_) => Ok(None),
        other => Ok(Some(format!("{} = {}", column, encode_literal(other, dialect)?))),
    }
}

/// Single-quote `s`, doubling embedded quotes.
pub fn quote_text(s: &str, dialect: Dialect) -> String {
    let mut escaped = s.replace('\'', "''");
    if dialect.escapes_backslash() {
        escaped = escaped.replace('\\', "\\\\");
    }
    format!("'{}'", escaped)
}

/// Postgres has a real boolean type; the others store flags as 0/1.
fn encode_bool(b: bool, dialect: Dialect) -> String {
    match (dialect, b) {
        (Dialect::Postgres, true) => "TRUE".to_string(),
        (Dialect::Postgres, false) => "FALSE".to_string(),
        (_, b) => u8::from(b).to_string(),
    }
}

fn encode_number(n: &Number) -> MigrateResult<String> {
    match n {
        Number::Int(v) => Ok(v.to_string()),
        Number::Float(v) if v.is_finite() => Ok(v.to_string()),
        Number::Float(v) => Err(MigrateError::UnsupportedType(format!(
            "non-finite number {}",
            v
        ))),
        Number::Decimal(s) if is_numeric_literal(s.trim()) => Ok(s.trim().to_string()),
        Number::Decimal(s) => Err(MigrateError::UnsupportedType(format!(
            "'{}' is not a numeric literal",
            s
        ))),
    }
}

fn encode_opt_number(n: Option<&Number>) -> MigrateResult<String> {
    match n {
        Some(n) => encode_number(n),
        None => Ok("NULL".to_string()),
    }
}

/// `[+-]digits[.digits][e[+-]digits]`, with at least one mantissa digit.
fn is_numeric_literal(s: &str) -> bool {
    let body = s.strip_prefix(['+', '-']).unwrap_or(s);
    let (mantissa, exponent) = match body.find(['e', 'E']) {
        Some(idx) => (&body[..idx], Some(&body[idx + 1..])),
        None => (body, None),
    };

    let mut parts = mantissa.splitn(2, '.');
    let int_part = parts.next().unwrap_or("");
    let frac_part = parts.next().unwrap_or("");
    let digits_ok = |p: &str| p.chars().all(|c| c.is_ascii_digit());
    if !digits_ok(int_part) || !digits_ok(frac_part) || int_part.len() + frac_part.len() == 0 {
        return false;
    }

    match exponent {
        None => true,
        Some(exp) => {
            let exp = exp.strip_prefix(['+', '-']).unwrap_or(exp);
            !exp.is_empty() && digits_ok(exp)
        }
    }
}

fn encode_timestamp(ts: &NaiveDateTime, dialect: Dialect) -> String {
    let fractional = ts.nanosecond() != 0;
    let text = if fractional {
        ts.format("%Y-%m-%d %H:%M:%S%.6f").to_string()
    } else {
        ts.format("%Y-%m-%d %H:%M:%S").to_string()
    };

    match (dialect, fractional) {
        (Dialect::Oracle, false) => format!("TO_DATE('{}', 'YYYY-MM-DD HH24:MI:SS')", text),
        (Dialect::Oracle, true) => {
            format!("TO_TIMESTAMP('{}', 'YYYY-MM-DD HH24:MI:SS.FF6')", text)
        }
        (Dialect::Postgres, false) => {
            format!("TO_TIMESTAMP('{}', 'YYYY-MM-DD HH24:MI:SS')::timestamp", text)
        }
        (Dialect::Postgres, true) => {
            format!("TO_TIMESTAMP('{}', 'YYYY-MM-DD HH24:MI:SS.US')::timestamp", text)
        }
        (Dialect::MySql, false) => format!("STR_TO_DATE('{}', '%Y-%m-%d %H:%i:%s')", text),
        (Dialect::MySql, true) => format!("STR_TO_DATE('{}', '%Y-%m-%d %H:%i:%s.%f')", text),
        (Dialect::Sqlite, false) => format!("strftime('%Y-%m-%d %H:%M:%S', '{}')", text),
        (Dialect::Sqlite, true) => format!("strftime('%Y-%m-%d %H:%M:%f', '{}')", text),
    }
}

fn encode_lob(lob: &LargeObject, dialect: Dialect) -> MigrateResult<String> {
    match lob {
        LargeObject::Text(s) => {
            if dialect != Dialect::Oracle || s.len() <= ORACLE_MAX_LITERAL_BYTES {
                return Ok(quote_text(s, dialect));
            }
            let chars: Vec<char> = s.chars().collect();
            let chunks: Vec<String> = chars
                .chunks(ORACLE_CLOB_CHUNK_CHARS)
                .map(|chunk| {
                    let part: String = chunk.iter().collect();
                    format!("TO_CLOB({})", quote_text(&part, dialect))
                })
                .collect();
            Ok(chunks.join(" || "))
        }
        LargeObject::Binary(bytes) => match dialect {
            Dialect::Oracle if bytes.is_empty() => Ok("EMPTY_BLOB()".to_string()),
            Dialect::Oracle if bytes.len() > ORACLE_MAX_RAW_BYTES => {
                Err(MigrateError::UnsupportedType(format!(
                    "binary large object of {} bytes exceeds the {}-byte inline limit",
                    bytes.len(),
                    ORACLE_MAX_RAW_BYTES
                )))
            }
            Dialect::Oracle => Ok(format!("HEXTORAW('{}')", hex::encode_upper(bytes))),
            Dialect::Postgres => Ok(format!("decode('{}', 'hex')", hex::encode(bytes))),
            Dialect::MySql | Dialect::Sqlite => Ok(format!("X'{}'", hex::encode(bytes))),
        },
    }
}

fn encode_geometry(geom: &Geometry, dialect: Dialect) -> MigrateResult<String> {
    if dialect != Dialect::Oracle {
        return Err(MigrateError::UnsupportedType(format!(
            "SDO_GEOMETRY literals cannot be rendered for {}",
            dialect
        )));
    }

    let int_or_null = |v: Option<i64>| v.map(|v| v.to_string()).unwrap_or_else(|| "NULL".into());

    let point = match &geom.point {
        Some(p) => format!(
            "MDSYS.SDO_POINT_TYPE({}, {}, {})",
            encode_opt_number(p.x.as_ref())?,
            encode_opt_number(p.y.as_ref())?,
            encode_opt_number(p.z.as_ref())?
        ),
        None => "NULL".to_string(),
    };

    Ok(format!(
        "MDSYS.SDO_GEOMETRY({}, {}, {}, {}, {})",
        int_or_null(geom.gtype),
        int_or_null(geom.srid),
        point,
        encode_array("MDSYS.SDO_ELEM_INFO_ARRAY", geom.elem_info.as_deref())?,
        encode_array("MDSYS.SDO_ORDINATE_ARRAY", geom.ordinates.as_deref())?
    ))
}

fn encode_array(constructor: &str, items: Option<&[Number]>) -> MigrateResult<String> {
    let Some(items) = items else {
        return Ok("NULL".to_string());
    };
    let rendered = items
        .iter()
        .map(encode_number)
        .collect::<MigrateResult<Vec<_>>>()?;
    Ok(format!("{}({})", constructor, rendered.join(", ")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::GeometryPoint;
    use chrono::NaiveDate;

    /// Read back a single-quoted SQL string literal.
    fn unquote(literal: &str) -> Option<String> {
        let inner = literal.strip_prefix('\'')?.strip_suffix('\'')?;
        let mut out = String::new();
        let mut chars = inner.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '\'' {
                if chars.next() != Some('\'') {
                    return None;
                }
            }
            out.push(c);
        }
        Some(out)
    }

    fn ts(h: u32, m: u32, s: u32, micro: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 31)
            .unwrap()
            .and_hms_micro_opt(h, m, s, micro)
            .unwrap()
    }

    #[test]
    fn test_null_literal_and_predicate() {
        assert_eq!(encode_literal(&SqlValue::Null, Dialect::Oracle).unwrap(), "NULL");
        assert_eq!(
            encode_predicate("ACCT_ID", &SqlValue::Null, Dialect::Oracle).unwrap(),
            Some("ACCT_ID IS NULL".to_string())
        );
    }

    #[test]
    fn test_quotes_are_doubled() {
        let original = "O'Brien's ''quoted''";
        let literal = encode_literal(&SqlValue::from(original), Dialect::Oracle).unwrap();
        assert_eq!(literal, "'O''Brien''s ''''quoted'''''");
        assert_eq!(unquote(&literal).as_deref(), Some(original));
    }

    #[test]
    fn test_mysql_escapes_backslash() {
        assert_eq!(quote_text(r"C:\tmp", Dialect::MySql), r"'C:\\tmp'");
        assert_eq!(quote_text(r"C:\tmp", Dialect::Postgres), r"'C:\tmp'");
    }

    #[test]
    fn test_numbers() {
        assert_eq!(encode_literal(&SqlValue::from(42i64), Dialect::Oracle).unwrap(), "42");
        assert_eq!(encode_literal(&SqlValue::from(1.5), Dialect::Oracle).unwrap(), "1.5");
        let dec = SqlValue::Number(Number::Decimal("-12.3400".into()));
        assert_eq!(encode_literal(&dec, Dialect::Oracle).unwrap(), "-12.3400");
        let sci = SqlValue::Number(Number::Decimal("1E-5".into()));
        assert_eq!(encode_literal(&sci, Dialect::Oracle).unwrap(), "1E-5");
    }

    #[test]
    fn test_booleans_follow_dialect() {
        assert_eq!(encode_literal(&SqlValue::Bool(true), Dialect::Postgres).unwrap(), "TRUE");
        assert_eq!(encode_literal(&SqlValue::Bool(false), Dialect::Postgres).unwrap(), "FALSE");
        assert_eq!(encode_literal(&SqlValue::Bool(true), Dialect::MySql).unwrap(), "1");
        assert_eq!(encode_literal(&SqlValue::Bool(false), Dialect::Sqlite).unwrap(), "0");
        assert_eq!(
            encode_predicate("ACTIVE_SW", &SqlValue::Bool(true), Dialect::Postgres).unwrap(),
            Some("ACTIVE_SW = TRUE".to_string())
        );
    }

    #[test]
    fn test_bad_numbers_are_rejected() {
        for bad in ["", ".", "1.2.3", "1e", "12; DROP TABLE x"] {
            let v = SqlValue::Number(Number::Decimal(bad.into()));
            let rendered = encode_literal(&v, Dialect::Oracle);
            assert!(
                matches!(rendered, Err(MigrateError::UnsupportedType(_))),
                "accepted {:?}",
                bad
            );
        }
        assert!(encode_literal(&SqlValue::from(f64::NAN), Dialect::Oracle).is_err());
    }

    #[test]
    fn test_timestamps_carry_format() {
        let v = SqlValue::from(ts(13, 45, 7, 0));
        assert_eq!(
            encode_literal(&v, Dialect::Oracle).unwrap(),
            "TO_DATE('2024-01-31 13:45:07', 'YYYY-MM-DD HH24:MI:SS')"
        );
        assert_eq!(
            encode_literal(&v, Dialect::MySql).unwrap(),
            "STR_TO_DATE('2024-01-31 13:45:07', '%Y-%m-%d %H:%i:%s')"
        );

        let frac = SqlValue::from(ts(13, 45, 7, 120));
        assert_eq!(
            encode_literal(&frac, Dialect::Oracle).unwrap(),
            "TO_TIMESTAMP('2024-01-31 13:45:07.000120', 'YYYY-MM-DD HH24:MI:SS.FF6')"
        );
        assert_eq!(
            encode_literal(&frac, Dialect::Postgres).unwrap(),
            "TO_TIMESTAMP('2024-01-31 13:45:07.000120', 'YYYY-MM-DD HH24:MI:SS.US')::timestamp"
        );
    }

    #[test]
    fn test_text_lob() {
        let v = SqlValue::Lob(LargeObject::Text("it's long".into()));
        assert_eq!(encode_literal(&v, Dialect::Oracle).unwrap(), "'it''s long'");

        let big = "x".repeat(2500);
        let v = SqlValue::Lob(LargeObject::Text(big));
        assert_eq!(encode_literal(&v, Dialect::Postgres).unwrap().len(), 2502);

        let huge = "y".repeat(4500);
        let rendered =
            encode_literal(&SqlValue::Lob(LargeObject::Text(huge)), Dialect::Oracle).unwrap();
        assert_eq!(rendered.matches("TO_CLOB(").count(), 5);
        assert!(rendered.contains(") || TO_CLOB("));
    }

    #[test]
    fn test_binary_lob() {
        let v = SqlValue::Lob(LargeObject::Binary(vec![0xde, 0xad, 0x01]));
        assert_eq!(encode_literal(&v, Dialect::Oracle).unwrap(), "HEXTORAW('DEAD01')");
        assert_eq!(encode_literal(&v, Dialect::Postgres).unwrap(), "decode('dead01', 'hex')");
        assert_eq!(encode_literal(&v, Dialect::Sqlite).unwrap(), "X'dead01'");

        let big = SqlValue::Lob(LargeObject::Binary(vec![0; 2001]));
        assert!(encode_literal(&big, Dialect::Oracle).is_err());
    }

    #[test]
    fn test_geometry() {
        let geom = Geometry {
            gtype: Some(2001),
            srid: Some(8307),
            point: Some(GeometryPoint {
                x: Some(Number::Float(-75.5)),
                y: Some(Number::Float(40.25)),
                z: None,
            }),
            elem_info: None,
            ordinates: None,
        };
        assert_eq!(
            encode_literal(&SqlValue::from(geom), Dialect::Oracle).unwrap(),
            "MDSYS.SDO_GEOMETRY(2001, 8307, MDSYS.SDO_POINT_TYPE(-75.5, 40.25, NULL), NULL, NULL)"
        );

        let polygon = Geometry {
            gtype: Some(2003),
            srid: None,
            point: None,
            elem_info: Some(vec![Number::Int(1), Number::Int(1003), Number::Int(3)]),
            ordinates: Some(vec![Number::Int(1), Number::Int(1), Number::Int(5), Number::Int(7)]),
        };
        assert_eq!(
            encode_literal(&SqlValue::from(polygon.clone()), Dialect::Oracle).unwrap(),
            "MDSYS.SDO_GEOMETRY(2003, NULL, NULL, MDSYS.SDO_ELEM_INFO_ARRAY(1, 1003, 3), \
             MDSYS.SDO_ORDINATE_ARRAY(1, 1, 5, 7))"
        );
        assert!(encode_literal(&SqlValue::from(polygon), Dialect::Postgres).is_err());
    }

    #[test]
    fn test_unsupported_is_an_error() {
        let v = SqlValue::Unsupported { type_name: "BFILE".into() };
        let err = encode_literal(&v, Dialect::Oracle).unwrap_err();
        assert_eq!(err.to_string(), "Unsupported type: no literal form for column type BFILE");
        assert!(encode_predicate("F", &v, Dialect::Oracle).is_err());
    }

    #[test]
    fn test_predicate_skips_lobs() {
        let v = SqlValue::Lob(LargeObject::Text("notes".into()));
        assert_eq!(encode_predicate("NOTES", &v, Dialect::Oracle).unwrap(), None);
        assert_eq!(
            encode_predicate("NAME", &SqlValue::from("a'b"), Dialect::Oracle).unwrap(),
            Some("NAME = 'a''b'".to_string())
        );
    }
}
