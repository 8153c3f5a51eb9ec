//! Source-to-analytics type mapping
//!
//! A pure, deterministic function from source column type text to the small
//! set of analytics types the writer supports. Rules are prefix-matched
//! case-insensitively, in order. Unknown types fail loudly with
//! `TypeUnmappable` - the mapper never silently coerces.

use crate::error::SyncError;
use serde::{Deserialize, Serialize};

/// Widest DECIMAL the analytics store accepts; anything wider degrades to
/// DOUBLE rather than failing the whole table.
const MAX_DECIMAL_PRECISION: u8 = 38;

/// The only types the analytics writer is required to support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TargetType {
    Integer,
    /// Fixed-point numeric. `precision` is `(p, s)` when the source declared
    /// one, `None` for a bare DECIMAL/NUMERIC.
    Decimal {
        #[serde(skip_serializing_if = "Option::is_none")]
        precision: Option<(u8, u8)>,
    },
    Double,
    VarChar,
    Timestamp,
}

impl TargetType {
    /// DDL type text for the analytics store.
    pub fn ddl(&self) -> String {
        match self {
            TargetType::Integer => "INTEGER".to_string(),
            TargetType::Decimal {
                precision: Some((p, s)),
            } => format!("DECIMAL({p},{s})"),
            TargetType::Decimal { precision: None } => "DECIMAL".to_string(),
            TargetType::Double => "DOUBLE".to_string(),
            TargetType::VarChar => "VARCHAR".to_string(),
            TargetType::Timestamp => "TIMESTAMP".to_string(),
        }
    }
}

/// One column of a schema mapping: the source type text, its mapped analytics
/// type, and the flags the sync pipeline needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub source_type: String,
    pub target_type: TargetType,
    pub nullable: bool,
    pub is_primary_key: bool,
    pub is_temporal: bool,
}

/// Map a source column type to its analytics type.
///
/// `column` is only used to build a useful `TypeUnmappable` message.
pub fn map_source_type(column: &str, source_type: &str) -> Result<TargetType, SyncError> {
    let ty = source_type.trim().to_ascii_uppercase();

    if let Some(rest) = ty.strip_prefix("NUMBER") {
        return Ok(map_number(rest));
    }
    // INTERVAL would otherwise prefix-match INT; it has no analytics type.
    if ty.starts_with("INT") && !ty.starts_with("INTERVAL") {
        return Ok(TargetType::Integer);
    }
    if ty.starts_with("SMALLINT") {
        return Ok(TargetType::Integer);
    }
    if let Some(rest) = ty
        .strip_prefix("DECIMAL")
        .or_else(|| ty.strip_prefix("NUMERIC"))
    {
        return Ok(decimal_or_double(parse_precision(rest)));
    }
    if ty.starts_with("FLOAT") || ty == "BINARY_FLOAT" || ty == "BINARY_DOUBLE" {
        return Ok(TargetType::Double);
    }
    if ty.starts_with("TIMESTAMP") || ty.starts_with("DATE") {
        return Ok(TargetType::Timestamp);
    }
    if ty.starts_with("CHAR")
        || ty.starts_with("VARCHAR")
        || ty.starts_with("NCHAR")
        || ty.starts_with("NVARCHAR")
        || ty == "CLOB"
        || ty == "NCLOB"
    {
        return Ok(TargetType::VarChar);
    }

    Err(SyncError::TypeUnmappable {
        column: column.to_string(),
        source_type: source_type.to_string(),
    })
}

/// NUMBER family:
/// - no precision at all: floating source, DOUBLE
/// - scale 0 and p <= 9: fits INTEGER
/// - scale 0 and p > 9: DECIMAL(p,0) - never a lossy INTEGER or DOUBLE
/// - scale > 0: DECIMAL(p,s), degrading to DOUBLE past the precision cap
fn map_number(rest: &str) -> TargetType {
    match parse_precision(rest) {
        None => TargetType::Double,
        Some((p, 0)) if p <= 9 => TargetType::Integer,
        Some((p, s)) => decimal_or_double(Some((p, s))),
    }
}

fn decimal_or_double(precision: Option<(u8, u8)>) -> TargetType {
    match precision {
        Some((p, _)) if p > MAX_DECIMAL_PRECISION => TargetType::Double,
        other => TargetType::Decimal { precision: other },
    }
}

/// Parse a trailing "(p)" or "(p,s)" type argument. Anything malformed is
/// treated as absent; the enclosing rule decides what absent means.
fn parse_precision(rest: &str) -> Option<(u8, u8)> {
    let inner = rest.trim().strip_prefix('(')?.strip_suffix(')')?;
    let mut parts = inner.splitn(2, ',');
    let p: u8 = parts.next()?.trim().parse().ok()?;
    let s: u8 = match parts.next() {
        Some(scale) => scale.trim().parse().ok()?,
        None => 0,
    };
    Some((p, s))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(ty: &str) -> TargetType {
        map_source_type("c", ty).unwrap()
    }

    #[test]
    fn number_with_small_zero_scale_is_integer() {
        assert_eq!(map("NUMBER(9,0)"), TargetType::Integer);
        assert_eq!(map("NUMBER(10)"), map("NUMBER(10,0)"));
        assert_eq!(map("number(4,0)"), TargetType::Integer);
    }

    #[test]
    fn wide_zero_scale_number_keeps_exactness() {
        assert_eq!(
            map("NUMBER(12,0)"),
            TargetType::Decimal {
                precision: Some((12, 0))
            }
        );
    }

    #[test]
    fn scaled_numbers_are_decimal() {
        assert_eq!(
            map("NUMBER(18,4)"),
            TargetType::Decimal {
                precision: Some((18, 4))
            }
        );
        assert_eq!(map("DECIMAL"), TargetType::Decimal { precision: None });
        assert_eq!(
            map("NUMERIC(10,2)"),
            TargetType::Decimal {
                precision: Some((10, 2))
            }
        );
    }

    #[test]
    fn precision_beyond_store_limit_degrades_to_double() {
        assert_eq!(map("NUMBER(40,10)"), TargetType::Double);
    }

    #[test]
    fn floating_family_is_double() {
        assert_eq!(map("FLOAT"), TargetType::Double);
        assert_eq!(map("FLOAT(126)"), TargetType::Double);
        assert_eq!(map("BINARY_FLOAT"), TargetType::Double);
        assert_eq!(map("BINARY_DOUBLE"), TargetType::Double);
        assert_eq!(map("NUMBER"), TargetType::Double);
    }

    #[test]
    fn temporal_family_is_timestamp() {
        assert_eq!(map("DATE"), TargetType::Timestamp);
        assert_eq!(map("TIMESTAMP"), TargetType::Timestamp);
        assert_eq!(map("TIMESTAMP(6)"), TargetType::Timestamp);
        assert_eq!(map("TIMESTAMP(6) WITH TIME ZONE"), TargetType::Timestamp);
    }

    #[test]
    fn character_family_is_varchar() {
        assert_eq!(map("CHAR(1)"), TargetType::VarChar);
        assert_eq!(map("VARCHAR2(200)"), TargetType::VarChar);
        assert_eq!(map("NVARCHAR2(100)"), TargetType::VarChar);
        assert_eq!(map("CLOB"), TargetType::VarChar);
    }

    #[test]
    fn unknown_types_fail_with_column_name() {
        let err = map_source_type("SHAPE", "SDO_GEOMETRY").unwrap_err();
        match err {
            SyncError::TypeUnmappable {
                column,
                source_type,
            } => {
                assert_eq!(column, "SHAPE");
                assert_eq!(source_type, "SDO_GEOMETRY");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn interval_does_not_ride_the_int_prefix() {
        assert!(map_source_type("D", "INTERVAL DAY TO SECOND").is_err());
    }

    #[test]
    fn mapper_is_pure() {
        // Same input, same output, across repeated calls.
        for _ in 0..3 {
            assert_eq!(map("NUMBER(18,4)"), map("NUMBER(18,4)"));
        }
    }

    #[test]
    fn ddl_rendering() {
        assert_eq!(
            TargetType::Decimal {
                precision: Some((18, 4))
            }
            .ddl(),
            "DECIMAL(18,4)"
        );
        assert_eq!(TargetType::Integer.ddl(), "INTEGER");
        assert_eq!(TargetType::Decimal { precision: None }.ddl(), "DECIMAL");
    }
}
