//! Source-side read surface
//!
//! The sync engine talks to the transactional source through the
//! [`SourceReader`] / [`SourceCursor`] traits. A cursor is opened once per
//! run and MUST keep its server-side position across `next_batch` calls -
//! re-issuing the predicate per batch would skip or duplicate rows whenever
//! the temporal key has ties.
//!
//! Batches are column-oriented. Temporal values are normalized to ISO-8601
//! UTC strings at the read boundary so that downstream watermark comparisons
//! are plain string comparisons.

use crate::error::SyncError;
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

pub mod memory;
#[cfg(feature = "odbc")]
pub mod odbc;

/// Binding of one source table to its analytics target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableBinding {
    /// Schema qualifier on the source side, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_schema: Option<String>,
    pub source_table: String,
    pub target_table: String,
    /// Primary key columns for target DDL; may be empty.
    #[serde(default)]
    pub primary_key: Vec<String>,
    /// Columns whose maximum forms the incremental watermark, in significance
    /// order. Empty means the table only supports full sync.
    #[serde(default)]
    pub temporal_key: Vec<String>,
    /// Rows per batch. Must be at least 1.
    pub batch_size: usize,
}

impl TableBinding {
    /// Fully qualified source table for query text.
    pub fn source_qualified(&self) -> String {
        match &self.source_schema {
            Some(schema) => format!("{schema}.{}", self.source_table),
            None => self.source_table.clone(),
        }
    }
}

/// The largest temporal-key value persisted to the analytics store.
///
/// One part per temporal-key column; ordering is lexicographic over the
/// parts, which equals time ordering because the parts are ISO-8601 UTC.
/// Serializes as a bare string for single-column keys and as an array of
/// strings for composite keys.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "WatermarkRepr", into = "WatermarkRepr")]
pub struct Watermark {
    parts: Vec<String>,
}

impl Watermark {
    pub fn single(value: impl Into<String>) -> Self {
        Self {
            parts: vec![value.into()],
        }
    }

    pub fn from_parts(parts: Vec<String>) -> Self {
        Self { parts }
    }

    pub fn parts(&self) -> &[String] {
        &self.parts
    }
}

impl std::fmt::Display for Watermark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.parts.join("|"))
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum WatermarkRepr {
    Single(String),
    Composite(Vec<String>),
}

impl From<WatermarkRepr> for Watermark {
    fn from(repr: WatermarkRepr) -> Self {
        match repr {
            WatermarkRepr::Single(value) => Watermark::single(value),
            WatermarkRepr::Composite(parts) => Watermark::from_parts(parts),
        }
    }
}

impl From<Watermark> for WatermarkRepr {
    fn from(wm: Watermark) -> Self {
        if wm.parts.len() == 1 {
            WatermarkRepr::Single(wm.parts.into_iter().next().unwrap())
        } else {
            WatermarkRepr::Composite(wm.parts)
        }
    }
}

/// A single cell value as it travels from source to analytics store.
///
/// Decimals and temporals travel as text: text is lossless for fixed-point
/// values and the analytics store casts on insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Integer(i64),
    Double(f64),
    Text(String),
}

impl Value {
    /// Render for watermark tuples. Null sorts as the empty string, which
    /// cannot exceed any real temporal value.
    pub fn as_watermark_part(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Integer(v) => v.to_string(),
            Value::Double(v) => v.to_string(),
            Value::Text(v) => v.clone(),
        }
    }
}

/// Raw catalog record for one source column, before type mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceColumn {
    pub name: String,
    pub source_type: String,
    pub nullable: bool,
}

/// One column-oriented batch of rows.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Column names, in source order.
    pub columns: Vec<String>,
    /// One value vector per column; all vectors have `rows` entries.
    pub values: Vec<Vec<Value>>,
    pub rows: usize,
    /// The largest temporal-key tuple in this batch, for watermark
    /// advancement. None when the binding has no temporal key.
    pub max_temporal: Option<Watermark>,
}

impl Batch {
    /// Assemble a batch from row-oriented data, computing `max_temporal`
    /// from the named temporal-key columns.
    pub fn from_rows(
        columns: Vec<String>,
        rows: Vec<Vec<Value>>,
        temporal_key: &[String],
    ) -> Self {
        let row_count = rows.len();
        let temporal_idx: Vec<usize> = temporal_key
            .iter()
            .filter_map(|key| columns.iter().position(|c| c == key))
            .collect();

        let mut max_temporal: Option<Watermark> = None;
        if temporal_idx.len() == temporal_key.len() && !temporal_idx.is_empty() {
            for row in &rows {
                let tuple = Watermark::from_parts(
                    temporal_idx
                        .iter()
                        .map(|&i| row[i].as_watermark_part())
                        .collect(),
                );
                if max_temporal.as_ref().map_or(true, |max| tuple > *max) {
                    max_temporal = Some(tuple);
                }
            }
        }

        let mut values: Vec<Vec<Value>> = columns.iter().map(|_| Vec::with_capacity(row_count)).collect();
        for row in rows {
            for (col, value) in row.into_iter().enumerate() {
                values[col].push(value);
            }
        }

        Batch {
            columns,
            values,
            rows: row_count,
            max_temporal,
        }
    }

    /// Iterate one row as a slice of per-column references.
    pub fn row(&self, index: usize) -> impl Iterator<Item = &Value> {
        self.values.iter().map(move |col| &col[index])
    }
}

/// Read access to one source database.
pub trait SourceReader: Send + Sync {
    type Cursor: SourceCursor;

    /// Column metadata from the source catalog. No data is read.
    fn describe(&self, binding: &TableBinding) -> Result<Vec<SourceColumn>, SyncError>;

    /// Cursor over the whole table.
    fn open_full(&self, binding: &TableBinding) -> Result<Self::Cursor, SyncError>;

    /// Cursor over rows whose temporal-key tuple strictly exceeds
    /// `watermark`, ordered ascending by the tuple.
    fn open_incremental(
        &self,
        binding: &TableBinding,
        watermark: &Watermark,
    ) -> Result<Self::Cursor, SyncError>;

    /// Cursor over at most `max_rows` rows, for test syncs.
    fn open_limited(&self, binding: &TableBinding, max_rows: u64)
        -> Result<Self::Cursor, SyncError>;
}

/// A positioned server-side cursor.
pub trait SourceCursor {
    /// Up to `n` more rows, or None at end of data.
    fn next_batch(&mut self, n: usize) -> Result<Option<Batch>, SyncError>;

    /// Release the underlying handle. Idempotent.
    fn close(&mut self);
}

/// Normalize a source temporal value to an ISO-8601 UTC string.
///
/// Accepts the common driver spellings ("YYYY-MM-DD HH:MM:SS[.frac]",
/// bare dates, or already-ISO text) and leaves anything unrecognized
/// untouched rather than guessing.
pub fn normalize_temporal(raw: &str) -> String {
    let text = raw.trim();
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(text) {
        return dt.to_utc().format("%Y-%m-%dT%H:%M:%S%.fZ").to_string();
    }
    for fmt in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, fmt) {
            return dt.format("%Y-%m-%dT%H:%M:%S%.fZ").to_string();
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return format!("{}T00:00:00Z", date.format("%Y-%m-%d"));
    }
    text.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn watermark_single_serializes_as_bare_string() {
        let wm = Watermark::single("2024-06-01T00:00:00Z");
        assert_eq!(
            serde_json::to_string(&wm).unwrap(),
            "\"2024-06-01T00:00:00Z\""
        );
        let back: Watermark = serde_json::from_str("\"2024-06-01T00:00:00Z\"").unwrap();
        assert_eq!(back, wm);
    }

    #[test]
    fn watermark_composite_serializes_as_array() {
        let wm = Watermark::from_parts(vec!["2024-06-01T00:00:00Z".into(), "42".into()]);
        let json = serde_json::to_string(&wm).unwrap();
        assert_eq!(json, "[\"2024-06-01T00:00:00Z\",\"42\"]");
        let back: Watermark = serde_json::from_str(&json).unwrap();
        assert_eq!(back, wm);
    }

    #[test]
    fn watermark_ordering_is_lexicographic_over_parts() {
        let a = Watermark::from_parts(vec!["2024-01-01".into(), "5".into()]);
        let b = Watermark::from_parts(vec!["2024-01-01".into(), "6".into()]);
        let c = Watermark::from_parts(vec!["2024-01-02".into(), "0".into()]);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn batch_tracks_max_temporal_tuple() {
        let batch = Batch::from_rows(
            vec!["id".into(), "ts".into()],
            vec![
                vec![Value::Integer(1), Value::Text("2024-01-02T00:00:00Z".into())],
                vec![Value::Integer(2), Value::Text("2024-01-05T00:00:00Z".into())],
                vec![Value::Integer(3), Value::Text("2024-01-03T00:00:00Z".into())],
            ],
            &["ts".to_string()],
        );
        assert_eq!(batch.rows, 3);
        assert_eq!(
            batch.max_temporal,
            Some(Watermark::single("2024-01-05T00:00:00Z"))
        );
        // Column-oriented layout
        assert_eq!(batch.values[0].len(), 3);
        assert_eq!(batch.values[1].len(), 3);
    }

    #[test]
    fn batch_without_temporal_key_has_no_watermark() {
        let batch = Batch::from_rows(
            vec!["id".into()],
            vec![vec![Value::Integer(1)]],
            &[],
        );
        assert_eq!(batch.max_temporal, None);
    }

    #[test]
    fn temporal_normalization() {
        assert_eq!(
            normalize_temporal("2024-06-01 13:45:00"),
            "2024-06-01T13:45:00Z"
        );
        assert_eq!(
            normalize_temporal("2024-06-01 13:45:00.250"),
            "2024-06-01T13:45:00.250Z"
        );
        assert_eq!(normalize_temporal("2024-06-01"), "2024-06-01T00:00:00Z");
        // Already normalized text is stable
        let iso = normalize_temporal("2024-06-01 13:45:00");
        assert_eq!(normalize_temporal(&iso), iso);
        // Unrecognized text passes through
        assert_eq!(normalize_temporal("not a date"), "not a date");
    }
}
