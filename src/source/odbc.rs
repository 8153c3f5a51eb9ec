//! ODBC-backed source reader
//!
//! Connects through the platform driver manager and streams batches with a
//! bound text row set, keeping the server-side cursor open for the life of
//! the run. All values arrive as text; temporal columns are normalized to
//! ISO-8601 UTC, numerics are passed through and cast by the analytics
//! store on insert.

use super::{
    normalize_temporal, Batch, SourceColumn, SourceCursor, SourceReader, TableBinding, Value,
    Watermark,
};
use crate::error::SyncError;
use odbc_api::buffers::TextRowSet;
use odbc_api::handles::StatementConnection;
use odbc_api::parameter::VarCharBox;
use odbc_api::{environment, BlockCursor, ConnectionOptions, CursorImpl, DataType, ResultSetMetadata};

type OwnedCursor = CursorImpl<StatementConnection<'static>>;

/// Reader over one ODBC data source.
pub struct OdbcSourceReader {
    connection_string: String,
    /// Per-cell text cap for the bound row set.
    max_text_len: usize,
}

impl OdbcSourceReader {
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            max_text_len: 4096,
        }
    }

    fn open_cursor(
        &self,
        sql: &str,
        params: Vec<VarCharBox>,
    ) -> Result<Option<OwnedCursor>, SyncError> {
        let env = environment().map_err(|e| SyncError::SourceUnavailable(e.to_string()))?;
        let conn = env
            .connect_with_connection_string(&self.connection_string, ConnectionOptions::default())
            .map_err(|e| SyncError::SourceUnavailable(e.to_string()))?;
        let result = if params.is_empty() {
            conn.into_cursor(sql, ())
        } else {
            conn.into_cursor(sql, &params[..])
        };
        result.map_err(|e| SyncError::SourceReadError(e.error.to_string()))
    }

    fn open_streaming(
        &self,
        binding: &TableBinding,
        sql: &str,
        params: Vec<VarCharBox>,
        limit: Option<u64>,
    ) -> Result<OdbcCursor, SyncError> {
        let mut cursor = self.open_cursor(sql, params)?.ok_or_else(|| {
            SyncError::SourceReadError(format!("statement returned no cursor: {sql}"))
        })?;

        let (columns, temporal) = column_layout(&mut cursor)?;
        let buffer =
            TextRowSet::for_cursor(binding.batch_size.max(1), &mut cursor, Some(self.max_text_len))
                .map_err(|e| SyncError::SourceReadError(e.to_string()))?;
        let block = cursor
            .bind_buffer(buffer)
            .map_err(|e| SyncError::SourceReadError(e.to_string()))?;

        Ok(OdbcCursor {
            block: Some(block),
            columns,
            temporal,
            temporal_key: binding.temporal_key.clone(),
            remaining: limit.map(|v| v as usize),
        })
    }
}

impl SourceReader for OdbcSourceReader {
    type Cursor = OdbcCursor;

    fn describe(&self, binding: &TableBinding) -> Result<Vec<SourceColumn>, SyncError> {
        // A zero-row probe; only metadata is read.
        let sql = format!("SELECT * FROM {} WHERE 1 = 0", binding.source_qualified());
        let mut cursor = self
            .open_cursor(&sql, Vec::new())
            .map_err(|_| SyncError::SchemaUnknown {
                table: binding.source_qualified(),
            })?
            .ok_or_else(|| SyncError::SchemaUnknown {
                table: binding.source_qualified(),
            })?;

        let names = cursor
            .column_names()
            .map_err(|e| SyncError::SourceReadError(e.to_string()))?
            .collect::<Result<Vec<String>, _>>()
            .map_err(|e| SyncError::SourceReadError(e.to_string()))?;

        names
            .into_iter()
            .enumerate()
            .map(|(i, name)| {
                let data_type = cursor
                    .col_data_type((i + 1) as u16)
                    .map_err(|e| SyncError::SourceReadError(e.to_string()))?;
                Ok(SourceColumn {
                    name,
                    source_type: render_source_type(data_type),
                    nullable: true,
                })
            })
            .collect()
    }

    fn open_full(&self, binding: &TableBinding) -> Result<Self::Cursor, SyncError> {
        let sql = format!("SELECT * FROM {}", binding.source_qualified());
        self.open_streaming(binding, &sql, Vec::new(), None)
    }

    fn open_incremental(
        &self,
        binding: &TableBinding,
        watermark: &Watermark,
    ) -> Result<Self::Cursor, SyncError> {
        let (predicate, params) = strict_tuple_predicate(&binding.temporal_key, watermark);
        let order = binding.temporal_key.join(", ");
        let sql = format!(
            "SELECT * FROM {} WHERE {predicate} ORDER BY {order}",
            binding.source_qualified()
        );
        self.open_streaming(binding, &sql, params, None)
    }

    fn open_limited(
        &self,
        binding: &TableBinding,
        max_rows: u64,
    ) -> Result<Self::Cursor, SyncError> {
        let sql = format!("SELECT * FROM {}", binding.source_qualified());
        self.open_streaming(binding, &sql, Vec::new(), Some(max_rows))
    }
}

/// Expand `(t1,..,tk) > (w1,..,wk)` into the OR-of-ANDs form drivers accept,
/// with one bound parameter per watermark part occurrence. Strictness over
/// the tuple is what keeps boundary ties from double-loading.
fn strict_tuple_predicate(temporal_key: &[String], watermark: &Watermark) -> (String, Vec<VarCharBox>) {
    let parts = watermark.parts();
    let mut terms = Vec::with_capacity(temporal_key.len());
    let mut params = Vec::new();
    for i in 0..temporal_key.len() {
        let mut clauses = Vec::with_capacity(i + 1);
        for (j, column) in temporal_key.iter().take(i).enumerate() {
            clauses.push(format!("{column} = ?"));
            params.push(VarCharBox::from_string(parts[j].clone()));
        }
        clauses.push(format!("{} > ?", temporal_key[i]));
        params.push(VarCharBox::from_string(
            parts.get(i).cloned().unwrap_or_default(),
        ));
        terms.push(format!("({})", clauses.join(" AND ")));
    }
    (terms.join(" OR "), params)
}

fn column_layout(cursor: &mut OwnedCursor) -> Result<(Vec<String>, Vec<bool>), SyncError> {
    let names = cursor
        .column_names()
        .map_err(|e| SyncError::SourceReadError(e.to_string()))?
        .collect::<Result<Vec<String>, _>>()
        .map_err(|e| SyncError::SourceReadError(e.to_string()))?;
    let mut temporal = Vec::with_capacity(names.len());
    for i in 1..=names.len() {
        let data_type = cursor
            .col_data_type(i as u16)
            .map_err(|e| SyncError::SourceReadError(e.to_string()))?;
        temporal.push(matches!(
            data_type,
            DataType::Date | DataType::Time { .. } | DataType::Timestamp { .. }
        ));
    }
    Ok((names, temporal))
}

/// Render an ODBC catalog type into the source-type text the mapper expects.
fn render_source_type(data_type: DataType) -> String {
    match data_type {
        DataType::TinyInt | DataType::SmallInt => "SMALLINT".to_string(),
        DataType::Integer => "INTEGER".to_string(),
        DataType::BigInt => "NUMBER(19,0)".to_string(),
        DataType::Numeric { precision, scale } | DataType::Decimal { precision, scale } => {
            format!("NUMBER({precision},{scale})")
        }
        DataType::Real | DataType::Float { .. } | DataType::Double => "FLOAT".to_string(),
        DataType::Date => "DATE".to_string(),
        DataType::Time { .. } | DataType::Timestamp { .. } => "TIMESTAMP".to_string(),
        DataType::Char { length } | DataType::WChar { length } => {
            format!("CHAR({})", length.map(|l| l.get()).unwrap_or(1))
        }
        DataType::Varchar { length }
        | DataType::WVarchar { length }
        | DataType::LongVarchar { length } => {
            format!("VARCHAR2({})", length.map(|l| l.get()).unwrap_or(4000))
        }
        other => format!("{other:?}"),
    }
}

/// Streaming cursor over a bound text row set.
pub struct OdbcCursor {
    block: Option<BlockCursor<OwnedCursor, TextRowSet>>,
    columns: Vec<String>,
    temporal: Vec<bool>,
    temporal_key: Vec<String>,
    remaining: Option<usize>,
}

impl SourceCursor for OdbcCursor {
    // The row set is bound at the binding's batch size, so one fetch is one
    // batch; asking for fewer rows than a fetch returns cannot shrink it
    // without losing already-fetched rows.
    fn next_batch(&mut self, _n: usize) -> Result<Option<Batch>, SyncError> {
        let Some(block) = self.block.as_mut() else {
            return Ok(None);
        };
        if self.remaining == Some(0) {
            self.close();
            return Ok(None);
        }

        let Some(row_set) = block
            .fetch_with_truncation_check(false)
            .map_err(|e| SyncError::SourceReadError(e.to_string()))?
        else {
            self.close();
            return Ok(None);
        };

        let mut take = row_set.num_rows();
        if let Some(remaining) = self.remaining {
            take = take.min(remaining);
        }

        let mut rows = Vec::with_capacity(take);
        for row_index in 0..take {
            let row: Vec<Value> = (0..self.columns.len())
                .map(|col| match row_set.at(col, row_index) {
                    None => Value::Null,
                    Some(bytes) => {
                        let text = String::from_utf8_lossy(bytes).into_owned();
                        if self.temporal[col] {
                            Value::Text(normalize_temporal(&text))
                        } else {
                            Value::Text(text)
                        }
                    }
                })
                .collect();
            rows.push(row);
        }
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= take;
        }

        Ok(Some(Batch::from_rows(
            self.columns.clone(),
            rows,
            &self.temporal_key,
        )))
    }

    fn close(&mut self) {
        self.block = None;
    }
}
