//! Analytics store writer
//!
//! Owns the DuckDB side of a sync: target DDL, batched appends, and row
//! counts. The writer is append-only during incremental runs - dedup is the
//! source predicate's job, never an upsert here.
//!
//! Identifier safety: every table or column name that ends up inside SQL
//! text is validated against a strict grammar and double-quoted. Values are
//! always bound as parameters.

use crate::error::SyncError;
use crate::mapper::ColumnSpec;
use crate::source::{Batch, Value};
use duckdb::types::{ToSqlOutput, Value as DuckValue, ValueRef};
use duckdb::{params, Connection, ToSql};
use std::path::Path;
use std::sync::LazyLock;

static IDENTIFIER: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier grammar"));

/// Validate a name against the identifier grammar and return it quoted for
/// inclusion in SQL text.
pub fn quote_identifier(name: &str) -> Result<String, SyncError> {
    if IDENTIFIER.is_match(name) {
        Ok(format!("\"{name}\""))
    } else {
        Err(SyncError::ConfigInvalid(format!(
            "invalid identifier {name:?}"
        )))
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> duckdb::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(DuckValue::Null),
            Value::Integer(v) => ToSqlOutput::Owned(DuckValue::BigInt(*v)),
            Value::Double(v) => ToSqlOutput::Owned(DuckValue::Double(*v)),
            Value::Text(v) => ToSqlOutput::Borrowed(ValueRef::Text(v.as_bytes())),
        })
    }
}

/// Writer over one analytics store file.
pub struct AnalyticsWriter {
    conn: Connection,
    schema: String,
}

impl AnalyticsWriter {
    /// Open (or create) the store and ensure the logical database's schema
    /// exists.
    pub fn open(path: &Path, database: &str) -> Result<Self, SyncError> {
        let schema_quoted = quote_identifier(database)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| SyncError::AnalyticsDdlError(format!("create {parent:?}: {e}")))?;
            }
        }
        let conn = Connection::open(path)
            .map_err(|e| SyncError::AnalyticsDdlError(format!("open {path:?}: {e}")))?;
        conn.execute_batch(&format!("CREATE SCHEMA IF NOT EXISTS {schema_quoted}"))
            .map_err(|e| SyncError::AnalyticsDdlError(e.to_string()))?;
        Ok(Self {
            conn,
            schema: database.to_string(),
        })
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory(database: &str) -> Result<Self, SyncError> {
        let schema_quoted = quote_identifier(database)?;
        let conn = Connection::open_in_memory()
            .map_err(|e| SyncError::AnalyticsDdlError(e.to_string()))?;
        conn.execute_batch(&format!("CREATE SCHEMA IF NOT EXISTS {schema_quoted}"))
            .map_err(|e| SyncError::AnalyticsDdlError(e.to_string()))?;
        Ok(Self {
            conn,
            schema: database.to_string(),
        })
    }

    fn qualified(&self, table: &str) -> Result<String, SyncError> {
        Ok(format!(
            "{}.{}",
            quote_identifier(&self.schema)?,
            quote_identifier(table)?
        ))
    }

    pub fn table_exists(&self, table: &str) -> Result<bool, SyncError> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT count(*) FROM information_schema.tables \
                 WHERE table_schema = ? AND table_name = ?",
                params![self.schema, table],
                |row| row.get(0),
            )
            .map_err(|e| SyncError::AnalyticsWriteError(e.to_string()))?;
        Ok(count > 0)
    }

    /// Create the target table. `primary_key` columns must appear in
    /// `columns`; an empty list means no PRIMARY KEY clause (test syncs).
    pub fn create_table(
        &self,
        table: &str,
        columns: &[ColumnSpec],
        primary_key: &[String],
    ) -> Result<(), SyncError> {
        let mut defs = Vec::with_capacity(columns.len() + 1);
        for col in columns {
            let name = quote_identifier(&col.name)?;
            let null_clause = if col.nullable { "" } else { " NOT NULL" };
            defs.push(format!("{name} {}{null_clause}", col.target_type.ddl()));
        }
        if !primary_key.is_empty() {
            let pk = primary_key
                .iter()
                .map(|c| quote_identifier(c))
                .collect::<Result<Vec<_>, _>>()?
                .join(", ");
            defs.push(format!("PRIMARY KEY ({pk})"));
        }
        let sql = format!(
            "CREATE TABLE {} ({})",
            self.qualified(table)?,
            defs.join(", ")
        );
        self.conn
            .execute_batch(&sql)
            .map_err(|e| SyncError::AnalyticsDdlError(e.to_string()))
    }

    /// Append one batch inside a transaction. Returns rows affected.
    ///
    /// Values arrive as text for decimals and temporals; each parameter is
    /// cast to the mapped column type in the statement so the store never
    /// guesses.
    pub fn insert_batch(
        &self,
        table: &str,
        columns: &[ColumnSpec],
        batch: &Batch,
    ) -> Result<u64, SyncError> {
        if batch.rows == 0 {
            return Ok(0);
        }
        let column_list = columns
            .iter()
            .map(|c| quote_identifier(&c.name))
            .collect::<Result<Vec<_>, _>>()?
            .join(", ");
        let placeholders = columns
            .iter()
            .map(|c| format!("CAST(? AS {})", c.target_type.ddl()))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO {} ({column_list}) VALUES ({placeholders})",
            self.qualified(table)?
        );

        self.conn
            .execute_batch("BEGIN TRANSACTION")
            .map_err(|e| SyncError::AnalyticsWriteError(e.to_string()))?;

        let result = (|| -> Result<u64, SyncError> {
            let mut stmt = self
                .conn
                .prepare(&sql)
                .map_err(|e| SyncError::AnalyticsWriteError(e.to_string()))?;
            let mut affected = 0u64;
            for row_index in 0..batch.rows {
                let row: Vec<&Value> = batch.row(row_index).collect();
                affected += stmt
                    .execute(duckdb::params_from_iter(row))
                    .map_err(|e| SyncError::AnalyticsWriteError(e.to_string()))?
                    as u64;
            }
            Ok(affected)
        })();

        match result {
            Ok(affected) => {
                self.conn
                    .execute_batch("COMMIT")
                    .map_err(|e| SyncError::AnalyticsWriteError(e.to_string()))?;
                Ok(affected)
            }
            Err(e) => {
                // Best-effort rollback; the original error is what matters.
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    pub fn row_count(&self, table: &str) -> Result<u64, SyncError> {
        let count: i64 = self
            .conn
            .query_row(
                &format!("SELECT count(*) FROM {}", self.qualified(table)?),
                [],
                |row| row.get(0),
            )
            .map_err(|e| SyncError::AnalyticsWriteError(e.to_string()))?;
        Ok(count as u64)
    }

    /// Used by full syncs (recreate) and test syncs (dispose).
    pub fn drop_table(&self, table: &str) -> Result<(), SyncError> {
        self.conn
            .execute_batch(&format!("DROP TABLE IF EXISTS {}", self.qualified(table)?))
            .map_err(|e| SyncError::AnalyticsDdlError(e.to_string()))
    }

    /// Raw handle for the (out-of-scope) query layer.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}
