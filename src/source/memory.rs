//! In-memory source for tests and demo runs
//!
//! Behaves like a real source with snapshot semantics: a cursor copies the
//! matching rows at open time, so rows pushed mid-run never leak into an
//! already-open cursor. Transient read failures can be injected to exercise
//! the engine's retry path.

use super::{Batch, SourceColumn, SourceCursor, SourceReader, TableBinding, Value, Watermark};
use crate::error::SyncError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
struct MemoryTable {
    columns: Vec<SourceColumn>,
    rows: Vec<Vec<Value>>,
}

/// A fake source database holding row-oriented tables.
#[derive(Default)]
pub struct MemorySource {
    tables: Mutex<HashMap<String, MemoryTable>>,
    fail_reads: Arc<AtomicUsize>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a table. Replaces any previous definition.
    pub fn add_table(&self, name: &str, columns: Vec<SourceColumn>, rows: Vec<Vec<Value>>) {
        self.tables
            .lock()
            .unwrap()
            .insert(name.to_string(), MemoryTable { columns, rows });
    }

    /// Append rows to an existing table (simulates source-side inserts
    /// between runs).
    pub fn push_rows(&self, name: &str, rows: Vec<Vec<Value>>) {
        let mut tables = self.tables.lock().unwrap();
        if let Some(table) = tables.get_mut(name) {
            table.rows.extend(rows);
        }
    }

    /// Make the next `n` `next_batch` calls fail with `SourceReadError`.
    pub fn fail_next_reads(&self, n: usize) {
        self.fail_reads.store(n, Ordering::SeqCst);
    }

    fn snapshot(&self, binding: &TableBinding) -> Result<MemoryTable, SyncError> {
        self.tables
            .lock()
            .unwrap()
            .get(&binding.source_table)
            .cloned()
            .ok_or_else(|| SyncError::SchemaUnknown {
                table: binding.source_table.clone(),
            })
    }

    fn temporal_tuple(table: &MemoryTable, row: &[Value], temporal_key: &[String]) -> Watermark {
        Watermark::from_parts(
            temporal_key
                .iter()
                .map(|key| {
                    table
                        .columns
                        .iter()
                        .position(|c| &c.name == key)
                        .map(|i| row[i].as_watermark_part())
                        .unwrap_or_default()
                })
                .collect(),
        )
    }
}

impl SourceReader for MemorySource {
    type Cursor = MemoryCursor;

    fn describe(&self, binding: &TableBinding) -> Result<Vec<SourceColumn>, SyncError> {
        Ok(self.snapshot(binding)?.columns)
    }

    fn open_full(&self, binding: &TableBinding) -> Result<Self::Cursor, SyncError> {
        let table = self.snapshot(binding)?;
        Ok(MemoryCursor::new(
            table.columns.iter().map(|c| c.name.clone()).collect(),
            table.rows.clone(),
            binding.temporal_key.clone(),
            None,
            self.fail_reads.clone(),
        ))
    }

    fn open_incremental(
        &self,
        binding: &TableBinding,
        watermark: &Watermark,
    ) -> Result<Self::Cursor, SyncError> {
        let table = self.snapshot(binding)?;
        // Strict tuple comparison: rows tied with the watermark are excluded.
        let mut rows: Vec<Vec<Value>> = table
            .rows
            .iter()
            .filter(|row| {
                Self::temporal_tuple(&table, row.as_slice(), &binding.temporal_key) > *watermark
            })
            .cloned()
            .collect();
        rows.sort_by_key(|row| Self::temporal_tuple(&table, row, &binding.temporal_key));
        Ok(MemoryCursor::new(
            table.columns.iter().map(|c| c.name.clone()).collect(),
            rows,
            binding.temporal_key.clone(),
            None,
            self.fail_reads.clone(),
        ))
    }

    fn open_limited(
        &self,
        binding: &TableBinding,
        max_rows: u64,
    ) -> Result<Self::Cursor, SyncError> {
        let table = self.snapshot(binding)?;
        Ok(MemoryCursor::new(
            table.columns.iter().map(|c| c.name.clone()).collect(),
            table.rows.clone(),
            binding.temporal_key.clone(),
            Some(max_rows as usize),
            self.fail_reads.clone(),
        ))
    }
}

/// Snapshot cursor over copied rows.
pub struct MemoryCursor {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
    temporal_key: Vec<String>,
    position: usize,
    remaining: Option<usize>,
    closed: bool,
    fail_reads: Arc<AtomicUsize>,
}

impl MemoryCursor {
    fn new(
        columns: Vec<String>,
        rows: Vec<Vec<Value>>,
        temporal_key: Vec<String>,
        remaining: Option<usize>,
        fail_reads: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            columns,
            rows,
            temporal_key,
            position: 0,
            remaining,
            closed: false,
            fail_reads,
        }
    }
}

impl SourceCursor for MemoryCursor {
    fn next_batch(&mut self, n: usize) -> Result<Option<Batch>, SyncError> {
        if self.closed || self.position >= self.rows.len() {
            return Ok(None);
        }
        if self
            .fail_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .is_ok()
        {
            return Err(SyncError::SourceReadError(
                "injected transient read failure".into(),
            ));
        }

        let mut take = n.min(self.rows.len() - self.position);
        if let Some(remaining) = self.remaining {
            take = take.min(remaining);
            if take == 0 {
                return Ok(None);
            }
        }

        let slice = self.rows[self.position..self.position + take].to_vec();
        self.position += take;
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= take;
        }

        Ok(Some(Batch::from_rows(
            self.columns.clone(),
            slice,
            &self.temporal_key,
        )))
    }

    fn close(&mut self) {
        self.closed = true;
        self.rows.clear();
    }
}
