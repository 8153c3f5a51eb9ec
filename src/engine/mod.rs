//! Sync pipeline
//!
//! One engine invocation is one run: schema inspection, type mapping, target
//! DDL, batched copy with checkpointing, finalize. Three entry points share
//! the pipeline:
//!
//! - `test_sync`: disposable `_test` target, row-capped, no real state.
//! - `full_sync`: target dropped and recreated, mapping version reset.
//! - `incremental_sync`: rows strictly above the stored watermark.
//!
//! The engine is synchronous blocking code; the worker runs it on a
//! dedicated blocking task. Cancellation and pause are observed at batch
//! boundaries (and inside retry sleeps), and the cursor is closed on every
//! exit path.

use crate::analytics::AnalyticsWriter;
use crate::error::SyncError;
use crate::events::{LogLevel, Phase, RunKind, SyncEvent};
use crate::mapper::{map_source_type, ColumnSpec};
use crate::source::{SourceCursor, SourceReader, TableBinding, Watermark};
use crate::state::{ProgressCheckpoint, StateStore, SyncState, SyncStatus};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub mod retry;

use retry::RetryPolicy;

/// Knobs shared by every run of one engine.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Wall-clock budget per run.
    pub max_duration: Duration,
    /// Batch-loop budget per run.
    pub max_iterations: u64,
    pub retry: RetryPolicy,
    /// How often the pause gate and retry sleeps re-check for cancellation.
    pub pause_poll: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            max_duration: Duration::from_secs(3_600),
            max_iterations: 100_000,
            retry: RetryPolicy::default(),
            pause_poll: Duration::from_millis(250),
        }
    }
}

/// Cooperative controls supplied by the worker.
#[derive(Clone, Default)]
pub struct RunControl {
    pub cancel: CancellationToken,
    pub pause: Arc<AtomicBool>,
    /// Reason supplied with `stop()`, reported in the `Stopped` event.
    pub stop_reason: Arc<std::sync::Mutex<Option<String>>>,
}

impl RunControl {
    fn take_stop_reason(&self) -> String {
        self.stop_reason
            .lock()
            .ok()
            .and_then(|mut r| r.take())
            .unwrap_or_else(|| "stop requested".to_string())
    }
}

/// Where run events go. The worker forwards into its bounded channel; tests
/// collect into a Vec.
pub trait EventSink: Send {
    fn emit(&mut self, event: SyncEvent);
}

impl EventSink for Vec<SyncEvent> {
    fn emit(&mut self, event: SyncEvent) {
        self.push(event);
    }
}

/// Terminal outcome of one run.
#[derive(Debug)]
pub enum RunOutcome {
    Completed { rows_loaded: u64, duration: Duration },
    Stopped { reason: String },
    Failed(SyncError),
}

#[derive(Debug)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub kind: RunKind,
    pub outcome: RunOutcome,
}

/// Sentinel for cooperative cancellation inside the pipeline. Not an error;
/// converted to `RunOutcome::Stopped` at the boundary.
enum RunInterrupt {
    Error(SyncError),
    Cancelled,
}

impl From<SyncError> for RunInterrupt {
    fn from(e: SyncError) -> Self {
        RunInterrupt::Error(e)
    }
}

pub struct SyncEngine<'a, R: SourceReader> {
    reader: &'a R,
    writer: &'a AnalyticsWriter,
    state: &'a StateStore,
    options: &'a SyncOptions,
    control: RunControl,
}

impl<'a, R: SourceReader> SyncEngine<'a, R> {
    pub fn new(
        reader: &'a R,
        writer: &'a AnalyticsWriter,
        state: &'a StateStore,
        options: &'a SyncOptions,
        control: RunControl,
    ) -> Self {
        Self {
            reader,
            writer,
            state,
            options,
            control,
        }
    }

    /// Load up to `max_rows` into a disposable `<target>_test` table and
    /// drop it. Never touches real state or checkpoints.
    pub fn test_sync(
        &self,
        binding: &TableBinding,
        max_rows: u64,
        sink: &mut dyn EventSink,
    ) -> RunSummary {
        self.run(RunKind::Test, binding, Some(max_rows), sink)
    }

    /// Fresh full load. An existing target is dropped and recreated; the
    /// schema mapping is re-derived and its version reset.
    pub fn full_sync(&self, binding: &TableBinding, sink: &mut dyn EventSink) -> RunSummary {
        self.run(RunKind::Full, binding, None, sink)
    }

    /// Load rows whose temporal tuple strictly exceeds the stored watermark.
    /// Requires an existing target and a non-empty temporal key.
    pub fn incremental_sync(&self, binding: &TableBinding, sink: &mut dyn EventSink) -> RunSummary {
        self.run(RunKind::Incremental, binding, None, sink)
    }

    fn run(
        &self,
        kind: RunKind,
        binding: &TableBinding,
        max_rows: Option<u64>,
        sink: &mut dyn EventSink,
    ) -> RunSummary {
        self.execute(Uuid::new_v4(), kind, binding, max_rows, sink)
    }

    /// Run with a caller-chosen run id (the worker hands the id back from
    /// `start` before the run produces its first event).
    pub fn execute(
        &self,
        run_id: Uuid,
        kind: RunKind,
        binding: &TableBinding,
        max_rows: Option<u64>,
        sink: &mut dyn EventSink,
    ) -> RunSummary {
        let started = Instant::now();
        sink.emit(SyncEvent::Started {
            run_id,
            kind,
            table: binding.target_table.clone(),
            timestamp: Utc::now(),
        });

        let result = self.run_pipeline(run_id, kind, binding, max_rows, started, sink);

        let (terminal, outcome) = match result {
            Ok(rows_loaded) => {
                let duration = started.elapsed();
                (
                    SyncEvent::Completed {
                        run_id,
                        rows_loaded,
                        duration_seconds: duration.as_secs_f64(),
                    },
                    RunOutcome::Completed {
                        rows_loaded,
                        duration,
                    },
                )
            }
            Err(RunInterrupt::Cancelled) => {
                let reason = self.control.take_stop_reason();
                if kind != RunKind::Test {
                    self.persist_status(binding, SyncStatus::Stopped);
                }
                (
                    SyncEvent::Stopped {
                        run_id,
                        reason: reason.clone(),
                    },
                    RunOutcome::Stopped { reason },
                )
            }
            Err(RunInterrupt::Error(error)) => {
                if kind != RunKind::Test {
                    self.persist_status(binding, SyncStatus::Failed);
                }
                (
                    SyncEvent::Failed {
                        run_id,
                        error_kind: error.kind().to_string(),
                        message: error.to_string(),
                        retryable: error.retryable(),
                    },
                    RunOutcome::Failed(error),
                )
            }
        };

        self.state.append_history(&terminal);
        sink.emit(terminal);

        RunSummary {
            run_id,
            kind,
            outcome,
        }
    }

    fn run_pipeline(
        &self,
        run_id: Uuid,
        kind: RunKind,
        binding: &TableBinding,
        max_rows: Option<u64>,
        started: Instant,
        sink: &mut dyn EventSink,
    ) -> Result<u64, RunInterrupt> {
        validate_binding(kind, binding)?;

        // ── Schema ───────────────────────────────────────────────────────
        self.progress(sink, run_id, Phase::Schema, 0, max_rows, started);
        let source_columns = self.reader.describe(binding)?;
        if source_columns.is_empty() {
            return Err(SyncError::SchemaUnknown {
                table: binding.source_table.clone(),
            }
            .into());
        }
        let columns = build_column_specs(binding, &source_columns)?;

        let mapping_version = match kind {
            RunKind::Test => 0,
            RunKind::Full => self.state.reset_mapping(&binding.target_table, columns.clone())?.version,
            RunKind::Incremental => {
                let stored = self.state.load_mapping(&binding.target_table)?.ok_or_else(|| {
                    SyncError::SchemaDrift {
                        table: binding.target_table.clone(),
                        detail: "no stored schema mapping; run a full sync first".into(),
                    }
                })?;
                check_drift(&binding.target_table, &stored.columns, &columns)?;
                let mapping = self.state.save_mapping(&binding.target_table, columns.clone())?;
                if mapping.version != stored.version {
                    sink.emit(SyncEvent::Log {
                        run_id,
                        level: LogLevel::Warn,
                        message: format!(
                            "column types changed within an identical column set; \
                             mapping version {} -> {}",
                            stored.version, mapping.version
                        ),
                    });
                }
                mapping.version
            }
        };

        // ── DDL ──────────────────────────────────────────────────────────
        self.progress(sink, run_id, Phase::Ddl, 0, max_rows, started);
        let target = match kind {
            RunKind::Test => format!("{}_test", binding.target_table),
            _ => binding.target_table.clone(),
        };
        match kind {
            RunKind::Test => {
                self.writer.drop_table(&target)?;
                self.writer.create_table(&target, &columns, &[])?;
            }
            RunKind::Full => {
                // A crashed full sync restarts from zero: partial target and
                // stale checkpoint are both discarded.
                self.writer.drop_table(&target)?;
                self.state.clear_checkpoint(&binding.target_table)?;
                let pk = lowered(&binding.primary_key);
                self.writer.create_table(&target, &columns, &pk)?;
            }
            RunKind::Incremental => {
                if !self.writer.table_exists(&target)? {
                    return Err(SyncError::SchemaUnknown { table: target }.into());
                }
            }
        }

        // ── Copy ─────────────────────────────────────────────────────────
        self.progress(sink, run_id, Phase::Copy, 0, max_rows, started);

        let prior_state = if kind == RunKind::Incremental {
            self.state.load_state(&binding.target_table)?.unwrap_or_default()
        } else {
            SyncState::default()
        };

        // Resume point: a leftover checkpoint with progress beats the
        // finalized watermark (it is necessarily further along).
        let resume_watermark = if kind == RunKind::Incremental {
            let checkpoint = self.state.load_checkpoint(&binding.target_table)?;
            match checkpoint {
                Some(cp) if cp.rows_done > 0 && cp.last_batch_watermark.is_some() => {
                    sink.emit(SyncEvent::Log {
                        run_id,
                        level: LogLevel::Info,
                        message: format!(
                            "resuming from checkpoint of run {} ({} rows done)",
                            cp.run_id, cp.rows_done
                        ),
                    });
                    cp.last_batch_watermark
                }
                _ => prior_state.last_watermark.clone(),
            }
        } else {
            None
        };

        let mut cursor = match kind {
            RunKind::Test => self.reader.open_limited(binding, max_rows.unwrap_or(0))?,
            RunKind::Full => self.reader.open_full(binding)?,
            RunKind::Incremental => match &resume_watermark {
                Some(wm) => self.reader.open_incremental(binding, wm)?,
                // Nothing persisted yet: strictly-greater-than-nothing is
                // the whole table.
                None => self.reader.open_full(binding)?,
            },
        };

        if kind != RunKind::Test {
            self.persist_running_state(binding, &prior_state, kind, mapping_version)?;
        }

        let copied = self.copy_loop(
            run_id,
            kind,
            binding,
            &target,
            &columns,
            max_rows,
            resume_watermark.clone(),
            started,
            &mut cursor,
            sink,
        );
        // The cursor is released on every exit path, success or not.
        cursor.close();
        let copied = copied?;

        // ── Finalize ─────────────────────────────────────────────────────
        self.progress(sink, run_id, Phase::Finalize, copied.rows_done, max_rows, started);

        match kind {
            RunKind::Test => {
                self.writer.drop_table(&target)?;
            }
            RunKind::Full | RunKind::Incremental => {
                let new_state = SyncState {
                    last_sync_at: Some(Utc::now()),
                    last_watermark: copied
                        .last_watermark
                        .clone()
                        .or(prior_state.last_watermark.clone()),
                    last_batch_count: copied.last_batch_rows,
                    total_rows: if kind == RunKind::Full {
                        copied.rows_done
                    } else {
                        prior_state.total_rows + copied.rows_done
                    },
                    mapping_version,
                    status: SyncStatus::Idle,
                };
                self.state.save_state(&binding.target_table, &new_state)?;
                self.state.clear_checkpoint(&binding.target_table)?;

                if kind == RunKind::Full {
                    // Post-load verification; drift is surfaced, not fatal.
                    let count = self.writer.row_count(&target)?;
                    if count != copied.rows_done {
                        sink.emit(SyncEvent::Log {
                            run_id,
                            level: LogLevel::Warn,
                            message: format!(
                                "row count after full sync is {count}, expected {}",
                                copied.rows_done
                            ),
                        });
                    }
                }
            }
        }

        Ok(copied.rows_done)
    }

    #[allow(clippy::too_many_arguments)]
    fn copy_loop(
        &self,
        run_id: Uuid,
        kind: RunKind,
        binding: &TableBinding,
        target: &str,
        columns: &[ColumnSpec],
        max_rows: Option<u64>,
        resume_watermark: Option<Watermark>,
        started: Instant,
        cursor: &mut R::Cursor,
        sink: &mut dyn EventSink,
    ) -> Result<CopyStats, RunInterrupt> {
        let mut stats = CopyStats {
            rows_done: 0,
            last_batch_rows: 0,
            last_watermark: resume_watermark,
        };
        let run_started_at = Utc::now();
        let mut iterations = 0u64;
        let mut paused_persisted = false;

        loop {
            // Cooperative cancellation, checked at every batch boundary.
            if self.control.cancel.is_cancelled() {
                return Err(RunInterrupt::Cancelled);
            }

            // Pause gate: idle in bounded polls, emitting Paused exactly once.
            if self.control.pause.load(Ordering::SeqCst) {
                sink.emit(SyncEvent::Paused { run_id });
                if kind != RunKind::Test && !paused_persisted {
                    self.persist_status(binding, SyncStatus::Paused);
                    paused_persisted = true;
                }
                while self.control.pause.load(Ordering::SeqCst) {
                    if self.control.cancel.is_cancelled() {
                        return Err(RunInterrupt::Cancelled);
                    }
                    std::thread::sleep(self.options.pause_poll);
                }
                sink.emit(SyncEvent::Resumed { run_id });
                if kind != RunKind::Test {
                    self.persist_status(binding, SyncStatus::Running);
                    paused_persisted = false;
                }
            }

            if started.elapsed() > self.options.max_duration {
                return Err(SyncError::Timeout {
                    limit_secs: self.options.max_duration.as_secs(),
                }
                .into());
            }
            iterations += 1;
            if iterations > self.options.max_iterations {
                return Err(SyncError::IterationCap {
                    limit: self.options.max_iterations,
                }
                .into());
            }

            let batch = self.with_retry(run_id, "read", sink, || {
                cursor.next_batch(binding.batch_size)
            })?;
            let Some(batch) = batch else {
                break;
            };
            if batch.rows == 0 {
                continue;
            }

            self.with_retry(run_id, "write", sink, || {
                self.writer.insert_batch(target, columns, &batch)
            })?;

            stats.rows_done += batch.rows as u64;
            stats.last_batch_rows = batch.rows as u64;
            if let Some(max) = &batch.max_temporal {
                if stats.last_watermark.as_ref().map_or(true, |wm| max > wm) {
                    stats.last_watermark = Some(max.clone());
                }
            }

            if kind != RunKind::Test {
                self.state.write_checkpoint(&ProgressCheckpoint {
                    run_id,
                    target_table: binding.target_table.clone(),
                    rows_done: stats.rows_done,
                    rows_total: max_rows,
                    last_batch_watermark: stats.last_watermark.clone(),
                    started_at: run_started_at,
                    updated_at: Utc::now(),
                })?;
            }

            self.progress(sink, run_id, Phase::Copy, stats.rows_done, max_rows, started);
        }

        Ok(stats)
    }

    /// Run `op`, retrying transient failures with backoff. Fatal errors and
    /// exhausted budgets propagate; cancellation is honored mid-sleep.
    fn with_retry<T>(
        &self,
        run_id: Uuid,
        what: &str,
        sink: &mut dyn EventSink,
        mut op: impl FnMut() -> Result<T, SyncError>,
    ) -> Result<T, RunInterrupt> {
        let mut attempt = 0u32;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.retryable() && self.options.retry.should_retry(attempt + 1) => {
                    attempt += 1;
                    let backoff = self.options.retry.backoff(attempt);
                    sink.emit(SyncEvent::Log {
                        run_id,
                        level: LogLevel::Warn,
                        message: format!(
                            "{what} failed (attempt {attempt}): {e}; retrying in {}ms",
                            backoff.as_millis()
                        ),
                    });
                    if self.sleep_cancellable(backoff) {
                        return Err(RunInterrupt::Cancelled);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Sleep in pause-poll slices so stop() is observed promptly.
    /// Returns true when cancelled.
    fn sleep_cancellable(&self, total: Duration) -> bool {
        let deadline = Instant::now() + total;
        while Instant::now() < deadline {
            if self.control.cancel.is_cancelled() {
                return true;
            }
            let left = deadline - Instant::now();
            std::thread::sleep(left.min(self.options.pause_poll));
        }
        self.control.cancel.is_cancelled()
    }

    fn progress(
        &self,
        sink: &mut dyn EventSink,
        run_id: Uuid,
        phase: Phase,
        rows_done: u64,
        rows_total: Option<u64>,
        started: Instant,
    ) {
        let eta_seconds = match rows_total {
            Some(total) if rows_done > 0 && total > rows_done => {
                let rate = rows_done as f64 / started.elapsed().as_secs_f64().max(1e-6);
                Some(((total - rows_done) as f64 / rate) as u64)
            }
            _ => None,
        };
        sink.emit(SyncEvent::Progress {
            run_id,
            phase,
            rows_done,
            rows_total,
            eta_seconds,
            dropped_events: None,
        });
    }

    fn persist_running_state(
        &self,
        binding: &TableBinding,
        prior: &SyncState,
        kind: RunKind,
        mapping_version: u32,
    ) -> Result<(), SyncError> {
        let base = if kind == RunKind::Full {
            // A full sync starts over; counters from earlier runs are gone.
            SyncState::default()
        } else {
            prior.clone()
        };
        let state = SyncState {
            status: SyncStatus::Running,
            mapping_version,
            ..base
        };
        self.state.save_state(&binding.target_table, &state)
    }

    /// Best-effort status write on failure/stop paths; the original outcome
    /// always wins over a state write problem.
    fn persist_status(&self, binding: &TableBinding, status: SyncStatus) {
        let result = self
            .state
            .load_state(&binding.target_table)
            .map(|s| s.unwrap_or_default())
            .and_then(|mut state| {
                state.status = status;
                self.state.save_state(&binding.target_table, &state)
            });
        if let Err(e) = result {
            tracing::warn!(
                "failed to persist status for {}: {e}",
                binding.target_table
            );
        }
    }
}

struct CopyStats {
    rows_done: u64,
    last_batch_rows: u64,
    last_watermark: Option<Watermark>,
}

fn lowered(names: &[String]) -> Vec<String> {
    names.iter().map(|n| n.to_ascii_lowercase()).collect()
}

fn validate_binding(kind: RunKind, binding: &TableBinding) -> Result<(), SyncError> {
    if binding.batch_size < 1 {
        return Err(SyncError::ConfigInvalid(format!(
            "batch_size must be at least 1 for {}",
            binding.target_table
        )));
    }
    crate::analytics::quote_identifier(&binding.target_table)?;
    if kind == RunKind::Incremental && binding.temporal_key.is_empty() {
        return Err(SyncError::ConfigInvalid(format!(
            "incremental sync of {} requires a temporal key",
            binding.target_table
        )));
    }
    Ok(())
}

/// Map every source column before any DDL. Flags come from the binding;
/// names are lowered for the analytics side.
fn build_column_specs(
    binding: &TableBinding,
    source_columns: &[crate::source::SourceColumn],
) -> Result<Vec<ColumnSpec>, SyncError> {
    let pk: Vec<String> = binding
        .primary_key
        .iter()
        .map(|c| c.to_ascii_lowercase())
        .collect();
    let temporal: Vec<String> = binding
        .temporal_key
        .iter()
        .map(|c| c.to_ascii_lowercase())
        .collect();

    source_columns
        .iter()
        .map(|col| {
            let name = col.name.to_ascii_lowercase();
            let target_type = map_source_type(&col.name, &col.source_type)?;
            Ok(ColumnSpec {
                is_primary_key: pk.contains(&name),
                is_temporal: temporal.contains(&name),
                nullable: col.nullable && !pk.contains(&name),
                name,
                source_type: col.source_type.clone(),
                target_type,
            })
        })
        .collect()
}

/// Incremental drift rule: a changed column set is fatal, and so is a column
/// whose mapped type moved to a different storage class (the existing target
/// column could not hold it). A type change within the same class - say a
/// widened DECIMAL - bumps the mapping version upstream and continues.
fn check_drift(table: &str, stored: &[ColumnSpec], candidate: &[ColumnSpec]) -> Result<(), SyncError> {
    let stored_names: Vec<&str> = stored.iter().map(|c| c.name.as_str()).collect();
    let candidate_names: Vec<&str> = candidate.iter().map(|c| c.name.as_str()).collect();
    if stored_names != candidate_names {
        return Err(SyncError::SchemaDrift {
            table: table.to_string(),
            detail: format!(
                "column set changed from {stored_names:?} to {candidate_names:?}; \
                 run a full sync"
            ),
        });
    }
    for (old, new) in stored.iter().zip(candidate) {
        if std::mem::discriminant(&old.target_type) != std::mem::discriminant(&new.target_type) {
            return Err(SyncError::SchemaDrift {
                table: table.to_string(),
                detail: format!(
                    "column {:?} changed from {} to {} ({} -> {}); run a full sync",
                    new.name,
                    old.source_type,
                    new.source_type,
                    old.target_type.ddl(),
                    new.target_type.ddl()
                ),
            });
        }
    }
    Ok(())
}
