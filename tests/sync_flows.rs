//! End-to-end sync scenarios over the in-memory source and a real
//! analytics store file.

use chrono::{Duration as ChronoDuration, NaiveDate};
use histmirror::analytics::AnalyticsWriter;
use histmirror::engine::{RunControl, RunOutcome, RunSummary, SyncEngine, SyncOptions};
use histmirror::source::memory::MemorySource;
use histmirror::source::{SourceColumn, SourceReader, Value};
use histmirror::state::{ProgressCheckpoint, StateStore};
use histmirror::{
    JobOptions, RunKind, RunSpec, Scheduler, SyncError, SyncEvent, SyncWorker, TableBinding,
    Watermark, WorkerSettings,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::StreamExt;

/// ISO timestamp `i` seconds past a fixed base, so row order equals
/// timestamp order.
fn ts(i: i64) -> String {
    let base = NaiveDate::from_ymd_opt(2024, 1, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap();
    (base + ChronoDuration::seconds(i))
        .format("%Y-%m-%dT%H:%M:%SZ")
        .to_string()
}

fn event_columns() -> Vec<SourceColumn> {
    vec![
        SourceColumn {
            name: "ID".into(),
            source_type: "NUMBER(10,0)".into(),
            nullable: false,
        },
        SourceColumn {
            name: "TS".into(),
            source_type: "TIMESTAMP".into(),
            nullable: false,
        },
        SourceColumn {
            name: "V".into(),
            source_type: "NUMBER(18,4)".into(),
            nullable: true,
        },
        SourceColumn {
            name: "NOTE".into(),
            source_type: "VARCHAR2(200)".into(),
            nullable: true,
        },
    ]
}

fn event_rows(from: i64, to: i64) -> Vec<Vec<Value>> {
    (from..=to)
        .map(|i| {
            vec![
                Value::Integer(i),
                Value::Text(ts(i)),
                Value::Text(format!("{}.{:04}", i, i % 10_000)),
                Value::Text(format!("note {i}")),
            ]
        })
        .collect()
}

fn binding(batch_size: usize) -> TableBinding {
    TableBinding {
        source_schema: None,
        source_table: "EVENTS".into(),
        target_table: "events".into(),
        primary_key: vec!["ID".into()],
        temporal_key: vec!["TS".into()],
        batch_size,
    }
}

struct Fixture {
    dir: tempfile::TempDir,
    source: MemorySource,
    state: StateStore,
    options: SyncOptions,
}

impl Fixture {
    fn new(rows: i64) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let source = MemorySource::new();
        source.add_table("EVENTS", event_columns(), event_rows(1, rows));
        let state = StateStore::open(dir.path().join("state")).unwrap();
        Self {
            dir,
            source,
            state,
            options: SyncOptions::default(),
        }
    }

    fn writer(&self) -> AnalyticsWriter {
        AnalyticsWriter::open(&self.dir.path().join("analytics.duckdb"), "analytics").unwrap()
    }

    fn run(&self, kind: RunKind, binding: &TableBinding) -> (RunSummary, Vec<SyncEvent>) {
        let writer = self.writer();
        let engine = SyncEngine::new(
            &self.source,
            &writer,
            &self.state,
            &self.options,
            RunControl::default(),
        );
        let mut events = Vec::new();
        let summary = match kind {
            RunKind::Full => engine.full_sync(binding, &mut events),
            RunKind::Incremental => engine.incremental_sync(binding, &mut events),
            RunKind::Test => engine.test_sync(binding, 0, &mut events),
        };
        (summary, events)
    }
}

fn rows_loaded(summary: &RunSummary) -> u64 {
    match &summary.outcome {
        RunOutcome::Completed { rows_loaded, .. } => *rows_loaded,
        other => panic!("expected completion, got {other:?}"),
    }
}

fn copy_batches(events: &[SyncEvent]) -> Vec<u64> {
    // rows_done deltas across copy-phase progress events = batch sizes.
    let mut sizes = Vec::new();
    let mut prev = 0;
    for event in events {
        if let SyncEvent::Progress {
            phase: histmirror::Phase::Copy,
            rows_done,
            ..
        } = event
        {
            if *rows_done > prev {
                sizes.push(rows_done - prev);
                prev = *rows_done;
            }
        }
    }
    sizes
}

// S1: full sync of 25k rows in batches of 10k.
#[test]
fn s1_full_sync_happy_path() {
    let fx = Fixture::new(25_000);
    let (summary, events) = fx.run(RunKind::Full, &binding(10_000));

    assert_eq!(rows_loaded(&summary), 25_000);
    assert_eq!(copy_batches(&events), vec![10_000, 10_000, 5_000]);

    let writer = fx.writer();
    assert_eq!(writer.row_count("events").unwrap(), 25_000);

    // Mapped column types landed in the store's catalog.
    let types: Vec<(String, String)> = {
        let mut stmt = writer
            .connection()
            .prepare(
                "SELECT column_name, data_type FROM information_schema.columns \
                 WHERE table_schema = 'analytics' AND table_name = 'events' \
                 ORDER BY ordinal_position",
            )
            .unwrap();
        stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .unwrap()
            .map(|r| r.unwrap())
            .collect()
    };
    assert_eq!(types[0].0, "id");
    assert_eq!(types[0].1, "INTEGER");
    assert_eq!(types[1].0, "ts");
    assert_eq!(types[1].1, "TIMESTAMP");
    assert_eq!(types[2].0, "v");
    assert_eq!(types[2].1, "DECIMAL(18,4)");
    assert_eq!(types[3].0, "note");
    assert_eq!(types[3].1, "VARCHAR");

    // Watermark is the max TS.
    let state = fx.state.load_state("events").unwrap().unwrap();
    assert_eq!(state.last_watermark, Some(Watermark::single(ts(25_000))));
}

// S2 and S3: immediate no-op, then 1,234 fresh rows in batches of 500.
#[test]
fn s2_s3_incremental_noop_then_new_rows() {
    let fx = Fixture::new(2_000);
    fx.run(RunKind::Full, &binding(1_000));
    let watermark_after_full = fx
        .state
        .load_state("events")
        .unwrap()
        .unwrap()
        .last_watermark;

    // S2: nothing new.
    let (summary, _) = fx.run(RunKind::Incremental, &binding(500));
    assert_eq!(rows_loaded(&summary), 0);
    let state = fx.state.load_state("events").unwrap().unwrap();
    assert_eq!(state.last_watermark, watermark_after_full);

    // S3: 1,234 rows past the watermark.
    fx.source.push_rows("EVENTS", event_rows(2_001, 3_234));
    let (summary, events) = fx.run(RunKind::Incremental, &binding(500));
    assert_eq!(rows_loaded(&summary), 1_234);
    assert_eq!(copy_batches(&events), vec![500, 500, 234]);
    assert_eq!(fx.writer().row_count("events").unwrap(), 3_234);

    let state = fx.state.load_state("events").unwrap().unwrap();
    assert_eq!(state.last_watermark, Some(Watermark::single(ts(3_234))));
    assert_eq!(state.total_rows, 3_234);
    assert_eq!(state.last_batch_count, 234);
}

// S4: crash after an acknowledged insert but before finalize; the next run
// resumes from the checkpoint watermark with no duplicates and no gaps.
#[test]
fn s4_crash_mid_run_resumes_from_checkpoint() {
    let fx = Fixture::new(1_000);
    fx.run(RunKind::Full, &binding(500));

    // 600 new source rows. Simulate a run that crashed after landing the
    // first 300 of them: rows are in the target, the checkpoint records
    // their watermark, but state was never finalized.
    fx.source.push_rows("EVENTS", event_rows(1_001, 1_600));
    {
        let writer = fx.writer();
        let columns: Vec<_> = fx.source.describe(&binding(500)).unwrap();
        let specs = columns
            .iter()
            .map(|c| histmirror::mapper::ColumnSpec {
                name: c.name.to_ascii_lowercase(),
                source_type: c.source_type.clone(),
                target_type: histmirror::mapper::map_source_type(&c.name, &c.source_type).unwrap(),
                nullable: c.nullable,
                is_primary_key: c.name == "ID",
                is_temporal: c.name == "TS",
            })
            .collect::<Vec<_>>();
        let landed = histmirror::Batch::from_rows(
            vec!["id".into(), "ts".into(), "v".into(), "note".into()],
            event_rows(1_001, 1_300),
            &["ts".to_string()],
        );
        writer.insert_batch("events", &specs, &landed).unwrap();
    }
    fx.state
        .write_checkpoint(&ProgressCheckpoint {
            run_id: uuid::Uuid::new_v4(),
            target_table: "events".into(),
            rows_done: 300,
            rows_total: None,
            last_batch_watermark: Some(Watermark::single(ts(1_300))),
            started_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        })
        .unwrap();

    // Restart: the incremental run picks up at the checkpoint watermark.
    let (summary, _) = fx.run(RunKind::Incremental, &binding(500));
    assert_eq!(rows_loaded(&summary), 300);
    assert_eq!(fx.writer().row_count("events").unwrap(), 1_600);

    // No duplicates: every id appears exactly once.
    let distinct: i64 = fx
        .writer()
        .connection()
        .query_row(
            "SELECT count(DISTINCT \"id\") FROM \"analytics\".\"events\"",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(distinct, 1_600);

    // Finalize cleared the checkpoint and advanced the watermark.
    assert!(fx.state.load_checkpoint("events").unwrap().is_none());
    let state = fx.state.load_state("events").unwrap().unwrap();
    assert_eq!(state.last_watermark, Some(Watermark::single(ts(1_600))));
}

// S5: a column's storage class changes; incremental refuses with
// SchemaDrift, writes nothing, leaves the checkpoint alone.
#[test]
fn s5_type_drift_fails_incremental() {
    let fx = Fixture::new(100);
    fx.run(RunKind::Full, &binding(50));
    let count_before = fx.writer().row_count("events").unwrap();

    // A checkpoint that must survive the failed run untouched.
    let checkpoint = ProgressCheckpoint {
        run_id: uuid::Uuid::new_v4(),
        target_table: "events".into(),
        rows_done: 42,
        rows_total: None,
        last_batch_watermark: Some(Watermark::single(ts(60))),
        started_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
    };
    fx.state.write_checkpoint(&checkpoint).unwrap();

    // V: NUMBER(18,4) -> VARCHAR2(64).
    let mut columns = event_columns();
    columns[2].source_type = "VARCHAR2(64)".into();
    fx.source.add_table("EVENTS", columns, event_rows(1, 100));

    let (summary, events) = fx.run(RunKind::Incremental, &binding(50));
    match &summary.outcome {
        RunOutcome::Failed(SyncError::SchemaDrift { .. }) => {}
        other => panic!("expected SchemaDrift, got {other:?}"),
    }
    match events.last().unwrap() {
        SyncEvent::Failed { error_kind, .. } => assert_eq!(error_kind, "SchemaDrift"),
        other => panic!("expected Failed event, got {other:?}"),
    }

    assert_eq!(fx.writer().row_count("events").unwrap(), count_before);
    let kept = fx.state.load_checkpoint("events").unwrap().unwrap();
    assert_eq!(kept.run_id, checkpoint.run_id);
    assert_eq!(kept.rows_done, 42);
}

// Property 1: across successful incremental runs the watermark never
// regresses and always equals the max temporal value loaded.
#[test]
fn watermark_is_monotonic_across_runs() {
    let fx = Fixture::new(10);
    fx.run(RunKind::Full, &binding(4));
    let mut previous = fx
        .state
        .load_state("events")
        .unwrap()
        .unwrap()
        .last_watermark
        .unwrap();

    let mut next_id = 11;
    for chunk in [7i64, 0, 3, 12] {
        if chunk > 0 {
            fx.source
                .push_rows("EVENTS", event_rows(next_id, next_id + chunk - 1));
            next_id += chunk;
        }
        let (summary, _) = fx.run(RunKind::Incremental, &binding(4));
        assert_eq!(rows_loaded(&summary), chunk as u64);

        let current = fx
            .state
            .load_state("events")
            .unwrap()
            .unwrap()
            .last_watermark
            .unwrap();
        assert!(current >= previous, "watermark regressed");
        assert_eq!(current, Watermark::single(ts(next_id - 1)));
        previous = current;
    }
    assert_eq!(
        fx.writer().row_count("events").unwrap(),
        (next_id - 1) as u64
    );
}

// Boundary: batch_size = 1 still loads everything exactly once.
#[test]
fn batch_size_one_boundary() {
    let fx = Fixture::new(7);
    let (summary, events) = fx.run(RunKind::Full, &binding(1));
    assert_eq!(rows_loaded(&summary), 7);
    assert_eq!(copy_batches(&events).len(), 7);
    assert_eq!(fx.writer().row_count("events").unwrap(), 7);
}

// Property 6 over the real channel: Started first, one terminal event,
// rows_done non-decreasing.
#[tokio::test]
async fn worker_event_stream_ordering() {
    let dir = tempfile::tempdir().unwrap();
    let source = MemorySource::new();
    source.add_table("EVENTS", event_columns(), event_rows(1, 2_000));
    let worker = Arc::new(
        SyncWorker::new(
            Arc::new(source),
            WorkerSettings {
                analytics_path: dir.path().join("analytics.duckdb"),
                database: "analytics".into(),
                state_dir: dir.path().join("state"),
                options: SyncOptions::default(),
                lock_stale_after: Duration::from_secs(1800),
                lock_timeout: Duration::ZERO,
                channel_capacity: 1_000,
            },
        )
        .unwrap(),
    );

    let mut stream = worker.events().unwrap();
    worker
        .start(RunSpec {
            kind: RunKind::Full,
            binding: binding(100),
            max_rows: None,
        })
        .unwrap();

    let mut collected = Vec::new();
    while let Some(event) = stream.next().await {
        let terminal = event.is_terminal();
        collected.push(event);
        if terminal {
            break;
        }
    }

    assert!(matches!(collected.first(), Some(SyncEvent::Started { .. })));
    assert_eq!(collected.iter().filter(|e| e.is_terminal()).count(), 1);
    let mut prev = 0;
    for event in &collected {
        if let SyncEvent::Progress { rows_done, .. } = event {
            assert!(*rows_done >= prev);
            prev = *rows_done;
        }
    }
    match collected.last().unwrap() {
        SyncEvent::Completed { rows_loaded, .. } => assert_eq!(*rows_loaded, 2_000),
        other => panic!("expected Completed, got {other:?}"),
    }
}

// S6: a scheduled trigger firing while a manual sync holds the lock is
// skipped with an overlap log; the manual run is unaffected.
#[tokio::test]
async fn s6_concurrent_trigger_skips() {
    let dir = tempfile::tempdir().unwrap();
    let source = MemorySource::new();
    source.add_table("EVENTS", event_columns(), event_rows(1, 10));
    let worker = Arc::new(
        SyncWorker::new(
            Arc::new(source),
            WorkerSettings {
                analytics_path: dir.path().join("analytics.duckdb"),
                database: "analytics".into(),
                state_dir: dir.path().join("state"),
                options: SyncOptions::default(),
                lock_stale_after: Duration::from_secs(1800),
                lock_timeout: Duration::ZERO,
                channel_capacity: 1_000,
            },
        )
        .unwrap(),
    );
    let mut events = worker.events().unwrap();

    // The "manual fullSync" in another process: it holds the sync lock.
    let manual = worker
        .sync_lock()
        .acquire("manual-full-sync", Duration::ZERO)
        .unwrap();

    let scheduler = Arc::new(Scheduler::new(worker.clone()));
    scheduler
        .register_recurring(
            "minutely",
            "* * * * * *",
            vec![binding(100)],
            JobOptions::default(),
        )
        .unwrap();
    scheduler.start();

    // The trigger observes LockBusy and skips.
    let overlap = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Some(SyncEvent::Log { message, .. }) = events.next().await {
                if message.contains("reason=overlap") {
                    return message;
                }
            }
        }
    })
    .await
    .expect("no overlap log within deadline");
    assert!(overlap.contains("minutely"));
    assert!(scheduler.list()[0].last_skipped.is_some());

    // Manual run finishes (releases the lock); the next trigger goes
    // through and completes a full sync of the never-synced table.
    drop(manual);
    let completed = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Some(SyncEvent::Completed { rows_loaded, .. }) = events.next().await {
                return rows_loaded;
            }
        }
    })
    .await
    .expect("no completion within deadline");
    assert_eq!(completed, 10);

    scheduler.stop(Duration::from_secs(2)).await;
}
