// Events that flow from a sync run to its subscribers
//
// Each run streams these over the worker's bounded channel; dashboards and
// the CLI drain them live. Using an enum allows pattern matching and keeps
// the wire format (JSON with a "type" discriminator) type-safe on both ends.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What kind of run produced an event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunKind {
    /// Disposable load into a `_test` table; never touches real state.
    Test,
    /// Fresh full load, target recreated.
    Full,
    /// Rows strictly above the stored watermark.
    Incremental,
}

impl RunKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunKind::Test => "test",
            RunKind::Full => "full",
            RunKind::Incremental => "incremental",
        }
    }
}

/// Pipeline phase a progress event was emitted from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Schema,
    Ddl,
    Copy,
    Finalize,
}

/// Severity for `Log` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// Main event type emitted over a run's event stream.
///
/// Ordering guarantees within one run: `Started` precedes everything,
/// `rows_done` never decreases, and exactly one of `Completed`, `Failed`
/// or `Stopped` closes the stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")] // Creates JSON like {"type": "progress", ...}
#[serde(rename_all = "snake_case")]
pub enum SyncEvent {
    /// A run began.
    Started {
        run_id: Uuid,
        kind: RunKind,
        table: String,
        timestamp: DateTime<Utc>,
    },

    /// Batch-level progress. `rows_total` is present only when the run has a
    /// known bound (test syncs). `dropped_events` reports how many progress
    /// events were discarded on channel overflow since the run started.
    Progress {
        run_id: Uuid,
        phase: Phase,
        rows_done: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        rows_total: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        eta_seconds: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        dropped_events: Option<u64>,
    },

    /// Free-form operational message tied to a run.
    Log {
        run_id: Uuid,
        level: LogLevel,
        message: String,
    },

    /// The pause gate closed; the engine is idling between batches.
    Paused { run_id: Uuid },

    /// The pause gate reopened.
    Resumed { run_id: Uuid },

    /// The run was cancelled cooperatively. Terminal.
    Stopped { run_id: Uuid, reason: String },

    /// The run failed. Terminal. `retryable` reflects whether a plain
    /// re-trigger is likely to succeed.
    Failed {
        run_id: Uuid,
        error_kind: String,
        message: String,
        retryable: bool,
    },

    /// The run finished. Terminal.
    Completed {
        run_id: Uuid,
        rows_loaded: u64,
        duration_seconds: f64,
    },
}

impl SyncEvent {
    /// True for the exactly-once closing events of a run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SyncEvent::Stopped { .. } | SyncEvent::Failed { .. } | SyncEvent::Completed { .. }
        )
    }

    /// True for events that may be dropped on channel overflow.
    pub fn is_droppable(&self) -> bool {
        matches!(self, SyncEvent::Progress { .. } | SyncEvent::Log { .. })
    }

    /// The run this event belongs to.
    pub fn run_id(&self) -> Uuid {
        match self {
            SyncEvent::Started { run_id, .. }
            | SyncEvent::Progress { run_id, .. }
            | SyncEvent::Log { run_id, .. }
            | SyncEvent::Paused { run_id }
            | SyncEvent::Resumed { run_id }
            | SyncEvent::Stopped { run_id, .. }
            | SyncEvent::Failed { run_id, .. }
            | SyncEvent::Completed { run_id, .. } => *run_id,
        }
    }
}
