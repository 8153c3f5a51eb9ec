//! histmirror - mirrors history tables from a transactional source into an
//! embedded analytics store
//!
//! The core is four cooperating pieces:
//! - engine: schema inspection, type mapping, batched copy, checkpointing
//! - state: crash-safe watermarks, mappings, checkpoints and the sync lock
//! - worker: one background run with pause/resume/stop and an event stream
//! - scheduler: cron-recurring incremental triggers with overlap skip
//!
//! Callers drive it through [`SyncWorker`] (test/full/incremental runs,
//! `events`, `pause`, `resume`, `stop`, `status`) and [`Scheduler`]
//! (`register_recurring`, `cancel`, `list`). Everything else is plumbing.

pub mod analytics;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod logging;
pub mod mapper;
pub mod scheduler;
pub mod source;
pub mod state;
pub mod worker;

pub use config::Config;
pub use engine::{RunControl, RunOutcome, RunSummary, SyncEngine, SyncOptions};
pub use error::SyncError;
pub use events::{LogLevel, Phase, RunKind, SyncEvent};
pub use scheduler::{JobInfo, JobOptions, Scheduler};
pub use source::{Batch, SourceCursor, SourceReader, TableBinding, Value, Watermark};
pub use state::{ProgressCheckpoint, SchemaMapping, StateStore, SyncState, SyncStatus};
pub use worker::{RunSpec, SyncWorker, WorkerSettings, WorkerStatus};
