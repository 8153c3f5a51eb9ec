//! Sync worker
//!
//! Wraps one engine invocation in a dedicated background thread and exposes
//! the control surface: start, pause/resume, stop, a bounded event stream,
//! and live status. Exactly one run may be active per worker.
//!
//! The event channel is bounded. Progress and Log events are sent with
//! `try_send` and dropped on overflow (the drop count surfaces in the next
//! delivered progress event); lifecycle events are sent blocking and are
//! never dropped.

use crate::analytics::AnalyticsWriter;
use crate::engine::{EventSink, RunControl, RunOutcome, SyncEngine, SyncOptions};
use crate::error::SyncError;
use crate::events::{LogLevel, RunKind, SyncEvent};
use crate::source::{SourceReader, TableBinding};
use crate::state::lock::SyncLock;
use crate::state::{StateStore, SyncState, SyncStatus};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

/// What to run.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub kind: RunKind,
    pub binding: TableBinding,
    /// Row cap; only meaningful for test runs.
    pub max_rows: Option<u64>,
}

/// Live status of the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Idle,
    Running,
    Paused,
    Failed,
    Completed,
    Stopped,
}

/// Everything a worker needs besides the source reader.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub analytics_path: PathBuf,
    pub database: String,
    pub state_dir: PathBuf,
    pub options: SyncOptions,
    pub lock_stale_after: Duration,
    /// How long `start` waits for the sync lock before reporting busy.
    pub lock_timeout: Duration,
    pub channel_capacity: usize,
}

pub struct SyncWorker<R: SourceReader + 'static> {
    reader: Arc<R>,
    settings: WorkerSettings,
    state: Arc<StateStore>,
    lock: Arc<SyncLock>,
    events_tx: mpsc::Sender<SyncEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<SyncEvent>>>,
    busy: Arc<AtomicBool>,
    pause: Arc<AtomicBool>,
    control: Mutex<Option<RunControl>>,
    status: Arc<Mutex<WorkerStatus>>,
}

impl<R: SourceReader + 'static> SyncWorker<R> {
    pub fn new(reader: Arc<R>, settings: WorkerSettings) -> Result<Self, SyncError> {
        let state = Arc::new(StateStore::open(&settings.state_dir)?);
        let lock = Arc::new(SyncLock::new(state.lock_path(), settings.lock_stale_after));
        let (events_tx, events_rx) = mpsc::channel(settings.channel_capacity.max(1));
        Ok(Self {
            reader,
            settings,
            state,
            lock,
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            busy: Arc::new(AtomicBool::new(false)),
            pause: Arc::new(AtomicBool::new(false)),
            control: Mutex::new(None),
            status: Arc::new(Mutex::new(WorkerStatus::Idle)),
        })
    }

    /// Spawn a run. Non-blocking; returns the run id whose events will
    /// follow on the stream. Fails fast with `WorkerBusy` when a run is
    /// active or `LockBusy` when another process holds the sync lock.
    pub fn start(&self, spec: RunSpec) -> Result<Uuid, SyncError> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SyncError::WorkerBusy);
        }

        // Everything that can fail does so here, before the thread spawns,
        // so start-time failures are plain errors rather than run events.
        let setup = (|| -> Result<_, SyncError> {
            let holder = format!("histmirror-{}", std::process::id());
            let lock_handle = self.lock.acquire(&holder, self.settings.lock_timeout)?;
            let writer =
                AnalyticsWriter::open(&self.settings.analytics_path, &self.settings.database)?;
            Ok((lock_handle, writer))
        })();
        let (mut lock_handle, writer) = match setup {
            Ok(pair) => pair,
            Err(e) => {
                self.busy.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let run_id = Uuid::new_v4();
        let control = RunControl {
            pause: self.pause.clone(),
            ..RunControl::default()
        };
        *self.control.lock().unwrap() = Some(control.clone());

        let reader = self.reader.clone();
        let state = self.state.clone();
        let options = self.settings.options.clone();
        let busy = self.busy.clone();
        let status = self.status.clone();
        let tx = self.events_tx.clone();
        let takeover = lock_handle.taken_over.take();

        std::thread::Builder::new()
            .name("sync-worker".into())
            .spawn(move || {
                let mut sink = ChannelSink { tx, dropped: 0 };
                if let Some(prior) = takeover {
                    sink.emit(SyncEvent::Log {
                        run_id,
                        level: LogLevel::Warn,
                        message: format!("replaced stale sync lock held by {prior}"),
                    });
                }

                let summary = {
                    let engine = SyncEngine::new(&*reader, &writer, &state, &options, control);
                    engine.execute(run_id, spec.kind, &spec.binding, spec.max_rows, &mut sink)
                };

                *status.lock().unwrap() = match summary.outcome {
                    RunOutcome::Completed { .. } => WorkerStatus::Completed,
                    RunOutcome::Stopped { .. } => WorkerStatus::Stopped,
                    RunOutcome::Failed(_) => WorkerStatus::Failed,
                };
                // The store connection must close before the next run can
                // open it; only then does the worker stop being busy.
                drop(writer);
                lock_handle.release();
                busy.store(false, Ordering::SeqCst);
            })
            .map_err(|e| {
                self.busy.store(false, Ordering::SeqCst);
                SyncError::StateWriteError(format!("failed to spawn worker thread: {e}"))
            })?;

        Ok(run_id)
    }

    /// Close the pause gate. The engine observes it at the next batch
    /// boundary and idles until `resume`.
    pub fn pause(&self) {
        self.pause.store(true, Ordering::SeqCst);
    }

    /// Reopen the pause gate.
    pub fn resume(&self) {
        self.pause.store(false, Ordering::SeqCst);
    }

    /// Raise the cancel signal. Observed within one batch boundary or one
    /// pause-poll interval, whichever comes first.
    pub fn stop(&self, reason: &str) {
        if let Some(control) = self.control.lock().unwrap().as_ref() {
            *control.stop_reason.lock().unwrap() = Some(reason.to_string());
            control.cancel.cancel();
        }
    }

    /// The event stream. Single consumer: the first call takes it, later
    /// calls return None.
    pub fn events(&self) -> Option<ReceiverStream<SyncEvent>> {
        self.events_rx
            .lock()
            .unwrap()
            .take()
            .map(ReceiverStream::new)
    }

    /// Live status. While a run is active this is derived from the pause
    /// gate; afterwards it reflects the last run's terminal outcome.
    pub fn status(&self) -> WorkerStatus {
        if self.busy.load(Ordering::SeqCst) {
            if self.pause.load(Ordering::SeqCst) {
                WorkerStatus::Paused
            } else {
                WorkerStatus::Running
            }
        } else {
            *self.status.lock().unwrap()
        }
    }

    /// Persisted per-table state merged with live worker status, for
    /// dashboards polling a single call.
    pub fn table_status(&self, table: &str) -> Result<SyncState, SyncError> {
        let mut state = self.state.load_state(table)?.unwrap_or_default();
        if self.busy.load(Ordering::SeqCst) {
            state.status = match self.status() {
                WorkerStatus::Paused => SyncStatus::Paused,
                _ => SyncStatus::Running,
            };
        }
        Ok(state)
    }

    pub fn state_store(&self) -> &StateStore {
        &self.state
    }

    /// Inject an operational log line into the event stream. Used by the
    /// scheduler for trigger-level messages that belong to no run.
    pub(crate) fn emit_log(&self, level: LogLevel, message: String) {
        let _ = self.events_tx.try_send(SyncEvent::Log {
            run_id: Uuid::nil(),
            level,
            message,
        });
    }

    pub fn sync_lock(&self) -> &SyncLock {
        &self.lock
    }
}

/// Forwards engine events into the bounded channel, counting drops.
struct ChannelSink {
    tx: mpsc::Sender<SyncEvent>,
    dropped: u64,
}

impl EventSink for ChannelSink {
    fn emit(&mut self, mut event: SyncEvent) {
        if event.is_droppable() {
            if self.dropped > 0 {
                if let SyncEvent::Progress { dropped_events, .. } = &mut event {
                    *dropped_events = Some(self.dropped);
                }
            }
            if self.tx.try_send(event).is_err() {
                self.dropped += 1;
            }
        } else {
            // Lifecycle events are never dropped; block until there is room.
            let _ = self.tx.blocking_send(event);
        }
    }
}
