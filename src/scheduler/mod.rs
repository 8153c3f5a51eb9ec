//! Recurring sync scheduler
//!
//! Named cron jobs that trigger incremental syncs through the worker. Each
//! job runs its own dispatcher task; a trigger that fires while a sync is
//! already active (worker busy or lock held elsewhere) is skipped with an
//! overlap log line - missed fires are never made up.

use crate::error::SyncError;
use crate::events::{LogLevel, RunKind};
use crate::source::{SourceReader, TableBinding};
use crate::worker::{RunSpec, SyncWorker};
use chrono::{DateTime, Utc};
use croner::parser::{CronParser, Seconds};
use croner::Cron;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Per-job knobs.
#[derive(Debug, Clone)]
pub struct JobOptions {
    /// Run a full sync for tables that have never been synced; otherwise
    /// triggers are incremental.
    pub full_when_uninitialized: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            full_when_uninitialized: true,
        }
    }
}

/// Snapshot of one registered job for `list()`.
#[derive(Debug, Clone)]
pub struct JobInfo {
    pub name: String,
    pub cron_expr: String,
    pub tables: Vec<String>,
    pub next_fire: Option<DateTime<Utc>>,
    pub last_fired: Option<DateTime<Utc>>,
    pub last_skipped: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct JobStats {
    last_fired: Option<DateTime<Utc>>,
    last_skipped: Option<DateTime<Utc>>,
}

struct Job {
    cron_expr: String,
    cron: Cron,
    bindings: Vec<TableBinding>,
    options: JobOptions,
    stats: Arc<Mutex<JobStats>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

/// The per-process schedule registry.
pub struct Scheduler<R: SourceReader + 'static> {
    worker: Arc<SyncWorker<R>>,
    jobs: Mutex<HashMap<String, Job>>,
    shutdown: CancellationToken,
    started: AtomicBool,
}

impl<R: SourceReader + 'static> Scheduler<R> {
    pub fn new(worker: Arc<SyncWorker<R>>) -> Self {
        Self {
            worker,
            jobs: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
        }
    }

    /// Register a recurring job. Rejects duplicate names and unparsable
    /// cron expressions. If the scheduler is already started the job's
    /// dispatcher spawns immediately.
    pub fn register_recurring(
        self: &Arc<Self>,
        name: &str,
        cron_expr: &str,
        bindings: Vec<TableBinding>,
        options: JobOptions,
    ) -> Result<(), SyncError> {
        let cron = CronParser::builder()
            .seconds(Seconds::Optional)
            .build()
            .parse(cron_expr)
            .map_err(|e| SyncError::ConfigInvalid(format!("cron {cron_expr:?}: {e}")))?;

        let mut jobs = self.jobs.lock().unwrap();
        if jobs.contains_key(name) {
            return Err(SyncError::ConfigInvalid(format!(
                "schedule {name:?} is already registered"
            )));
        }

        let mut job = Job {
            cron_expr: cron_expr.to_string(),
            cron,
            bindings,
            options,
            stats: Arc::new(Mutex::new(JobStats::default())),
            task: None,
        };
        if self.started.load(Ordering::SeqCst) {
            job.task = Some(self.spawn_dispatcher(name.to_string(), &job));
        }
        jobs.insert(name.to_string(), job);
        Ok(())
    }

    /// Remove a job, aborting its dispatcher. Unknown names are a no-op.
    pub fn cancel(&self, name: &str) {
        if let Some(job) = self.jobs.lock().unwrap().remove(name) {
            if let Some(task) = job.task {
                task.abort();
            }
        }
    }

    pub fn list(&self) -> Vec<JobInfo> {
        let now = Utc::now();
        self.jobs
            .lock()
            .unwrap()
            .iter()
            .map(|(name, job)| {
                let stats = job.stats.lock().unwrap();
                JobInfo {
                    name: name.clone(),
                    cron_expr: job.cron_expr.clone(),
                    tables: job
                        .bindings
                        .iter()
                        .map(|b| b.target_table.clone())
                        .collect(),
                    next_fire: job.cron.find_next_occurrence(&now, false).ok(),
                    last_fired: stats.last_fired,
                    last_skipped: stats.last_skipped,
                }
            })
            .collect()
    }

    /// Start dispatchers for every registered job. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut jobs = self.jobs.lock().unwrap();
        for (name, job) in jobs.iter_mut() {
            if job.task.is_none() {
                job.task = Some(self.spawn_dispatcher(name.clone(), job));
            }
        }
    }

    /// Stop all dispatchers, waiting up to `timeout` for them to wind down.
    /// Idempotent.
    pub async fn stop(&self, timeout: Duration) {
        self.shutdown.cancel();
        let tasks: Vec<_> = {
            let mut jobs = self.jobs.lock().unwrap();
            jobs.values_mut().filter_map(|job| job.task.take()).collect()
        };
        let _ = tokio::time::timeout(timeout, async {
            for task in tasks {
                let _ = task.await;
            }
        })
        .await;
        self.started.store(false, Ordering::SeqCst);
    }

    fn spawn_dispatcher(self: &Arc<Self>, name: String, job: &Job) -> tokio::task::JoinHandle<()> {
        let scheduler = Arc::clone(self);
        let cron = job.cron.clone();
        let bindings = job.bindings.clone();
        let options = job.options.clone();
        let stats = job.stats.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            tracing::info!("schedule {name}: dispatcher started");
            loop {
                let now = Utc::now();
                let next = match cron.find_next_occurrence(&now, false) {
                    Ok(next) => next,
                    Err(e) => {
                        tracing::error!("schedule {name}: no next occurrence: {e}");
                        break;
                    }
                };
                let wait = (next - now).to_std().unwrap_or(Duration::ZERO);

                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("schedule {name}: dispatcher stopping");
                        break;
                    }
                    _ = tokio::time::sleep(wait) => {
                        scheduler.fire(&name, &bindings, &options, &stats);
                    }
                }
            }
        })
    }

    /// One trigger: dispatch each binding through the worker, skipping on
    /// any kind of busy. The skipped fire is not made up.
    fn fire(
        &self,
        name: &str,
        bindings: &[TableBinding],
        options: &JobOptions,
        stats: &Arc<Mutex<JobStats>>,
    ) {
        for binding in bindings {
            let kind = self.kind_for(binding, options);
            let spec = RunSpec {
                kind,
                binding: binding.clone(),
                max_rows: None,
            };
            match self.worker.start(spec) {
                Ok(run_id) => {
                    stats.lock().unwrap().last_fired = Some(Utc::now());
                    tracing::info!(
                        "schedule {name}: started {} sync of {} (run {run_id})",
                        kind.as_str(),
                        binding.target_table
                    );
                }
                Err(e @ (SyncError::WorkerBusy | SyncError::LockBusy { .. })) => {
                    stats.lock().unwrap().last_skipped = Some(Utc::now());
                    let message = format!(
                        "schedule {name}: trigger for {} skipped, reason=overlap ({e})",
                        binding.target_table
                    );
                    tracing::info!("{message}");
                    self.worker.emit_log(LogLevel::Info, message);
                }
                Err(e) => {
                    stats.lock().unwrap().last_skipped = Some(Utc::now());
                    let message = format!(
                        "schedule {name}: trigger for {} failed to start: {e}",
                        binding.target_table
                    );
                    tracing::warn!("{message}");
                    self.worker.emit_log(LogLevel::Warn, message);
                }
            }
        }
    }

    /// Incremental by default; full for tables that have no sync state yet.
    fn kind_for(&self, binding: &TableBinding, options: &JobOptions) -> RunKind {
        if options.full_when_uninitialized {
            match self.worker.state_store().load_state(&binding.target_table) {
                Ok(Some(_)) => RunKind::Incremental,
                _ => RunKind::Full,
            }
        } else {
            RunKind::Incremental
        }
    }
}
