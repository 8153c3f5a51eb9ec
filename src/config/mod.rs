//! Configuration for the sync core
//!
//! Configuration is loaded in order of precedence:
//! 1. Environment variables `HISTMIRROR_*` (highest priority)
//! 2. Config file (~/.config/histmirror/config.toml or --config path)
//! 3. Built-in defaults (lowest priority)
//!
//! The core itself only ever sees the assembled [`Config`] value; nothing
//! in the engine reads the environment.

use crate::engine::retry::RetryPolicy;
use crate::engine::SyncOptions;
use crate::error::SyncError;
use crate::source::TableBinding;
use crate::worker::WorkerSettings;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Source database connection parameters.
///
/// The password deliberately has no `Debug`/display path anywhere in this
/// crate; error messages and logs only ever name host and service.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub host: String,
    pub port: u16,
    pub service: String,
    pub user: String,
    pub password: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1521,
            service: "ORCLPDB1".into(),
            user: String::new(),
            password: String::new(),
        }
    }
}

impl std::fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("service", &self.service)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl SourceConfig {
    /// ODBC connection string for the source. Contains the password; never
    /// log the result.
    pub fn connection_string(&self) -> String {
        format!(
            "DRIVER={{Oracle}};DBQ={}:{}/{};UID={};PWD={}",
            self.host, self.port, self.service, self.user, self.password
        )
    }
}

/// Where the analytics store lives.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    pub path: PathBuf,
    /// Logical database (schema) inside the store.
    pub database: String,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/analytics.duckdb"),
            database: "analytics".into(),
        }
    }
}

/// Per-run knobs, file-level counterpart of [`SyncOptions`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub batch_size: usize,
    pub max_duration_seconds: u64,
    pub max_iterations: u64,
    pub retry: RetryPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 10_000,
            max_duration_seconds: 3_600,
            max_iterations: 100_000,
            retry: RetryPolicy::default(),
        }
    }
}

/// A named recurring schedule over configured tables.
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    pub name: String,
    pub cron: String,
    /// Target table names; must match `[[tables]]` entries.
    pub tables: Vec<String>,
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub source: SourceConfig,
    pub analytics: AnalyticsConfig,
    /// Directory for state, mapping, checkpoint and lock files.
    pub state_dir: PathBuf,
    /// Staleness threshold for forced lock takeover.
    pub lock_stale_seconds: u64,
    pub sync: SyncConfig,
    /// Event channel bound.
    pub progress_channel_capacity: usize,
    /// Tables this deployment mirrors.
    pub tables: Vec<TableBinding>,
    pub schedules: Vec<ScheduleConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source: SourceConfig::default(),
            analytics: AnalyticsConfig::default(),
            state_dir: PathBuf::from("./data/state"),
            lock_stale_seconds: 1_800,
            sync: SyncConfig::default(),
            progress_channel_capacity: 1_000,
            tables: Vec::new(),
            schedules: Vec::new(),
        }
    }
}

/// Config file structure (everything optional; absent keys keep defaults).
#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileConfig {
    pub source: Option<SourceConfig>,
    pub analytics: Option<AnalyticsConfig>,
    pub state_dir: Option<PathBuf>,
    pub lock_stale_seconds: Option<u64>,
    pub sync: Option<SyncConfig>,
    pub progress_channel_capacity: Option<usize>,
    #[serde(default)]
    pub tables: Vec<TableBinding>,
    #[serde(default)]
    pub schedules: Vec<ScheduleConfig>,
}

impl Config {
    /// Default config file location.
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("histmirror").join("config.toml"))
    }

    /// Assemble the effective configuration: defaults, then the file (an
    /// explicit path or the default location), then the environment.
    /// Validates before returning.
    pub fn load(file: Option<&Path>) -> Result<Self, SyncError> {
        let mut config = Config::default();

        let path = file.map(PathBuf::from).or_else(Self::config_path);
        if let Some(path) = path {
            match std::fs::read_to_string(&path) {
                Ok(text) => {
                    let parsed: FileConfig = toml::from_str(&text).map_err(|e| {
                        SyncError::ConfigInvalid(format!("{}: {e}", path.display()))
                    })?;
                    config.apply_file(parsed);
                }
                // A missing default-location file means defaults; a missing
                // explicit file is an operator mistake.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    if file.is_some() {
                        return Err(SyncError::ConfigInvalid(format!(
                            "config file {} not found",
                            path.display()
                        )));
                    }
                }
                Err(e) => {
                    return Err(SyncError::ConfigInvalid(format!("{}: {e}", path.display())))
                }
            }
        }

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub(crate) fn apply_file(&mut self, file: FileConfig) {
        if let Some(source) = file.source {
            self.source = source;
        }
        if let Some(analytics) = file.analytics {
            self.analytics = analytics;
        }
        if let Some(state_dir) = file.state_dir {
            self.state_dir = state_dir;
        }
        if let Some(stale) = file.lock_stale_seconds {
            self.lock_stale_seconds = stale;
        }
        if let Some(sync) = file.sync {
            self.sync = sync;
        }
        if let Some(capacity) = file.progress_channel_capacity {
            self.progress_channel_capacity = capacity;
        }
        if !file.tables.is_empty() {
            self.tables = file.tables;
        }
        if !file.schedules.is_empty() {
            self.schedules = file.schedules;
        }
    }

    fn apply_env(&mut self) {
        fn var(name: &str) -> Option<String> {
            std::env::var(name).ok().filter(|v| !v.is_empty())
        }
        if let Some(host) = var("HISTMIRROR_SOURCE_HOST") {
            self.source.host = host;
        }
        if let Some(port) = var("HISTMIRROR_SOURCE_PORT").and_then(|v| v.parse().ok()) {
            self.source.port = port;
        }
        if let Some(service) = var("HISTMIRROR_SOURCE_SERVICE") {
            self.source.service = service;
        }
        if let Some(user) = var("HISTMIRROR_SOURCE_USER") {
            self.source.user = user;
        }
        if let Some(password) = var("HISTMIRROR_SOURCE_PASSWORD") {
            self.source.password = password;
        }
        if let Some(path) = var("HISTMIRROR_ANALYTICS_PATH") {
            self.analytics.path = PathBuf::from(path);
        }
        if let Some(database) = var("HISTMIRROR_ANALYTICS_DATABASE") {
            self.analytics.database = database;
        }
        if let Some(dir) = var("HISTMIRROR_STATE_DIR") {
            self.state_dir = PathBuf::from(dir);
        }
        if let Some(batch) = var("HISTMIRROR_BATCH_SIZE").and_then(|v| v.parse().ok()) {
            self.sync.batch_size = batch;
        }
    }

    /// Fail fast on configuration that could never run.
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.sync.batch_size < 1 {
            return Err(SyncError::ConfigInvalid("sync.batch_size must be >= 1".into()));
        }
        if self.sync.max_iterations < 1 {
            return Err(SyncError::ConfigInvalid(
                "sync.max_iterations must be >= 1".into(),
            ));
        }
        if self.progress_channel_capacity < 1 {
            return Err(SyncError::ConfigInvalid(
                "progress_channel_capacity must be >= 1".into(),
            ));
        }
        if self.analytics.path.as_os_str().is_empty() {
            return Err(SyncError::ConfigInvalid("analytics.path is empty".into()));
        }
        for binding in &self.tables {
            crate::analytics::quote_identifier(&binding.target_table)?;
            if binding.batch_size < 1 {
                return Err(SyncError::ConfigInvalid(format!(
                    "table {}: batch_size must be >= 1",
                    binding.target_table
                )));
            }
        }
        for schedule in &self.schedules {
            for table in &schedule.tables {
                if !self.tables.iter().any(|b| &b.target_table == table) {
                    return Err(SyncError::ConfigInvalid(format!(
                        "schedule {:?} references unknown table {table:?}",
                        schedule.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Look up a configured table binding by target name.
    pub fn binding(&self, target_table: &str) -> Option<&TableBinding> {
        self.tables.iter().find(|b| b.target_table == target_table)
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            max_duration: Duration::from_secs(self.sync.max_duration_seconds),
            max_iterations: self.sync.max_iterations,
            retry: self.sync.retry.clone(),
            pause_poll: Duration::from_millis(250),
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            analytics_path: self.analytics.path.clone(),
            database: self.analytics.database.clone(),
            state_dir: self.state_dir.clone(),
            options: self.sync_options(),
            lock_stale_after: Duration::from_secs(self.lock_stale_seconds),
            lock_timeout: Duration::ZERO,
            channel_capacity: self.progress_channel_capacity,
        }
    }

    /// Render the effective configuration as a TOML document, suitable for
    /// `config --show` and for seeding a fresh config file. The source
    /// password is always written as a placeholder.
    pub fn to_toml(&self) -> String {
        let mut out = String::new();
        out.push_str("# histmirror configuration\n\n");
        // Top-level keys must precede any table header.
        out.push_str(&format!(
            "state_dir = {:?}\n",
            self.state_dir.display().to_string()
        ));
        out.push_str(&format!("lock_stale_seconds = {}\n", self.lock_stale_seconds));
        out.push_str(&format!(
            "progress_channel_capacity = {}\n\n",
            self.progress_channel_capacity
        ));
        out.push_str("[source]\n");
        out.push_str(&format!("host = {:?}\n", self.source.host));
        out.push_str(&format!("port = {}\n", self.source.port));
        out.push_str(&format!("service = {:?}\n", self.source.service));
        out.push_str(&format!("user = {:?}\n", self.source.user));
        out.push_str("password = \"\"  # set via HISTMIRROR_SOURCE_PASSWORD\n\n");
        out.push_str("[analytics]\n");
        out.push_str(&format!("path = {:?}\n", self.analytics.path.display().to_string()));
        out.push_str(&format!("database = {:?}\n\n", self.analytics.database));
        out.push_str("[sync]\n");
        out.push_str(&format!("batch_size = {}\n", self.sync.batch_size));
        out.push_str(&format!(
            "max_duration_seconds = {}\n",
            self.sync.max_duration_seconds
        ));
        out.push_str(&format!("max_iterations = {}\n\n", self.sync.max_iterations));
        out.push_str("[sync.retry]\n");
        out.push_str(&format!("max_attempts = {}\n", self.sync.retry.max_attempts));
        out.push_str(&format!("base_ms = {}\n", self.sync.retry.base_ms));
        out.push_str(&format!("cap_ms = {}\n", self.sync.retry.cap_ms));
        out.push_str(&format!("jitter = {}\n", self.sync.retry.jitter));
        for binding in &self.tables {
            out.push_str("\n[[tables]]\n");
            if let Some(schema) = &binding.source_schema {
                out.push_str(&format!("source_schema = {schema:?}\n"));
            }
            out.push_str(&format!("source_table = {:?}\n", binding.source_table));
            out.push_str(&format!("target_table = {:?}\n", binding.target_table));
            out.push_str(&format!("primary_key = {:?}\n", binding.primary_key));
            out.push_str(&format!("temporal_key = {:?}\n", binding.temporal_key));
            out.push_str(&format!("batch_size = {}\n", binding.batch_size));
        }
        for schedule in &self.schedules {
            out.push_str("\n[[schedules]]\n");
            out.push_str(&format!("name = {:?}\n", schedule.name));
            out.push_str(&format!("cron = {:?}\n", schedule.cron));
            out.push_str(&format!("tables = {:?}\n", schedule.tables));
        }
        out
    }
}
