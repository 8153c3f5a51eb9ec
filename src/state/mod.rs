//! Persistent sync state
//!
//! Per-table watermarks, schema mappings and in-flight checkpoints live as
//! JSON files under the configured state directory:
//!
//! ```text
//! <state.dir>/
//!   sync.lock                    # lock record (see lock module)
//!   state/<table>.json           # SyncState
//!   mappings/<table>.json        # SchemaMapping
//!   progress/<table>.json        # ProgressCheckpoint (runtime)
//!   history.jsonl                # terminal events, one JSON object per line
//! ```
//!
//! Every write is atomic and durable: serialize to a temp sibling, fsync the
//! file, rename over the target, fsync the directory. A reader racing a
//! writer sees either the old record or the new one, never a torn file.

use crate::error::SyncError;
use crate::events::SyncEvent;
use crate::mapper::ColumnSpec;
use crate::source::Watermark;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub mod lock;

/// Lifecycle of a table's sync, as persisted between runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Idle,
    Running,
    Paused,
    Failed,
    Stopped,
}

/// Per-table sync state. `last_watermark` only ever advances after a batch
/// whose insert was acknowledged by the analytics store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncState {
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_watermark: Option<Watermark>,
    pub last_batch_count: u64,
    /// Rows loaded since the last full sync.
    pub total_rows: u64,
    pub mapping_version: u32,
    pub status: SyncStatus,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            last_sync_at: None,
            last_watermark: None,
            last_batch_count: 0,
            total_rows: 0,
            mapping_version: 0,
            status: SyncStatus::Idle,
        }
    }
}

/// The column mapping in force for a target table. `version` bumps only when
/// the column set or a mapped type changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaMapping {
    pub version: u32,
    pub columns: Vec<ColumnSpec>,
    pub created_at: DateTime<Utc>,
}

/// Ephemeral record of an in-flight run, written after every batch and
/// removed on finalize. Its presence after a crash is the resume signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressCheckpoint {
    pub run_id: Uuid,
    pub target_table: String,
    pub rows_done: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_total: Option<u64>,
    /// Largest temporal tuple definitely persisted by an acknowledged insert.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_batch_watermark: Option<Watermark>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// JSON persistence rooted at the configured state directory.
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    /// Open the store, creating the directory layout if missing.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, SyncError> {
        let root = root.as_ref().to_path_buf();
        for sub in ["state", "mappings", "progress"] {
            fs::create_dir_all(root.join(sub))
                .map_err(|e| SyncError::StateWriteError(format!("create {sub}: {e}")))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join("sync.lock")
    }

    fn state_path(&self, table: &str) -> PathBuf {
        self.root.join("state").join(format!("{table}.json"))
    }

    fn mapping_path(&self, table: &str) -> PathBuf {
        self.root.join("mappings").join(format!("{table}.json"))
    }

    fn checkpoint_path(&self, table: &str) -> PathBuf {
        self.root.join("progress").join(format!("{table}.json"))
    }

    pub fn load_state(&self, table: &str) -> Result<Option<SyncState>, SyncError> {
        read_json(&self.state_path(table))
    }

    pub fn save_state(&self, table: &str, state: &SyncState) -> Result<(), SyncError> {
        write_json_atomic(&self.state_path(table), state)
    }

    pub fn load_mapping(&self, table: &str) -> Result<Option<SchemaMapping>, SyncError> {
        read_json(&self.mapping_path(table))
    }

    /// Store a mapping, bumping `version` iff the columns differ from what is
    /// already stored. Returns the mapping now in force.
    pub fn save_mapping(
        &self,
        table: &str,
        columns: Vec<ColumnSpec>,
    ) -> Result<SchemaMapping, SyncError> {
        let mapping = match self.load_mapping(table)? {
            Some(existing) if existing.columns == columns => existing,
            Some(existing) => SchemaMapping {
                version: existing.version + 1,
                columns,
                created_at: Utc::now(),
            },
            None => SchemaMapping {
                version: 1,
                columns,
                created_at: Utc::now(),
            },
        };
        write_json_atomic(&self.mapping_path(table), &mapping)?;
        Ok(mapping)
    }

    /// Full syncs re-derive the schema from scratch: version restarts at 1.
    pub fn reset_mapping(
        &self,
        table: &str,
        columns: Vec<ColumnSpec>,
    ) -> Result<SchemaMapping, SyncError> {
        let mapping = SchemaMapping {
            version: 1,
            columns,
            created_at: Utc::now(),
        };
        write_json_atomic(&self.mapping_path(table), &mapping)?;
        Ok(mapping)
    }

    pub fn write_checkpoint(&self, checkpoint: &ProgressCheckpoint) -> Result<(), SyncError> {
        write_json_atomic(&self.checkpoint_path(&checkpoint.target_table), checkpoint)
    }

    pub fn load_checkpoint(&self, table: &str) -> Result<Option<ProgressCheckpoint>, SyncError> {
        read_json(&self.checkpoint_path(table))
    }

    pub fn clear_checkpoint(&self, table: &str) -> Result<(), SyncError> {
        match fs::remove_file(self.checkpoint_path(table)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SyncError::StateWriteError(e.to_string())),
        }
    }

    /// Append a terminal event to the run history log. Best-effort: failures
    /// are logged and swallowed so they can never fail a run.
    pub fn append_history(&self, event: &SyncEvent) {
        let path = self.root.join("history.jsonl");
        let result = (|| -> std::io::Result<()> {
            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
            let json = serde_json::to_string(event).map_err(std::io::Error::other)?;
            writeln!(file, "{json}")?;
            file.flush()
        })();
        if let Err(e) = result {
            tracing::warn!("failed to append run history to {path:?}: {e}");
        }
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, SyncError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(SyncError::StateCorrupt {
                path: path.display().to_string(),
                detail: e.to_string(),
            })
        }
    };
    serde_json::from_str(&text)
        .map(Some)
        .map_err(|e| SyncError::StateCorrupt {
            path: path.display().to_string(),
            detail: e.to_string(),
        })
}

/// write-temp + fsync + rename + fsync-dir. The rename is what makes racing
/// readers safe; the two fsyncs are what make a crash safe.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), SyncError> {
    let io_err = |e: std::io::Error| SyncError::StateWriteError(format!("{}: {e}", path.display()));

    let mut json = serde_json::to_string_pretty(value)
        .map_err(|e| SyncError::StateWriteError(e.to_string()))?;
    json.push('\n');

    let dir = path
        .parent()
        .ok_or_else(|| SyncError::StateWriteError(format!("{} has no parent", path.display())))?;
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| SyncError::StateWriteError(format!("bad path {}", path.display())))?;
    let tmp = dir.join(format!(".{file_name}.tmp"));

    {
        let mut file = File::create(&tmp).map_err(io_err)?;
        file.write_all(json.as_bytes()).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
    }
    fs::rename(&tmp, path).map_err(io_err)?;

    // Durability of the rename itself.
    #[cfg(unix)]
    {
        File::open(dir).map_err(io_err)?.sync_all().map_err(io_err)?;
    }
    Ok(())
}
