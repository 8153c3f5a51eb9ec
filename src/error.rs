//! Error taxonomy for the sync core
//!
//! Every failure a run can hit maps to exactly one variant here, and each
//! variant carries a fixed retryability classification. Retryable means a
//! plain re-trigger of the run is likely to succeed (transient network or
//! write hiccups); everything else needs operator action first.
//!
//! Cancellation is deliberately NOT part of this enum. A stopped run is a
//! normal terminal outcome (`SyncEvent::Stopped`), not an error.

use thiserror::Error;

/// Errors produced by the sync core.
///
/// Messages never include connection secrets; connection failures carry the
/// driver's text with credentials already absent (we only ever format host
/// and service, never the password).
#[derive(Debug, Error)]
pub enum SyncError {
    /// Missing or invalid configuration. Fail fast, never enter the run loop.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Could not reach or handshake with the source database.
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    /// Transient failure while reading from an open source cursor.
    #[error("source read failed: {0}")]
    SourceReadError(String),

    /// A required table is missing from the catalog.
    #[error("table {table:?} not found")]
    SchemaUnknown { table: String },

    /// A source column's type has no mapping to an analytics type.
    #[error("column {column:?} has unmappable source type {source_type:?}")]
    TypeUnmappable { column: String, source_type: String },

    /// Transient failure appending a batch to the analytics store.
    #[error("analytics write failed: {0}")]
    AnalyticsWriteError(String),

    /// DDL against the analytics store failed.
    #[error("analytics DDL failed: {0}")]
    AnalyticsDdlError(String),

    /// The source column set no longer matches the stored mapping.
    /// Incremental sync refuses to continue; run a full sync.
    #[error("schema drift on {table:?}: {detail}")]
    SchemaDrift { table: String, detail: String },

    /// A state file exists but cannot be parsed. Refuse to run until an
    /// operator inspects it.
    #[error("state file {path:?} is corrupt: {detail}")]
    StateCorrupt { path: String, detail: String },

    /// Writing a state, mapping or checkpoint file failed.
    #[error("state write failed: {0}")]
    StateWriteError(String),

    /// The sync lock is held by another process.
    #[error("sync lock held by {holder} for {age_secs}s")]
    LockBusy { holder: String, age_secs: u64 },

    /// The worker already has an active run.
    #[error("worker busy: a run is already active")]
    WorkerBusy,

    /// The run exceeded its wall-clock budget.
    #[error("run exceeded max duration of {limit_secs}s")]
    Timeout { limit_secs: u64 },

    /// The batch loop exceeded its iteration budget.
    #[error("run exceeded max iterations ({limit})")]
    IterationCap { limit: u64 },
}

impl SyncError {
    /// Whether a plain re-trigger of the same run is likely to succeed.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            SyncError::SourceUnavailable(_)
                | SyncError::SourceReadError(_)
                | SyncError::AnalyticsWriteError(_)
                | SyncError::StateWriteError(_)
                | SyncError::LockBusy { .. }
                | SyncError::WorkerBusy
        )
    }

    /// Stable kind string for the event wire format.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::ConfigInvalid(_) => "ConfigInvalid",
            SyncError::SourceUnavailable(_) => "SourceUnavailable",
            SyncError::SourceReadError(_) => "SourceReadError",
            SyncError::SchemaUnknown { .. } => "SchemaUnknown",
            SyncError::TypeUnmappable { .. } => "TypeUnmappable",
            SyncError::AnalyticsWriteError(_) => "AnalyticsWriteError",
            SyncError::AnalyticsDdlError(_) => "AnalyticsDDLError",
            SyncError::SchemaDrift { .. } => "SchemaDrift",
            SyncError::StateCorrupt { .. } => "StateCorrupt",
            SyncError::StateWriteError(_) => "StateWriteError",
            SyncError::LockBusy { .. } => "LockBusy",
            SyncError::WorkerBusy => "WorkerBusy",
            SyncError::Timeout { .. } => "Timeout",
            SyncError::IterationCap { .. } => "IterationCap",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_errors_are_retryable() {
        assert!(SyncError::SourceReadError("timeout".into()).retryable());
        assert!(SyncError::AnalyticsWriteError("io".into()).retryable());
        assert!(SyncError::LockBusy {
            holder: "other".into(),
            age_secs: 10
        }
        .retryable());
    }

    #[test]
    fn fatal_errors_are_not_retryable() {
        assert!(!SyncError::TypeUnmappable {
            column: "V".into(),
            source_type: "SDO_GEOMETRY".into()
        }
        .retryable());
        assert!(!SyncError::SchemaDrift {
            table: "events".into(),
            detail: "column set changed".into()
        }
        .retryable());
        assert!(!SyncError::Timeout { limit_secs: 3600 }.retryable());
    }

    #[test]
    fn kind_strings_are_stable() {
        assert_eq!(
            SyncError::AnalyticsDdlError("x".into()).kind(),
            "AnalyticsDDLError"
        );
        assert_eq!(SyncError::IterationCap { limit: 5 }.kind(), "IterationCap");
    }
}
