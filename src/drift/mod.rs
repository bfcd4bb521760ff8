//! Drift detection and change-set synchronization.

pub mod changeset;
pub mod definition;
pub mod detector;
pub mod manager;
pub mod outbox;
pub mod pool;
pub mod scan;
pub mod schedule;
pub mod schedules_queue;
pub mod stream;
pub mod transport;

use std::path::PathBuf;

use thiserror::Error;

pub use changeset::{ChangeSetCategory, ChangeSetError, ChangeSetManager, EntryKind, FileEntry};
pub use definition::{DefinitionError, DriftDefinition, DriftFilter, FileFilter};
pub use detector::{DetectionListener, DriftDetectionSummary, DriftDetector, PassOutcome};
pub use manager::DriftManager;
pub use outbox::OutboxTransport;
pub use pool::DetectorPool;
pub use scan::ScanError;
pub use schedule::{DriftDetectionSchedule, ScheduleKey, ScheduleState};
pub use schedules_queue::{Deactivation, Removal, SchedulesQueue};
pub use stream::{NotifyingStream, StreamClose};
pub use transport::{DriftServerService, DriftSnapshot, TransportError};

/// Errors surfaced by detection passes and server hand-offs.
#[derive(Debug, Error)]
pub enum DriftError {
    #[error(transparent)]
    ChangeSet(#[from] ChangeSetError),
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error(transparent)]
    Definition(#[from] DefinitionError),
    #[error("Transport failed for resource {resource_id}: {source}")]
    Transport {
        resource_id: i32,
        source: TransportError,
    },
    #[error("Failed to prepare directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to start drift detector thread: {0}")]
    SpawnDetector(std::io::Error),
}
