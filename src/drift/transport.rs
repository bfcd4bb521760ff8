use std::collections::{BTreeSet, HashMap};

use thiserror::Error;

use super::{changeset::FileEntry, definition::DriftDefinition, stream::NotifyingStream};

/// Failures reported by a server transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Server rejected upload: {0}")]
    Rejected(String),
    #[error("Server unavailable: {0}")]
    Unavailable(String),
    #[error("Transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Server-side snapshot of a definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriftSnapshot {
    pub version: i32,
    pub entries: Vec<FileEntry>,
}

/// Server boundary used by the drift engine.
///
/// Send operations take ownership of the stream. Dropping or closing it tells
/// the engine the transport is done reading.
pub trait DriftServerService: Send + Sync {
    fn send_change_set_zip(
        &self,
        resource_id: i32,
        zip_size: u64,
        zip_stream: NotifyingStream,
    ) -> Result<(), TransportError>;

    fn send_files_zip(
        &self,
        resource_id: i32,
        zip_size: u64,
        zip_stream: NotifyingStream,
    ) -> Result<(), TransportError>;

    fn get_drift_definitions(
        &self,
        resource_ids: &BTreeSet<i32>,
    ) -> Result<HashMap<i32, Vec<DriftDefinition>>, TransportError>;

    fn get_current_snapshot(
        &self,
        definition_id: i32,
    ) -> Result<Option<DriftSnapshot>, TransportError>;
}
