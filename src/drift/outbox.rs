//! Filesystem transport that spools archives into an outbox directory.
//!
//! Each upload lands in `<outbox>/<resource_id>/` and is recorded as one JSON
//! line in `<outbox>/receipts.jsonl`. A separate process ships the outbox.

use std::{
    collections::{BTreeSet, HashMap},
    fs::{self, File, OpenOptions},
    io::{self, BufWriter, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{
    changeset::ZipKind,
    definition::DriftDefinition,
    schedule::now_millis,
    stream::NotifyingStream,
    transport::{DriftServerService, DriftSnapshot, TransportError},
};

pub const RECEIPTS_FILE: &str = "receipts.jsonl";

/// One spooled archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub resource_id: i32,
    pub kind: ReceiptKind,
    pub file: PathBuf,
    pub size: u64,
    pub received_at_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptKind {
    ChangeSet,
    Content,
}

/// [`DriftServerService`] backed by local directories.
///
/// Definitions come from configuration; no server snapshots are available.
pub struct OutboxTransport {
    outbox_dir: PathBuf,
    temp_dir: PathBuf,
    definitions: HashMap<i32, Vec<DriftDefinition>>,
    receipts: Mutex<()>,
}

impl OutboxTransport {
    pub fn new(
        outbox_dir: impl Into<PathBuf>,
        temp_dir: impl Into<PathBuf>,
        definitions: HashMap<i32, Vec<DriftDefinition>>,
    ) -> Self {
        Self {
            outbox_dir: outbox_dir.into(),
            temp_dir: temp_dir.into(),
            definitions,
            receipts: Mutex::new(()),
        }
    }

    pub fn outbox_dir(&self) -> &Path {
        &self.outbox_dir
    }

    /// Parse every receipt written so far.
    pub fn read_receipts(&self) -> Result<Vec<Receipt>, TransportError> {
        let path = self.outbox_dir.join(RECEIPTS_FILE);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        text.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line).map_err(|err| {
                    TransportError::Io(io::Error::new(io::ErrorKind::InvalidData, err))
                })
            })
            .collect()
    }

    fn spool(
        &self,
        resource_id: i32,
        kind: ReceiptKind,
        zip_size: u64,
        mut stream: NotifyingStream,
    ) -> Result<(), TransportError> {
        fs::create_dir_all(&self.temp_dir)?;
        let part = self
            .temp_dir
            .join(format!("upload-{resource_id}-{:08x}.part", rand::random::<u32>()));
        let copied = copy_to(&mut stream, &part);
        stream.close();
        let copied = match copied {
            Ok(copied) => copied,
            Err(err) => {
                let _ = fs::remove_file(&part);
                return Err(err.into());
            }
        };
        if copied != zip_size {
            let _ = fs::remove_file(&part);
            return Err(TransportError::Rejected(format!(
                "expected {zip_size} bytes, received {copied}"
            )));
        }

        let dest_dir = self.outbox_dir.join(resource_id.to_string());
        fs::create_dir_all(&dest_dir)?;
        let zip_kind = match kind {
            ReceiptKind::ChangeSet => ZipKind::ChangeSet,
            ReceiptKind::Content => ZipKind::Content,
        };
        let received_at_ms = now_millis();
        let mut stamp = received_at_ms;
        let mut dest = dest_dir.join(zip_kind.file_name(stamp));
        while dest.exists() {
            stamp += 1;
            dest = dest_dir.join(zip_kind.file_name(stamp));
        }
        move_file(&part, &dest)?;
        self.append_receipt(&Receipt {
            resource_id,
            kind,
            file: dest.clone(),
            size: copied,
            received_at_ms,
        })?;
        info!(resource_id, file = %dest.display(), size = copied, "Spooled upload");
        Ok(())
    }

    fn append_receipt(&self, receipt: &Receipt) -> Result<(), TransportError> {
        let line = serde_json::to_string(receipt)
            .map_err(|err| TransportError::Io(io::Error::new(io::ErrorKind::InvalidData, err)))?;
        let _guard = self.receipts.lock().unwrap_or_else(|poisoned| {
            warn!("Outbox receipts lock poisoned; recovering.");
            poisoned.into_inner()
        });
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.outbox_dir.join(RECEIPTS_FILE))?;
        writeln!(file, "{line}")?;
        Ok(())
    }
}

impl DriftServerService for OutboxTransport {
    fn send_change_set_zip(
        &self,
        resource_id: i32,
        zip_size: u64,
        zip_stream: NotifyingStream,
    ) -> Result<(), TransportError> {
        self.spool(resource_id, ReceiptKind::ChangeSet, zip_size, zip_stream)
    }

    fn send_files_zip(
        &self,
        resource_id: i32,
        zip_size: u64,
        zip_stream: NotifyingStream,
    ) -> Result<(), TransportError> {
        self.spool(resource_id, ReceiptKind::Content, zip_size, zip_stream)
    }

    fn get_drift_definitions(
        &self,
        resource_ids: &BTreeSet<i32>,
    ) -> Result<HashMap<i32, Vec<DriftDefinition>>, TransportError> {
        Ok(self
            .definitions
            .iter()
            .filter(|(resource_id, _)| resource_ids.contains(resource_id))
            .map(|(resource_id, definitions)| (*resource_id, definitions.clone()))
            .collect())
    }

    fn get_current_snapshot(
        &self,
        _definition_id: i32,
    ) -> Result<Option<DriftSnapshot>, TransportError> {
        Ok(None)
    }
}

fn copy_to(stream: &mut NotifyingStream, path: &Path) -> io::Result<u64> {
    let mut writer = BufWriter::new(File::create(path)?);
    let copied = io::copy(stream, &mut writer)?;
    writer.into_inner().map_err(|err| err.into_error())?.sync_all()?;
    Ok(copied)
}

fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(_) => {
            fs::copy(from, to)?;
            fs::remove_file(from)
        }
    }
}
