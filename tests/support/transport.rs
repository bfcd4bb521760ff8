use std::{
    collections::{BTreeSet, HashMap},
    io::Read,
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use drift_agent::drift::{
    DriftDefinition, DriftServerService, DriftSnapshot, NotifyingStream, TransportError,
};

/// In-memory server that records everything it is sent.
#[derive(Default)]
pub struct RecordingTransport {
    pub change_set_zips: Mutex<Vec<(i32, Vec<u8>)>>,
    pub content_zips: Mutex<Vec<(i32, Vec<u8>)>>,
    /// Content streams kept open when `hold_content` is set.
    pub held_streams: Mutex<Vec<NotifyingStream>>,
    pub definitions: Mutex<HashMap<i32, Vec<DriftDefinition>>>,
    pub snapshots: Mutex<HashMap<i32, DriftSnapshot>>,
    hold_content: AtomicBool,
    failing_change_sets: AtomicUsize,
    failing_contents: AtomicUsize,
    rejecting_contents: AtomicUsize,
}

impl RecordingTransport {
    pub fn hold_content_streams(&self, hold: bool) {
        self.hold_content.store(hold, Ordering::SeqCst);
    }

    /// Reject the next `count` change-set uploads.
    pub fn fail_next_change_sets(&self, count: usize) {
        self.failing_change_sets.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` content uploads without reading them.
    pub fn fail_next_contents(&self, count: usize) {
        self.failing_contents.store(count, Ordering::SeqCst);
    }

    /// Read and close the next `count` content uploads, then reject them.
    pub fn reject_next_contents_after_read(&self, count: usize) {
        self.rejecting_contents.store(count, Ordering::SeqCst);
    }

    pub fn take_held_stream(&self) -> NotifyingStream {
        self.held_streams.lock().unwrap().remove(0)
    }

    pub fn change_set_count(&self) -> usize {
        self.change_set_zips.lock().unwrap().len()
    }

    pub fn last_change_set(&self) -> Vec<u8> {
        self.change_set_zips.lock().unwrap().last().unwrap().1.clone()
    }

    pub fn last_content(&self) -> Vec<u8> {
        self.content_zips.lock().unwrap().last().unwrap().1.clone()
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
        .is_ok()
}

fn drain(mut stream: NotifyingStream) -> std::io::Result<Vec<u8>> {
    let mut bytes = Vec::new();
    stream.read_to_end(&mut bytes)?;
    stream.close();
    Ok(bytes)
}

impl DriftServerService for RecordingTransport {
    fn send_change_set_zip(
        &self,
        resource_id: i32,
        zip_size: u64,
        zip_stream: NotifyingStream,
    ) -> Result<(), TransportError> {
        if take_one(&self.failing_change_sets) {
            return Err(TransportError::Unavailable("server offline".into()));
        }
        let bytes = drain(zip_stream)?;
        assert_eq!(bytes.len() as u64, zip_size);
        self.change_set_zips.lock().unwrap().push((resource_id, bytes));
        Ok(())
    }

    fn send_files_zip(
        &self,
        resource_id: i32,
        zip_size: u64,
        zip_stream: NotifyingStream,
    ) -> Result<(), TransportError> {
        if self.hold_content.load(Ordering::SeqCst) {
            self.held_streams.lock().unwrap().push(zip_stream);
            return Ok(());
        }
        if take_one(&self.failing_contents) {
            return Err(TransportError::Unavailable("server offline".into()));
        }
        let bytes = drain(zip_stream)?;
        assert_eq!(bytes.len() as u64, zip_size);
        if take_one(&self.rejecting_contents) {
            return Err(TransportError::Rejected("content checksum mismatch".into()));
        }
        self.content_zips.lock().unwrap().push((resource_id, bytes));
        Ok(())
    }

    fn get_drift_definitions(
        &self,
        resource_ids: &BTreeSet<i32>,
    ) -> Result<HashMap<i32, Vec<DriftDefinition>>, TransportError> {
        Ok(self
            .definitions
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| resource_ids.contains(id))
            .map(|(id, defs)| (*id, defs.clone()))
            .collect())
    }

    fn get_current_snapshot(
        &self,
        definition_id: i32,
    ) -> Result<Option<DriftSnapshot>, TransportError> {
        Ok(self.snapshots.lock().unwrap().get(&definition_id).cloned())
    }
}
