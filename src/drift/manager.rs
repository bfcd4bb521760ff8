use std::{
    collections::BTreeSet,
    fs::{self, File},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use tracing::{debug, info, warn};

use super::{
    DriftError,
    changeset::{ChangeSetManager, ContentZip},
    definition::DriftDefinition,
    detector::{DetectionListener, DriftDetectionSummary, DriftDetector},
    pool::DetectorPool,
    schedule::{DriftDetectionSchedule, ScheduleKey},
    schedules_queue::{Removal, SchedulesQueue},
    stream::{NotifyingStream, StreamClose},
    transport::DriftServerService,
};

/// Owns the schedules queue and change-set storage, and talks to the server.
pub struct DriftManager {
    queue: Arc<SchedulesQueue>,
    change_sets: Arc<ChangeSetManager>,
    transport: Arc<dyn DriftServerService>,
    temp_dir: PathBuf,
}

impl DriftManager {
    /// Build a manager rooted at `data_dir`, creating both directories.
    pub fn new(
        data_dir: impl Into<PathBuf>,
        temp_dir: impl Into<PathBuf>,
        transport: Arc<dyn DriftServerService>,
    ) -> Result<Self, DriftError> {
        let change_sets = Arc::new(ChangeSetManager::new(data_dir));
        Self::with_change_set_manager(change_sets, temp_dir, transport)
    }

    pub fn with_change_set_manager(
        change_sets: Arc<ChangeSetManager>,
        temp_dir: impl Into<PathBuf>,
        transport: Arc<dyn DriftServerService>,
    ) -> Result<Self, DriftError> {
        let temp_dir = temp_dir.into();
        for dir in [change_sets.data_dir(), temp_dir.as_path()] {
            fs::create_dir_all(dir).map_err(|source| DriftError::CreateDir {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        let hook_change_sets = Arc::clone(&change_sets);
        let queue = Arc::new(SchedulesQueue::with_removal_hook(Box::new(move |schedule| {
            if let Err(err) = hook_change_sets
                .delete_change_set_directory(schedule.resource_id, &schedule.definition.name)
            {
                warn!(schedule = %schedule.key(), error = %err, "Failed to delete change-set directory");
            }
        })));
        Ok(Self {
            queue,
            change_sets,
            transport,
            temp_dir,
        })
    }

    pub fn schedules_queue(&self) -> &Arc<SchedulesQueue> {
        &self.queue
    }

    pub fn change_set_manager(&self) -> &Arc<ChangeSetManager> {
        &self.change_sets
    }

    /// Scratch directory handed to transports that stage uploads.
    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    /// Fetch definitions for `resource_ids` and schedule each one.
    ///
    /// A server snapshot seeds the local baseline when none exists yet.
    /// Returns the number of newly scheduled definitions.
    pub fn initialize(&self, resource_ids: &BTreeSet<i32>) -> Result<usize, DriftError> {
        let definitions = self
            .transport
            .get_drift_definitions(resource_ids)
            .map_err(|source| DriftError::Transport {
                resource_id: resource_ids.first().copied().unwrap_or_default(),
                source,
            })?;
        let mut scheduled = 0;
        for (resource_id, definitions) in definitions {
            for definition in definitions {
                if let Err(err) = self.seed_baseline(resource_id, &definition) {
                    warn!(
                        resource_id,
                        definition = %definition.name,
                        error = %err,
                        "Failed to seed baseline from server snapshot"
                    );
                }
                match self.schedule_drift_detection(resource_id, definition) {
                    Ok(true) => scheduled += 1,
                    Ok(false) => {}
                    Err(err) => warn!(resource_id, error = %err, "Skipping drift definition"),
                }
            }
        }
        info!(scheduled, "Drift detection initialized");
        Ok(scheduled)
    }

    fn seed_baseline(&self, resource_id: i32, definition: &DriftDefinition) -> Result<(), DriftError> {
        definition.validate()?;
        if self.change_sets.snapshot_exists(resource_id, &definition.name) {
            return Ok(());
        }
        let snapshot = self
            .transport
            .get_current_snapshot(definition.id)
            .map_err(|source| DriftError::Transport {
                resource_id,
                source,
            })?;
        if let Some(snapshot) = snapshot {
            self.change_sets
                .write_snapshot(resource_id, definition, snapshot.version, &snapshot.entries)?;
            debug!(resource_id, definition = %definition.name, version = snapshot.version, "Seeded baseline");
        }
        Ok(())
    }

    /// Validate and enqueue a definition, creating its change-set directory.
    ///
    /// Returns false if the schedule already exists. The directory is created
    /// only after the queue accepted the key, so a removal of the same key that
    /// is still deleting the old directory cannot delete the new one.
    pub fn schedule_drift_detection(
        &self,
        resource_id: i32,
        definition: DriftDefinition,
    ) -> Result<bool, DriftError> {
        definition.validate()?;
        definition.file_filter()?;
        let key = ScheduleKey::for_definition(resource_id, &definition);
        if !self.queue.add_schedule(resource_id, definition) {
            return Ok(false);
        }
        if let Err(err) = self
            .change_sets
            .create_change_set_dir(resource_id, &key.definition_name)
        {
            self.queue.remove_by_key(&key);
            return Err(err.into());
        }
        info!(schedule = %key, "Scheduled drift detection");
        Ok(true)
    }

    /// Run the next detection pass for a schedule as soon as a detector is free.
    ///
    /// Returns false if the schedule is unknown or a pass is already running.
    pub fn detect_now(&self, resource_id: i32, definition_name: &str) -> bool {
        self.queue
            .expedite(&ScheduleKey::new(resource_id, definition_name))
    }

    /// Replace the definition of an existing schedule.
    pub fn update_drift_detection(
        &self,
        resource_id: i32,
        definition: DriftDefinition,
    ) -> Result<bool, DriftError> {
        definition.validate()?;
        definition.file_filter()?;
        Ok(self.queue.update_schedule(resource_id, definition))
    }

    /// Remove a schedule. Its change-set directory is deleted now, or once
    /// the running detection pass finishes.
    pub fn unschedule_drift_detection(
        &self,
        resource_id: i32,
        definition: &DriftDefinition,
    ) -> Removal {
        let removal = self.queue.remove_schedule(resource_id, definition);
        info!(resource_id, definition = %definition.name, ?removal, "Unscheduled drift detection");
        removal
    }

    /// Stream the pending change-set zip to the server and ack it on success.
    ///
    /// A zip is built from the manifest of `summary.category` if none exists.
    pub fn send_change_set_to_server(
        &self,
        summary: &DriftDetectionSummary,
    ) -> Result<(), DriftError> {
        let resource_id = summary.resource_id();
        let name = summary.definition_name();
        let zip = match self.change_sets.latest_change_set_zip(resource_id, name)? {
            Some(zip) => zip,
            None => self
                .change_sets
                .zip_change_set(resource_id, name, summary.category)?,
        };
        let (file, size) = open_with_size(&zip)?;
        self.transport
            .send_change_set_zip(resource_id, size, NotifyingStream::new(file))
            .map_err(|source| DriftError::Transport {
                resource_id,
                source,
            })?;
        info!(
            resource_id,
            definition = name,
            category = %summary.category,
            repeat = summary.repeat,
            zip_size = size,
            "Sent change set"
        );
        self.ack_change_set(resource_id, name)
    }

    /// Zip `content/` and stream it to the server.
    ///
    /// The zip and the files it carries are deleted once the transport has
    /// read the stream to the end, closed it and returned `Ok`, in whichever
    /// order the last two happen. Returns false when there was nothing to
    /// send or an upload from this directory is still open.
    pub fn send_change_set_content_to_server(
        &self,
        resource_id: i32,
        definition_name: &str,
    ) -> Result<bool, DriftError> {
        let dir = self.change_sets.change_set_dir(resource_id, definition_name);
        if self.change_sets.content_in_flight(&dir) {
            debug!(resource_id, definition = definition_name, "Content upload still open");
            return Ok(false);
        }
        self.change_sets.discard_stale_content_zips(&dir)?;
        let Some(content) = self
            .change_sets
            .write_content_zip(resource_id, definition_name)?
        else {
            return Ok(false);
        };
        let (file, size) = open_with_size(&content.path)?;
        self.change_sets.mark_content_in_flight(&content.path);

        let upload = Arc::new(ContentUpload::new(Arc::clone(&self.change_sets), content));
        let on_close = Arc::clone(&upload);
        let stream = NotifyingStream::with_close_listener(file, move |close| on_close.closed(close));
        let sent = self.transport.send_files_zip(resource_id, size, stream);
        upload.answered(sent.is_ok());
        sent.map_err(|source| DriftError::Transport {
            resource_id,
            source,
        })?;
        info!(resource_id, definition = definition_name, zip_size = size, "Sent content");
        Ok(true)
    }

    pub fn ack_change_set(&self, resource_id: i32, definition_name: &str) -> Result<(), DriftError> {
        self.change_sets.ack_change_set(resource_id, definition_name)?;
        Ok(())
    }

    pub fn detector(self: &Arc<Self>) -> DriftDetector {
        DriftDetector::new(
            Arc::clone(&self.queue),
            Arc::clone(&self.change_sets),
            Arc::clone(self) as Arc<dyn DetectionListener>,
        )
    }

    /// Start `threads` detector workers polling every `poll_interval`.
    pub fn start_detection(
        self: &Arc<Self>,
        threads: usize,
        poll_interval: Duration,
    ) -> Result<DetectorPool, DriftError> {
        DetectorPool::spawn(Arc::new(self.detector()), threads, poll_interval)
            .map_err(DriftError::SpawnDetector)
    }

    /// Stop `pool` and wait for running passes to finish.
    pub fn shutdown(&self, mut pool: DetectorPool) {
        pool.shutdown();
        info!(schedules = self.queue.len(), "Drift detection stopped");
    }
}

impl DetectionListener for DriftManager {
    fn drift_detected(&self, summary: &DriftDetectionSummary) -> Result<(), DriftError> {
        self.send_change_set_to_server(summary)?;
        self.send_change_set_content_to_server(summary.resource_id(), summary.definition_name())?;
        Ok(())
    }

    fn content_pending(&self, schedule: &DriftDetectionSchedule) -> Result<(), DriftError> {
        self.send_change_set_content_to_server(schedule.resource_id, &schedule.definition.name)?;
        Ok(())
    }
}

/// One content upload whose fate depends on both the stream close and the
/// transport's answer; whichever arrives second settles it.
struct ContentUpload {
    change_sets: Arc<ChangeSetManager>,
    content: ContentZip,
    outcome: Mutex<UploadOutcome>,
}

#[derive(Default)]
struct UploadOutcome {
    close: Option<StreamClose>,
    accepted: Option<bool>,
}

impl ContentUpload {
    fn new(change_sets: Arc<ChangeSetManager>, content: ContentZip) -> Self {
        Self {
            change_sets,
            content,
            outcome: Mutex::new(UploadOutcome::default()),
        }
    }

    fn closed(&self, close: StreamClose) {
        let mut outcome = self.lock_outcome();
        outcome.close = Some(close);
        self.settle(&outcome);
    }

    fn answered(&self, accepted: bool) {
        let mut outcome = self.lock_outcome();
        outcome.accepted = Some(accepted);
        self.settle(&outcome);
    }

    fn settle(&self, outcome: &UploadOutcome) {
        let (Some(close), Some(accepted)) = (outcome.close, outcome.accepted) else {
            return;
        };
        if close.reached_eof && accepted {
            if let Err(err) = self.change_sets.ack_content(&self.content) {
                warn!(zip = %self.content.path.display(), error = %err, "Failed to clean up content");
            }
            return;
        }
        debug!(
            zip = %self.content.path.display(),
            bytes_read = close.bytes_read,
            accepted,
            "Content upload incomplete; keeping files for the next upload"
        );
        self.change_sets.release_content(&self.content.path);
    }

    fn lock_outcome(&self) -> MutexGuard<'_, UploadOutcome> {
        self.outcome.lock().unwrap_or_else(|poisoned| {
            warn!("Content upload lock poisoned; recovering.");
            poisoned.into_inner()
        })
    }
}

fn open_with_size(path: &Path) -> Result<(File, u64), DriftError> {
    let file = File::open(path).map_err(|source| DriftError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let size = file
        .metadata()
        .map_err(|source| DriftError::Open {
            path: path.to_path_buf(),
            source,
        })?
        .len();
    Ok((file, size))
}
