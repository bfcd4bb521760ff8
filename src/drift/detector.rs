use std::sync::{Arc, atomic::AtomicBool};

use tracing::{debug, info, warn};

use super::{
    DriftError,
    changeset::{
        ChangeSetCategory, ChangeSetError, ChangeSetManager, EntryKind, FileEntry, NewChangeSet,
    },
    scan,
    schedule::{DriftDetectionSchedule, ScheduleKey},
    schedules_queue::SchedulesQueue,
};

/// Result of one detection pass, handed to a [`DetectionListener`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriftDetectionSummary {
    pub schedule: DriftDetectionSchedule,
    pub category: ChangeSetCategory,
    /// Transmitted entries; empty when `repeat` is set.
    pub entries: Vec<FileEntry>,
    pub version: i32,
    /// Re-send of an archive the server has not acknowledged yet.
    pub repeat: bool,
}

impl DriftDetectionSummary {
    pub fn resource_id(&self) -> i32 {
        self.schedule.resource_id
    }

    pub fn definition_name(&self) -> &str {
        &self.schedule.definition.name
    }

    pub fn count(&self, kind: EntryKind) -> usize {
        self.entries.iter().filter(|entry| entry.kind == kind).count()
    }
}

/// Receives summaries that need to reach the server.
pub trait DetectionListener: Send + Sync {
    fn drift_detected(&self, summary: &DriftDetectionSummary) -> Result<(), DriftError>;

    /// Nothing drifted, but `content/` still holds files from an earlier pass
    /// whose upload failed or was skipped.
    fn content_pending(&self, schedule: &DriftDetectionSchedule) -> Result<(), DriftError>;
}

/// What a single [`DriftDetector::run_once`] call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    /// No schedule was due.
    Idle,
    /// A change set was handed to the listener.
    Reported(DriftDetectionSummary),
    /// Nothing changed since the baseline.
    Unchanged(ScheduleKey),
    /// The definition is disabled.
    Skipped(ScheduleKey),
    /// The pass failed; the schedule is retried on its next interval.
    Failed(ScheduleKey),
}

/// Runs detection passes for due schedules.
pub struct DriftDetector {
    queue: Arc<SchedulesQueue>,
    change_sets: Arc<ChangeSetManager>,
    listener: Arc<dyn DetectionListener>,
}

impl DriftDetector {
    pub fn new(
        queue: Arc<SchedulesQueue>,
        change_sets: Arc<ChangeSetManager>,
        listener: Arc<dyn DetectionListener>,
    ) -> Self {
        Self {
            queue,
            change_sets,
            listener,
        }
    }

    /// Run a pass for the earliest due schedule, if any.
    ///
    /// The schedule is always handed back to the queue, whatever the pass did.
    pub fn run_once(&self, cancel: Option<&AtomicBool>) -> PassOutcome {
        let Some(schedule) = self.queue.get_next_schedule() else {
            return PassOutcome::Idle;
        };
        let _active = ActiveSchedule {
            queue: &self.queue,
            key: schedule.key(),
        };
        match self.detect(&schedule, cancel) {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(schedule = %schedule.key(), error = %err, "Drift detection pass failed");
                PassOutcome::Failed(schedule.key())
            }
        }
    }

    fn detect(
        &self,
        schedule: &DriftDetectionSchedule,
        cancel: Option<&AtomicBool>,
    ) -> Result<PassOutcome, DriftError> {
        let resource_id = schedule.resource_id;
        let definition = &schedule.definition;
        if !definition.enabled {
            debug!(schedule = %schedule.key(), "Skipping disabled drift definition");
            return Ok(PassOutcome::Skipped(schedule.key()));
        }

        if self.change_sets.has_pending_upload(resource_id, &definition.name)? {
            let version = self
                .change_sets
                .read_snapshot(resource_id, &definition.name)?
                .map(|snapshot| snapshot.headers.version)
                .unwrap_or(0);
            let summary = DriftDetectionSummary {
                schedule: schedule.clone(),
                category: self.change_sets.pending_category(resource_id, &definition.name),
                entries: Vec::new(),
                version,
                repeat: true,
            };
            info!(schedule = %schedule.key(), "Re-sending unacknowledged change set");
            self.listener.drift_detected(&summary)?;
            return Ok(PassOutcome::Reported(summary));
        }

        let baseline = match self.change_sets.read_snapshot(resource_id, &definition.name) {
            Ok(baseline) => baseline,
            Err(err @ ChangeSetError::Malformed { .. }) => {
                warn!(
                    schedule = %schedule.key(),
                    error = %err,
                    "Ignoring unreadable snapshot; taking a new coverage snapshot"
                );
                None
            }
            Err(err) => return Err(err.into()),
        };
        let filter = definition.file_filter()?;
        let current = scan::scan_directory(&definition.base_dir, &filter, cancel)?;
        let snapshot = scan::snapshot_entries(&current);

        let (category, delta, version) = match &baseline {
            None => (ChangeSetCategory::Coverage, snapshot.clone(), 0),
            Some(baseline) => {
                let delta = scan::diff(&baseline.hashes_by_path(), &current);
                if delta.is_empty() {
                    debug!(schedule = %schedule.key(), "No drift detected");
                    if self
                        .change_sets
                        .has_pending_content(resource_id, &definition.name)?
                    {
                        info!(schedule = %schedule.key(), "Retrying leftover content upload");
                        self.listener.content_pending(schedule)?;
                    }
                    return Ok(PassOutcome::Unchanged(schedule.key()));
                }
                (
                    ChangeSetCategory::Drift,
                    delta,
                    baseline.headers.version.saturating_add(1),
                )
            }
        };

        for entry in delta.iter().filter(|entry| entry.kind != EntryKind::Removed) {
            let (Some(file), Some(sha)) = (current.get(&entry.path), entry.new_sha.as_deref()) else {
                continue;
            };
            self.change_sets
                .store_content(resource_id, &definition.name, &file.absolute, sha)?;
        }

        let written = self.change_sets.write_change_set(
            resource_id,
            definition,
            NewChangeSet {
                category,
                version,
                delta: &delta,
                snapshot: &snapshot,
            },
        );
        if let Err(err) = written {
            if let Err(rollback) = self
                .change_sets
                .rollback(resource_id, &definition.name, category)
            {
                warn!(schedule = %schedule.key(), error = %rollback, "Rollback failed");
            }
            return Err(err.into());
        }

        let summary = DriftDetectionSummary {
            schedule: schedule.clone(),
            category,
            entries: delta,
            version,
            repeat: false,
        };
        info!(
            schedule = %schedule.key(),
            %category,
            version,
            added = summary.count(EntryKind::Added),
            changed = summary.count(EntryKind::Changed),
            removed = summary.count(EntryKind::Removed),
            "Drift detection produced a change set"
        );
        self.listener.drift_detected(&summary)?;
        Ok(PassOutcome::Reported(summary))
    }
}

/// Hands the schedule back to the queue when the pass ends, even on panic.
struct ActiveSchedule<'a> {
    queue: &'a SchedulesQueue,
    key: ScheduleKey,
}

impl Drop for ActiveSchedule<'_> {
    fn drop(&mut self) {
        self.queue.deactivate_schedule(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drift::definition::DriftFilter;
    use crate::drift::schedule::ScheduleState;
    use crate::drift::{DriftDefinition, changeset::PREVIOUS_CHANGE_SET_FILE};
    use std::{sync::Mutex, time::Duration};
    use tempfile::{TempDir, tempdir};

    #[derive(Default)]
    struct Recording {
        summaries: Mutex<Vec<DriftDetectionSummary>>,
        content_retries: Mutex<Vec<ScheduleKey>>,
        fail: bool,
    }

    impl DetectionListener for Recording {
        fn drift_detected(&self, summary: &DriftDetectionSummary) -> Result<(), DriftError> {
            self.summaries.lock().unwrap().push(summary.clone());
            if self.fail {
                return Err(DriftError::Transport {
                    resource_id: summary.resource_id(),
                    source: crate::drift::TransportError::Unavailable("offline".into()),
                });
            }
            Ok(())
        }

        fn content_pending(&self, schedule: &DriftDetectionSchedule) -> Result<(), DriftError> {
            self.content_retries.lock().unwrap().push(schedule.key());
            Ok(())
        }
    }

    struct Fixture {
        _data: TempDir,
        base: TempDir,
        queue: Arc<SchedulesQueue>,
        change_sets: Arc<ChangeSetManager>,
        listener: Arc<Recording>,
        detector: DriftDetector,
    }

    fn fixture(fail: bool) -> Fixture {
        let data = tempdir().unwrap();
        let base = tempdir().unwrap();
        let queue = Arc::new(SchedulesQueue::new());
        let change_sets = Arc::new(ChangeSetManager::new(data.path()));
        let listener = Arc::new(Recording {
            fail,
            ..Recording::default()
        });
        let detector = DriftDetector::new(
            Arc::clone(&queue),
            Arc::clone(&change_sets),
            Arc::clone(&listener) as Arc<dyn DetectionListener>,
        );
        Fixture {
            _data: data,
            base,
            queue,
            change_sets,
            listener,
            detector,
        }
    }

    fn definition(fixture: &Fixture) -> DriftDefinition {
        DriftDefinition::new(5, "detector", fixture.base.path())
            .with_interval(Duration::from_secs(3600))
    }

    // The hour-long interval keeps the schedule idle until expedited.
    fn rerun(fixture: &Fixture) -> PassOutcome {
        assert_eq!(fixture.detector.run_once(None), PassOutcome::Idle);
        assert!(fixture.queue.expedite(&ScheduleKey::new(1, "detector")));
        fixture.detector.run_once(None)
    }

    #[test]
    fn idle_queue_does_nothing() {
        let fixture = fixture(false);
        assert_eq!(fixture.detector.run_once(None), PassOutcome::Idle);
    }

    #[test]
    fn first_pass_is_coverage_and_second_pass_without_changes_is_silent() {
        let fixture = fixture(false);
        std::fs::write(fixture.base.path().join("a.conf"), "a=1").unwrap();
        let def = definition(&fixture);
        fixture.queue.add_schedule(1, def.clone());

        let PassOutcome::Reported(summary) = fixture.detector.run_once(None) else {
            panic!("expected a coverage report");
        };
        assert_eq!(summary.category, ChangeSetCategory::Coverage);
        assert_eq!(summary.count(EntryKind::Added), 1);
        assert!(!summary.repeat);
        fixture.change_sets.ack_change_set(1, "detector").unwrap();

        assert!(matches!(
            rerun(&fixture),
            PassOutcome::Unchanged(_)
        ));
        assert_eq!(fixture.listener.summaries.lock().unwrap().len(), 1);
    }

    #[test]
    fn unchanged_pass_retries_leftover_content() {
        let fixture = fixture(false);
        std::fs::write(fixture.base.path().join("a.conf"), "a=1").unwrap();
        let def = definition(&fixture);
        fixture.queue.add_schedule(1, def.clone());
        fixture.detector.run_once(None);
        fixture.change_sets.ack_change_set(1, "detector").unwrap();
        assert!(fixture.change_sets.has_pending_content(1, "detector").unwrap());

        assert!(matches!(
            rerun(&fixture),
            PassOutcome::Unchanged(_)
        ));
        assert_eq!(
            *fixture.listener.content_retries.lock().unwrap(),
            vec![ScheduleKey::for_definition(1, &def)]
        );
    }

    #[cfg(unix)]
    #[test]
    fn file_names_with_line_breaks_keep_a_usable_baseline() {
        let fixture = fixture(false);
        std::fs::write(fixture.base.path().join("a\nb"), "a=1").unwrap();
        fixture.queue.add_schedule(1, definition(&fixture));
        let PassOutcome::Reported(summary) = fixture.detector.run_once(None) else {
            panic!("expected a coverage report");
        };
        assert_eq!(summary.entries[0].path, "a\nb");
        fixture.change_sets.ack_change_set(1, "detector").unwrap();

        assert!(matches!(
            rerun(&fixture),
            PassOutcome::Unchanged(_)
        ));
        std::fs::write(fixture.base.path().join("a\nb"), "a=2").unwrap();
        let PassOutcome::Reported(summary) = rerun(&fixture) else {
            panic!("expected a drift report");
        };
        assert_eq!(summary.category, ChangeSetCategory::Drift);
    }

    #[test]
    fn empty_base_dir_still_reports_coverage() {
        let fixture = fixture(false);
        fixture.queue.add_schedule(1, definition(&fixture));
        let PassOutcome::Reported(summary) = fixture.detector.run_once(None) else {
            panic!("expected a coverage report");
        };
        assert_eq!(summary.category, ChangeSetCategory::Coverage);
        assert!(summary.entries.is_empty());
    }

    #[test]
    fn drift_pass_reports_delta_and_stores_content() {
        let fixture = fixture(false);
        let conf = fixture.base.path().join("a.conf");
        std::fs::write(&conf, "a=1").unwrap();
        let def = definition(&fixture);
        fixture.queue.add_schedule(1, def.clone());
        fixture.detector.run_once(None);
        fixture.change_sets.ack_change_set(1, "detector").unwrap();

        std::fs::write(&conf, "a=2").unwrap();
        let PassOutcome::Reported(summary) = rerun(&fixture) else {
            panic!("expected a drift report");
        };
        assert_eq!(summary.category, ChangeSetCategory::Drift);
        assert_eq!(summary.version, 1);
        assert_eq!(summary.count(EntryKind::Changed), 1);
        let sha = summary.entries[0].new_sha.clone().unwrap();
        assert!(fixture.change_sets.content_dir(1, "detector").join(sha).is_file());
        assert!(
            fixture
                .change_sets
                .change_set_dir(1, "detector")
                .join(PREVIOUS_CHANGE_SET_FILE)
                .is_file()
        );
    }

    #[test]
    fn unacknowledged_zip_is_resent_as_repeat() {
        let fixture = fixture(true);
        std::fs::write(fixture.base.path().join("a.conf"), "a=1").unwrap();
        let def = definition(&fixture);
        fixture.queue.add_schedule(1, def.clone());
        assert!(matches!(
            fixture.detector.run_once(None),
            PassOutcome::Failed(_)
        ));

        rerun(&fixture);
        let summaries = fixture.listener.summaries.lock().unwrap();
        assert_eq!(summaries.len(), 2);
        assert!(!summaries[0].repeat);
        assert!(summaries[1].repeat);
        assert_eq!(summaries[1].category, ChangeSetCategory::Coverage);
    }

    #[test]
    fn missing_base_dir_fails_and_schedule_is_requeued() {
        let fixture = fixture(false);
        let def = DriftDefinition::new(5, "missing", fixture.base.path().join("nope"));
        fixture.queue.add_schedule(1, def.clone());
        assert!(matches!(
            fixture.detector.run_once(None),
            PassOutcome::Failed(_)
        ));
        let schedule = fixture.queue.find(&ScheduleKey::for_definition(1, &def)).unwrap();
        assert_eq!(schedule.state, ScheduleState::Idle);
        assert!(fixture.listener.summaries.lock().unwrap().is_empty());
    }

    #[test]
    fn disabled_definition_is_skipped() {
        let fixture = fixture(false);
        let mut def = definition(&fixture).with_include(DriftFilter::new("conf", ""));
        def.enabled = false;
        fixture.queue.add_schedule(1, def);
        assert!(matches!(
            fixture.detector.run_once(None),
            PassOutcome::Skipped(_)
        ));
        assert!(!fixture.change_sets.snapshot_exists(1, "detector"));
    }
}
