use std::{
    fmt,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use super::definition::DriftDefinition;

/// Identity of a schedule: one definition name per resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScheduleKey {
    pub resource_id: i32,
    pub definition_name: String,
}

impl ScheduleKey {
    pub fn new(resource_id: i32, definition_name: impl Into<String>) -> Self {
        Self {
            resource_id,
            definition_name: definition_name.into(),
        }
    }

    pub fn for_definition(resource_id: i32, definition: &DriftDefinition) -> Self {
        Self::new(resource_id, definition.name.clone())
    }
}

impl fmt::Display for ScheduleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.resource_id, self.definition_name)
    }
}

/// Lifecycle of a schedule inside the queue.
///
/// `Idle -> Active -> Idle` on every detection pass. An unschedule request that
/// arrives while `Active` moves the schedule to `PendingRemoval`; the following
/// deactivation finishes it as `Removed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleState {
    Idle,
    Active,
    PendingRemoval,
    Removed,
}

impl ScheduleState {
    /// True while a detection pass owns the schedule.
    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Active | Self::PendingRemoval)
    }
}

/// Runtime pairing of a resource and its drift definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriftDetectionSchedule {
    pub resource_id: i32,
    pub definition: DriftDefinition,
    /// Next fire time in epoch milliseconds.
    pub next_scan: u64,
    pub state: ScheduleState,
}

impl DriftDetectionSchedule {
    pub fn new(resource_id: i32, definition: DriftDefinition) -> Self {
        Self {
            resource_id,
            definition,
            next_scan: 0,
            state: ScheduleState::Idle,
        }
    }

    pub fn key(&self) -> ScheduleKey {
        ScheduleKey::for_definition(self.resource_id, &self.definition)
    }

    /// Push the next fire time one interval past `now`.
    pub(crate) fn rearm(&mut self, now: u64) {
        let interval = self.definition.interval().as_millis().min(u64::MAX as u128) as u64;
        self.next_scan = now.saturating_add(interval);
    }
}

impl fmt::Display for DriftDetectionSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DriftDetectionSchedule[resource_id={}, definition={}, next_scan={}, state={:?}]",
            self.resource_id, self.definition.name, self.next_scan, self.state
        )
    }
}

/// Current wall-clock time in epoch milliseconds.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis()
        .min(u64::MAX as u128) as u64
}
