use std::collections::{BTreeSet, HashMap};
use std::sync::{Condvar, Mutex, MutexGuard};

use tracing::{debug, warn};

use super::definition::DriftDefinition;
use super::schedule::{DriftDetectionSchedule, ScheduleKey, ScheduleState, now_millis};

/// Callback run once a schedule leaves the queue for good.
pub type RemovalHook = Box<dyn Fn(&DriftDetectionSchedule) + Send + Sync>;

/// Result of an unschedule request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// The schedule was idle and is gone.
    Removed,
    /// A detection pass owns the schedule; removal happens on deactivation.
    Deferred,
    Missing,
}

impl Removal {
    pub fn is_removed(self) -> bool {
        matches!(self, Self::Removed)
    }
}

/// Result of handing an active schedule back to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deactivation {
    /// Requeued with the given next fire time (epoch millis).
    Requeued(u64),
    /// A deferred unschedule completed.
    Removed,
    /// The schedule was not active.
    NotActive,
}

struct Entry {
    schedule: DriftDetectionSchedule,
    seq: u64,
    /// Definition update received while the schedule was active.
    replacement: Option<DriftDefinition>,
}

#[derive(Default)]
struct QueueState {
    entries: HashMap<ScheduleKey, Entry>,
    /// Idle schedules ordered by (next fire time, insertion sequence).
    ready: BTreeSet<(u64, u64, ScheduleKey)>,
    next_seq: u64,
}

impl QueueState {
    fn enqueue(&mut self, key: ScheduleKey) {
        let seq = self.next_seq;
        self.next_seq += 1;
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.seq = seq;
            entry.schedule.state = ScheduleState::Idle;
            self.ready.insert((entry.schedule.next_scan, seq, key));
        }
    }

    /// Mark `key` removed and return a copy of its schedule for the hook.
    fn tombstone(&mut self, key: &ScheduleKey) -> Option<DriftDetectionSchedule> {
        let entry = self.entries.get_mut(key)?;
        entry.schedule.state = ScheduleState::Removed;
        entry.replacement = None;
        Some(entry.schedule.clone())
    }

    fn live(&self, key: &ScheduleKey) -> Option<&Entry> {
        self.entries
            .get(key)
            .filter(|entry| entry.schedule.state != ScheduleState::Removed)
    }

    fn dequeue(&mut self, key: &ScheduleKey) {
        if let Some(entry) = self.entries.get(key) {
            self.ready
                .remove(&(entry.schedule.next_scan, entry.seq, key.clone()));
        }
    }
}

/// Priority queue of drift detection schedules ordered by next fire time.
///
/// A single mutex guards all state. Schedules handed out by
/// [`SchedulesQueue::get_next_schedule`] stay in the queue as `Active` until
/// [`SchedulesQueue::deactivate_schedule`] is called for them, so unschedule
/// requests arriving mid-pass are deferred instead of racing the scan.
///
/// While the removal hook runs, the key stays in the map as a `Removed`
/// tombstone; `add_schedule` for that key waits until the hook has finished.
pub struct SchedulesQueue {
    state: Mutex<QueueState>,
    removal_done: Condvar,
    removal_hook: Option<RemovalHook>,
}

impl Default for SchedulesQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulesQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            removal_done: Condvar::new(),
            removal_hook: None,
        }
    }

    /// Create a queue that runs `hook` whenever a schedule is removed, whether
    /// immediately or after its deferred deactivation.
    pub fn with_removal_hook(hook: RemovalHook) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            removal_done: Condvar::new(),
            removal_hook: Some(hook),
        }
    }

    /// Insert a schedule that fires immediately.
    ///
    /// Returns false if a schedule with the same key already exists. Adding a
    /// schedule that is pending removal revives it with the new definition.
    pub fn add_schedule(&self, resource_id: i32, definition: DriftDefinition) -> bool {
        let key = ScheduleKey::for_definition(resource_id, &definition);
        let mut state = self.lock_state();
        while state.entries.get(&key).map(|entry| entry.schedule.state) == Some(ScheduleState::Removed) {
            state = self.removal_done.wait(state).unwrap_or_else(|poisoned| {
                warn!("Schedules queue lock poisoned; recovering.");
                poisoned.into_inner()
            });
        }
        if let Some(entry) = state.entries.get_mut(&key) {
            if entry.schedule.state == ScheduleState::PendingRemoval {
                debug!(schedule = %key, "Reviving schedule that was pending removal");
                entry.schedule.state = ScheduleState::Active;
                entry.replacement = Some(definition);
                return true;
            }
            return false;
        }
        let mut schedule = DriftDetectionSchedule::new(resource_id, definition);
        schedule.next_scan = now_millis();
        state.entries.insert(
            key.clone(),
            Entry {
                schedule,
                seq: 0,
                replacement: None,
            },
        );
        state.enqueue(key);
        true
    }

    /// Replace the definition of an existing schedule.
    ///
    /// Active schedules pick up the new definition when they are deactivated.
    pub fn update_schedule(&self, resource_id: i32, definition: DriftDefinition) -> bool {
        let key = ScheduleKey::for_definition(resource_id, &definition);
        let mut state = self.lock_state();
        let Some(entry) = state.entries.get_mut(&key) else {
            return false;
        };
        match entry.schedule.state {
            ScheduleState::Idle => {
                entry.schedule.definition = definition;
                true
            }
            ScheduleState::Active => {
                entry.replacement = Some(definition);
                true
            }
            ScheduleState::PendingRemoval | ScheduleState::Removed => false,
        }
    }

    /// Remove a schedule, deferring the removal while a detection pass owns it.
    pub fn remove_schedule(&self, resource_id: i32, definition: &DriftDefinition) -> Removal {
        self.remove_by_key(&ScheduleKey::for_definition(resource_id, definition))
    }

    pub fn remove_by_key(&self, key: &ScheduleKey) -> Removal {
        let removed = {
            let mut state = self.lock_state();
            let Some(current) = state.entries.get(key).map(|entry| entry.schedule.state) else {
                return Removal::Missing;
            };
            match current {
                ScheduleState::Active => {
                    if let Some(entry) = state.entries.get_mut(key) {
                        entry.schedule.state = ScheduleState::PendingRemoval;
                        entry.replacement = None;
                    }
                    return Removal::Deferred;
                }
                ScheduleState::PendingRemoval => return Removal::Deferred,
                ScheduleState::Removed => return Removal::Missing,
                ScheduleState::Idle => {
                    state.dequeue(key);
                    state.tombstone(key)
                }
            }
        };
        if let Some(schedule) = removed {
            self.finish_removal(key, &schedule);
        }
        Removal::Removed
    }

    /// Make an idle schedule due now. Returns false if it is missing or active.
    pub fn expedite(&self, key: &ScheduleKey) -> bool {
        let mut state = self.lock_state();
        let Some(entry) = state.entries.get(key) else {
            return false;
        };
        if entry.schedule.state != ScheduleState::Idle {
            return false;
        }
        state.dequeue(key);
        if let Some(entry) = state.entries.get_mut(key) {
            entry.schedule.next_scan = now_millis();
        }
        state.enqueue(key.clone());
        true
    }

    /// Pop the earliest due schedule and mark it active.
    ///
    /// Returns `None` when nothing is due; callers poll again later.
    pub fn get_next_schedule(&self) -> Option<DriftDetectionSchedule> {
        let now = now_millis();
        let mut state = self.lock_state();
        let first = state.ready.first().cloned()?;
        if first.0 > now {
            return None;
        }
        state.ready.remove(&first);
        let entry = state.entries.get_mut(&first.2)?;
        entry.schedule.state = ScheduleState::Active;
        Some(entry.schedule.clone())
    }

    /// Hand an active schedule back to the queue.
    ///
    /// The schedule is re-armed at now + interval, or removed if an unschedule
    /// request arrived while it was active. The removal hook runs in that case.
    pub fn deactivate_schedule(&self, key: &ScheduleKey) -> Deactivation {
        let removed = {
            let mut state = self.lock_state();
            let Some(current) = state.entries.get(key).map(|entry| entry.schedule.state) else {
                warn!(schedule = %key, "Deactivating a schedule that is not in the queue");
                return Deactivation::NotActive;
            };
            match current {
                ScheduleState::Active => {
                    let now = now_millis();
                    let next_scan = match state.entries.get_mut(key) {
                        Some(entry) => {
                            if let Some(definition) = entry.replacement.take() {
                                entry.schedule.definition = definition;
                            }
                            entry.schedule.rearm(now);
                            entry.schedule.next_scan
                        }
                        None => return Deactivation::NotActive,
                    };
                    state.enqueue(key.clone());
                    return Deactivation::Requeued(next_scan);
                }
                ScheduleState::PendingRemoval => state.tombstone(key),
                ScheduleState::Idle | ScheduleState::Removed => {
                    debug!(schedule = %key, "Schedule was not active");
                    return Deactivation::NotActive;
                }
            }
        };
        if let Some(schedule) = removed {
            debug!(schedule = %key, "Completing deferred schedule removal");
            self.finish_removal(key, &schedule);
        }
        Deactivation::Removed
    }

    pub fn contains(&self, resource_id: i32, definition: &DriftDefinition) -> bool {
        self.contains_key(&ScheduleKey::for_definition(resource_id, definition))
    }

    pub fn contains_key(&self, key: &ScheduleKey) -> bool {
        self.lock_state()
            .live(key)
            .is_some()
    }

    /// Snapshot of a schedule, including its current lifecycle state.
    pub fn find(&self, key: &ScheduleKey) -> Option<DriftDetectionSchedule> {
        self.lock_state()
            .live(key)
            .map(|entry| entry.schedule.clone())
    }

    /// Snapshot of all schedules in fire order; active ones come last.
    pub fn schedules(&self) -> Vec<DriftDetectionSchedule> {
        let state = self.lock_state();
        let mut ordered: Vec<DriftDetectionSchedule> = state
            .ready
            .iter()
            .filter_map(|(_, _, key)| state.entries.get(key))
            .map(|entry| entry.schedule.clone())
            .collect();
        ordered.extend(
            state
                .entries
                .values()
                .filter(|entry| entry.schedule.state.is_in_flight())
                .map(|entry| entry.schedule.clone()),
        );
        ordered
    }

    pub fn len(&self) -> usize {
        self.lock_state()
            .entries
            .values()
            .filter(|entry| entry.schedule.state != ScheduleState::Removed)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every idle schedule without running the removal hook; in-flight
    /// schedules are marked for removal.
    pub fn clear(&self) {
        let mut state = self.lock_state();
        state.ready.clear();
        state.entries.retain(|_, entry| {
            entry.schedule.state.is_in_flight() || entry.schedule.state == ScheduleState::Removed
        });
        for entry in state.entries.values_mut() {
            if entry.schedule.state.is_in_flight() {
                entry.schedule.state = ScheduleState::PendingRemoval;
                entry.replacement = None;
            }
        }
    }

    /// Run the hook outside the lock, then drop the tombstone and wake waiters.
    fn finish_removal(&self, key: &ScheduleKey, schedule: &DriftDetectionSchedule) {
        if let Some(hook) = self.removal_hook.as_ref() {
            hook(schedule);
        }
        let mut state = self.lock_state();
        if state.entries.get(key).map(|entry| entry.schedule.state) == Some(ScheduleState::Removed) {
            state.entries.remove(key);
        }
        drop(state);
        self.removal_done.notify_all();
    }

    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!("Schedules queue lock poisoned; recovering.");
            poisoned.into_inner()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn definition(name: &str) -> DriftDefinition {
        DriftDefinition::new(1, name, "/tmp").with_interval(Duration::from_secs(3600))
    }

    #[test]
    fn duplicate_keys_are_rejected() {
        let queue = SchedulesQueue::new();
        assert!(queue.add_schedule(1, definition("a")));
        assert!(!queue.add_schedule(1, definition("a")));
        assert!(queue.add_schedule(2, definition("a")));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn ties_are_broken_by_insertion_order() {
        let queue = SchedulesQueue::new();
        {
            let mut state = queue.lock_state();
            for (name, seq) in [("first", 0u64), ("second", 1)] {
                let key = ScheduleKey::new(1, name);
                let mut schedule = DriftDetectionSchedule::new(1, definition(name));
                schedule.next_scan = 5;
                state.entries.insert(
                    key.clone(),
                    Entry {
                        schedule,
                        seq,
                        replacement: None,
                    },
                );
                state.ready.insert((5, seq, key));
            }
            state.next_seq = 2;
        }
        assert_eq!(queue.get_next_schedule().unwrap().definition.name, "first");
        assert_eq!(queue.get_next_schedule().unwrap().definition.name, "second");
    }

    #[test]
    fn earliest_fire_time_comes_first() {
        let queue = SchedulesQueue::new();
        queue.add_schedule(1, definition("late"));
        queue.add_schedule(1, definition("early"));
        {
            let mut state = queue.lock_state();
            let late = ScheduleKey::new(1, "late");
            state.dequeue(&late);
            if let Some(entry) = state.entries.get_mut(&late) {
                entry.schedule.next_scan = 10;
            }
            state.enqueue(late);
        }
        let first = queue.get_next_schedule().unwrap();
        assert_eq!(first.definition.name, "late");
    }

    #[test]
    fn popped_schedule_is_active_and_not_due_after_rearm() {
        let queue = SchedulesQueue::new();
        queue.add_schedule(1, definition("a"));
        let schedule = queue.get_next_schedule().unwrap();
        assert_eq!(schedule.state, ScheduleState::Active);
        assert!(queue.get_next_schedule().is_none());

        let outcome = queue.deactivate_schedule(&schedule.key());
        assert!(matches!(outcome, Deactivation::Requeued(next) if next > schedule.next_scan));
        assert!(queue.get_next_schedule().is_none());
        assert_eq!(
            queue.find(&schedule.key()).unwrap().state,
            ScheduleState::Idle
        );
    }

    #[test]
    fn empty_queue_returns_none() {
        let queue = SchedulesQueue::new();
        assert!(queue.get_next_schedule().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn removing_idle_schedule_runs_hook_immediately() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let queue = SchedulesQueue::with_removal_hook(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let def = definition("a");
        queue.add_schedule(1, def.clone());
        assert_eq!(queue.remove_schedule(1, &def), Removal::Removed);
        assert!(!queue.contains(1, &def));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(queue.get_next_schedule().is_none());
    }

    #[test]
    fn removing_active_schedule_is_deferred_until_deactivation() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let queue = SchedulesQueue::with_removal_hook(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let def = definition("a");
        queue.add_schedule(1, def.clone());
        let active = queue.get_next_schedule().unwrap();

        assert_eq!(queue.remove_schedule(1, &def), Removal::Deferred);
        assert!(queue.contains(1, &def));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        assert_eq!(queue.deactivate_schedule(&active.key()), Deactivation::Removed);
        assert!(!queue.contains(1, &def));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn update_while_active_applies_on_deactivation() {
        let queue = SchedulesQueue::new();
        queue.add_schedule(1, definition("a"));
        let active = queue.get_next_schedule().unwrap();
        let updated = definition("a").with_interval(Duration::from_secs(60));
        assert!(queue.update_schedule(1, updated.clone()));
        assert_eq!(queue.find(&active.key()).unwrap().definition.interval, 3600);
        queue.deactivate_schedule(&active.key());
        assert_eq!(queue.find(&active.key()).unwrap().definition, updated);
    }

    #[test]
    fn adding_back_a_pending_removal_cancels_it() {
        let queue = SchedulesQueue::new();
        let def = definition("a");
        queue.add_schedule(1, def.clone());
        let active = queue.get_next_schedule().unwrap();
        queue.remove_schedule(1, &def);
        assert!(queue.add_schedule(1, def.clone()));
        assert!(matches!(
            queue.deactivate_schedule(&active.key()),
            Deactivation::Requeued(_)
        ));
        assert!(queue.contains(1, &def));
    }

    #[test]
    fn expedite_makes_idle_schedule_due() {
        let queue = SchedulesQueue::new();
        queue.add_schedule(1, definition("a"));
        let active = queue.get_next_schedule().unwrap();
        assert!(!queue.expedite(&active.key()));
        queue.deactivate_schedule(&active.key());
        assert!(queue.get_next_schedule().is_none());

        assert!(queue.expedite(&active.key()));
        assert_eq!(queue.get_next_schedule().unwrap().key(), active.key());
        assert!(!queue.expedite(&ScheduleKey::new(9, "missing")));
    }

    #[test]
    fn re_add_waits_for_removal_hook() {
        let (started_tx, started_rx) = std::sync::mpsc::channel::<()>();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let events = Arc::new(Mutex::new(Vec::new()));
        let hook_events = Arc::clone(&events);
        let release_rx = Mutex::new(release_rx);
        let started_tx = Mutex::new(started_tx);
        let queue = Arc::new(SchedulesQueue::with_removal_hook(Box::new(move |_| {
            started_tx.lock().unwrap().send(()).unwrap();
            release_rx.lock().unwrap().recv().unwrap();
            hook_events.lock().unwrap().push("hook finished");
        })));
        let def = definition("a");
        queue.add_schedule(1, def.clone());

        let remover = {
            let queue = Arc::clone(&queue);
            let def = def.clone();
            std::thread::spawn(move || queue.remove_schedule(1, &def))
        };
        started_rx.recv().unwrap();
        assert!(!queue.contains(1, &def));
        assert_eq!(queue.len(), 0);

        let adder = {
            let queue = Arc::clone(&queue);
            let events = Arc::clone(&events);
            let def = def.clone();
            std::thread::spawn(move || {
                let added = queue.add_schedule(1, def);
                events.lock().unwrap().push("re-added");
                added
            })
        };
        std::thread::sleep(Duration::from_millis(50));
        assert!(events.lock().unwrap().is_empty());

        release_tx.send(()).unwrap();
        assert_eq!(remover.join().unwrap(), Removal::Removed);
        assert!(adder.join().unwrap());
        assert_eq!(*events.lock().unwrap(), vec!["hook finished", "re-added"]);
        assert!(queue.contains(1, &def));
    }

    #[test]
    fn deactivating_unknown_schedule_is_harmless() {
        let queue = SchedulesQueue::new();
        assert_eq!(
            queue.deactivate_schedule(&ScheduleKey::new(9, "missing")),
            Deactivation::NotActive
        );
    }

    #[test]
    fn poisoned_lock_recovers() {
        let queue = SchedulesQueue::new();
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = queue.state.lock().unwrap();
            panic!("poison");
        }));
        assert!(queue.add_schedule(1, definition("a")));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn concurrent_adds_and_pops_do_not_lose_schedules() {
        let queue = Arc::new(SchedulesQueue::new());
        let mut handles = Vec::new();
        for worker in 0..4 {
            let queue = Arc::clone(&queue);
            handles.push(std::thread::spawn(move || {
                for idx in 0..25 {
                    queue.add_schedule(worker, definition(&format!("def-{idx}")));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        let mut popped = 0;
        while let Some(schedule) = queue.get_next_schedule() {
            popped += 1;
            assert_eq!(schedule.state, ScheduleState::Active);
        }
        assert_eq!(popped, 100);
        assert_eq!(queue.len(), 100);
    }
}
