use std::{
    io,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use tracing::{debug, error, info};

use super::detector::{DriftDetector, PassOutcome};

const SLEEP_SLICE: Duration = Duration::from_millis(25);

/// Fixed set of detector threads polling the schedules queue.
pub struct DetectorPool {
    shutdown: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl DetectorPool {
    /// Spawn `threads` workers (at least one). Idle workers wait `poll_interval`
    /// before polling the queue again.
    pub fn spawn(
        detector: Arc<DriftDetector>,
        threads: usize,
        poll_interval: Duration,
    ) -> io::Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut pool = Self {
            shutdown: Arc::clone(&shutdown),
            threads: Vec::new(),
        };
        for worker_index in 0..threads.max(1) {
            let detector = Arc::clone(&detector);
            let shutdown = Arc::clone(&shutdown);
            let handle = thread::Builder::new()
                .name(format!("drift-detector-{worker_index}"))
                .spawn(move || worker_loop(worker_index, &detector, &shutdown, poll_interval))?;
            pool.threads.push(handle);
        }
        info!(threads = pool.threads.len(), "Started drift detectors");
        Ok(pool)
    }

    pub fn is_running(&self) -> bool {
        !self.threads.is_empty() && !self.shutdown.load(Ordering::Relaxed)
    }

    /// Signal every worker and wait for in-progress passes to finish.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for DetectorPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(
    worker_index: usize,
    detector: &DriftDetector,
    shutdown: &AtomicBool,
    poll_interval: Duration,
) {
    while !shutdown.load(Ordering::Relaxed) {
        let outcome = catch_unwind(AssertUnwindSafe(|| detector.run_once(Some(shutdown))));
        match outcome {
            Ok(PassOutcome::Idle) => sleep_until_shutdown(shutdown, poll_interval),
            Ok(_) => {}
            Err(_) => {
                error!(worker = worker_index, "Drift detection pass panicked");
                sleep_until_shutdown(shutdown, poll_interval);
            }
        }
    }
    debug!(worker = worker_index, "Drift detector stopped");
}

fn sleep_until_shutdown(shutdown: &AtomicBool, duration: Duration) {
    let deadline = Instant::now() + duration;
    while !shutdown.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep(SLEEP_SLICE.min(deadline - now));
    }
}
