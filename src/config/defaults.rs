pub(crate) const MAX_DETECTOR_THREADS: usize = 16;
pub(crate) const MIN_POLL_INTERVAL_MS: u64 = 50;
pub(crate) const MAX_POLL_INTERVAL_MS: u64 = 60_000;
pub(crate) const MAX_LOG_FILES_KEPT: usize = 200;

/// Thirty minutes between detection passes.
pub(crate) fn default_interval_secs() -> u64 {
    1800
}

pub(crate) fn default_true() -> bool {
    true
}

pub(crate) fn default_detector_threads() -> usize {
    2
}

pub(crate) fn default_poll_interval_ms() -> u64 {
    1000
}

pub(crate) fn clamp_detector_threads(value: usize) -> usize {
    value.clamp(1, MAX_DETECTOR_THREADS)
}

pub(crate) fn clamp_poll_interval_ms(value: u64) -> u64 {
    value.clamp(MIN_POLL_INTERVAL_MS, MAX_POLL_INTERVAL_MS)
}

pub(crate) fn default_log_files_kept() -> usize {
    10
}

pub(crate) fn clamp_log_files_kept(value: usize) -> usize {
    value.clamp(1, MAX_LOG_FILES_KEPT)
}
