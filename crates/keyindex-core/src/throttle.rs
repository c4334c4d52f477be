//! CPU-adaptive sizing of the dispatch window.
//!
//! After each committed window the process CPU time consumed since the
//! previous sample is folded into a multiplier on the base concurrency:
//! `factor = (factor + target / (delta + offset)) / 2`, clamped. Heavy
//! windows shrink the next one; idle windows let it grow.

use crate::config::IndexingConfig;

/// Total user + system CPU time of this process in microseconds.
///
/// - **Unix**: `libc::getrusage(RUSAGE_SELF)`
/// - **Other platforms**: `None`, which leaves the window fixed
pub fn process_cpu_micros() -> Option<u64> {
    #[cfg(unix)]
    {
        cpu_micros_unix()
    }
    #[cfg(not(unix))]
    {
        None
    }
}

#[cfg(unix)]
fn cpu_micros_unix() -> Option<u64> {
    use std::mem::MaybeUninit;
    let mut usage = MaybeUninit::<libc::rusage>::uninit();
    // SAFETY: getrusage writes into the provided pointer; we check the return value.
    let ret = unsafe { libc::getrusage(libc::RUSAGE_SELF, usage.as_mut_ptr()) };
    if ret != 0 {
        return None;
    }
    // SAFETY: getrusage succeeded, so the struct is fully initialized.
    let usage = unsafe { usage.assume_init() };
    let micros = |tv: libc::timeval| tv.tv_sec as u64 * 1_000_000 + tv.tv_usec as u64;
    Some(micros(usage.ru_utime) + micros(usage.ru_stime))
}

/// Feedback controller for the number of dispatches between commits.
#[derive(Debug, Clone)]
pub struct AdaptiveWindow {
    base: usize,
    factor: f64,
    target: f64,
    offset: f64,
    min: f64,
    max: f64,
    last_cpu: Option<u64>,
}

impl AdaptiveWindow {
    pub fn new(config: &IndexingConfig) -> Self {
        Self {
            base: config.concurrency.max(1),
            factor: config.initial_cpu_factor,
            target: config.cpu_target_micros,
            offset: config.cpu_offset_micros,
            min: config.min_cpu_factor,
            max: config.max_cpu_factor,
            last_cpu: process_cpu_micros(),
        }
    }

    /// Dispatches allowed before the next commit
    pub fn limit(&self) -> usize {
        ((self.base as f64 * self.factor) as usize).max(1)
    }

    pub fn factor(&self) -> f64 {
        self.factor
    }

    /// Take a CPU sample and adjust the factor.
    pub fn sample(&mut self) {
        let now = process_cpu_micros();
        if let (Some(now), Some(last)) = (now, self.last_cpu) {
            self.observe(now.saturating_sub(last));
        }
        self.last_cpu = now;
    }

    /// Fold one window's CPU consumption (µs) into the factor.
    pub fn observe(&mut self, delta_micros: u64) {
        let next = (self.factor + self.target / (delta_micros as f64 + self.offset)) / 2.0;
        self.factor = next.clamp(self.min, self.max);
    }
}
