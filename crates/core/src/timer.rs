//! High-resolution timers for frame timing and profiling.

use std::time::{Duration, Instant};

use tracing::debug;

/// High-resolution timer for measuring elapsed time.
#[derive(Debug)]
pub struct Timer {
    start: Instant,
    last_tick: Instant,
}

impl Timer {
    /// Create a new timer, starting from now.
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            start: now,
            last_tick: now,
        }
    }

    /// Get the total elapsed time since the timer was created.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Elapsed time in milliseconds, as a float for log output.
    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed().as_secs_f64() * 1000.0
    }

    /// Get the time elapsed since the last call to `tick()`.
    /// This is useful for frame pacing statistics.
    pub fn tick(&mut self) -> Duration {
        let now = Instant::now();
        let delta = now - self.last_tick;
        self.last_tick = now;
        delta
    }

    /// Reset the timer to the current time.
    pub fn reset(&mut self) {
        let now = Instant::now();
        self.start = now;
        self.last_tick = now;
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

/// Logs how long a named scope took when it goes out of scope.
///
/// # Example
/// ```
/// use renderer_core::ScopedTimer;
///
/// {
///     let _t = ScopedTimer::new("pack mesh");
///     // ... work ...
/// } // "pack mesh took 0.12 ms" is logged at debug level here
/// ```
#[derive(Debug)]
pub struct ScopedTimer {
    label: &'static str,
    timer: Timer,
}

impl ScopedTimer {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            timer: Timer::new(),
        }
    }

    /// Time spent so far, without ending the scope.
    #[inline]
    pub fn elapsed(&self) -> Duration {
        self.timer.elapsed()
    }
}

impl Drop for ScopedTimer {
    fn drop(&mut self) {
        debug!("{} took {:.3} ms", self.label, self.timer.elapsed_ms());
    }
}
