//! Host pacing clock.
use std::{
    thread,
    time::{Duration, Instant},
};

/// Timer to synchronize the host loop with a fixed-rate schedule.
///
/// The interpreter itself never sleeps or polls; the host owns one clock
/// per schedule (instruction cycle, timer tick) and drives the matching
/// operation whenever its clock fires.
pub struct Clock {
    last: Instant,
    interval: Duration,
}

impl Clock {
    /// Creates a new clock with the current time as internal state.
    pub fn new(interval: Duration) -> Self {
        Self {
            last: Instant::now(),
            interval,
        }
    }

    /// Set the clock state back to zero.
    pub fn reset(&mut self) {
        self.last = Instant::now();
    }

    /// True once per elapsed interval.
    ///
    /// Resets to now rather than trying to catch up. If the host was
    /// paused for a long time, it simply continues at its usual rate.
    pub fn tick(&mut self) -> bool {
        if self.last.elapsed() >= self.interval {
            self.reset();
            true
        } else {
            false
        }
    }

    /// Block the current thread until the next cycle.
    pub fn wait(&mut self) {
        // Sleep does not have enough resolution, and spinning causes high
        // CPU usage and fan madness. Yielding in a loop is the best
        // alternative.
        while self.last.elapsed() < self.interval {
            thread::yield_now();
        }
        self.reset();
    }
}
