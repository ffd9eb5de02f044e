//! Virtual Clock (C1) — single time source for the whole pipeline.
//!
//! No other module should call `SystemTime::now()` directly; everything reads
//! time through a `Clock` handle so a replay run can drive the pipeline from
//! persisted timestamps instead of wall-clock time. `Clock` is cheaply
//! cloneable (shared interior state) rather than a process-wide singleton —
//! every component that needs time takes one at construction time, so tests
//! can each own an independent clock.

use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug)]
struct ClockState {
    live: bool,
    time_offset: f64,
    current_time: f64,
}

/// A shared, mutable time source. Cloning a `Clock` yields a handle to the
/// same underlying state (Arc<Mutex<..>>), not an independent copy.
#[derive(Debug, Clone)]
pub struct Clock {
    inner: Arc<Mutex<ClockState>>,
}

fn wall_clock_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock {
    /// A live clock tracking the OS wall clock with zero offset.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ClockState {
                live: true,
                time_offset: 0.0,
                current_time: 0.0,
            })),
        }
    }

    /// A paused clock fixed at `timestamp`. Handy for deterministic tests and
    /// for the replay driver, which never wants a live clock.
    pub fn paused_at(timestamp: f64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ClockState {
                live: false,
                time_offset: 0.0,
                current_time: timestamp,
            })),
        }
    }

    /// The current time, in seconds since the epoch.
    pub fn now(&self) -> f64 {
        let state = self.inner.lock().unwrap();
        if state.live {
            wall_clock_now() - state.time_offset
        } else {
            state.current_time
        }
    }

    /// Set the clock such that `now() == timestamp` immediately after this call.
    pub fn set(&self, timestamp: f64) {
        let mut state = self.inner.lock().unwrap();
        if state.live {
            state.time_offset = wall_clock_now() - timestamp;
        } else {
            state.current_time = timestamp;
        }
    }

    /// Freeze the clock, optionally at a specific timestamp (otherwise at its
    /// current value).
    pub fn pause(&self, timestamp: Option<f64>) {
        let mut state = self.inner.lock().unwrap();
        state.current_time = match timestamp {
            Some(ts) => ts,
            None => {
                if state.live {
                    wall_clock_now() - state.time_offset
                } else {
                    state.current_time
                }
            }
        };
        state.live = false;
    }

    /// Resume live ticking, optionally jumping to a specific timestamp first
    /// (otherwise resuming seamlessly from the paused value).
    pub fn resume(&self, timestamp: Option<f64>) {
        {
            let mut state = self.inner.lock().unwrap();
            state.live = true;
        }
        match timestamp {
            Some(ts) => self.set(ts),
            None => {
                let current = self.inner.lock().unwrap().current_time;
                self.set(current);
            }
        }
    }

    pub fn is_live(&self) -> bool {
        self.inner.lock().unwrap().live
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paused_clock_holds_exact_value() {
        let clock = Clock::paused_at(42.0);
        assert_eq!(clock.now(), 42.0);
        clock.set(100.0);
        assert_eq!(clock.now(), 100.0);
    }

    #[test]
    fn pause_then_resume_seamlessly() {
        let clock = Clock::paused_at(10.0);
        clock.resume(None);
        assert!(clock.is_live());
        // Resuming with no timestamp re-anchors live time at the paused value,
        // so `now()` should read back very close to 10.0 immediately after.
        assert!((clock.now() - 10.0).abs() < 0.05);
    }

    #[test]
    fn clones_share_state() {
        let clock = Clock::paused_at(1.0);
        let handle = clock.clone();
        handle.set(5.0);
        assert_eq!(clock.now(), 5.0);
    }
}
