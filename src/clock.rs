//! Logical clock
//!
//! Time is measured in seconds as f64, starting at 0 when the clock is built.
//! Realtime clocks follow the wall clock scaled by a rate; offline clocks only
//! move when told to.

use std::time::{Duration, Instant};

/// Clock mode for an event loop.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ClockMode {
    #[default]
    Realtime,
    Offline,
}

#[derive(Debug)]
pub struct Clock {
    mode: ClockMode,
    /// Time dilation anchors (realtime only).
    rate: f64,
    wall_anchor: Instant,
    logical_anchor: f64,
    offline_now: f64,
}

impl Clock {
    pub fn new(mode: ClockMode, rate: f64) -> Self {
        let mut clock = Self {
            mode,
            rate: 1.0,
            wall_anchor: Instant::now(),
            logical_anchor: 0.0,
            offline_now: 0.0,
        };
        clock.set_rate(rate);
        clock
    }

    pub fn mode(&self) -> ClockMode {
        self.mode
    }

    /// Current logical time.
    pub fn now(&self) -> f64 {
        match self.mode {
            ClockMode::Offline => self.offline_now,
            ClockMode::Realtime => {
                let dt = self.wall_anchor.elapsed().as_secs_f64();
                self.logical_anchor + dt * self.rate
            }
        }
    }

    /// Set the time dilation rate. Non-positive or non-finite rates fall back to 1.
    pub fn set_rate(&mut self, rate: f64) {
        let r = if rate.is_finite() && rate > 0.0 {
            rate
        } else {
            1.0
        };
        if self.mode == ClockMode::Realtime {
            self.logical_anchor = self.now();
            self.wall_anchor = Instant::now();
        }
        self.rate = r;
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Move an offline clock forward. Never moves backwards; no-op in realtime.
    pub fn advance_to(&mut self, t: f64) {
        if self.mode == ClockMode::Offline && t > self.offline_now {
            self.offline_now = t;
        }
    }

    /// Wall-clock time until logical time `t` is reached.
    pub fn wall_until(&self, t: f64) -> Duration {
        let dt_logical = t - self.now();
        let dt_wall = (dt_logical / self.rate).max(0.0);
        Duration::try_from_secs_f64(dt_wall).unwrap_or(Duration::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offline_clock_only_moves_forward() {
        let mut clock = Clock::new(ClockMode::Offline, 1.0);
        assert_eq!(clock.now(), 0.0);
        clock.advance_to(1.5);
        clock.advance_to(1.0);
        assert_eq!(clock.now(), 1.5);
        assert_eq!(clock.wall_until(1.0), Duration::ZERO);
    }

    #[test]
    fn test_realtime_rate_scales_time() {
        let clock = Clock::new(ClockMode::Realtime, 100.0);
        std::thread::sleep(Duration::from_millis(5));
        // 5ms wall at 100x is at least 0.5s logical.
        assert!(clock.now() >= 0.5);
    }

    #[test]
    fn test_invalid_rate_falls_back() {
        let clock = Clock::new(ClockMode::Realtime, -3.0);
        assert_eq!(clock.rate(), 1.0);
        let wait = clock.wall_until(clock.now() + 0.5);
        assert!(wait <= Duration::from_millis(500));
    }

    #[test]
    fn test_far_deadline_saturates_wait() {
        let clock = Clock::new(ClockMode::Realtime, 1.0);
        assert_eq!(clock.wall_until(1e20), Duration::MAX);

        let slow = Clock::new(ClockMode::Realtime, 1e-300);
        assert_eq!(slow.wall_until(1.0), Duration::MAX);
    }
}
