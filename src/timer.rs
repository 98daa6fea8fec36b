//! Timer entries and handles
//!
//! One-shot and repeating timers draw their ids from a single sequence, and
//! each kind gets its own handle type so a timeout handle can never cancel an
//! interval (or the reverse).

use std::fmt;

/// Handle returned by [`EventLoop::register_timeout`](crate::EventLoop::register_timeout).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimeoutHandle(pub(crate) u64);

/// Handle returned by [`EventLoop::register_interval`](crate::EventLoop::register_interval).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IntervalHandle(pub(crate) u64);

impl TimeoutHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl IntervalHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TimeoutHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timeout#{}", self.0)
    }
}

impl fmt::Display for IntervalHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "interval#{}", self.0)
    }
}

pub(crate) enum TimerKind {
    OneShot(Box<dyn FnOnce()>),
    Repeating {
        period: f64,
        callback: Box<dyn FnMut()>,
    },
}

/// A queued timer. The due time lives in the queue key.
pub(crate) struct Timer {
    pub kind: TimerKind,
    /// Cleared by cancellation; the entry stays queued until popped.
    pub active: bool,
}

impl Timer {
    pub fn one_shot(callback: Box<dyn FnOnce()>) -> Self {
        Self {
            kind: TimerKind::OneShot(callback),
            active: true,
        }
    }

    pub fn repeating(period: f64, callback: Box<dyn FnMut()>) -> Self {
        Self {
            kind: TimerKind::Repeating { period, callback },
            active: true,
        }
    }

    pub fn is_repeating(&self) -> bool {
        matches!(self.kind, TimerKind::Repeating { .. })
    }
}
