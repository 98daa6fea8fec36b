//! Event Loop
//!
//! Owns the timer queue and the clock, and fires due timers in time order.
//! - Realtime: sleeps (spin_sleep) until the next timer is due, no busy waiting
//! - Offline: jumps the clock to the next due time, or steps it via `advance_to`
//!
//! The loop is a cheap handle around shared state so callbacks can capture a
//! clone and register, cancel, or stop from inside a firing. No borrow of the
//! shared state is held while user code runs.

use crate::clock::{Clock, ClockMode};
use crate::error::{check_duration, LoopError};
use crate::pq::MinPq;
use crate::timer::{IntervalHandle, TimeoutHandle, Timer, TimerKind};
use spin_sleep::SpinSleeper;
use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Upper bound on dispatch passes for a single `advance_to`.
pub const MAX_DISPATCH_PASSES: usize = 200_000;

/// Longest single realtime sleep; the loop re-checks its queue after each.
const MAX_IDLE_WAIT: Duration = Duration::from_secs(60);

/// Configuration for building an event loop.
#[derive(Clone, Debug)]
pub struct LoopConfig {
    pub mode: ClockMode,
    /// Logical seconds per wall second (realtime only).
    pub rate: f64,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            mode: ClockMode::Realtime,
            rate: 1.0,
        }
    }
}

/// Interval whose callback is currently executing.
struct InFlight {
    id: u64,
    cancelled: bool,
}

struct LoopInner {
    clock: Clock,
    /// Id sequence shared by timeouts and intervals.
    next_id: u64,
    /// Insertion sequence for tie-breaking equal due times.
    next_tie: u64,
    queue: MinPq<Timer>,
    in_flight: Option<InFlight>,
    running: bool,
    dispatching: bool,
}

impl LoopInner {
    fn alloc_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn schedule(&mut self, id: u64, due: f64, timer: Timer) {
        let tie = self.next_tie;
        self.next_tie += 1;
        self.queue.add(id, due, tie, timer);
    }

    /// Mark a queued or in-flight timer of the given kind inactive.
    fn cancel(&mut self, id: u64, repeating: bool) -> bool {
        if let Some(timer) = self.queue.get_mut(id) {
            if timer.is_repeating() != repeating || !timer.active {
                return false;
            }
            timer.active = false;
            return true;
        }
        match self.in_flight.as_mut() {
            Some(f) if repeating && f.id == id && !f.cancelled => {
                f.cancelled = true;
                true
            }
            _ => false,
        }
    }

    fn active_timers(&self) -> usize {
        let in_flight = self
            .in_flight
            .as_ref()
            .map_or(0, |f| usize::from(!f.cancelled));
        if self.queue.is_empty() {
            return in_flight;
        }
        self.queue.values().filter(|t| t.active).count() + in_flight
    }

    fn ensure_idle(&self) -> Result<(), LoopError> {
        if self.running || self.dispatching {
            return Err(LoopError::AlreadyRunning);
        }
        Ok(())
    }
}

/// Single-threaded timer event loop.
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<RefCell<LoopInner>>,
    sleeper: SpinSleeper,
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new(LoopConfig::default())
    }
}

impl EventLoop {
    pub fn new(config: LoopConfig) -> Self {
        Self {
            inner: Rc::new(RefCell::new(LoopInner {
                clock: Clock::new(config.mode, config.rate),
                next_id: 0,
                next_tie: 0,
                queue: MinPq::new(),
                in_flight: None,
                running: false,
                dispatching: false,
            })),
            sleeper: SpinSleeper::default(),
        }
    }

    /// A loop driven by the wall clock.
    pub fn realtime() -> Self {
        Self::default()
    }

    /// A loop whose clock only moves when dispatch needs it to.
    pub fn offline() -> Self {
        Self::new(LoopConfig {
            mode: ClockMode::Offline,
            ..Default::default()
        })
    }

    /// Current logical time in seconds.
    pub fn now(&self) -> f64 {
        self.inner.borrow().clock.now()
    }

    pub fn mode(&self) -> ClockMode {
        self.inner.borrow().clock.mode()
    }

    pub fn is_running(&self) -> bool {
        self.inner.borrow().running
    }

    /// Number of timers that will still fire.
    pub fn pending_timers(&self) -> usize {
        self.inner.borrow().active_timers()
    }

    /// Earliest queued due time, including cancelled entries not yet discarded.
    pub fn next_due(&self) -> Option<f64> {
        self.inner.borrow().queue.peek_deadline()
    }

    /// Run `callback` once, `delay` seconds from now.
    pub fn register_timeout<F>(&self, callback: F, delay: f64) -> Result<TimeoutHandle, LoopError>
    where
        F: FnOnce() + 'static,
    {
        let delay = check_duration("delay", delay, true)?;
        let mut inner = self.inner.borrow_mut();
        let id = inner.alloc_id();
        let due = inner.clock.now() + delay;
        inner.schedule(id, due, Timer::one_shot(Box::new(callback)));
        trace!(timer = id, due, "timeout registered");
        Ok(TimeoutHandle(id))
    }

    /// Cancel a timeout. Unknown or already fired handles are ignored.
    pub fn cancel_timeout(&self, handle: TimeoutHandle) {
        if self.inner.borrow_mut().cancel(handle.0, false) {
            debug!(timer = handle.0, "timeout cancelled");
        }
    }

    /// Run `callback` every `period` seconds, first at now + period.
    pub fn register_interval<F>(&self, callback: F, period: f64) -> Result<IntervalHandle, LoopError>
    where
        F: FnMut() + 'static,
    {
        let period = check_duration("period", period, false)?;
        let mut inner = self.inner.borrow_mut();
        let id = inner.alloc_id();
        let due = inner.clock.now() + period;
        inner.schedule(id, due, Timer::repeating(period, Box::new(callback)));
        trace!(timer = id, due, period, "interval registered");
        Ok(IntervalHandle(id))
    }

    /// Cancel an interval, including from inside its own callback.
    pub fn cancel_interval(&self, handle: IntervalHandle) {
        if self.inner.borrow_mut().cancel(handle.0, true) {
            debug!(timer = handle.0, "interval cancelled");
        }
    }

    /// Run the dispatch loop until `stop()` is called or no active timer remains.
    ///
    /// Timers still queued on exit are kept and fire if the loop is started again.
    pub fn start(&self) -> Result<(), LoopError> {
        {
            let mut inner = self.inner.borrow_mut();
            inner.ensure_idle()?;
            inner.running = true;
            info!(
                mode = ?inner.clock.mode(),
                rate = inner.clock.rate(),
                pending = inner.active_timers(),
                "event loop started"
            );
        }

        loop {
            self.dispatch_due();

            let wait = {
                let mut inner = self.inner.borrow_mut();
                if !inner.running {
                    break;
                }
                let next = match inner.queue.peek_deadline() {
                    Some(next) if inner.active_timers() > 0 => next,
                    _ => {
                        debug!("no active timers left");
                        inner.running = false;
                        break;
                    }
                };
                match inner.clock.mode() {
                    ClockMode::Offline => {
                        inner.clock.advance_to(next);
                        None
                    }
                    ClockMode::Realtime => Some(realtime_wait(&inner.clock, next)),
                }
            };

            if let Some(wait) = wait.filter(|w| !w.is_zero()) {
                self.sleeper.sleep(wait);
            }
        }

        info!(now = self.now(), "event loop stopped");
        Ok(())
    }

    /// Leave the dispatch loop at its next check. Does not interrupt a running callback.
    pub fn stop(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.running {
            debug!("stop requested");
        }
        inner.running = false;
    }

    /// Fire every timer due at the current time. Returns the number fired.
    pub fn run_due(&self) -> Result<usize, LoopError> {
        self.inner.borrow().ensure_idle()?;
        Ok(self.dispatch_due())
    }

    /// Step an offline clock to `until`, firing every timer due on the way.
    ///
    /// The clock is set to each due time before that timer fires.
    pub fn advance_to(&self, until: f64) -> Result<usize, LoopError> {
        if !until.is_finite() {
            return Err(LoopError::invalid_argument("until", format!("{until} is not finite")));
        }
        {
            let inner = self.inner.borrow();
            inner.ensure_idle()?;
            if inner.clock.mode() != ClockMode::Offline {
                return Err(LoopError::NotOffline);
            }
        }

        let mut fired = 0;
        for _ in 0..MAX_DISPATCH_PASSES {
            let next = self.next_due();
            match next {
                Some(due) if due <= until => {
                    self.inner.borrow_mut().clock.advance_to(due);
                    fired += self.dispatch_due();
                }
                _ => {
                    self.inner.borrow_mut().clock.advance_to(until);
                    return Ok(fired);
                }
            }
        }

        warn!(until, limit = MAX_DISPATCH_PASSES, "offline stepping did not converge");
        Err(LoopError::DispatchLimit {
            limit: MAX_DISPATCH_PASSES,
        })
    }

    /// Step an offline clock forward by `dt` seconds.
    pub fn advance_by(&self, dt: f64) -> Result<usize, LoopError> {
        let dt = check_duration("dt", dt, true)?;
        self.advance_to(self.now() + dt)
    }

    /// One dispatch pass: read the clock once, then fire every timer due at
    /// that time that was queued before the pass began.
    fn dispatch_due(&self) -> usize {
        let (now, horizon) = {
            let mut inner = self.inner.borrow_mut();
            inner.dispatching = true;
            (inner.clock.now(), inner.next_tie)
        };

        let mut fired = 0;
        loop {
            let next = {
                let mut inner = self.inner.borrow_mut();
                match inner.queue.peek() {
                    Some((due, tie)) if due <= now && tie < horizon => inner.queue.pop(),
                    _ => None,
                }
            };
            let Some((id, due, timer)) = next else {
                break;
            };
            if self.fire(id, due, timer) {
                fired += 1;
            }
        }

        self.inner.borrow_mut().dispatching = false;
        fired
    }

    fn fire(&self, id: u64, due: f64, timer: Timer) -> bool {
        if !timer.active {
            trace!(timer = id, "dropping cancelled timer");
            return false;
        }

        match timer.kind {
            TimerKind::OneShot(callback) => {
                trace!(timer = id, due, "firing timeout");
                invoke(id, callback);
            }
            TimerKind::Repeating {
                period,
                mut callback,
            } => {
                let fired_at = {
                    let mut inner = self.inner.borrow_mut();
                    inner.in_flight = Some(InFlight {
                        id,
                        cancelled: false,
                    });
                    inner.clock.now()
                };
                trace!(timer = id, due, fired_at, "firing interval");
                invoke(id, &mut callback);

                let mut inner = self.inner.borrow_mut();
                let cancelled = inner.in_flight.take().map_or(true, |f| f.cancelled);
                if !cancelled {
                    inner.schedule(id, fired_at + period, Timer::repeating(period, callback));
                }
            }
        }
        true
    }
}

/// Run a timer callback, containing any panic so the loop keeps going.
fn invoke(id: u64, callback: impl FnOnce()) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(callback)) {
        error!(timer = id, panic = panic_message(&*payload), "timer callback panicked");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Wall time to sleep before `next`, capped so far-off deadlines are
/// re-checked instead of handed to the sleeper whole.
fn realtime_wait(clock: &Clock, next: f64) -> Duration {
    clock.wall_until(next).min(MAX_IDLE_WAIT)
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("EventLoop")
            .field("mode", &inner.clock.mode())
            .field("now", &inner.clock.now())
            .field("pending", &inner.active_timers())
            .field("queued", &inner.queue.len())
            .field("running", &inner.running)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn recorder() -> (Rc<RefCell<Vec<&'static str>>>, impl Fn(&'static str) -> Box<dyn FnOnce()>) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let l = log.clone();
        let make = move |name: &'static str| {
            let l = l.clone();
            Box::new(move || l.borrow_mut().push(name)) as Box<dyn FnOnce()>
        };
        (log, make)
    }

    #[test]
    fn test_timeouts_fire_in_due_order() {
        let el = EventLoop::offline();
        let (log, make) = recorder();

        el.register_timeout(make("300"), 0.3).unwrap();
        el.register_timeout(make("100"), 0.1).unwrap();
        el.register_timeout(make("200"), 0.2).unwrap();

        assert_eq!(el.advance_to(1.0).unwrap(), 3);
        assert_eq!(*log.borrow(), vec!["100", "200", "300"]);
        assert_eq!(el.now(), 1.0);
    }

    #[test]
    fn test_equal_due_times_fire_in_insertion_order() {
        let el = EventLoop::offline();
        let (log, make) = recorder();

        el.register_timeout(make("a"), 0.5).unwrap();
        el.register_timeout(make("b"), 0.5).unwrap();
        el.register_timeout(make("c"), 0.5).unwrap();

        el.advance_to(0.5).unwrap();
        assert_eq!(*log.borrow(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_invalid_registration_registers_nothing() {
        let el = EventLoop::offline();

        let err = el.register_timeout(|| {}, -1.0).unwrap_err();
        assert!(matches!(err, LoopError::InvalidArgument { name: "delay", .. }));

        let err = el.register_interval(|| {}, 0.0).unwrap_err();
        assert!(matches!(err, LoopError::InvalidArgument { name: "period", .. }));

        assert!(el.register_interval(|| {}, f64::NAN).is_err());
        assert_eq!(el.pending_timers(), 0);
        assert_eq!(el.next_due(), None);
    }

    #[test]
    fn test_zero_delay_timeout_is_allowed() {
        let el = EventLoop::offline();
        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        el.register_timeout(move || h.set(h.get() + 1), 0.0).unwrap();
        assert_eq!(el.run_due().unwrap(), 1);
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn test_cancel_timeout_is_idempotent() {
        let el = EventLoop::offline();
        let (log, make) = recorder();

        let a = el.register_timeout(make("a"), 0.1).unwrap();
        let b = el.register_timeout(make("b"), 0.2).unwrap();
        el.cancel_timeout(a);
        el.cancel_timeout(a);
        assert_eq!(el.pending_timers(), 1);

        el.advance_to(1.0).unwrap();
        el.cancel_timeout(b);
        el.cancel_timeout(b);
        el.advance_to(2.0).unwrap();

        assert_eq!(*log.borrow(), vec!["b"]);
        assert_eq!(el.pending_timers(), 0);
    }

    #[test]
    fn test_interval_reschedules_from_firing_time() {
        let el = EventLoop::offline();
        let times = Rc::new(RefCell::new(Vec::new()));

        el.advance_to(2.0).unwrap();
        let (t, clock) = (times.clone(), el.clone());
        let handle = el
            .register_interval(move || t.borrow_mut().push(clock.now()), 0.5)
            .unwrap();

        el.advance_to(3.6).unwrap();
        el.cancel_interval(handle);
        el.cancel_interval(handle);
        el.advance_to(10.0).unwrap();

        assert_eq!(*times.borrow(), vec![2.5, 3.0, 3.5]);
        assert_eq!(el.pending_timers(), 0);
    }

    #[test]
    fn test_interval_cancelled_from_own_callback() {
        let el = EventLoop::offline();
        let count = Rc::new(Cell::new(0));
        let slot: Rc<Cell<Option<IntervalHandle>>> = Rc::new(Cell::new(None));

        let (c, s, lp) = (count.clone(), slot.clone(), el.clone());
        let handle = el
            .register_interval(
                move || {
                    c.set(c.get() + 1);
                    if c.get() == 2 {
                        if let Some(h) = s.get() {
                            lp.cancel_interval(h);
                        }
                    }
                },
                1.0,
            )
            .unwrap();
        slot.set(Some(handle));

        el.advance_to(10.0).unwrap();
        assert_eq!(count.get(), 2);
        assert_eq!(el.pending_timers(), 0);
    }

    #[test]
    fn test_handles_share_one_sequence() {
        let el = EventLoop::offline();
        let t = el.register_timeout(|| {}, 1.0).unwrap();
        let i = el.register_interval(|| {}, 1.0).unwrap();
        assert_ne!(t.id(), i.id());
        assert_eq!(t.to_string(), format!("timeout#{}", t.id()));
    }

    #[test]
    fn test_callback_registered_timer_waits_for_next_pass() {
        let el = EventLoop::offline();
        let (log, make) = recorder();

        let (lp, make_inner) = (el.clone(), make("inner"));
        let outer = make("outer");
        el.register_timeout(
            move || {
                outer();
                lp.register_timeout(make_inner, 0.0).unwrap();
            },
            0.0,
        )
        .unwrap();

        assert_eq!(el.run_due().unwrap(), 1);
        assert_eq!(*log.borrow(), vec!["outer"]);
        assert_eq!(el.run_due().unwrap(), 1);
        assert_eq!(*log.borrow(), vec!["outer", "inner"]);
    }

    #[test]
    fn test_panicking_callback_does_not_stop_dispatch() {
        let el = EventLoop::offline();
        let (log, make) = recorder();

        el.register_timeout(|| panic!("callback failure"), 0.1).unwrap();
        el.register_timeout(make("after"), 0.2).unwrap();

        assert_eq!(el.advance_to(1.0).unwrap(), 2);
        assert_eq!(*log.borrow(), vec!["after"]);
    }

    #[test]
    fn test_advance_requires_offline_clock() {
        let el = EventLoop::realtime();
        assert_eq!(el.advance_to(1.0), Err(LoopError::NotOffline));
        assert!(EventLoop::offline().advance_by(-1.0).is_err());
    }

    #[test]
    fn test_runaway_zero_delay_chain_hits_limit() {
        fn reschedule(el: EventLoop) {
            let next = el.clone();
            let _ = el.register_timeout(move || reschedule(next), 0.0);
        }

        let el = EventLoop::offline();
        reschedule(el.clone());
        assert_eq!(
            el.advance_to(1.0),
            Err(LoopError::DispatchLimit {
                limit: MAX_DISPATCH_PASSES
            })
        );
    }

    #[test]
    fn test_far_deadline_waits_in_bounded_steps() {
        let el = EventLoop::realtime();
        el.register_timeout(|| {}, 1e20).unwrap();
        let next = el.next_due().unwrap();
        let wait = realtime_wait(&el.inner.borrow().clock, next);
        assert_eq!(wait, MAX_IDLE_WAIT);
        assert!(format!("{el:?}").contains("queued: 1"));
    }
}
