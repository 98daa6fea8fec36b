//! Timer-settled deferred values
//!
//! The only place where the event loop and `Deferred` meet: a timeout whose
//! callback settles a deferred.

use crate::deferred::Deferred;
use crate::error::LoopError;
use crate::event_loop::EventLoop;

impl EventLoop {
    /// Run `job` after `delay` seconds and settle the returned deferred with its result.
    pub fn settle_after<T, E, F>(&self, delay: f64, job: F) -> Result<Deferred<T, E>, LoopError>
    where
        T: Clone + 'static,
        E: Clone + 'static,
        F: FnOnce() -> Result<T, E> + 'static,
    {
        let (deferred, resolver) = Deferred::pending();
        self.register_timeout(
            move || match job() {
                Ok(value) => resolver.resolve(value),
                Err(error) => resolver.reject(error),
            },
            delay,
        )?;
        Ok(deferred)
    }

    /// A deferred fulfilled with `value` after `delay` seconds.
    pub fn resolve_after<T, E>(&self, delay: f64, value: T) -> Result<Deferred<T, E>, LoopError>
    where
        T: Clone + 'static,
        E: Clone + 'static,
    {
        self.settle_after(delay, move || Ok(value))
    }

    /// A deferred rejected with `error` after `delay` seconds.
    pub fn reject_after<T, E>(&self, delay: f64, error: E) -> Result<Deferred<T, E>, LoopError>
    where
        T: Clone + 'static,
        E: Clone + 'static,
    {
        self.settle_after(delay, move || Err(error))
    }
}
