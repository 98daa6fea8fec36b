//! Rust Event Loop
//!
//! A single-threaded cooperative scheduler with:
//! - Deferred values with one-shot settlement and chained continuations
//! - One-shot and repeating timers with typed cancellation handles
//! - Drift-free interval rescheduling relative to the actual firing time
//! - Dual clock modes: realtime (spin_sleep) and offline (stepping API)

pub mod clock;
pub mod deferred;
pub mod delay;
pub mod error;
pub mod event_loop;
pub mod pq;
pub mod timer;


pub use clock::ClockMode;
pub use deferred::{Deferred, Outcome, Resolver, State};
pub use error::LoopError;
pub use event_loop::{EventLoop, LoopConfig, MAX_DISPATCH_PASSES};
pub use timer::{IntervalHandle, TimeoutHandle};
