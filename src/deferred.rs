//! Deferred values
//!
//! A single-settlement value container with chained continuations.
//! - Settlement is one-way: pending -> fulfilled | rejected
//! - Continuations queued while pending run at settlement, in registration order
//! - Continuations attached after settlement run immediately, inside the call
//!
//! A `Deferred` knows nothing about the event loop. Timer callbacks settle it
//! through a [`Resolver`].

use std::cell::RefCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use tracing::{error, trace, warn};

/// Settlement state of a deferred value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum State<T, E> {
    Pending,
    Fulfilled(T),
    Rejected(E),
}

impl<T, E> State<T, E> {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }

    pub fn is_fulfilled(&self) -> bool {
        matches!(self, Self::Fulfilled(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }
}

/// What a continuation hands to the downstream deferred.
pub enum Outcome<T, E> {
    Fulfill(T),
    Reject(E),
    /// Settle according to another deferred, once it settles.
    Adopt(Deferred<T, E>),
}

impl<T, E> From<Result<T, E>> for Outcome<T, E> {
    fn from(result: Result<T, E>) -> Self {
        match result {
            Ok(value) => Self::Fulfill(value),
            Err(error) => Self::Reject(error),
        }
    }
}

impl<T, E> From<Deferred<T, E>> for Outcome<T, E> {
    fn from(deferred: Deferred<T, E>) -> Self {
        Self::Adopt(deferred)
    }
}

type Continuation<V> = Box<dyn FnOnce(V)>;

struct Inner<T, E> {
    state: State<T, E>,
    /// Set once a resolver has adopted another deferred.
    locked: bool,
    on_fulfilled: Vec<Continuation<T>>,
    on_rejected: Vec<Continuation<E>>,
}

type Shared<T, E> = Rc<RefCell<Inner<T, E>>>;

/// A value that will exist later.
///
/// Cloning yields another handle to the same settlement.
pub struct Deferred<T, E> {
    inner: Shared<T, E>,
}

/// Write side of a [`Deferred`].
///
/// Only the first `resolve`, `reject` or `adopt` has an effect.
pub struct Resolver<T, E> {
    inner: Shared<T, E>,
}

impl<T, E> Clone for Deferred<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T, E> Clone for Resolver<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

fn fulfill<T: Clone, E>(inner: &Shared<T, E>, value: T) {
    let (callbacks, discarded) = {
        let mut s = inner.borrow_mut();
        if !s.state.is_pending() {
            return;
        }
        s.state = State::Fulfilled(value.clone());
        (
            std::mem::take(&mut s.on_fulfilled),
            std::mem::take(&mut s.on_rejected),
        )
    };
    drop(discarded);
    trace!(continuations = callbacks.len(), "deferred fulfilled");
    run_continuations(callbacks, &value);
}

fn reject<T, E: Clone>(inner: &Shared<T, E>, error: E) {
    let (callbacks, discarded) = {
        let mut s = inner.borrow_mut();
        if !s.state.is_pending() {
            return;
        }
        s.state = State::Rejected(error.clone());
        (
            std::mem::take(&mut s.on_rejected),
            std::mem::take(&mut s.on_fulfilled),
        )
    };
    drop(discarded);
    trace!(continuations = callbacks.len(), "deferred rejected");
    run_continuations(callbacks, &error);
}

/// Run every drained continuation, even if an earlier one panics.
///
/// The first panic is resumed once the whole queue has run.
fn run_continuations<V: Clone>(callbacks: Vec<Continuation<V>>, arg: &V) {
    let mut first_panic = None;
    for callback in callbacks {
        let arg = arg.clone();
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || callback(arg))) {
            if first_panic.is_none() {
                first_panic = Some(payload);
            } else {
                warn!("further continuation panicked during settlement");
            }
        }
    }
    if let Some(payload) = first_panic {
        panic::resume_unwind(payload);
    }
}

impl<T: Clone + 'static, E: Clone + 'static> Resolver<T, E> {
    /// Whether a settlement can still be requested through this resolver.
    fn is_open(&self) -> bool {
        let s = self.inner.borrow();
        s.state.is_pending() && !s.locked
    }

    pub fn resolve(&self, value: T) {
        if self.is_open() {
            fulfill(&self.inner, value);
        }
    }

    pub fn reject(&self, error: E) {
        if self.is_open() {
            reject(&self.inner, error);
        }
    }

    /// Settle according to `other`'s eventual settlement.
    ///
    /// `other` may itself be adopting a third deferred; each layer settles
    /// only once the layer beneath it has, so nested chains unwrap fully.
    /// Adopting the deferred this resolver belongs to is ignored.
    pub fn adopt(&self, other: Deferred<T, E>) {
        if !self.is_open() {
            return;
        }
        if Rc::ptr_eq(&self.inner, &other.inner) {
            warn!("deferred cannot adopt itself; ignored");
            return;
        }
        self.inner.borrow_mut().locked = true;
        let on_value = Rc::clone(&self.inner);
        let on_error = Rc::clone(&self.inner);
        other.subscribe(
            move |value| fulfill(&on_value, value),
            move |error| reject(&on_error, error),
        );
    }

    /// Apply a continuation's outcome.
    pub fn settle(&self, outcome: Outcome<T, E>) {
        match outcome {
            Outcome::Fulfill(value) => self.resolve(value),
            Outcome::Reject(error) => self.reject(error),
            Outcome::Adopt(other) => self.adopt(other),
        }
    }

    pub fn is_settled(&self) -> bool {
        !self.inner.borrow().state.is_pending()
    }
}

impl<T: Clone + 'static, E: Clone + 'static> Deferred<T, E> {
    /// Create a pending deferred together with its resolver.
    pub fn pending() -> (Self, Resolver<T, E>) {
        let inner = Rc::new(RefCell::new(Inner {
            state: State::Pending,
            locked: false,
            on_fulfilled: Vec::new(),
            on_rejected: Vec::new(),
        }));
        let resolver = Resolver {
            inner: Rc::clone(&inner),
        };
        (Self { inner }, resolver)
    }

    /// Run `executor` synchronously with a resolver.
    ///
    /// An `Err` returned by the executor rejects the deferred, unless the
    /// executor already settled it. A panicking executor is logged and the
    /// panic resumed to the caller.
    pub fn new<F>(executor: F) -> Self
    where
        F: FnOnce(Resolver<T, E>) -> Result<(), E>,
    {
        let (deferred, resolver) = Self::pending();
        let settler = resolver.clone();
        match panic::catch_unwind(AssertUnwindSafe(move || executor(settler))) {
            Ok(Ok(())) => {}
            Ok(Err(error)) => resolver.reject(error),
            Err(payload) => {
                error!(settled = resolver.is_settled(), "deferred executor panicked");
                panic::resume_unwind(payload);
            }
        }
        deferred
    }

    pub fn resolved(value: T) -> Self {
        let (deferred, resolver) = Self::pending();
        resolver.resolve(value);
        deferred
    }

    pub fn rejected(error: E) -> Self {
        let (deferred, resolver) = Self::pending();
        resolver.reject(error);
        deferred
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> State<T, E> {
        self.inner.borrow().state.clone()
    }

    pub fn is_pending(&self) -> bool {
        self.inner.borrow().state.is_pending()
    }

    pub fn is_fulfilled(&self) -> bool {
        self.inner.borrow().state.is_fulfilled()
    }

    pub fn is_rejected(&self) -> bool {
        self.inner.borrow().state.is_rejected()
    }

    /// The fulfillment value, if fulfilled.
    pub fn value(&self) -> Option<T> {
        match &self.inner.borrow().state {
            State::Fulfilled(value) => Some(value.clone()),
            _ => None,
        }
    }

    /// The rejection error, if rejected.
    pub fn error(&self) -> Option<E> {
        match &self.inner.borrow().state {
            State::Rejected(error) => Some(error.clone()),
            _ => None,
        }
    }

    /// Queue a pair of continuations, or run the matching one now if settled.
    fn subscribe<F, R>(&self, on_fulfilled: F, on_rejected: R)
    where
        F: FnOnce(T) + 'static,
        R: FnOnce(E) + 'static,
    {
        let settled = {
            let mut s = self.inner.borrow_mut();
            if s.state.is_pending() {
                s.on_fulfilled.push(Box::new(on_fulfilled));
                s.on_rejected.push(Box::new(on_rejected));
                return;
            }
            s.state.clone()
        };
        match settled {
            State::Fulfilled(value) => on_fulfilled(value),
            State::Rejected(error) => on_rejected(error),
            State::Pending => {}
        }
    }

    /// General form of `then`: both handlers decide the downstream outcome.
    ///
    /// Runs the matching handler synchronously when already settled.
    pub fn then_with<U, F, R>(&self, on_fulfilled: F, on_rejected: R) -> Deferred<U, E>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Outcome<U, E> + 'static,
        R: FnOnce(E) -> Outcome<U, E> + 'static,
    {
        let (next, resolver) = Deferred::pending();
        let on_error = resolver.clone();
        self.subscribe(
            move |value| resolver.settle(on_fulfilled(value)),
            move |error| on_error.settle(on_rejected(error)),
        );
        next
    }

    /// Map the value; an `Err` rejects the result. Rejections pass through.
    pub fn then<U, F>(&self, on_fulfilled: F) -> Deferred<U, E>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Result<U, E> + 'static,
    {
        self.then_with(move |value| on_fulfilled(value).into(), Outcome::Reject)
    }

    /// Chain a handler that returns another deferred.
    pub fn and_then<U, F>(&self, on_fulfilled: F) -> Deferred<U, E>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Deferred<U, E> + 'static,
    {
        self.then_with(move |value| Outcome::Adopt(on_fulfilled(value)), Outcome::Reject)
    }

    /// `then` with both a fulfillment and a rejection handler.
    pub fn then_both<U, F, R>(&self, on_fulfilled: F, on_rejected: R) -> Deferred<U, E>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> Result<U, E> + 'static,
        R: FnOnce(E) -> Result<U, E> + 'static,
    {
        self.then_with(
            move |value| on_fulfilled(value).into(),
            move |error| on_rejected(error).into(),
        )
    }

    /// Recover from a rejection. Values pass through.
    pub fn catch<R>(&self, on_rejected: R) -> Deferred<T, E>
    where
        R: FnOnce(E) -> Result<T, E> + 'static,
    {
        self.then_with(Outcome::Fulfill, move |error| on_rejected(error).into())
    }

    /// Recover from a rejection with another deferred.
    pub fn or_else<R>(&self, on_rejected: R) -> Deferred<T, E>
    where
        R: FnOnce(E) -> Deferred<T, E> + 'static,
    {
        self.then_with(Outcome::Fulfill, move |error| Outcome::Adopt(on_rejected(error)))
    }

    /// Run `on_finally` once on either path, then forward the outcome unchanged.
    pub fn finally<F>(&self, on_finally: F) -> Deferred<T, E>
    where
        F: FnOnce() + 'static,
    {
        let hook = Rc::new(RefCell::new(Some(on_finally)));
        let hook_err = Rc::clone(&hook);
        self.then_with(
            move |value| {
                run_once(&hook);
                Outcome::Fulfill(value)
            },
            move |error| {
                run_once(&hook_err);
                Outcome::Reject(error)
            },
        )
    }
}

fn run_once<F: FnOnce()>(hook: &RefCell<Option<F>>) {
    let f = hook.borrow_mut().take();
    if let Some(f) = f {
        f();
    }
}

impl<T: fmt::Debug, E: fmt::Debug> fmt::Debug for Deferred<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.inner.borrow();
        f.debug_struct("Deferred")
            .field("state", &s.state)
            .field("queued", &s.on_fulfilled.len())
            .finish()
    }
}

impl<T, E> fmt::Debug for Resolver<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("settled", &!self.inner.borrow().state.is_pending())
            .finish()
    }
}
