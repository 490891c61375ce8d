//! Single-owner pollable futures.
//!
//! A [`Promise`] is the consumer half of an asynchronous result. It is polled
//! from a synchronous tick with [`Promise::try_consume`]: exactly one call ever
//! observes the terminal outcome, every later call reports
//! [`Consume::AlreadyConsumed`] without touching the result again.
//!
//! The producer half is a [`Resolver`]. Dropping a resolver without resolving it
//! settles the promise as cancelled, so a promise is never left pending once
//! nothing can complete it.

use crate::cancel::CancelScope;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::Handle;

#[derive(Debug)]
enum Slot<T, E> {
    Pending,
    Succeeded(T),
    Failed(E),
    Cancelled,
    Taken,
}

/// Result of polling a promise.
#[derive(Debug, PartialEq, Eq)]
pub enum Consume<T, E> {
    /// Not settled yet; poll again on a later tick.
    Pending,
    Succeeded(T),
    Failed(E),
    Cancelled,
    /// The outcome was already handed out by an earlier call.
    AlreadyConsumed,
}

impl<T, E> Consume<T, E> {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

/// Consumer half of a take-once asynchronous result.
#[derive(Debug)]
pub struct Promise<T, E> {
    slot: Arc<Mutex<Slot<T, E>>>,
}

/// Producer half of a [`Promise`].
#[derive(Debug)]
pub struct Resolver<T, E> {
    slot: Option<Arc<Mutex<Slot<T, E>>>>,
}

impl<T, E> Promise<T, E> {
    /// Create a pending promise and its resolver.
    pub fn pending() -> (Self, Resolver<T, E>) {
        let slot = Arc::new(Mutex::new(Slot::Pending));
        (
            Self { slot: slot.clone() },
            Resolver { slot: Some(slot) },
        )
    }

    /// A promise that is already settled with `value`.
    pub fn ready(value: Result<T, E>) -> Self {
        let (promise, resolver) = Self::pending();
        resolver.resolve(value);
        promise
    }

    /// Take the outcome if it is settled. Only the first call after settling
    /// returns it; all later calls return [`Consume::AlreadyConsumed`].
    pub fn try_consume(&mut self) -> Consume<T, E> {
        let mut slot = self.slot.lock();
        match &*slot {
            Slot::Pending => return Consume::Pending,
            Slot::Taken => return Consume::AlreadyConsumed,
            _ => {}
        }
        match std::mem::replace(&mut *slot, Slot::Taken) {
            Slot::Succeeded(v) => Consume::Succeeded(v),
            Slot::Failed(e) => Consume::Failed(e),
            Slot::Cancelled => Consume::Cancelled,
            Slot::Pending | Slot::Taken => unreachable!("checked above"),
        }
    }

    /// Whether the promise has settled and its outcome not yet consumed.
    pub fn is_settled(&self) -> bool {
        !matches!(&*self.slot.lock(), Slot::Pending | Slot::Taken)
    }

    pub fn is_consumed(&self) -> bool {
        matches!(&*self.slot.lock(), Slot::Taken)
    }
}

impl<T, E> Promise<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Run `fut` on `runtime` under `scope`.
    ///
    /// The promise settles as cancelled if the scope is cancelled while the
    /// future is still pending. A future that completes anyway keeps its
    /// outcome: a value built across a late cancellation still reaches the
    /// consumer, which owns releasing it.
    pub fn spawn<F>(runtime: &Handle, scope: &CancelScope, fut: F) -> Self
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        let (promise, resolver) = Self::pending();
        let scope = scope.clone();
        runtime.spawn(async move {
            tokio::select! {
                biased;
                _ = scope.cancelled() => resolver.cancel(),
                out = fut => resolver.resolve(out),
            }
        });
        promise
    }
}

impl<T, E> Resolver<T, E> {
    pub fn resolve(mut self, value: Result<T, E>) {
        self.settle(match value {
            Ok(v) => Slot::Succeeded(v),
            Err(e) => Slot::Failed(e),
        });
    }

    pub fn cancel(mut self) {
        self.settle(Slot::Cancelled);
    }

    fn settle(&mut self, outcome: Slot<T, E>) {
        if let Some(slot) = self.slot.take() {
            let mut slot = slot.lock();
            if matches!(&*slot, Slot::Pending) {
                *slot = outcome;
            }
        }
    }
}

impl<T, E> Drop for Resolver<T, E> {
    fn drop(&mut self) {
        self.settle(Slot::Cancelled);
    }
}
