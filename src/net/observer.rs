//! Observer contract for network events.

use std::panic::{catch_unwind, AssertUnwindSafe};

use super::request::{Request, Settlement};

/// Verdict of the pre-send hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendDecision {
    Proceed,
    /// Abort the request instead of sending it.
    Abort(String),
}

/// Receives slow/recover transitions and request lifecycle events.
///
/// Every method has a no-op default. Callbacks run after queue bookkeeping
/// and never under a lock.
pub trait NetworkObserver: Send + Sync {
    fn on_slow(&self) {}

    fn on_recover(&self) {}

    fn before_send(&self, _request: &Request) -> SendDecision {
        SendDecision::Proceed
    }

    fn on_settled(&self, _request: &Request, _settlement: &Settlement) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl NetworkObserver for NoopObserver {}

/// Runs an observer callback, logging instead of unwinding on panic.
pub(crate) fn guarded<T>(hook: &'static str, default: T, f: impl FnOnce() -> T) -> T {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => value,
        Err(_) => {
            tracing::error!(hook, "network observer panicked");
            default
        }
    }
}
