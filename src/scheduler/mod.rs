//! Request scheduling module.
//!
//! Admission under a live concurrency budget, slow-network detection, and the
//! facade that puts the request cache in front of the queue.

mod concurrency;
mod facade;
mod queue;

pub use concurrency::ConcurrencyLimit;
pub use facade::Scheduler;
pub use queue::{CacheLink, DrainResult, QueueConfig, RequestQueue, TIMER_TOLERANCE};
