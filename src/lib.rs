//! Fetch Scheduler
//!
//! Client-side request scheduling with a Vary-aware response cache.
//!
//! # Components
//!
//! - **Queue**: admits requests under a live concurrency limit, dispatches
//!   foreground requests before preloads, and reports when the network
//!   becomes slow or recovers.
//! - **Cache**: memoizes pending and settled requests under keys that grow
//!   more specific as servers declare `Vary` headers.
//! - **Scheduler**: the facade that serves requests from the cache or queues
//!   them, and keeps the cache consistent with each outcome.
//!
//! The wire exchange itself is left to a caller-provided [`net::Transport`].

pub mod cache;
pub mod config;
pub mod error;
pub mod net;
pub mod scheduler;
pub mod telemetry;

pub use cache::{CacheConfig, RequestCache};
pub use config::SchedulerConfig;
pub use error::{ConfigError, RequestError, TransportError};
pub use net::{
    NetworkObserver, Request, RequestMatcher, RequestState, Response, SendDecision, Settlement,
    Transport,
};
pub use scheduler::{ConcurrencyLimit, DrainResult, RequestQueue, Scheduler};
