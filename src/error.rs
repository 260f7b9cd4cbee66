//! Error types for the request scheduler.
//!
//! Queue and cache never retry. They only route one of these outcomes to
//! whoever awaits a request.

use std::sync::Arc;
use thiserror::Error;

use crate::net::Response;

/// Outcome of awaiting a request that did not produce a usable response.
#[derive(Debug, Clone, Error)]
pub enum RequestError {
    /// Explicit cancellation, including supersession by a cache incompatibility.
    #[error("Request aborted: {reason}")]
    Aborted { reason: String },

    #[error("Network failure: {0}")]
    NetworkFailure(String),

    /// A response arrived but was classified as not ok. Only produced when the
    /// caller opts into treating failed responses as rejections.
    #[error("Failed response: HTTP {}", .0.status())]
    FailedResponse(Arc<Response>),
}

impl RequestError {
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }
}

/// Errors a transport reports back to the queue.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport aborted the exchange")]
    Aborted,

    #[error("Transport failure: {0}")]
    Network(String),
}

/// Invalid scheduler or cache configuration.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Cache size must be greater than zero; disable the cache instead")]
    ZeroCacheSize,

    #[error("Invalid concurrency {0}: use a positive limit or -1 for unbounded")]
    InvalidConcurrency(isize),

    #[error("Failed to parse configuration: {0}")]
    Parse(String),
}
