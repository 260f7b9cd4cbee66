//! Caching module.
//!
//! A generic capacity/age-bounded map and the Vary-aware request cache built
//! on top of it.

mod bounded;
mod request_cache;

pub use bounded::{BoundedCache, KeyNormalizer};
pub use request_cache::{CacheConfig, ConnectOptions, RequestCache};
