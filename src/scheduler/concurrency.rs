//! Live concurrency setting.

use std::fmt;
use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ConfigError;

/// Maximum number of requests in flight, shared between every holder.
///
/// The queue reads it on each admission decision, so a caller may retune it
/// at runtime. `-1` means unbounded.
#[derive(Clone)]
pub struct ConcurrencyLimit(Arc<AtomicIsize>);

impl ConcurrencyLimit {
    pub const UNBOUNDED: isize = -1;

    pub fn new(limit: isize) -> Result<Self, ConfigError> {
        validate(limit)?;
        Ok(Self(Arc::new(AtomicIsize::new(limit))))
    }

    pub fn unbounded() -> Self {
        Self(Arc::new(AtomicIsize::new(Self::UNBOUNDED)))
    }

    pub fn get(&self) -> isize {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self, limit: isize) -> Result<(), ConfigError> {
        validate(limit)?;
        self.0.store(limit, Ordering::Release);
        Ok(())
    }

    pub fn is_unbounded(&self) -> bool {
        self.get() == Self::UNBOUNDED
    }

    /// True if one more request may start with `in_flight` already running.
    pub fn allows(&self, in_flight: usize) -> bool {
        match usize::try_from(self.get()) {
            Ok(limit) => in_flight < limit,
            Err(_) => true,
        }
    }
}

fn validate(limit: isize) -> Result<(), ConfigError> {
    if limit == ConcurrencyLimit::UNBOUNDED || limit > 0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidConcurrency(limit))
    }
}

impl Default for ConcurrencyLimit {
    fn default() -> Self {
        Self(Arc::new(AtomicIsize::new(6)))
    }
}

impl fmt::Debug for ConcurrencyLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ConcurrencyLimit").field(&self.get()).finish()
    }
}

impl PartialEq for ConcurrencyLimit {
    fn eq(&self, other: &Self) -> bool {
        self.get() == other.get()
    }
}

impl Eq for ConcurrencyLimit {}

impl Serialize for ConcurrencyLimit {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.get() as i64)
    }
}

impl<'de> Deserialize<'de> for ConcurrencyLimit {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let limit = isize::deserialize(deserializer)?;
        Self::new(limit).map_err(serde::de::Error::custom)
    }
}
