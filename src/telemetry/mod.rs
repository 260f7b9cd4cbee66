//! Telemetry module.
//!
//! Structured logging setup and the metrics the scheduler records.

mod logging;
mod metrics;

pub use logging::{init_logging, LogConfig, LogError, LogFormat};
pub use self::metrics::{
    record_aborts, record_cache_lookup, record_dispatch, record_queue_depth,
    record_settlement, record_slow_transition,
};
