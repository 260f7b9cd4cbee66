//! Scheduler configuration loading from environment variables and TOML.
//!
//! Unparseable environment values fall back to defaults without crashing.
//! Values that parse but make no sense (a zero cache size, a concurrency of
//! zero) are rejected: "no cache" is `FETCH_SCHED_CACHE_ENABLED=false`.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `FETCH_SCHED_CONCURRENCY` | 6 | Max in-flight requests (-1 = unbounded) |
//! | `FETCH_SCHED_BAD_RESPONSE_TIME_MS` | 400 | Slow network threshold (ms) |
//! | `FETCH_SCHED_CACHE_ENABLED` | true | Cache switch |
//! | `FETCH_SCHED_CACHE_SIZE` | 70 | Max cache entries |
//! | `FETCH_SCHED_CACHE_EVICT_AGE_MS` | 5400000 | Max age of a served entry (0 = unbounded) |
//! | `FETCH_SCHED_CACHE_EXPIRE_AGE_MS` | 15000 | Age after which entries are stale (0 = never) |
//! | `FETCH_SCHED_EXPIRE_ON_MUTATION` | true | Expire the cache after non-safe requests |
//! | `FETCH_SCHED_LOG_LEVEL` | info | Log filter directive |
//! | `FETCH_SCHED_LOG_FORMAT` | json | `json` or `pretty` |
//! | `FETCH_SCHED_LOG_FILE` | unset | Append logs to this file instead of stderr |

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::CacheConfig;
use crate::error::ConfigError;
use crate::scheduler::{ConcurrencyLimit, QueueConfig};

/// Complete scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Live setting; clones share it.
    pub concurrency: ConcurrencyLimit,
    pub bad_response_time: Duration,
    pub cache: CacheConfig,
    pub expire_cache_on_mutation: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: ConcurrencyLimit::default(),
            bad_response_time: Duration::from_millis(400),
            cache: CacheConfig::default(),
            expire_cache_on_mutation: true,
        }
    }
}

/// Effective configuration summary (serializable).
#[derive(Debug, Clone, Serialize)]
pub struct EffectiveConfig {
    pub concurrency: isize,
    pub bad_response_time_ms: u64,
    pub cache_enabled: bool,
    pub cache_size: usize,
    pub cache_evict_age_ms: u64,
    pub cache_expire_age_ms: u64,
    pub expire_cache_on_mutation: bool,
}

/// On-disk shape. Every field is optional; ages are milliseconds, 0 = unbounded.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    concurrency: Option<isize>,
    bad_response_time_ms: Option<u64>,
    cache_enabled: Option<bool>,
    cache_size: Option<usize>,
    cache_evict_age_ms: Option<u64>,
    cache_expire_age_ms: Option<u64>,
    expire_cache_on_mutation: Option<bool>,
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache.max_size == 0 {
            return Err(ConfigError::ZeroCacheSize);
        }
        Ok(())
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            concurrency: self.concurrency.clone(),
            bad_response_time: self.bad_response_time,
        }
    }

    /// Parses TOML, filling omitted options with defaults.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let file: FileConfig =
            toml::from_str(source).map_err(|e| ConfigError::Parse(e.to_string()))?;
        let defaults = Self::default();
        let config = Self {
            concurrency: match file.concurrency {
                Some(limit) => ConcurrencyLimit::new(limit)?,
                None => defaults.concurrency,
            },
            bad_response_time: file
                .bad_response_time_ms
                .map_or(defaults.bad_response_time, Duration::from_millis),
            cache: CacheConfig {
                enabled: file.cache_enabled.unwrap_or(defaults.cache.enabled),
                max_size: file.cache_size.unwrap_or(defaults.cache.max_size),
                evict_age: file.cache_evict_age_ms.map_or(defaults.cache.evict_age, age_from_ms),
                expire_age: file
                    .cache_expire_age_ms
                    .map_or(defaults.cache.expire_age, age_from_ms),
            },
            expire_cache_on_mutation: file
                .expire_cache_on_mutation
                .unwrap_or(defaults.expire_cache_on_mutation),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Parse(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&source)
    }

    /// Return a serializable summary of all effective values.
    pub fn effective_config(&self) -> EffectiveConfig {
        EffectiveConfig {
            concurrency: self.concurrency.get(),
            bad_response_time_ms: self.bad_response_time.as_millis() as u64,
            cache_enabled: self.cache.enabled,
            cache_size: self.cache.max_size,
            cache_evict_age_ms: age_to_ms(self.cache.evict_age),
            cache_expire_age_ms: age_to_ms(self.cache.expire_age),
            expire_cache_on_mutation: self.expire_cache_on_mutation,
        }
    }
}

impl EffectiveConfig {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

fn age_from_ms(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

fn age_to_ms(age: Option<Duration>) -> u64 {
    age.map_or(0, |a| a.as_millis() as u64)
}

/// Parse an env var, returning `default` on missing or invalid.
pub(crate) fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<T>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Load cache configuration from environment.
fn load_cache_config() -> CacheConfig {
    let defaults = CacheConfig::default();
    CacheConfig {
        enabled: parse_env("FETCH_SCHED_CACHE_ENABLED", defaults.enabled),
        max_size: parse_env("FETCH_SCHED_CACHE_SIZE", defaults.max_size),
        evict_age: age_from_ms(parse_env(
            "FETCH_SCHED_CACHE_EVICT_AGE_MS",
            age_to_ms(defaults.evict_age),
        )),
        expire_age: age_from_ms(parse_env(
            "FETCH_SCHED_CACHE_EXPIRE_AGE_MS",
            age_to_ms(defaults.expire_age),
        )),
    }
}

/// Load all configuration from environment variables.
pub fn load() -> Result<SchedulerConfig, ConfigError> {
    let concurrency = parse_env("FETCH_SCHED_CONCURRENCY", ConcurrencyLimit::default().get());
    let bad_response_ms = parse_env("FETCH_SCHED_BAD_RESPONSE_TIME_MS", 400u64);
    let config = SchedulerConfig {
        concurrency: ConcurrencyLimit::new(concurrency)?,
        bad_response_time: Duration::from_millis(bad_response_ms),
        cache: load_cache_config(),
        expire_cache_on_mutation: parse_env("FETCH_SCHED_EXPIRE_ON_MUTATION", true),
    };
    config.validate()?;
    Ok(config)
}
