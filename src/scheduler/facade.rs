//! Scheduler facade.
//!
//! A caller hands over a request; the scheduler serves it from the cache or
//! queues it and caches the pending request. Settled requests update the
//! cache according to their outcome.

use std::sync::{Arc, Weak};
use std::time::Duration;

use super::queue::{CacheLink, DrainResult, RequestQueue};
use crate::cache::{ConnectOptions, RequestCache};
use crate::config::SchedulerConfig;
use crate::error::ConfigError;
use crate::net::{NetworkObserver, NoopObserver, Request, RequestMatcher, Settlement, Transport};

struct SchedulerInner {
    queue: RequestQueue,
    cache: RequestCache,
    config: SchedulerConfig,
}

/// Injectable scheduler instance. Independent instances never share state.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, transport: Arc<dyn Transport>) -> Result<Self, ConfigError> {
        Self::with_observer(config, transport, Arc::new(NoopObserver))
    }

    pub fn with_observer(
        config: SchedulerConfig,
        transport: Arc<dyn Transport>,
        observer: Arc<dyn NetworkObserver>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let cache = RequestCache::new(config.cache.clone())?;
        let link: Arc<dyn CacheLink> = Arc::new(cache.clone());
        let queue =
            RequestQueue::with_collaborators(config.queue_config(), transport, observer, Some(link));
        tracing::info!(
            concurrency = config.concurrency.get(),
            bad_response_time_ms = config.bad_response_time.as_millis() as u64,
            cache_enabled = config.cache.enabled,
            cache_size = config.cache.max_size,
            "scheduler created"
        );
        Ok(Self { inner: Arc::new(SchedulerInner { queue, cache, config }) })
    }

    /// Processes a request and returns it as the handle to await.
    ///
    /// Must be called within a Tokio runtime.
    pub fn request(&self, request: Request) -> Request {
        process_request(&self.inner, request.clone());
        request
    }

    pub fn queue(&self) -> &RequestQueue {
        &self.inner.queue
    }

    pub fn cache(&self) -> &RequestCache {
        &self.inner.cache
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// True if the request would be looked up in and stored into the cache.
    pub fn will_cache(&self, request: &Request) -> bool {
        will_cache(&self.inner, request)
    }

    pub fn abort(&self, matcher: &RequestMatcher, reason: &str) -> usize {
        self.inner.queue.abort(matcher, reason)
    }

    pub fn is_busy(&self) -> bool {
        self.inner.queue.is_busy()
    }

    pub fn is_slow(&self) -> bool {
        self.inner.queue.is_slow()
    }

    pub async fn drain(&self, timeout: Duration) -> DrainResult {
        self.inner.queue.drain(timeout).await
    }

    /// Aborts every request, clears the cache and cancels pending timers.
    pub fn reset(&self) {
        self.inner.queue.reset();
        self.inner.cache.reset();
        tracing::debug!("scheduler reset");
    }
}

fn will_cache(inner: &SchedulerInner, request: &Request) -> bool {
    inner.config.cache.enabled && request.cache_option().unwrap_or_else(|| request.method().is_safe())
}

fn process_request(inner: &Arc<SchedulerInner>, request: Request) {
    if !use_cached_request(inner, &request) {
        queue_request(inner, request);
    }
}

fn use_cached_request(inner: &Arc<SchedulerInner>, request: &Request) -> bool {
    if !will_cache(inner, request) {
        return false;
    }
    let Some(cached) = inner.cache.get(request) else {
        return false;
    };
    tracing::debug!(request = %request.description(), "re-using cached request");
    if !request.is_preload() {
        inner.queue.promote_to_foreground(&cached);
    }
    let weak = Arc::downgrade(inner);
    inner.cache.connect(
        &cached,
        request.clone(),
        ConnectOptions::on_incompatible(move |request| {
            if let Some(inner) = weak.upgrade() {
                process_request(&inner, request);
            }
        }),
    );
    true
}

fn queue_request(inner: &Arc<SchedulerInner>, request: Request) {
    if will_cache(inner, &request) {
        inner.cache.put(&request);
    }
    let weak = Arc::downgrade(inner);
    request.on_settled(move |request, settlement| handle_caching(&weak, request, settlement));
    inner.queue.asap(request);
}

fn handle_caching(weak: &Weak<SchedulerInner>, request: &Request, settlement: &Settlement) {
    let Some(inner) = weak.upgrade() else { return };
    let cache = &inner.cache;
    match settlement {
        Settlement::Response(response) => {
            if inner.config.expire_cache_on_mutation && !request.method().is_safe() {
                cache.expire(&RequestMatcher::All.except(request));
            }
            if !response.ok() {
                let url = request.url().to_string();
                cache.evict(&RequestMatcher::predicate(move |cached| cached.url() == url));
            }
        }
        Settlement::Aborted(_) | Settlement::NetworkFailure(_) => {
            cache.delete(request);
        }
    }
}
