//! Vary-aware request cache.
//!
//! Requests are memoized under a key built from their description plus the
//! values of every header a server has declared, via `Vary`, as affecting
//! responses for that description. The set of such header names only grows,
//! so key granularity tunes itself from observed server behaviour.
//!
//! Entries are re-keyed once their response arrives. Renames are done by
//! locating the stored entry and moving it, so an entry is never lost or
//! duplicated even when the vary set grew while it was in flight.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use serde::{Deserialize, Serialize};

use super::bounded::BoundedCache;
use crate::error::ConfigError;
use crate::net::{push_escaped, Request, RequestMatcher, Response, Settlement};
use crate::scheduler::CacheLink;
use crate::telemetry;

/// Configuration for the request cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// "No cache" switch. A disabled cache still needs a valid size.
    pub enabled: bool,
    pub max_size: usize,
    /// Entries older than this are no longer served. `None` = unbounded.
    pub evict_age: Option<Duration>,
    /// Entries older than this are served but reported stale. `None` = never.
    pub expire_age: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: 70,
            evict_age: Some(Duration::from_secs(90 * 60)),
            expire_age: Some(Duration::from_secs(15)),
        }
    }
}

/// Options for [`RequestCache::connect`].
#[derive(Default)]
pub struct ConnectOptions {
    /// Skip the compatibility check (redirect aliasing).
    pub force: bool,
    /// Called with the new request when its cached source turned out to be
    /// incompatible. The request is back in the `New` state.
    pub on_incompatible: Option<Box<dyn FnOnce(Request) + Send>>,
}

impl ConnectOptions {
    pub fn forced() -> Self {
        Self { force: true, on_incompatible: None }
    }

    pub fn on_incompatible<F>(callback: F) -> Self
    where
        F: FnOnce(Request) + Send + 'static,
    {
        Self { force: false, on_incompatible: Some(Box::new(callback)) }
    }
}

struct CacheState {
    map: BoundedCache<Request>,
    /// description -> header names declared as vary-relevant for it.
    vary_info: HashMap<String, BTreeSet<String>>,
}

impl CacheState {
    fn previous_vary_header_names(&self, request: &Request) -> Option<&BTreeSet<String>> {
        self.vary_info.get(request.description())
    }

    /// Description plus `:name=value` per known vary name. A header the
    /// request lacks is encoded as a bare `:name`, distinct from an empty value.
    fn cache_key(&self, request: &Request) -> String {
        let mut key = request.description().to_string();
        for name in self.previous_vary_header_names(request).into_iter().flatten() {
            key.push(':');
            key.push_str(name);
            if let Some(value) = request.header(name) {
                key.push('=');
                push_escaped(&mut key, value);
            }
        }
        key
    }

    fn merge_previous_header_names(&mut self, request: &Request, response: &Response) {
        if response.vary_header_names().is_empty() {
            return;
        }
        self.vary_info
            .entry(request.description().to_string())
            .or_default()
            .extend(response.vary_header_names().iter().cloned());
    }

    fn stored_key(&self, request: &Request) -> Option<String> {
        self.map
            .iter()
            .find(|(_, cached)| cached.ptr_eq(request))
            .map(|(key, _)| key.to_string())
    }
}

struct CacheInner {
    state: Mutex<CacheState>,
    config: CacheConfig,
}

/// Shared handle to the request cache.
#[derive(Clone)]
pub struct RequestCache {
    inner: Arc<CacheInner>,
}

impl RequestCache {
    pub fn new(config: CacheConfig) -> Result<Self, ConfigError> {
        let map = BoundedCache::new(config.max_size, config.evict_age)?;
        Ok(Self {
            inner: Arc::new(CacheInner {
                state: Mutex::new(CacheState { map, vary_info: HashMap::new() }),
                config,
            }),
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Key for `request` given the vary names known so far.
    pub fn cache_key(&self, request: &Request) -> String {
        self.inner.state.lock().cache_key(request)
    }

    /// Header names observed as vary-relevant for the request's description.
    pub fn previous_vary_header_names(&self, request: &Request) -> Vec<String> {
        let state = self.inner.state.lock();
        state
            .previous_vary_header_names(request)
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Cached request for `request`'s current key, if still usable.
    pub fn get(&self, request: &Request) -> Option<Request> {
        let cached = {
            let mut state = self.inner.state.lock();
            let key = state.cache_key(request);
            state.map.get(&key).cloned()
        };
        telemetry::record_cache_lookup(cached.is_some());
        tracing::trace!(request = %request.description(), hit = cached.is_some(), "cache lookup");
        cached
    }

    /// Stores `request` under its current key, making room first. The entry
    /// is re-keyed when the request settles.
    pub fn put(&self, request: &Request) {
        {
            let mut state = self.inner.state.lock();
            let evicted = state.map.make_room();
            if evicted > 0 {
                tracing::debug!(evicted, "cache full, evicted oldest entries");
            }
            let key = state.cache_key(request);
            state.map.set(&key, request.clone());
        }
        let weak = Arc::downgrade(&self.inner);
        request.on_settled(move |request, _| {
            if let Some(inner) = weak.upgrade() {
                RequestCache { inner }.update_cache_key(request);
            }
        });
    }

    /// Merges the response's vary names and moves the entry to its new key.
    /// Returns the entry's key, or `None` if `request` is not cached.
    pub fn update_cache_key(&self, request: &Request) -> Option<String> {
        let response = request.current_response();
        let mut state = self.inner.state.lock();
        if let Some(response) = &response {
            state.merge_previous_header_names(request, response);
        }
        let old_key = state.stored_key(request)?;
        let new_key = state.cache_key(request);
        if old_key != new_key {
            state.map.rename(&old_key, &new_key);
            tracing::debug!(%old_key, %new_key, "cache entry re-keyed");
        }
        Some(new_key)
    }

    /// Serves `new_request` from `existing`'s settlement and caches it under
    /// its own key. Returns `None` if `existing` is not cached.
    pub fn alias(&self, existing: &Request, new_request: Request) -> Option<Request> {
        let existing = self.get(existing)?;
        self.connect(&existing, new_request.clone(), ConnectOptions::forced());
        self.put(&new_request);
        Some(new_request)
    }

    /// Resolves `new_request` from `existing` once it settles.
    ///
    /// A response is shared only when forced or when both requests still have
    /// the same key at that point; otherwise `on_incompatible` gets the new
    /// request back. Errors are propagated as-is.
    pub fn connect(&self, existing: &Request, new_request: Request, options: ConnectOptions) {
        new_request.mark_tracking();
        if let Some(settlement) = existing.settlement() {
            self.resolve_connection(existing, new_request, settlement, options);
            return;
        }
        let cache = self.clone();
        match Handle::try_current() {
            Ok(runtime) => {
                let existing = existing.clone();
                runtime.spawn(async move {
                    let settlement = existing.settled().await;
                    cache.resolve_connection(&existing, new_request, settlement, options);
                });
            }
            // Without a runtime, resolve from the settle callbacks. Callbacks
            // run in registration order, so the entry is re-keyed first.
            Err(_) => existing.on_settled(move |existing, settlement| {
                cache.resolve_connection(existing, new_request, settlement.clone(), options);
            }),
        }
    }

    fn resolve_connection(
        &self,
        existing: &Request,
        new_request: Request,
        settlement: Settlement,
        options: ConnectOptions,
    ) {
        let Settlement::Response(response) = settlement else {
            new_request.adopt(settlement);
            return;
        };
        if options.force || self.is_compatible(existing, &new_request) {
            new_request.respond_from_cache(response, existing);
            return;
        }
        new_request.reset_to_new();
        if new_request.is_terminal() {
            return;
        }
        tracing::debug!(
            request = %new_request.description(),
            "cached request became incompatible, reprocessing"
        );
        if let Some(on_incompatible) = options.on_incompatible {
            on_incompatible(new_request);
        }
    }

    /// True if both requests map to the same key right now.
    pub fn is_compatible(&self, a: &Request, b: &Request) -> bool {
        if a.ptr_eq(b) {
            return true;
        }
        let state = self.inner.state.lock();
        state.cache_key(a) == state.cache_key(b)
    }

    /// Removes `request`'s entry, wherever it is stored.
    pub fn delete(&self, request: &Request) -> bool {
        let mut state = self.inner.state.lock();
        state.map.retain(|_, cached| !cached.ptr_eq(request)) > 0
    }

    /// Removes every matching entry.
    pub fn evict(&self, matcher: &RequestMatcher) -> usize {
        let doomed = self.matching(matcher);
        if doomed.is_empty() {
            return 0;
        }
        let removed = {
            let mut state = self.inner.state.lock();
            state
                .map
                .retain(|_, cached| !doomed.iter().any(|d| d.ptr_eq(cached)))
        };
        tracing::debug!(?matcher, removed, "cache evict");
        removed
    }

    /// Marks every matching entry stale without removing it.
    pub fn expire(&self, matcher: &RequestMatcher) -> usize {
        let stale = self.matching(matcher);
        for request in &stale {
            request.set_expired(true);
        }
        tracing::debug!(?matcher, expired = stale.len(), "cache expire");
        stale.len()
    }

    /// True if the request was expired explicitly or is older than `expire_age`.
    pub fn is_stale(&self, request: &Request) -> bool {
        request.is_expired()
            || self
                .inner
                .config
                .expire_age
                .is_some_and(|age| request.age() >= age)
    }

    pub fn make_room(&self) -> usize {
        self.inner.state.lock().map.make_room()
    }

    /// Snapshot of the cached requests.
    pub fn requests(&self) -> Vec<Request> {
        self.inner.state.lock().map.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.state.lock().map.is_empty()
    }

    /// Drops every entry and every learned vary name.
    pub fn reset(&self) {
        let mut state = self.inner.state.lock();
        state.map.clear();
        state.vary_info.clear();
    }

    // Matchers may run caller code, so they never run under the lock.
    fn matching(&self, matcher: &RequestMatcher) -> Vec<Request> {
        self.requests()
            .into_iter()
            .filter(|request| matcher.matches(request))
            .collect()
    }
}

impl CacheLink for RequestCache {
    fn cache_key(&self, request: &Request) -> String {
        RequestCache::cache_key(self, request)
    }

    fn register_alias_for_redirect(&self, request: &Request, response: &Response) {
        if !response.is_redirect_of(request.method(), request.url()) {
            return;
        }
        let mut builder = Request::builder(response.method().clone(), response.url())
            .headers(request.headers().clone());
        if let Some(target) = request.target() {
            builder = builder.target(target);
        }
        if let Some(layer) = request.layer() {
            builder = builder.layer(layer);
        }
        let redirect = builder.build();
        if self.get(&redirect).is_some() {
            return;
        }
        if self.alias(request, redirect).is_some() {
            tracing::debug!(
                from = %request.url(),
                to = %response.url(),
                "cached redirect alias"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookups_do_not_record_vary_sets() {
        let cache = RequestCache::new(CacheConfig::default()).unwrap();
        let a = Request::get("/a");
        let b = Request::get("/b");
        assert!(cache.get(&a).is_none());
        assert!(!cache.is_compatible(&a, &b));
        let _ = CacheLink::cache_key(&cache, &b);
        assert!(cache.previous_vary_header_names(&a).is_empty());
        assert!(cache.inner.state.lock().vary_info.is_empty());

        cache.put(&a);
        a.respond(
            Response::builder(http::Method::GET, "/a", 200)
                .header("Vary", "Accept")
                .build(),
        );
        assert_eq!(cache.inner.state.lock().vary_info.len(), 1);
    }
}
