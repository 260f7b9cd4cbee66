//! Request queue management.
//!
//! Admits requests under a live concurrency budget, dispatches them to the
//! transport, and tracks whether the network looks slow.
//!
//! Bookkeeping is synchronous and never runs caller code under the queue
//! lock: matchers, observers and request aborts all run after the lock is
//! released. The only deferred work is the poke after a settlement and the
//! slow-check timer.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::concurrency::ConcurrencyLimit;
use crate::error::TransportError;
use crate::net::{
    guarded, NetworkObserver, NoopObserver, Request, RequestMatcher, Response, SendDecision,
    Settlement, Transport,
};
use crate::telemetry;

/// Timers fire up to this much early; a request this close to the bad
/// response time already counts as slow.
pub const TIMER_TOLERANCE: Duration = Duration::from_millis(1);

/// The queue's view of the cache: key derivation for `abort_except` and
/// redirect aliasing after successful responses.
pub trait CacheLink: Send + Sync {
    fn cache_key(&self, request: &Request) -> String;

    fn register_alias_for_redirect(&self, request: &Request, response: &Response);
}

/// Configuration for the request queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub concurrency: ConcurrencyLimit,
    /// Foreground requests outstanding this long make the network slow.
    pub bad_response_time: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: ConcurrencyLimit::default(),
            bad_response_time: Duration::from_millis(400),
        }
    }
}

/// Result of waiting for the queue to go idle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainResult {
    Idle,
    Timeout { remaining: usize },
}

struct SlowTimer {
    deadline: Instant,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct QueueState {
    current: Vec<Request>,
    queued: VecDeque<Request>,
    emitted_slow: bool,
    slow_timer: Option<SlowTimer>,
}

impl QueueState {
    /// First non-preload request, else the head of the queue.
    fn pluck_next(&mut self) -> Option<Request> {
        let index = self
            .queued
            .iter()
            .position(|request| !request.is_preload())
            .or(if self.queued.is_empty() { None } else { Some(0) })?;
        self.queued.remove(index)
    }

    fn remove(&mut self, request: &Request) -> bool {
        if let Some(index) = self.current.iter().position(|r| r.ptr_eq(request)) {
            self.current.remove(index);
            return true;
        }
        if let Some(index) = self.queued.iter().position(|r| r.ptr_eq(request)) {
            self.queued.remove(index);
            return true;
        }
        false
    }

    fn all(&self) -> impl Iterator<Item = &Request> {
        self.current.iter().chain(self.queued.iter())
    }

    fn is_slow(&self, bad_response_time: Duration) -> bool {
        self.all()
            .filter(|request| !request.is_preload())
            .any(|request| request.age() + TIMER_TOLERANCE >= bad_response_time)
    }

    fn record_depth(&self) {
        telemetry::record_queue_depth(self.current.len(), self.queued.len());
    }
}

struct QueueInner {
    state: Mutex<QueueState>,
    config: QueueConfig,
    transport: Arc<dyn Transport>,
    observer: Arc<dyn NetworkObserver>,
    cache_link: Option<Arc<dyn CacheLink>>,
}

/// Shared handle to the request queue.
#[derive(Clone)]
pub struct RequestQueue {
    inner: Arc<QueueInner>,
}

impl RequestQueue {
    pub fn new(config: QueueConfig, transport: Arc<dyn Transport>) -> Self {
        Self::with_collaborators(config, transport, Arc::new(NoopObserver), None)
    }

    pub fn with_collaborators(
        config: QueueConfig,
        transport: Arc<dyn Transport>,
        observer: Arc<dyn NetworkObserver>,
        cache_link: Option<Arc<dyn CacheLink>>,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState::default()),
                config,
                transport,
                observer,
                cache_link,
            }),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Admits a request: dispatches it now if the budget allows, otherwise
    /// queues it. Requests that already settled are ignored.
    pub fn asap(&self, request: Request) {
        if !request.mark_queued() {
            tracing::debug!(request = %request.description(), "ignoring settled request");
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        request.on_settled(move |request, settlement| {
            if let Some(inner) = weak.upgrade() {
                RequestQueue { inner }.on_request_settled(request, settlement);
            }
        });
        {
            let mut state = self.inner.state.lock();
            if request.is_terminal() {
                return;
            }
            state.queued.push_back(request.clone());
            state.record_depth();
            // Armed under the same lock as the push.
            self.arm_slow_timer(&mut state, &request);
        }
        tracing::debug!(
            request = %request.description(),
            preload = request.is_preload(),
            "request admitted"
        );
        self.poke();
    }

    /// Turns a preload into a foreground request in place. Only foreground
    /// requests count toward slowness.
    pub fn promote_to_foreground(&self, request: &Request) {
        if request.take_preload() {
            tracing::debug!(request = %request.description(), "preload promoted");
            let mut state = self.inner.state.lock();
            self.arm_slow_timer(&mut state, request);
        }
    }

    /// Dispatches queued requests while the budget allows.
    pub fn poke(&self) {
        while let Some(request) = self.pluck_next_request() {
            self.send_request_now(request);
        }
    }

    /// Moves the next dispatchable request from the queue into the in-flight
    /// set, if the budget allows.
    pub(crate) fn pluck_next_request(&self) -> Option<Request> {
        let mut state = self.inner.state.lock();
        if !self.inner.config.concurrency.allows(state.current.len()) {
            return None;
        }
        let request = state.pluck_next()?;
        state.current.push(request.clone());
        state.record_depth();
        Some(request)
    }

    /// Sends a request that is already in the in-flight set, unless the
    /// pre-send hook vetoes it. Outside a tokio runtime there is nothing to
    /// drive the transport, so the request settles as a network failure.
    pub(crate) fn send_request_now(&self, request: Request) {
        let decision = guarded("before_send", SendDecision::Proceed, || {
            self.inner.observer.before_send(&request)
        });
        if let SendDecision::Abort(reason) = decision {
            tracing::info!(request = %request.description(), %reason, "send vetoed");
            request.abort(reason);
            return;
        }
        request.mark_loading();
        telemetry::record_dispatch();
        tracing::debug!(request = %request.description(), "sending request");

        let Ok(runtime) = Handle::try_current() else {
            tracing::error!(request = %request.description(), "no async runtime to send on");
            request.fail_network("no async runtime");
            return;
        };
        let transport = Arc::clone(&self.inner.transport);
        let token = request.cancellation_token();
        runtime.spawn(async move {
            let outcome = tokio::select! {
                biased;
                () = token.cancelled() => return,
                outcome = transport.send(request.clone()) => outcome,
            };
            match outcome {
                Ok(response) => request.respond(response),
                Err(TransportError::Aborted) => request.abort("aborted by transport"),
                Err(TransportError::Network(message)) => request.fail_network(message),
            };
        });
    }

    fn on_request_settled(&self, request: &Request, settlement: &Settlement) {
        {
            let mut state = self.inner.state.lock();
            state.remove(request);
            state.record_depth();
        }
        telemetry::record_settlement(settlement.kind());
        tracing::debug!(
            request = %request.description(),
            outcome = settlement.kind(),
            "request settled"
        );

        if let (Settlement::Response(response), Some(link)) = (settlement, &self.inner.cache_link) {
            if response.ok() {
                link.register_alias_for_redirect(request, response);
            }
        }
        self.check_slow();
        guarded("on_settled", (), || self.inner.observer.on_settled(request, settlement));
        self.schedule_poke();
    }

    // Deferred so a settlement handler finishes unwinding before the next
    // dispatch starts.
    fn schedule_poke(&self) {
        let weak = Arc::downgrade(&self.inner);
        match Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Some(inner) = weak.upgrade() {
                        RequestQueue { inner }.poke();
                    }
                });
            }
            Err(_) => self.poke(),
        }
    }

    /// Aborts every queued or in-flight request the matcher selects. Both
    /// lists are scanned in full. Returns how many were aborted.
    pub fn abort(&self, matcher: &RequestMatcher, reason: &str) -> usize {
        let snapshot: Vec<Request> = self.inner.state.lock().all().cloned().collect();
        let doomed: Vec<Request> = snapshot
            .into_iter()
            .filter(|request| matcher.matches(request))
            .collect();
        if doomed.is_empty() {
            return 0;
        }
        {
            let mut state = self.inner.state.lock();
            let keep = |request: &Request| !doomed.iter().any(|d| d.ptr_eq(request));
            state.current.retain(keep);
            state.queued.retain(keep);
            state.record_depth();
        }
        for request in &doomed {
            request.abort(reason);
        }
        telemetry::record_aborts(doomed.len());
        tracing::debug!(?matcher, aborted = doomed.len(), %reason, "requests aborted");
        doomed.len()
    }

    /// Aborts everything with a cache key other than `excused`'s that also
    /// matches `matcher`.
    pub fn abort_except(&self, excused: &Request, matcher: &RequestMatcher, reason: &str) -> usize {
        let link = self.inner.cache_link.clone();
        let excused_key = key_for(&link, excused);
        let matcher = matcher.clone();
        let selection = RequestMatcher::predicate(move |request| {
            key_for(&link, request) != excused_key && matcher.matches(request)
        });
        self.abort(&selection, reason)
    }

    pub fn is_busy(&self) -> bool {
        !self.inner.state.lock().current.is_empty()
    }

    /// True if any foreground request has been outstanding for the bad
    /// response time.
    pub fn is_slow(&self) -> bool {
        self.inner
            .state
            .lock()
            .is_slow(self.inner.config.bad_response_time)
    }

    /// Notifies observers when slowness changed since the last notification.
    pub fn check_slow(&self) -> bool {
        let (slow, changed) = {
            let mut state = self.inner.state.lock();
            let slow = state.is_slow(self.inner.config.bad_response_time);
            let changed = slow != state.emitted_slow;
            state.emitted_slow = slow;
            (slow, changed)
        };
        if changed {
            telemetry::record_slow_transition(slow);
            if slow {
                tracing::warn!("network became slow");
                guarded("on_slow", (), || self.inner.observer.on_slow());
            } else {
                tracing::info!("network recovered");
                guarded("on_recover", (), || self.inner.observer.on_recover());
            }
        }
        slow
    }

    fn arm_slow_timer(&self, state: &mut QueueState, request: &Request) {
        if request.is_preload() {
            return;
        }
        if let Some(queued_at) = request.queued_at() {
            self.schedule_slow_check(state, queued_at + self.slow_after());
        }
    }

    fn slow_after(&self) -> Duration {
        self.inner
            .config
            .bad_response_time
            .saturating_sub(TIMER_TOLERANCE)
    }

    // Keeps a single timer armed for the earliest pending deadline. Callers
    // hold the state lock.
    fn schedule_slow_check(&self, state: &mut QueueState, deadline: Instant) {
        let Ok(runtime) = Handle::try_current() else { return };
        if let Some(timer) = &state.slow_timer {
            if timer.deadline <= deadline {
                return;
            }
            timer.handle.abort();
        }
        let weak: Weak<QueueInner> = Arc::downgrade(&self.inner);
        let handle = runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(inner) = weak.upgrade() {
                RequestQueue { inner }.on_slow_timer(deadline);
            }
        });
        state.slow_timer = Some(SlowTimer { deadline, handle });
    }

    fn on_slow_timer(&self, fired: Instant) {
        self.check_slow();

        let slow_after = self.slow_after();
        let now = Instant::now();
        let mut state = self.inner.state.lock();
        if state.slow_timer.as_ref().is_some_and(|t| t.deadline == fired) {
            state.slow_timer = None;
        }
        let next = state
            .all()
            .filter(|request| !request.is_preload())
            .filter_map(|request| request.queued_at())
            .map(|queued_at| queued_at + slow_after)
            .filter(|deadline| *deadline > now)
            .min();
        if let Some(deadline) = next {
            self.schedule_slow_check(&mut state, deadline);
        }
    }

    /// Waits until nothing is queued or in flight.
    pub async fn drain(&self, timeout: Duration) -> DrainResult {
        let wait = async {
            loop {
                let pending: Vec<Request> = self.inner.state.lock().all().cloned().collect();
                if pending.is_empty() {
                    return;
                }
                join_all(pending.iter().map(|request| request.settled())).await;
                tokio::task::yield_now().await;
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(()) => DrainResult::Idle,
            Err(_) => DrainResult::Timeout { remaining: self.len() },
        }
    }

    pub fn current_requests(&self) -> Vec<Request> {
        self.inner.state.lock().current.clone()
    }

    pub fn queued_requests(&self) -> Vec<Request> {
        self.inner.state.lock().queued.iter().cloned().collect()
    }

    /// Queued plus in-flight.
    pub fn len(&self) -> usize {
        let state = self.inner.state.lock();
        state.current.len() + state.queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Aborts everything, forgets the emitted slow state and cancels the
    /// slow-check timer.
    pub fn reset(&self) {
        let (requests, timer) = {
            let mut state = self.inner.state.lock();
            let mut requests: Vec<Request> = state.current.drain(..).collect();
            requests.extend(state.queued.drain(..));
            state.emitted_slow = false;
            state.record_depth();
            (requests, state.slow_timer.take())
        };
        if let Some(timer) = timer {
            timer.handle.abort();
        }
        for request in requests {
            request.abort("queue reset");
        }
        tracing::debug!("request queue reset");
    }
}

fn key_for(link: &Option<Arc<dyn CacheLink>>, request: &Request) -> String {
    match link {
        Some(link) => link.cache_key(request),
        None => request.description().to_string(),
    }
}
