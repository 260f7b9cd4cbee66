//! Request value object and its settlement handle.
//!
//! A `Request` is a cheap, clonable handle. All clones observe the same
//! lifecycle: the queue tracking it in flight and the cache memoizing it are
//! two views of one object, not two copies.
//!
//! Settlement happens exactly once. Synchronous settle callbacks run first
//! (bookkeeping), then the outcome is published to every awaiter.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use http::{HeaderMap, HeaderName, HeaderValue, Method};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::response::Response;
use crate::error::RequestError;

pub type RequestId = u64;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Built but not yet handed to the scheduler.
    New,
    Queued,
    Loading,
    /// Waiting on a cached request's settlement.
    Tracking,
    Settled,
    Aborted,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Settled | Self::Aborted)
    }
}

/// How a request ended.
#[derive(Debug, Clone)]
pub enum Settlement {
    Response(Arc<Response>),
    Aborted(String),
    NetworkFailure(String),
}

impl Settlement {
    pub fn response(&self) -> Option<&Arc<Response>> {
        match self {
            Self::Response(response) => Some(response),
            _ => None,
        }
    }

    /// Label used for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Response(r) if r.ok() => "ok",
            Self::Response(_) => "failed",
            Self::Aborted(_) => "aborted",
            Self::NetworkFailure(_) => "network_failure",
        }
    }
}

type SettleCallback = Box<dyn FnOnce(&Request, &Settlement) + Send>;

struct Lifecycle {
    state: RequestState,
    queued_at: Option<Instant>,
    preload: bool,
    expired: bool,
    /// Once connected to a cached request, `expired` reads and writes go there.
    expired_delegate: Option<Request>,
    from_cache: bool,
    settlement: Option<Settlement>,
    callbacks: Vec<SettleCallback>,
}

struct RequestInner {
    id: RequestId,
    method: Method,
    url: String,
    headers: HeaderMap,
    params: Vec<(String, String)>,
    body: Option<Vec<u8>>,
    target: Option<String>,
    layer: Option<String>,
    fail: Option<bool>,
    cache: Option<bool>,
    description: String,
    created_at: Instant,
    lifecycle: Mutex<Lifecycle>,
    cancel: CancellationToken,
    outcome: watch::Sender<Option<Settlement>>,
}

/// One desired exchange.
#[derive(Clone)]
pub struct Request {
    inner: Arc<RequestInner>,
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.inner.id)
            .field("description", &self.inner.description)
            .field("state", &self.state())
            .field("preload", &self.is_preload())
            .finish()
    }
}

impl Request {
    pub fn builder(method: Method, url: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(method, url)
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::builder(Method::GET, url).build()
    }

    pub fn id(&self) -> RequestId {
        self.inner.id
    }

    pub fn method(&self) -> &Method {
        &self.inner.method
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.inner.headers
    }

    /// Case-insensitive header lookup. Non-UTF-8 values read as absent.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.inner.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.inner.params
    }

    pub fn body(&self) -> Option<&[u8]> {
        self.inner.body.as_deref()
    }

    pub fn target(&self) -> Option<&str> {
        self.inner.target.as_deref()
    }

    pub fn layer(&self) -> Option<&str> {
        self.inner.layer.as_deref()
    }

    /// Explicit fail classification tag, if the caller set one.
    pub fn fail(&self) -> Option<bool> {
        self.inner.fail
    }

    /// Explicit cache participation, if the caller set one.
    pub fn cache_option(&self) -> Option<bool> {
        self.inner.cache
    }

    /// Identity string: method, URL, params, target and layer.
    pub fn description(&self) -> &str {
        &self.inner.description
    }

    /// Identity comparison: true for clones of the same request.
    pub fn ptr_eq(&self, other: &Request) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn state(&self) -> RequestState {
        self.inner.lifecycle.lock().state
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn is_preload(&self) -> bool {
        self.inner.lifecycle.lock().preload
    }

    pub fn is_from_cache(&self) -> bool {
        self.inner.lifecycle.lock().from_cache
    }

    pub fn queued_at(&self) -> Option<Instant> {
        self.inner.lifecycle.lock().queued_at
    }

    /// Time since the request was queued, or since it was built if it never was.
    pub fn age(&self) -> Duration {
        let since = self.queued_at().unwrap_or(self.inner.created_at);
        Instant::now().saturating_duration_since(since)
    }

    pub fn is_expired(&self) -> bool {
        let delegate = {
            let lifecycle = self.inner.lifecycle.lock();
            match &lifecycle.expired_delegate {
                Some(delegate) => delegate.clone(),
                None => return lifecycle.expired,
            }
        };
        delegate.is_expired()
    }

    /// Marks the request stale. Independent of settlement.
    pub fn set_expired(&self, expired: bool) {
        let delegate = {
            let mut lifecycle = self.inner.lifecycle.lock();
            match &lifecycle.expired_delegate {
                Some(delegate) => delegate.clone(),
                None => {
                    lifecycle.expired = expired;
                    return;
                }
            }
        };
        delegate.set_expired(expired);
    }

    /// The settlement, if the request has settled.
    pub fn settlement(&self) -> Option<Settlement> {
        self.inner.lifecycle.lock().settlement.clone()
    }

    /// The response, if the request settled with one.
    pub fn current_response(&self) -> Option<Arc<Response>> {
        self.settlement().and_then(|s| s.response().cloned())
    }

    /// Waits until the request settles.
    pub async fn settled(&self) -> Settlement {
        if let Some(settlement) = self.settlement() {
            return settlement;
        }
        let mut rx = self.inner.outcome.subscribe();
        let result = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        result.unwrap_or_else(|| Settlement::Aborted("request dropped".to_string()))
    }

    /// Waits for the response. Failed responses are delivered with `ok() == false`.
    pub async fn response(&self) -> Result<Arc<Response>, RequestError> {
        match self.settled().await {
            Settlement::Response(response) => Ok(response),
            Settlement::Aborted(reason) => Err(RequestError::Aborted { reason }),
            Settlement::NetworkFailure(message) => Err(RequestError::NetworkFailure(message)),
        }
    }

    /// Like [`Request::response`], but rejects failed responses.
    pub async fn ok_response(&self) -> Result<Arc<Response>, RequestError> {
        let response = self.response().await?;
        if response.ok() {
            Ok(response)
        } else {
            Err(RequestError::FailedResponse(response))
        }
    }

    /// Registers a callback that runs synchronously on settlement. If the
    /// request already settled, it runs immediately.
    pub fn on_settled<F>(&self, callback: F)
    where
        F: FnOnce(&Request, &Settlement) + Send + 'static,
    {
        let settlement = {
            let mut lifecycle = self.inner.lifecycle.lock();
            match &lifecycle.settlement {
                Some(settlement) => settlement.clone(),
                None => {
                    lifecycle.callbacks.push(Box::new(callback));
                    return;
                }
            }
        };
        callback(self, &settlement);
    }

    /// Aborts the request. No-op if it already settled. Returns true if this
    /// call performed the transition.
    pub fn abort(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let aborted = self.settle(Settlement::Aborted(reason.clone()), RequestState::Aborted);
        if aborted {
            self.inner.cancel.cancel();
            tracing::debug!(request = %self.description(), %reason, "request aborted");
        }
        aborted
    }

    /// Settles with a transport response, applying the fail classification.
    pub fn respond(&self, mut response: Response) -> bool {
        response.classify(self.inner.fail);
        if self.is_expired() {
            response.mark_expired();
        }
        self.settle(Settlement::Response(Arc::new(response)), RequestState::Settled)
    }

    pub fn fail_network(&self, message: impl Into<String>) -> bool {
        self.settle(Settlement::NetworkFailure(message.into()), RequestState::Settled)
    }

    /// Token cancelled when the request is aborted.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Clears the preload flag. Returns true if it was set.
    pub(crate) fn take_preload(&self) -> bool {
        std::mem::replace(&mut self.inner.lifecycle.lock().preload, false)
    }

    pub(crate) fn mark_queued(&self) -> bool {
        let mut lifecycle = self.inner.lifecycle.lock();
        if lifecycle.state.is_terminal() {
            return false;
        }
        lifecycle.state = RequestState::Queued;
        lifecycle.queued_at = Some(Instant::now());
        true
    }

    pub(crate) fn mark_loading(&self) {
        let mut lifecycle = self.inner.lifecycle.lock();
        if !lifecycle.state.is_terminal() {
            lifecycle.state = RequestState::Loading;
        }
    }

    pub(crate) fn mark_tracking(&self) {
        let mut lifecycle = self.inner.lifecycle.lock();
        if !lifecycle.state.is_terminal() {
            lifecycle.state = RequestState::Tracking;
        }
    }

    /// Returns a tracking request to `New` so it can be processed afresh.
    pub(crate) fn reset_to_new(&self) {
        let mut lifecycle = self.inner.lifecycle.lock();
        if lifecycle.state == RequestState::Tracking {
            lifecycle.state = RequestState::New;
        }
    }

    /// Settles with another request's response, delegating `expired` to it.
    pub(crate) fn respond_from_cache(&self, response: Arc<Response>, source: &Request) -> bool {
        {
            let mut lifecycle = self.inner.lifecycle.lock();
            if lifecycle.state.is_terminal() {
                return false;
            }
            lifecycle.from_cache = true;
            lifecycle.expired_delegate = Some(source.clone());
        }
        self.settle(Settlement::Response(response), RequestState::Settled)
    }

    /// Settles with an outcome copied from another request.
    pub(crate) fn adopt(&self, settlement: Settlement) -> bool {
        let state = match settlement {
            Settlement::Aborted(_) => RequestState::Aborted,
            _ => RequestState::Settled,
        };
        self.settle(settlement, state)
    }

    fn settle(&self, settlement: Settlement, state: RequestState) -> bool {
        let callbacks = {
            let mut lifecycle = self.inner.lifecycle.lock();
            if lifecycle.state.is_terminal() {
                return false;
            }
            lifecycle.state = state;
            lifecycle.settlement = Some(settlement.clone());
            std::mem::take(&mut lifecycle.callbacks)
        };
        for callback in callbacks {
            let result = catch_unwind(AssertUnwindSafe(|| callback(self, &settlement)));
            if result.is_err() {
                tracing::error!(request = %self.description(), "settle callback panicked");
            }
        }
        self.inner.outcome.send_replace(Some(settlement));
        true
    }
}

/// Builds a [`Request`].
#[derive(Debug)]
pub struct RequestBuilder {
    method: Method,
    url: String,
    headers: HeaderMap,
    params: Vec<(String, String)>,
    body: Option<Vec<u8>>,
    target: Option<String>,
    layer: Option<String>,
    preload: bool,
    fail: Option<bool>,
    cache: Option<bool>,
}

impl RequestBuilder {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            params: Vec::new(),
            body: None,
            target: None,
            layer: None,
            preload: false,
            fail: None,
            cache: None,
        }
    }

    /// Sets a header. Invalid names or values are skipped.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn layer(mut self, layer: impl Into<String>) -> Self {
        self.layer = Some(layer.into());
        self
    }

    pub fn preload(mut self, preload: bool) -> Self {
        self.preload = preload;
        self
    }

    pub fn fail(mut self, fail: bool) -> Self {
        self.fail = Some(fail);
        self
    }

    pub fn cache(mut self, cache: bool) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn build(self) -> Request {
        let description = describe(
            &self.method,
            &self.url,
            &self.params,
            self.target.as_deref(),
            self.layer.as_deref(),
        );
        let (outcome, _) = watch::channel(None);
        Request {
            inner: Arc::new(RequestInner {
                id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
                method: self.method,
                url: self.url,
                headers: self.headers,
                params: self.params,
                body: self.body,
                target: self.target,
                layer: self.layer,
                fail: self.fail,
                cache: self.cache,
                description,
                created_at: Instant::now(),
                lifecycle: Mutex::new(Lifecycle {
                    state: RequestState::New,
                    queued_at: None,
                    preload: self.preload,
                    expired: false,
                    expired_delegate: None,
                    from_cache: false,
                    settlement: None,
                    callbacks: Vec::new(),
                }),
                cancel: CancellationToken::new(),
                outcome,
            }),
        }
    }
}

/// Identity string for cache keys and logs. Every free-form segment is
/// escaped, so distinct requests never share a description.
fn describe(
    method: &Method,
    url: &str,
    params: &[(String, String)],
    target: Option<&str>,
    layer: Option<&str>,
) -> String {
    let mut description = format!("{method} ");
    push_escaped(&mut description, url);
    for (i, (name, value)) in params.iter().enumerate() {
        description.push(if i == 0 { '?' } else { '&' });
        push_escaped(&mut description, name);
        description.push('=');
        push_escaped(&mut description, value);
    }
    if let Some(target) = target {
        description.push_str(" target=");
        push_escaped(&mut description, target);
    }
    if let Some(layer) = layer {
        description.push_str(" layer=");
        push_escaped(&mut description, layer);
    }
    description
}

/// Appends `segment`, backslash-escaping the characters used as delimiters
/// in descriptions and cache keys.
pub(crate) fn push_escaped(out: &mut String, segment: &str) {
    for c in segment.chars() {
        if matches!(c, '\\' | ' ' | '?' | '&' | '=' | ':') {
            out.push('\\');
        }
        out.push(c);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn description_covers_identity_fields() {
        let request = Request::builder(Method::GET, "/users")
            .param("page", "2")
            .target(".main")
            .layer("root")
            .build();
        assert_eq!(request.description(), "GET /users?page=2 target=.main layer=root");
    }

    #[test]
    fn delimiters_inside_segments_are_escaped() {
        let folded = Request::builder(Method::GET, "/p").target("main layer=root").build();
        let split = Request::builder(Method::GET, "/p").target("main").layer("root").build();
        assert_eq!(split.description(), "GET /p target=main layer=root");
        assert_eq!(folded.description(), r"GET /p target=main\ layer\=root");

        let inline = Request::get("/search?q=1");
        let param = Request::builder(Method::GET, "/search").param("q", "1").build();
        assert_ne!(inline.description(), param.description());
    }

    #[test]
    fn headers_are_case_insensitive() {
        let request = Request::builder(Method::GET, "/").header("X-Up-Target", "body").build();
        assert_eq!(request.header("x-up-target"), Some("body"));
    }

    #[test]
    fn terminal_state_never_changes() {
        let request = Request::get("/a");
        assert!(request.abort("first"));
        assert!(!request.abort("second"));
        assert!(!request.fail_network("late"));
        assert_eq!(request.state(), RequestState::Aborted);
        assert!(request.cancellation_token().is_cancelled());
    }

    #[test]
    fn expired_can_flip_after_settlement() {
        let request = Request::get("/a");
        request.respond(Response::builder(Method::GET, "/a", 200).build());
        request.set_expired(true);
        assert!(request.is_expired());
        assert_eq!(request.state(), RequestState::Settled);
    }

    #[test]
    fn callbacks_run_once_and_late_registrations_run_immediately() {
        let request = Request::get("/a");
        let hits = Arc::new(AtomicU64::new(0));
        let early = hits.clone();
        request.on_settled(move |_, _| {
            early.fetch_add(1, Ordering::SeqCst);
        });
        request.fail_network("boom");
        request.fail_network("again");
        let late = hits.clone();
        request.on_settled(move |_, s| {
            assert_eq!(s.kind(), "network_failure");
            late.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn panicking_callback_does_not_block_settlement() {
        let request = Request::get("/a");
        request.on_settled(|_, _| panic!("observer bug"));
        assert!(request.fail_network("x"));
        assert!(matches!(request.settlement(), Some(Settlement::NetworkFailure(_))));
    }

    #[test]
    fn expired_in_flight_marks_response_stale() {
        let request = Request::get("/a");
        request.set_expired(true);
        request.respond(Response::builder(Method::GET, "/a", 200).build());
        assert!(request.current_response().is_some_and(|r| r.is_expired()));
    }

    #[test]
    fn cached_view_delegates_expired() {
        let source = Request::get("/a");
        source.respond(Response::builder(Method::GET, "/a", 200).build());
        let view = Request::get("/a");
        let response = source.current_response().unwrap();
        assert!(view.respond_from_cache(response, &source));
        view.set_expired(true);
        assert!(source.is_expired());
        assert!(view.is_from_cache());
    }

    #[tokio::test]
    async fn ok_response_rejects_failed_status() {
        let request = Request::get("/missing");
        request.respond(Response::builder(Method::GET, "/missing", 404).build());
        assert!(request.response().await.is_ok());
        let err = request.ok_response().await.unwrap_err();
        assert!(matches!(err, RequestError::FailedResponse(r) if r.status() == 404));
    }

    #[tokio::test]
    async fn abort_reaches_awaiters() {
        let request = Request::get("/a");
        let waiter = request.clone();
        let handle = tokio::spawn(async move { waiter.response().await });
        request.abort("navigated away");
        let err = handle.await.unwrap().unwrap_err();
        assert!(err.is_aborted());
    }
}
