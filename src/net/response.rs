//! Fully buffered HTTP response model.
//!
//! A `Response` is immutable once published. The transport builds it with
//! [`ResponseBuilder`]; the owning request classifies it (ok / failed) and
//! stamps stale-on-arrival before wrapping it in an `Arc`.

use std::borrow::Cow;

use http::header::VARY;
use http::{HeaderMap, HeaderName, HeaderValue, Method};

/// A completed exchange.
#[derive(Debug, Clone)]
pub struct Response {
    method: Method,
    url: String,
    status: u16,
    headers: HeaderMap,
    body: Vec<u8>,
    ok: bool,
    vary_header_names: Vec<String>,
    expired: bool,
}

impl Response {
    pub fn builder(method: Method, url: impl Into<String>, status: u16) -> ResponseBuilder {
        ResponseBuilder {
            method,
            url: url.into(),
            status,
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }

    /// Method actually used for the exchange.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Final URL after redirects.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    /// True unless the exchange was classified as failed.
    pub fn ok(&self) -> bool {
        self.ok
    }

    /// Lowercased header names the server declared in `Vary`.
    pub fn vary_header_names(&self) -> &[String] {
        &self.vary_header_names
    }

    /// The request was expired while this response was still in flight.
    /// Downstream consumers should revalidate rather than trust it as fresh.
    pub fn is_expired(&self) -> bool {
        self.expired
    }

    /// True if the exchange ended at a different method or URL than requested.
    pub fn is_redirect_of(&self, method: &Method, url: &str) -> bool {
        self.method != *method || self.url != url
    }

    /// Applies the fail classification. `fail` is the caller's explicit tag;
    /// without one, 2xx and 304 count as ok.
    pub(crate) fn classify(&mut self, fail: Option<bool>) {
        self.ok = match fail {
            Some(fail) => !fail,
            None => is_success_status(self.status),
        };
    }

    pub(crate) fn mark_expired(&mut self) {
        self.expired = true;
    }
}

/// Default status classification.
pub fn is_success_status(status: u16) -> bool {
    (200..300).contains(&status) || status == 304
}

/// Splits a `Vary` header into lowercased names. `*` is not a header name and
/// is dropped.
pub fn parse_vary(headers: &HeaderMap) -> Vec<String> {
    let mut names: Vec<String> = headers
        .get_all(VARY)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty() && name != "*")
        .collect();
    names.dedup();
    names
}

/// Builder used by transports.
#[derive(Debug)]
pub struct ResponseBuilder {
    method: Method,
    url: String,
    status: u16,
    headers: HeaderMap,
    body: Vec<u8>,
}

impl ResponseBuilder {
    /// Adds a header. Invalid names or values are skipped.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.append(name, value);
        }
        self
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn build(self) -> Response {
        let vary_header_names = parse_vary(&self.headers);
        Response {
            ok: is_success_status(self.status),
            method: self.method,
            url: self.url,
            status: self.status,
            headers: self.headers,
            body: self.body,
            vary_header_names,
            expired: false,
        }
    }
}
