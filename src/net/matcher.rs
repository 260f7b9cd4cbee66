//! Request selection for abort, evict and expire.

use std::fmt;
use std::sync::Arc;

use regex::Regex;

use super::request::Request;

/// URL glob pattern. Multiple patterns are separated by whitespace and `*`
/// matches any run of characters. A pattern without a query matches URLs
/// regardless of their query string.
#[derive(Debug, Clone)]
pub struct UrlPattern {
    source: String,
    regex: Regex,
}

impl UrlPattern {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        let alternatives: Vec<String> = pattern
            .split_whitespace()
            .map(|glob| {
                let escaped: Vec<String> = glob.split('*').map(regex::escape).collect();
                escaped.join(".*")
            })
            .collect();
        let regex = Regex::new(&format!(r"^(?:{})(?:\?.*)?$", alternatives.join("|")))?;
        Ok(Self { source: pattern.to_string(), regex })
    }

    pub fn matches(&self, url: &str) -> bool {
        self.regex.is_match(url)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

type Predicate = Arc<dyn Fn(&Request) -> bool + Send + Sync>;

/// Selects requests held by the queue or the cache.
#[derive(Clone)]
pub enum RequestMatcher {
    All,
    /// Identity match against one request.
    Request(Request),
    Url(UrlPattern),
    Predicate(Predicate),
}

impl fmt::Debug for RequestMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("All"),
            Self::Request(r) => f.debug_tuple("Request").field(&r.id()).finish(),
            Self::Url(p) => f.debug_tuple("Url").field(&p.as_str()).finish(),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

impl RequestMatcher {
    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&Request) -> bool + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(f))
    }

    pub fn url(pattern: &str) -> Result<Self, regex::Error> {
        UrlPattern::new(pattern).map(Self::Url)
    }

    /// Same selection, minus `excused`.
    pub fn except(self, excused: &Request) -> Self {
        let excused = excused.clone();
        Self::predicate(move |r| !r.ptr_eq(&excused) && self.matches(r))
    }

    pub fn matches(&self, request: &Request) -> bool {
        match self {
            Self::All => true,
            Self::Request(other) => other.ptr_eq(request),
            Self::Url(pattern) => pattern.matches(request.url()),
            Self::Predicate(f) => f(request),
        }
    }
}

impl From<&Request> for RequestMatcher {
    fn from(request: &Request) -> Self {
        Self::Request(request.clone())
    }
}

impl From<UrlPattern> for RequestMatcher {
    fn from(pattern: UrlPattern) -> Self {
        Self::Url(pattern)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_patterns() {
        let pattern = UrlPattern::new("/users/* /admin").unwrap();
        assert!(pattern.matches("/users/1"));
        assert!(pattern.matches("/users/1?tab=posts"));
        assert!(pattern.matches("/admin"));
        assert!(!pattern.matches("/admin/settings"));
        assert!(!pattern.matches("/posts"));
    }

    #[test]
    fn regex_metacharacters_are_literal() {
        let pattern = UrlPattern::new("/a+b.html").unwrap();
        assert!(pattern.matches("/a+b.html"));
        assert!(!pattern.matches("/aab.html"));
    }

    #[test]
    fn identity_and_except() {
        let a = Request::get("/a");
        let twin = Request::get("/a");
        assert!(RequestMatcher::from(&a).matches(&a));
        assert!(!RequestMatcher::from(&a).matches(&twin));

        let all_but_a = RequestMatcher::All.except(&a);
        assert!(!all_but_a.matches(&a));
        assert!(all_but_a.matches(&twin));
    }
}
