//! Cache key definitions.
//!
//! A key is the request method plus the full origin-form URL. Query strings are
//! kept verbatim: presigned URLs differ only in their signature parameters and
//! each signed grant must stay a distinct object.

use std::fmt;

use axum::http::Method;

/// Identifies one cacheable resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    method: Method,
    url: String,
}

impl CacheKey {
    /// Build a key from a method and an origin-form URL (`/path?query`).
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.url)
    }
}
