//! Request filtering: which requests the offline agent is allowed to touch.

use crate::{Request, Url};
use http::Method;
use tracing::trace;

/// Decision for an intercepted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterceptAction {
    /// The agent handles the request with its caching policy.
    Handle,
    /// The request goes to the network untouched.
    PassThrough(PassThroughReason),
}

/// Why a request bypasses the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassThroughReason {
    /// Not a safe read (POST, PUT, DELETE...).
    UnsafeMethod,
    /// URL matches a reserved dynamic-data pattern.
    ReservedPath,
}

/// Reserved URL pattern: a substring matched anywhere in the URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlPattern {
    /// Pattern string.
    pub pattern: String,
}

impl UrlPattern {
    /// Create a contains pattern.
    pub fn contains(substring: &str) -> Self {
        Self {
            pattern: substring.to_string(),
        }
    }

    /// Check if a URL matches this pattern.
    pub fn matches(&self, url: &Url) -> bool {
        url.as_str().contains(&self.pattern)
    }
}

/// Classifies requests as handled or pass-through.
///
/// A request passes through when its method is not a safe read or when its
/// URL matches any reserved pattern. Everything else is handled.
#[derive(Debug, Clone)]
pub struct RequestFilter {
    reserved: Vec<UrlPattern>,
    safe_methods: Vec<Method>,
}

impl RequestFilter {
    /// Create a filter that handles every GET request.
    pub fn new() -> Self {
        Self {
            reserved: Vec::new(),
            safe_methods: vec![Method::GET],
        }
    }

    /// Create a filter that reserves every URL containing `marker`.
    pub fn with_api_marker(marker: &str) -> Self {
        let mut filter = Self::new();
        if !marker.is_empty() {
            filter.reserve(UrlPattern::contains(marker));
        }
        filter
    }

    /// Never handle URLs matching `pattern`.
    pub fn reserve(&mut self, pattern: UrlPattern) {
        self.reserved.push(pattern);
    }

    /// Reserved patterns, in insertion order.
    pub fn reserved(&self) -> &[UrlPattern] {
        &self.reserved
    }

    /// Classify a request.
    pub fn classify(&self, request: &Request) -> InterceptAction {
        if let Some(pattern) = self.reserved.iter().find(|p| p.matches(&request.url)) {
            trace!(url = %request.url, pattern = %pattern.pattern, "Reserved path");
            return InterceptAction::PassThrough(PassThroughReason::ReservedPath);
        }

        if !self.safe_methods.contains(&request.method) {
            trace!(url = %request.url, method = %request.method, "Unsafe method");
            return InterceptAction::PassThrough(PassThroughReason::UnsafeMethod);
        }

        InterceptAction::Handle
    }
}

impl Default for RequestFilter {
    fn default() -> Self {
        Self::new()
    }
}
