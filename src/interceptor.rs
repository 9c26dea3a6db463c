//! Request hooks run by the proxy before a request is forwarded.

use async_trait::async_trait;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::request::Parts;
use tracing::debug;

use crate::Result;

/// Hook invoked for every intercepted request, in registration order.
///
/// `parts.uri` is always absolute, so implementations can scope on
/// `parts.uri.host()`. A slow hook only stalls its own connection; the
/// proxy enforces a per-call timeout.
#[async_trait]
pub trait Interceptor: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    async fn intercept(&self, parts: &mut Parts) -> Result<()>;
}

// ---------------------------------------------------------------------------
// HostMatcher
// ---------------------------------------------------------------------------

/// Host allow-list: exact names or `*.suffix` wildcards, case-insensitive.
#[derive(Debug, Clone, Default)]
pub struct HostMatcher {
    exact: Vec<String>,
    suffixes: Vec<String>,
}

impl HostMatcher {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut matcher = Self::default();
        for pattern in patterns {
            let pattern = pattern.as_ref().trim().to_ascii_lowercase();
            if pattern.is_empty() {
                continue;
            }
            match pattern.strip_prefix("*.") {
                // keep the dot so "*.example.com" does not match "badexample.com"
                Some(suffix) => matcher.suffixes.push(format!(".{}", suffix)),
                None => matcher.exact.push(pattern),
            }
        }
        matcher
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.suffixes.is_empty()
    }

    pub fn matches(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        self.exact.iter().any(|h| *h == host) || self.suffixes.iter().any(|s| host.ends_with(s))
    }
}

// ---------------------------------------------------------------------------
// HeaderInjector
// ---------------------------------------------------------------------------

/// Sets fixed headers, overwriting existing values.
pub struct HeaderInjector {
    name: String,
    headers: HeaderMap,
    hosts: Option<HostMatcher>,
}

impl HeaderInjector {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            headers: HeaderMap::new(),
            hosts: None,
        }
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Only touch requests to these hosts.
    pub fn for_hosts(mut self, hosts: HostMatcher) -> Self {
        self.hosts = Some(hosts);
        self
    }
}

#[async_trait]
impl Interceptor for HeaderInjector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn intercept(&self, parts: &mut Parts) -> Result<()> {
        if let Some(hosts) = &self.hosts {
            let host = parts.uri.host().unwrap_or_default();
            if !hosts.matches(host) {
                return Ok(());
            }
        }
        for (name, value) in &self.headers {
            parts.headers.insert(name.clone(), value.clone());
        }
        debug!(interceptor = %self.name, count = self.headers.len(), "headers injected");
        Ok(())
    }
}
