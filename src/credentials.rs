//! Credential injection: the `Authorization` header for allowed hosts.

use std::sync::Arc;

use async_trait::async_trait;
use http::header::{HeaderValue, AUTHORIZATION};
use http::request::Parts;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, trace};

use crate::config::CredentialsConfig;
use crate::interceptor::{HostMatcher, Interceptor};
use crate::{Error, Result};

/// Supplies the full `Authorization` header value, if any credential is
/// available right now.
pub trait CredentialSource: Send + Sync {
    fn authorization(&self) -> Option<SecretString>;
}

/// Reads tokens from environment variables on every request.
///
/// Precedence: API token (`token <t>`), then bearer token, then OAuth access
/// token (both `Bearer <t>`). The first non-empty value wins.
#[derive(Debug, Clone)]
pub struct EnvCredentialSource {
    api_token_env: String,
    bearer_token_env: String,
    oauth_token_env: String,
}

impl EnvCredentialSource {
    pub fn from_config(config: &CredentialsConfig) -> Self {
        Self {
            api_token_env: config.api_token_env.clone(),
            bearer_token_env: config.bearer_token_env.clone(),
            oauth_token_env: config.oauth_token_env.clone(),
        }
    }

    /// Pure precedence rule over already-read values.
    fn select(api: Option<String>, bearer: Option<String>, oauth: Option<String>) -> Option<SecretString> {
        let non_empty = |v: Option<String>| v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
        if let Some(token) = non_empty(api) {
            return Some(SecretString::from(format!("token {}", token)));
        }
        non_empty(bearer)
            .or_else(|| non_empty(oauth))
            .map(|token| SecretString::from(format!("Bearer {}", token)))
    }
}

impl CredentialSource for EnvCredentialSource {
    fn authorization(&self) -> Option<SecretString> {
        Self::select(
            std::env::var(&self.api_token_env).ok(),
            std::env::var(&self.bearer_token_env).ok(),
            std::env::var(&self.oauth_token_env).ok(),
        )
    }
}

/// Fixed header value, for embedding callers that already hold a token.
pub struct StaticCredentialSource(SecretString);

impl StaticCredentialSource {
    pub fn new(authorization: SecretString) -> Self {
        Self(authorization)
    }
}

impl CredentialSource for StaticCredentialSource {
    fn authorization(&self) -> Option<SecretString> {
        Some(SecretString::from(self.0.expose_secret().to_owned()))
    }
}

/// Sets `Authorization` on requests to allowed hosts. Requests to any other
/// host pass through untouched.
pub struct CredentialInjector {
    source: Arc<dyn CredentialSource>,
    hosts: HostMatcher,
}

impl CredentialInjector {
    pub fn new(source: Arc<dyn CredentialSource>, hosts: HostMatcher) -> Self {
        Self { source, hosts }
    }
}

#[async_trait]
impl Interceptor for CredentialInjector {
    fn name(&self) -> &str {
        "credentials"
    }

    async fn intercept(&self, parts: &mut Parts) -> Result<()> {
        let host = parts.uri.host().unwrap_or_default();
        if !self.hosts.matches(host) {
            trace!(host, "host not in credential scope");
            return Ok(());
        }
        let Some(auth) = self.source.authorization() else {
            debug!(host, "no credential available");
            return Ok(());
        };
        let mut value = HeaderValue::from_str(auth.expose_secret())
            .map_err(|_| Error::Config("credential contains characters invalid in a header".into()))?;
        value.set_sensitive(true);
        parts.headers.insert(AUTHORIZATION, value);
        debug!(host, "credential injected");
        Ok(())
    }
}
