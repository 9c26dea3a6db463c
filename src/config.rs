//! Runtime configuration: an optional YAML/JSON file overlaid by
//! `TOOLGATE_*` environment variables.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use toolgate_release::{CorruptCachePolicy, ReleaseSource, VersionSpec};

use crate::proxy::AuthMechanism;
use crate::{Error, Result};

/// Environment variable holding extra PEM trust roots for the proxy.
pub const DEFAULT_EXTRA_CA_ENV: &str = "TOOLGATE_CA_CERTIFICATE_LOCATION";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub cache_dir: PathBuf,
    pub tool: ToolConfig,
    pub proxy: ProxyConfig,
    pub credentials: CredentialsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_dir: std::env::temp_dir().join("toolgate"),
            tool: ToolConfig::default(),
            proxy: ProxyConfig::default(),
            credentials: CredentialsConfig::default(),
        }
    }
}

/// Which binary to fetch and where releases are published.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolConfig {
    pub name: String,
    /// `latest` or a concrete version such as `1.4.0`.
    pub version: String,
    /// `owner/name` of the release repository.
    pub repository: String,
    pub api_base: String,
    pub download_base: String,
    pub manifest_name: String,
    pub tag_prefix: String,
    /// Asset name to SHA-256. A pinned asset skips the manifest download.
    pub pinned_checksums: BTreeMap<String, String>,
    pub corrupt_cache: CorruptCachePolicy,
}

impl Default for ToolConfig {
    fn default() -> Self {
        let source = ReleaseSource::github("mcp-scan", "");
        Self {
            name: source.tool,
            version: "latest".into(),
            repository: source.repository,
            api_base: source.api_base,
            download_base: source.download_base,
            manifest_name: source.manifest_name,
            tag_prefix: source.tag_prefix,
            pinned_checksums: BTreeMap::new(),
            corrupt_cache: CorruptCachePolicy::default(),
        }
    }
}

impl ToolConfig {
    pub fn release_source(&self) -> ReleaseSource {
        ReleaseSource {
            tool: self.name.clone(),
            repository: self.repository.clone(),
            api_base: self.api_base.trim_end_matches('/').to_string(),
            download_base: self.download_base.trim_end_matches('/').to_string(),
            manifest_name: self.manifest_name.clone(),
            tag_prefix: self.tag_prefix.clone(),
            pinned_checksums: self.pinned_checksums.clone(),
        }
    }

    pub fn version_spec(&self) -> Result<VersionSpec> {
        Ok(VersionSpec::parse(&self.version)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxyConfig {
    /// When false the child runs without the intercepting proxy.
    pub enabled: bool,
    pub upstream: Option<String>,
    pub upstream_auth: AuthMechanism,
    /// Skip verification of origin certificates.
    pub insecure: bool,
    /// Name of the variable that points at extra PEM trust roots.
    pub extra_ca_env: String,
    #[serde(with = "duration_str")]
    pub interceptor_timeout: Duration,
    #[serde(with = "duration_str")]
    pub upstream_timeout: Duration,
    /// Variables set on the child to the proxy's CA bundle path.
    pub child_ca_env_vars: Vec<String>,
    pub leaf_cache_capacity: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            upstream: None,
            upstream_auth: AuthMechanism::None,
            insecure: false,
            extra_ca_env: DEFAULT_EXTRA_CA_ENV.into(),
            interceptor_timeout: Duration::from_secs(10),
            upstream_timeout: Duration::from_secs(30),
            child_ca_env_vars: vec![
                "NODE_EXTRA_CA_CERTS".into(),
                "SSL_CERT_FILE".into(),
                "REQUESTS_CA_BUNDLE".into(),
            ],
            leaf_cache_capacity: 256,
        }
    }
}

/// Credential injection into proxied requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CredentialsConfig {
    pub enabled: bool,
    /// Hosts that receive credentials: exact names or `*.suffix`.
    pub inject_hosts: Vec<String>,
    pub api_token_env: String,
    pub bearer_token_env: String,
    pub oauth_token_env: String,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            inject_hosts: Vec::new(),
            api_token_env: "TOOLGATE_API_TOKEN".into(),
            bearer_token_env: "TOOLGATE_BEARER_TOKEN".into(),
            oauth_token_env: "TOOLGATE_OAUTH_TOKEN".into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

/// Load a config file. `.yaml`/`.yml` parse as YAML, everything else as JSON.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read {}: {}", path.display(), e)))?;

    let is_yaml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"))
        .unwrap_or(false);

    let config: Config = if is_yaml {
        serde_yaml::from_str(&raw)
            .map_err(|e| Error::Config(format!("invalid YAML config {}: {}", path.display(), e)))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("invalid JSON config {}: {}", path.display(), e)))?
    };
    Ok(config)
}

impl Config {
    /// File (if any), then environment, then validation.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => load_config(p)?,
            None => Config::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Overlay `TOOLGATE_*` values returned by `lookup`. Empty values are ignored.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(dir) = get("TOOLGATE_CACHE_DIR") {
            self.cache_dir = PathBuf::from(dir);
        }
        if let Some(name) = get("TOOLGATE_TOOL_NAME") {
            self.tool.name = name;
        }
        if let Some(version) = get("TOOLGATE_TOOL_VERSION") {
            self.tool.version = version;
        }
        if let Some(repo) = get("TOOLGATE_TOOL_REPOSITORY") {
            self.tool.repository = repo;
        }
        if let Some(upstream) = get("TOOLGATE_UPSTREAM_PROXY") {
            self.proxy.upstream = Some(upstream);
        }
        if let Some(auth) = get("TOOLGATE_UPSTREAM_PROXY_AUTH") {
            self.proxy.upstream_auth = AuthMechanism::parse(&auth);
        }
        if let Some(raw) = get("TOOLGATE_INSECURE") {
            self.proxy.insecure = parse_bool("TOOLGATE_INSECURE", &raw)?;
        }
        if let Some(hosts) = get("TOOLGATE_INJECT_HOSTS") {
            self.credentials.inject_hosts = hosts
                .split(',')
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(str::to_string)
                .collect();
            self.credentials.enabled = true;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let name = self.tool.name.trim();
        if name.is_empty() || name.contains('/') {
            return Err(Error::Config(format!(
                "tool.name '{}' must be a non-empty file name prefix",
                self.tool.name
            )));
        }
        if self.tool.repository.split('/').filter(|p| !p.is_empty()).count() != 2 {
            return Err(Error::Config(format!(
                "tool.repository '{}' must be 'owner/name' (or set TOOLGATE_TOOL_REPOSITORY)",
                self.tool.repository
            )));
        }
        self.tool.version_spec()?;

        if let Some(upstream) = &self.proxy.upstream {
            let parsed = url::Url::parse(upstream)
                .map_err(|e| Error::Config(format!("invalid upstream proxy '{}': {}", upstream, e)))?;
            // The hop to the upstream proxy is plain TCP, so an https:// proxy is refused.
            if parsed.scheme() != "http" || parsed.host_str().is_none() {
                return Err(Error::Config(format!(
                    "upstream proxy '{}' must be an http:// URL with a host",
                    upstream
                )));
            }
        }

        if self.proxy.interceptor_timeout.is_zero() {
            return Err(Error::Config("proxy.interceptor_timeout must be positive".into()));
        }

        if self.credentials.enabled && self.credentials.inject_hosts.is_empty() {
            return Err(Error::Config(
                "credentials.enabled requires at least one entry in credentials.inject_hosts"
                    .into(),
            ));
        }
        Ok(())
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(Error::Config(format!("{} must be a boolean, got '{}'", key, other))),
    }
}

/// Durations as humantime strings (`"30s"`, `"1m 30s"`).
mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn valid() -> Config {
        let mut config = Config::default();
        config.tool.repository = "acme/tool".into();
        config
    }

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_need_a_repository() {
        assert!(Config::default().validate().is_err());
        valid().validate().unwrap();
    }

    #[test]
    fn loads_yaml_with_durations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("toolgate.yaml");
        fs::write(
            &path,
            r#"
cache_dir: /var/cache/toolgate
tool:
  name: scanner
  version: v1.2.3
  repository: acme/scanner
  corrupt_cache: fail
  pinned_checksums:
    scanner-1.2.3-linux-x86_64: abc123
proxy:
  upstream: http://corp-proxy:3128
  upstream_auth: negotiate
  interceptor_timeout: 2s 500ms
credentials:
  enabled: true
  inject_hosts: ["api.example.com", "*.example.org"]
"#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        config.validate().unwrap();
        assert_eq!(config.cache_dir, PathBuf::from("/var/cache/toolgate"));
        assert_eq!(config.tool.corrupt_cache, CorruptCachePolicy::Fail);
        assert_eq!(config.proxy.upstream_auth, AuthMechanism::Negotiate);
        assert_eq!(config.proxy.interceptor_timeout, Duration::from_millis(2500));
        assert_eq!(
            config.tool.version_spec().unwrap(),
            VersionSpec::Exact("1.2.3".into())
        );
        assert_eq!(config.tool.release_source().pinned_checksums.len(), 1);
        // Untouched sections keep their defaults.
        assert_eq!(config.proxy.child_ca_env_vars.len(), 3);
    }

    #[test]
    fn loads_json_and_rejects_unknown_fields() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("toolgate.json");
        fs::write(&good, r#"{"tool": {"repository": "acme/tool", "version": "2.0.0"}}"#).unwrap();
        assert_eq!(load_config(&good).unwrap().tool.version, "2.0.0");

        let bad = dir.path().join("bad.json");
        fs::write(&bad, r#"{"tool": {"repo": "acme/tool"}}"#).unwrap();
        assert!(matches!(load_config(&bad), Err(Error::Config(_))));
    }

    #[test]
    fn env_overrides_file_values() {
        let mut config = valid();
        config
            .apply_env_from(env(&[
                ("TOOLGATE_CACHE_DIR", "/tmp/elsewhere"),
                ("TOOLGATE_TOOL_VERSION", "3.1.0"),
                ("TOOLGATE_UPSTREAM_PROXY", "http://proxy:8080"),
                ("TOOLGATE_UPSTREAM_PROXY_AUTH", "anyauth"),
                ("TOOLGATE_INSECURE", "true"),
                ("TOOLGATE_INJECT_HOSTS", "api.example.com, *.example.org,"),
                ("TOOLGATE_TOOL_NAME", ""),
            ]))
            .unwrap();

        assert_eq!(config.cache_dir, PathBuf::from("/tmp/elsewhere"));
        assert_eq!(config.tool.version, "3.1.0");
        assert_eq!(config.tool.name, "mcp-scan");
        assert_eq!(config.proxy.upstream.as_deref(), Some("http://proxy:8080"));
        assert_eq!(config.proxy.upstream_auth, AuthMechanism::AnyAuth);
        assert!(config.proxy.insecure);
        assert!(config.credentials.enabled);
        assert_eq!(
            config.credentials.inject_hosts,
            vec!["api.example.com".to_string(), "*.example.org".to_string()]
        );
        config.validate().unwrap();
    }

    #[test]
    fn env_rejects_bad_boolean() {
        let mut config = valid();
        let err = config
            .apply_env_from(env(&[("TOOLGATE_INSECURE", "maybe")]))
            .unwrap_err();
        assert!(err.to_string().contains("TOOLGATE_INSECURE"));
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut config = valid();
        config.tool.version = "1.0.0; rm -rf /".into();
        assert!(config.validate().is_err());

        let mut config = valid();
        config.proxy.upstream = Some("socks5://proxy:1080".into());
        assert!(config.validate().is_err());

        let mut config = valid();
        config.proxy.upstream = Some("https://user:pw@proxy:3129".into());
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = valid();
        config.credentials.enabled = true;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.tool.name = "../evil".into();
        assert!(config.validate().is_err());
    }
}
