use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::checksum::{self, DEFAULT_MANIFEST_NAME};
use crate::fetch::Fetch;
use crate::platform::{self, Platform};
use crate::{ReleaseError, Result};

// ---------------------------------------------------------------------------
// Release index documents
// ---------------------------------------------------------------------------

/// One downloadable artifact of a release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub name: String,
    #[serde(rename = "browser_download_url", alias = "browserDownloadURL")]
    pub download_url: String,
}

/// A release as returned by the release index (`/releases/latest`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Release {
    #[serde(default)]
    pub tag_name: Option<String>,
    #[serde(default)]
    pub assets: Vec<Asset>,
}

impl Release {
    /// Find the asset whose name carries the platform prefix and suffix.
    pub fn find_platform_asset(&self, prefix: &str, suffix: &str) -> Option<&Asset> {
        self.assets
            .iter()
            .find(|a| a.name.starts_with(prefix) && a.name.ends_with(suffix))
    }

    pub fn find_asset(&self, name: &str) -> Option<&Asset> {
        self.assets.iter().find(|a| a.name == name)
    }
}

// ---------------------------------------------------------------------------
// VersionSpec
// ---------------------------------------------------------------------------

/// Which release to resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionSpec {
    Latest,
    Exact(String),
}

impl VersionSpec {
    /// Parse `latest` or a concrete version (a leading `v` is accepted).
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() || raw.eq_ignore_ascii_case("latest") {
            return Ok(Self::Latest);
        }
        let version = raw.strip_prefix('v').unwrap_or(raw);
        let valid = !version.is_empty()
            && version.starts_with(|c: char| c.is_ascii_digit())
            && version
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '+'));
        if !valid {
            return Err(ReleaseError::InvalidVersion(raw.to_string()));
        }
        Ok(Self::Exact(version.to_string()))
    }
}

impl fmt::Display for VersionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Latest => write!(f, "latest"),
            Self::Exact(v) => write!(f, "{}", v),
        }
    }
}

// ---------------------------------------------------------------------------
// ReleaseSource
// ---------------------------------------------------------------------------

/// Where releases of the tool are published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseSource {
    /// Tool name; asset names start with `<tool>-`.
    pub tool: String,
    /// `owner/repo` on the release host.
    pub repository: String,
    /// Base URL of the release index API (e.g. "https://api.github.com").
    pub api_base: String,
    /// Base URL for pinned-version downloads (e.g. "https://github.com").
    pub download_base: String,
    pub manifest_name: String,
    /// Prefix of release tags, usually "v".
    pub tag_prefix: String,
    /// Asset name to digest. A pinned digest replaces the manifest lookup.
    pub pinned_checksums: BTreeMap<String, String>,
}

impl ReleaseSource {
    pub fn github(tool: impl Into<String>, repository: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            repository: repository.into(),
            api_base: "https://api.github.com".to_string(),
            download_base: "https://github.com".to_string(),
            manifest_name: DEFAULT_MANIFEST_NAME.to_string(),
            tag_prefix: "v".to_string(),
            pinned_checksums: BTreeMap::new(),
        }
    }

    pub fn latest_url(&self) -> String {
        format!(
            "{}/repos/{}/releases/latest",
            self.api_base.trim_end_matches('/'),
            self.repository
        )
    }

    /// Deterministic download URL of `file` in the release tagged for `version`.
    pub fn versioned_url(&self, version: &str, file: &str) -> String {
        format!(
            "{}/{}/releases/download/{}{}/{}",
            self.download_base.trim_end_matches('/'),
            self.repository,
            self.tag_prefix,
            version,
            file
        )
    }
}

// ---------------------------------------------------------------------------
// ReleaseResolver
// ---------------------------------------------------------------------------

/// An asset together with the digest it must hash to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAsset {
    pub asset: Asset,
    pub expected_digest: String,
}

/// Maps (platform, version) to a downloadable asset and its expected digest.
pub struct ReleaseResolver {
    source: ReleaseSource,
    fetcher: Arc<dyn Fetch>,
}

impl ReleaseResolver {
    pub fn new(source: ReleaseSource, fetcher: Arc<dyn Fetch>) -> Self {
        Self { source, fetcher }
    }

    pub fn source(&self) -> &ReleaseSource {
        &self.source
    }

    /// Resolve the asset for `platform` at `version`.
    ///
    /// Pinned versions need no index query; `latest` queries the release
    /// index and requires both the platform asset and the manifest asset.
    pub async fn resolve(&self, platform: &Platform, version: &VersionSpec) -> Result<ResolvedAsset> {
        let (prefix, suffix) = platform::asset_affixes(&self.source.tool, platform)?;

        let (asset, manifest_url) = match version {
            VersionSpec::Exact(v) => {
                let name = format!("{}{}{}", prefix, v, suffix);
                let asset = Asset {
                    download_url: self.source.versioned_url(v, &name),
                    name,
                };
                let manifest_url = self.source.versioned_url(v, &self.source.manifest_name);
                (asset, manifest_url)
            }
            VersionSpec::Latest => {
                let release = self.latest_release().await?;
                let asset = release
                    .find_platform_asset(&prefix, suffix)
                    .cloned()
                    .ok_or_else(|| {
                        ReleaseError::AssetNotFound(format!(
                            "no asset matching {}*{} for platform {}",
                            prefix, suffix, platform
                        ))
                    })?;
                let manifest = release
                    .find_asset(&self.source.manifest_name)
                    .ok_or_else(|| {
                        ReleaseError::AssetNotFound(format!(
                            "no {} asset in latest release",
                            self.source.manifest_name
                        ))
                    })?;
                (asset, manifest.download_url.clone())
            }
        };

        let expected_digest = match self.source.pinned_checksums.get(&asset.name) {
            Some(pinned) => {
                debug!(asset = %asset.name, "using pinned checksum");
                pinned.clone()
            }
            None => self.manifest_digest(&manifest_url, &asset.name).await?,
        };

        info!(asset = %asset.name, %version, "resolved release asset");
        Ok(ResolvedAsset {
            asset,
            expected_digest,
        })
    }

    async fn latest_release(&self) -> Result<Release> {
        let url = self.source.latest_url();
        debug!(%url, "querying release index");
        let body = self.fetcher.get(&url).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn manifest_digest(&self, url: &str, asset_name: &str) -> Result<String> {
        debug!(%url, "downloading checksum manifest");
        let body = self.fetcher.get(url).await?;
        let text = String::from_utf8_lossy(&body);
        checksum::parse_manifest(&text, asset_name)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
