use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::checksum;
use crate::fetch::Fetch;
use crate::index::{ReleaseResolver, ReleaseSource, ResolvedAsset, VersionSpec};
use crate::platform::Platform;
use crate::progress::{self, Progress};
use crate::{ReleaseError, Result};

/// What to do when a cached binary no longer matches its expected digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorruptCachePolicy {
    /// Discard the cached copy and download again.
    #[default]
    Redownload,
    /// Report [`ReleaseError::ChecksumMismatch`] and leave the file alone.
    Fail,
}

/// Cache of verified release binaries stored as `<cache_dir>/<asset name>`.
///
/// The asset name encodes tool, version and platform, and a cached file is
/// only trusted after its digest matches the expected one. Nothing else is
/// recorded on disk. Writers download to a unique temporary name and rename
/// into place, so concurrent processes never observe a partial file.
pub struct BinaryCache {
    cache_dir: PathBuf,
    resolver: ReleaseResolver,
    fetcher: Arc<dyn Fetch>,
    policy: CorruptCachePolicy,
}

impl BinaryCache {
    pub fn new(cache_dir: PathBuf, source: ReleaseSource, fetcher: Arc<dyn Fetch>) -> Self {
        Self {
            cache_dir,
            resolver: ReleaseResolver::new(source, Arc::clone(&fetcher)),
            fetcher,
            policy: CorruptCachePolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: CorruptCachePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Final location of a cached asset.
    pub fn cache_path(&self, asset_name: &str) -> PathBuf {
        self.cache_dir.join(asset_name)
    }

    /// Locate the verified binary for `platform`/`version`, downloading it if
    /// the cache has no valid copy. Returns the cache path.
    pub async fn resolve_verified_binary(
        &self,
        platform: &Platform,
        version: &VersionSpec,
        progress: &dyn Progress,
    ) -> Result<PathBuf> {
        let resolved = self.resolver.resolve(platform, version).await?;
        self.install(&resolved, progress).await
    }

    /// Ensure `resolved` is present and verified in the cache.
    pub async fn install(&self, resolved: &ResolvedAsset, progress: &dyn Progress) -> Result<PathBuf> {
        let tool = &self.resolver.source().tool;
        check_asset_name(&resolved.asset.name)?;
        let cache_path = self.cache_path(&resolved.asset.name);

        match fs::metadata(&cache_path).await {
            Ok(meta) if meta.is_file() => {
                progress::milestone(progress, 0.1, &format!("Verifying cached {} binary", tool));
                let actual = digest_of(&cache_path).await?;
                if actual.eq_ignore_ascii_case(&resolved.expected_digest) {
                    progress::milestone(progress, 1.0, &format!("Using cached {} binary", tool));
                    progress::finish(progress);
                    debug!(path = %cache_path.display(), "using cached binary");
                    return Ok(cache_path);
                }
                match self.policy {
                    CorruptCachePolicy::Fail => {
                        return Err(ReleaseError::ChecksumMismatch {
                            path: cache_path,
                            expected: resolved.expected_digest.clone(),
                            actual,
                        });
                    }
                    CorruptCachePolicy::Redownload => {
                        warn!(
                            path = %cache_path.display(),
                            expected = %resolved.expected_digest,
                            %actual,
                            "cached binary failed checksum verification, downloading again",
                        );
                    }
                }
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(ReleaseError::io(
                    format!("stat cached binary {}", cache_path.display()),
                    e,
                ))
            }
        }

        fs::create_dir_all(&self.cache_dir)
            .await
            .map_err(|e| ReleaseError::io(format!("create {}", self.cache_dir.display()), e))?;

        progress::milestone(progress, 0.2, &format!("Downloading {} binary", tool));
        let temp = TempDownload::new(&self.cache_dir, &resolved.asset.name);
        info!(url = %resolved.asset.download_url, "downloading binary");
        self.fetcher
            .download(&resolved.asset.download_url, temp.path())
            .await?;

        progress::milestone(progress, 0.9, &format!("Verifying downloaded {} binary", tool));
        let actual = digest_of(temp.path()).await?;
        if !actual.eq_ignore_ascii_case(&resolved.expected_digest) {
            return Err(ReleaseError::ChecksumMismatch {
                path: temp.path().to_path_buf(),
                expected: resolved.expected_digest.clone(),
                actual,
            });
        }

        make_executable(temp.path()).await?;
        temp.persist(&cache_path).await?;

        progress::milestone(progress, 1.0, &format!("Downloaded {} binary", tool));
        progress::finish(progress);
        info!(path = %cache_path.display(), "binary cached");
        Ok(cache_path)
    }
}

/// Asset names come from the release index and must stay inside the cache.
fn check_asset_name(name: &str) -> Result<()> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) if !name.contains(['/', '\\']) => Ok(()),
        _ => Err(ReleaseError::InvalidAssetName(name.to_string())),
    }
}

/// Hash on the blocking pool; binaries can be large.
async fn digest_of(path: &Path) -> Result<String> {
    let owned = path.to_path_buf();
    tokio::task::spawn_blocking(move || checksum::compute_digest(&owned))
        .await
        .map_err(|e| {
            ReleaseError::io(
                format!("hash {}", path.display()),
                std::io::Error::other(e.to_string()),
            )
        })?
}

#[cfg(unix)]
async fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
        .await
        .map_err(|e| ReleaseError::io(format!("chmod {}", path.display()), e))
}

#[cfg(not(unix))]
async fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

/// A uniquely named download target inside the cache directory. Removed on
/// drop unless it was renamed into place.
struct TempDownload {
    path: PathBuf,
    persisted: bool,
}

impl TempDownload {
    fn new(dir: &Path, asset_name: &str) -> Self {
        let name = format!(
            "{}.download-{}",
            asset_name,
            uuid::Uuid::now_v7().simple()
        );
        Self {
            path: dir.join(name),
            persisted: false,
        }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(mut self, dest: &Path) -> Result<()> {
        fs::rename(&self.path, dest).await.map_err(|e| {
            ReleaseError::io(
                format!("move {} into cache as {}", self.path.display(), dest.display()),
                e,
            )
        })?;
        self.persisted = true;
        Ok(())
    }
}

impl Drop for TempDownload {
    fn drop(&mut self) {
        if !self.persisted {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
