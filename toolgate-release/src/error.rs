use std::path::PathBuf;

/// Errors produced while resolving, downloading and verifying a release binary.
#[derive(Debug, thiserror::Error)]
pub enum ReleaseError {
    #[error("unsupported platform {os}/{arch}")]
    UnsupportedPlatform { os: String, arch: String },

    #[error("no checksum entry found for asset {asset}")]
    ManifestEntryNotFound { asset: String },

    #[error("release asset not found: {0}")]
    AssetNotFound(String),

    #[error("asset name {0:?} is not a single file name")]
    InvalidAssetName(String),

    #[error("invalid version: {0}")]
    InvalidVersion(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("GET {url} returned {status}")]
    HttpStatus { url: String, status: u16 },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("checksum mismatch for {}: expected {expected}, got {actual}", path.display())]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ReleaseError {
    /// Wrap an I/O error with the operation that produced it.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// True for failures a caller may retry by re-running the whole operation.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::HttpStatus { .. } | Self::Http(_)
        )
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ReleaseError>;
