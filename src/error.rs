//! Error types for toolgate

use std::net::SocketAddr;

use thiserror::Error;
use toolgate_release::ReleaseError;

/// Result type alias using toolgate Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in toolgate operations
#[derive(Error, Debug)]
pub enum Error {
    /// Resolving, downloading or verifying the tool binary failed
    #[error(transparent)]
    Release(#[from] ReleaseError),

    /// The CA singleton lost its certificate file and has no PEM to restore it from
    #[error("CA inconsistency: {0}")]
    CaInconsistency(String),

    /// Certificate generation errors
    #[error("certificate error: {0}")]
    Certificate(#[from] rcgen::Error),

    /// TLS configuration errors
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// The proxy listener could not be bound
    #[error("failed to bind proxy listener on {addr}: {source}")]
    ProxyBind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Proxy lifecycle errors
    #[error("proxy error: {0}")]
    Proxy(String),

    /// Upstream proxy configuration or handshake errors
    #[error("upstream proxy error: {0}")]
    Upstream(String),

    /// The child process could not be started
    #[error("failed to execute {program}: {source}")]
    ChildExec {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The child process ran and exited with a non-zero code
    #[error("child process exited with code {code}")]
    ChildNonZeroExit { code: i32 },

    /// The child process ended without an exit code (killed by a signal)
    #[error("child process terminated without an exit status")]
    ChildTerminated,

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O errors with the operation that produced them
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// Serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl Error {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Process exit code for this failure: the child's own code when it ran
    /// and failed, `-1` for everything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ChildNonZeroExit { code } => *code,
            _ => -1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_carries_child_code() {
        assert_eq!(Error::ChildNonZeroExit { code: 3 }.exit_code(), 3);
        assert_eq!(Error::ChildTerminated.exit_code(), -1);
        assert_eq!(Error::Config("bad".into()).exit_code(), -1);
    }

    #[test]
    fn release_errors_keep_their_message() {
        let err: Error = ReleaseError::UnsupportedPlatform {
            os: "plan9".into(),
            arch: "mips".into(),
        }
        .into();
        assert_eq!(err.to_string(), "unsupported platform plan9/mips");
    }
}
