//! toolgate: run a checksum-verified release binary behind a local
//! credential-injecting TLS proxy.
//!
//! # Key Features
//!
//! - **Verified Binaries**: resolve the platform asset, verify it against the
//!   release checksums and cache it (see the `toolgate-release` crate)
//! - **Intercepting Proxy**: loopback forward proxy that terminates TLS with
//!   leaves signed by a per-process CA
//! - **Credential Injection**: pluggable interceptors add `Authorization` for
//!   allowed hosts without touching the tool
//! - **Upstream Proxies**: optional second hop with Basic or negotiated auth
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use toolgate::{ca::CaStore, config::Config, progress::TerminalProgress, session::Session};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::resolve(None)?;
//!     let ca = Arc::new(CaStore::new(config.cache_dir.clone()));
//!     let session = Session::new(config, Arc::clone(&ca))?;
//!
//!     let code = session
//!         .run(&["scan".to_string()], None, &TerminalProgress::new())
//!         .await?;
//!     ca.cleanup()?;
//!     println!("exit code: {}", code);
//!     Ok(())
//! }
//! ```

pub mod ca;
pub mod config;
pub mod credentials;
pub mod error;
pub mod interceptor;
pub mod launcher;
pub mod progress;
pub mod proxy;
pub mod session;

// Re-exports for convenience
pub use error::{Error, Result};
pub use proxy::{InterceptProxy, ProxyInfo};
pub use session::Session;

pub mod prelude {
    pub use crate::ca::{CaData, CaStore};
    pub use crate::config::Config;
    pub use crate::credentials::{CredentialInjector, CredentialSource};
    pub use crate::error::{Error, Result};
    pub use crate::interceptor::{HeaderInjector, HostMatcher, Interceptor};
    pub use crate::launcher::Launcher;
    pub use crate::proxy::{AuthMechanism, InterceptProxy, ProxyInfo, ProxyOptions};
    pub use crate::session::Session;
    pub use toolgate_release::{Platform, VersionSpec};
}
