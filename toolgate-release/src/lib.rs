//! Resolve, download, checksum-verify and cache release binaries.
//!
//! The entry point is [`BinaryCache::resolve_verified_binary`]: it maps a
//! [`Platform`] and [`VersionSpec`] to a release asset, and returns a local
//! path whose SHA-256 matches the published checksum manifest.

pub mod cache;
pub mod checksum;
pub mod error;
pub mod fetch;
pub mod index;
pub mod platform;
pub mod progress;

pub use cache::{BinaryCache, CorruptCachePolicy};
pub use error::{ReleaseError, Result};
pub use fetch::{Fetch, HttpFetcher};
pub use index::{Asset, Release, ReleaseResolver, ReleaseSource, ResolvedAsset, VersionSpec};
pub use platform::Platform;
pub use progress::{NoProgress, Progress, ProgressError};
