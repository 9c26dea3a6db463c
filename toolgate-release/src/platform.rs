use std::fmt;

use crate::{ReleaseError, Result};

// ---------------------------------------------------------------------------
// Platform
// ---------------------------------------------------------------------------

/// Operating systems with published release binaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Os {
    Linux,
    MacOs,
}

/// CPU architectures with published release binaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    Amd64,
    Arm64,
}

/// Target platform for a release asset.
///
/// Values outside the support table are still representable as raw strings
/// so that [`asset_affixes`] can report exactly what was requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    pub os: String,
    pub arch: String,
}

impl Platform {
    pub fn new(os: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            arch: arch.into(),
        }
    }

    /// Build a `Platform` matching the current host.
    pub fn host() -> Self {
        Self::new(std::env::consts::OS, std::env::consts::ARCH)
    }

    /// Parse an `os/arch` pair such as `linux/amd64` or `macos/aarch64`.
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().split_once('/') {
            Some((os, arch)) if !os.is_empty() && !arch.is_empty() => Ok(Self::new(os, arch)),
            _ => Err(ReleaseError::UnsupportedPlatform {
                os: raw.to_string(),
                arch: String::new(),
            }),
        }
    }

    fn classify(&self) -> Option<(Os, Arch)> {
        let os = match self.os.to_ascii_lowercase().as_str() {
            "linux" => Os::Linux,
            "darwin" | "macos" => Os::MacOs,
            _ => return None,
        };
        let arch = match self.arch.to_ascii_lowercase().as_str() {
            "amd64" | "x86_64" => Arch::Amd64,
            "arm64" | "aarch64" => Arch::Arm64,
            _ => return None,
        };
        Some((os, arch))
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.arch)
    }
}

/// Map a platform to the suffix its release asset carries.
///
/// Asset names are `<tool>-<version><suffix>`, e.g.
/// `mcp-scan-0.3.2-linux-x86_64`.
pub fn asset_suffix(platform: &Platform) -> Result<&'static str> {
    let suffix = match platform.classify() {
        Some((Os::Linux, Arch::Amd64)) => "-linux-x86_64",
        Some((Os::Linux, Arch::Arm64)) => "-linux-aarch64",
        Some((Os::MacOs, Arch::Arm64)) => "-macos-arm64",
        Some((Os::MacOs, Arch::Amd64)) => "-macos-x86_64",
        None => {
            return Err(ReleaseError::UnsupportedPlatform {
                os: platform.os.clone(),
                arch: platform.arch.clone(),
            })
        }
    };
    Ok(suffix)
}

/// Prefix and suffix used to recognise this platform's asset in a release.
pub fn asset_affixes(tool: &str, platform: &Platform) -> Result<(String, &'static str)> {
    let suffix = asset_suffix(platform)?;
    Ok((format!("{}-", tool), suffix))
}

/// Compose the asset name for a pinned version.
pub fn asset_name(tool: &str, version: &str, platform: &Platform) -> Result<String> {
    let (prefix, suffix) = asset_affixes(tool, platform)?;
    Ok(format!("{}{}{}", prefix, version, suffix))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linux_amd64_asset_name() {
        let name = asset_name("tool", "1.0.0", &Platform::new("linux", "amd64")).unwrap();
        assert_eq!(name, "tool-1.0.0-linux-x86_64");
    }

    #[test]
    fn rust_and_go_arch_names_agree() {
        let a = asset_suffix(&Platform::new("linux", "x86_64")).unwrap();
        let b = asset_suffix(&Platform::new("linux", "amd64")).unwrap();
        assert_eq!(a, b);

        let c = asset_suffix(&Platform::new("darwin", "arm64")).unwrap();
        let d = asset_suffix(&Platform::new("macos", "aarch64")).unwrap();
        assert_eq!(c, d);
        assert_eq!(c, "-macos-arm64");
    }

    #[test]
    fn unsupported_platform_names_both_values() {
        let err = asset_suffix(&Platform::new("windows", "amd64")).unwrap_err();
        match err {
            ReleaseError::UnsupportedPlatform { os, arch } => {
                assert_eq!(os, "windows");
                assert_eq!(arch, "amd64");
            }
            other => panic!("unexpected error: {other}"),
        }

        let msg = asset_suffix(&Platform::new("linux", "riscv64"))
            .unwrap_err()
            .to_string();
        assert!(msg.contains("linux"));
        assert!(msg.contains("riscv64"));
    }

    #[test]
    fn parse_os_arch_pair() {
        let p = Platform::parse("linux/amd64").unwrap();
        assert_eq!(p, Platform::new("linux", "amd64"));
        assert_eq!(p.to_string(), "linux/amd64");
        assert!(Platform::parse("linux").is_err());
        assert!(Platform::parse("/amd64").is_err());
    }
}
