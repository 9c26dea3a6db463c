//! SHA-256 verification of downloaded binaries and checksum manifest parsing.
//!
//! Digests are computed in fixed-size chunks so large binaries never have to
//! be held in memory.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::{ReleaseError, Result};

/// Conventional name of the manifest asset published alongside binaries.
pub const DEFAULT_MANIFEST_NAME: &str = "checksums.txt";

const BUF_SIZE: usize = 64 * 1024;

/// Compute SHA-256 of a file and return the digest as lowercase hex.
pub fn compute_digest(path: &Path) -> Result<String> {
    let mut f = File::open(path)
        .map_err(|e| ReleaseError::io(format!("open {} for hashing", path.display()), e))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; BUF_SIZE];
    loop {
        let n = f
            .read(&mut buf)
            .map_err(|e| ReleaseError::io(format!("read {} for hashing", path.display()), e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Compare the file's digest against `expected_hex`, ignoring case.
///
/// A mismatch is `Ok(false)`; only I/O failures are errors.
pub fn verify(path: &Path, expected_hex: &str) -> Result<bool> {
    let actual = compute_digest(path)?;
    Ok(actual.eq_ignore_ascii_case(expected_hex.trim()))
}

/// Find the digest for `asset_name` in a checksum manifest.
///
/// Blank lines and `#` comments are skipped. Every other line is split on
/// whitespace: the first token is the digest, the last token the file name.
/// The first matching line wins.
pub fn parse_manifest(content: &str, asset_name: &str) -> Result<String> {
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 2 {
            continue;
        }
        // `sha256sum -b` writes "<digest> *<name>".
        let name = fields[fields.len() - 1];
        let name = name.strip_prefix('*').unwrap_or(name);
        if name == asset_name {
            return Ok(fields[0].to_string());
        }
    }
    Err(ReleaseError::ManifestEntryNotFound {
        asset: asset_name.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const HELLO_WORLD_SHA256: &str =
        "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    fn temp_file(contents: &[u8]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn digest_of_empty_file() {
        let f = temp_file(b"");
        assert_eq!(
            compute_digest(f.path()).unwrap(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn digest_spans_multiple_chunks() {
        let data = vec![0x5au8; BUF_SIZE * 3 + 17];
        let f = temp_file(&data);
        let expected = hex::encode(Sha256::digest(&data));
        assert_eq!(compute_digest(f.path()).unwrap(), expected);
    }

    #[test]
    fn verify_matches_own_digest() {
        let f = temp_file(b"hello world");
        let digest = compute_digest(f.path()).unwrap();
        assert_eq!(digest, HELLO_WORLD_SHA256);
        assert!(verify(f.path(), &digest).unwrap());
    }

    #[test]
    fn verify_is_case_insensitive() {
        let f = temp_file(b"hello world");
        assert!(verify(f.path(), &HELLO_WORLD_SHA256.to_ascii_uppercase()).unwrap());
    }

    #[test]
    fn verify_mismatch_is_false_not_error() {
        let f = temp_file(b"hello world");
        let zeros = "0".repeat(64);
        assert!(!verify(f.path(), &zeros).unwrap());
        assert!(!verify(f.path(), "not-even-hex").unwrap());
    }

    #[test]
    fn verify_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = verify(&dir.path().join("absent"), HELLO_WORLD_SHA256).unwrap_err();
        assert!(matches!(err, ReleaseError::Io { .. }));
    }

    #[test]
    fn manifest_skips_comments_and_blanks() {
        let text = "aaaa  assetA\n# comment\n\nbbbb  assetB\n";
        assert_eq!(parse_manifest(text, "assetB").unwrap(), "bbbb");
        assert_eq!(parse_manifest(text, "assetA").unwrap(), "aaaa");
        assert!(matches!(
            parse_manifest(text, "assetC"),
            Err(ReleaseError::ManifestEntryNotFound { asset }) if asset == "assetC"
        ));
    }

    #[test]
    fn manifest_first_match_wins() {
        let text = "1111 tool\n2222 tool\n";
        assert_eq!(parse_manifest(text, "tool").unwrap(), "1111");
    }

    #[test]
    fn manifest_handles_binary_marker_and_malformed_lines() {
        let text = "lonelytoken\n   \ncccc *tool-1.0.0-linux-x86_64\n";
        assert_eq!(
            parse_manifest(text, "tool-1.0.0-linux-x86_64").unwrap(),
            "cccc"
        );
    }

    #[test]
    fn manifest_does_not_match_name_prefix() {
        let text = "dddd  tool-1.0.0-linux-x86_64.sig\n";
        assert!(parse_manifest(text, "tool-1.0.0-linux-x86_64").is_err());
    }
}
