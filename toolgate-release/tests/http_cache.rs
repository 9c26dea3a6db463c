//! End-to-end cache behaviour against a local release host.

use std::sync::Arc;

use httpmock::prelude::*;
use sha2::{Digest, Sha256};
use toolgate_release::{
    BinaryCache, HttpFetcher, NoProgress, Platform, ReleaseError, ReleaseSource, VersionSpec,
};

const BINARY: &[u8] = b"#!/bin/sh\necho scanning\n";

fn sha(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn source_for(server: &MockServer) -> ReleaseSource {
    let mut source = ReleaseSource::github("tool", "acme/tool");
    source.api_base = server.base_url();
    source.download_base = server.base_url();
    source
}

#[tokio::test]
async fn latest_release_is_downloaded_once() {
    let server = MockServer::start_async().await;
    let index = serde_json::json!({
        "tag_name": "v2.1.0",
        "assets": [
            { "name": "tool-2.1.0-macos-arm64", "browser_download_url": server.url("/dl/mac") },
            { "name": "tool-2.1.0-linux-x86_64", "browser_download_url": server.url("/dl/linux") },
            { "name": "checksums.txt", "browser_download_url": server.url("/dl/checksums.txt") },
        ]
    });
    let index_mock = server
        .mock_async(|when, then| {
            when.method(GET).path("/repos/acme/tool/releases/latest");
            then.status(200).json_body(index);
        })
        .await;
    let manifest = format!(
        "{}  tool-2.1.0-macos-arm64\n{}  tool-2.1.0-linux-x86_64\n",
        sha(b"mac"),
        sha(BINARY)
    );
    server
        .mock_async(|when, then| {
            when.method(GET).path("/dl/checksums.txt");
            then.status(200).body(manifest);
        })
        .await;
    let binary_mock = server
        .mock_async(|when, then| {
            when.method(GET).path("/dl/linux");
            then.status(200).body(BINARY);
        })
        .await;

    let tmp = tempfile::tempdir().unwrap();
    let cache = BinaryCache::new(
        tmp.path().to_path_buf(),
        source_for(&server),
        Arc::new(HttpFetcher::new().unwrap()),
    );
    let platform = Platform::new("linux", "amd64");

    for _ in 0..2 {
        let path = cache
            .resolve_verified_binary(&platform, &VersionSpec::Latest, &NoProgress)
            .await
            .unwrap();
        assert_eq!(path, tmp.path().join("tool-2.1.0-linux-x86_64"));
        assert_eq!(std::fs::read(&path).unwrap(), BINARY);
    }

    binary_mock.assert_hits_async(1).await;
    index_mock.assert_hits_async(2).await;
}

#[tokio::test]
async fn pinned_version_uses_versioned_urls() {
    let server = MockServer::start_async().await;
    let manifest = format!("{}  tool-1.4.0-linux-x86_64\n", sha(BINARY));
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/acme/tool/releases/download/v1.4.0/checksums.txt");
            then.status(200).body(manifest);
        })
        .await;
    let binary_mock = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/acme/tool/releases/download/v1.4.0/tool-1.4.0-linux-x86_64");
            then.status(200).body(BINARY);
        })
        .await;

    let tmp = tempfile::tempdir().unwrap();
    let cache = BinaryCache::new(
        tmp.path().to_path_buf(),
        source_for(&server),
        Arc::new(HttpFetcher::new().unwrap()),
    );

    let path = cache
        .resolve_verified_binary(
            &Platform::new("linux", "x86_64"),
            &VersionSpec::parse("v1.4.0").unwrap(),
            &NoProgress,
        )
        .await
        .unwrap();
    assert!(path.ends_with("tool-1.4.0-linux-x86_64"));
    binary_mock.assert_async().await;
}

#[tokio::test]
async fn missing_manifest_entry_is_reported() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/acme/tool/releases/download/v1.0.0/checksums.txt");
            then.status(200).body("deadbeef  some-other-asset\n");
        })
        .await;

    let tmp = tempfile::tempdir().unwrap();
    let cache = BinaryCache::new(
        tmp.path().to_path_buf(),
        source_for(&server),
        Arc::new(HttpFetcher::new().unwrap()),
    );

    let err = cache
        .resolve_verified_binary(
            &Platform::new("linux", "amd64"),
            &VersionSpec::Exact("1.0.0".into()),
            &NoProgress,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ReleaseError::ManifestEntryNotFound { .. }));
}

#[tokio::test]
async fn release_host_errors_are_network_errors() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/repos/acme/tool/releases/latest");
            then.status(503);
        })
        .await;

    let tmp = tempfile::tempdir().unwrap();
    let cache = BinaryCache::new(
        tmp.path().to_path_buf(),
        source_for(&server),
        Arc::new(HttpFetcher::new().unwrap()),
    );

    let err = cache
        .resolve_verified_binary(
            &Platform::new("linux", "amd64"),
            &VersionSpec::Latest,
            &NoProgress,
        )
        .await
        .unwrap_err();
    assert!(err.is_network(), "unexpected error: {err}");
    assert!(matches!(err, ReleaseError::HttpStatus { status: 503, .. }));
}
