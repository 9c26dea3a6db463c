//! CA store lifecycle across create, external deletion and cleanup.

use std::sync::Arc;
use std::thread;

use toolgate::ca::CaStore;

#[test]
fn deleted_certificate_is_restored_from_memory() {
    let dir = tempfile::tempdir().unwrap();
    let store = CaStore::new(dir.path());

    let ca = store.get_or_create().unwrap();
    std::fs::remove_file(&ca.cert_file).unwrap();

    let restored = store.get_or_create().unwrap();
    assert!(Arc::ptr_eq(&ca, &restored));
    assert_eq!(
        std::fs::read_to_string(&restored.cert_file).unwrap(),
        ca.cert_pem
    );
}

#[test]
fn cleanup_then_create_yields_a_new_ca() {
    let dir = tempfile::tempdir().unwrap();
    let store = CaStore::new(dir.path());

    let first = store.get_or_create().unwrap();
    store.cleanup().unwrap();
    assert!(!first.cert_file.exists());
    assert!(store.current().is_none());

    let second = store.get_or_create().unwrap();
    assert!(second.cert_file.is_file());
    assert_ne!(first.cert_pem, second.cert_pem);
    assert_ne!(first.cert_file, second.cert_file);
}

#[test]
fn concurrent_callers_share_one_ca() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(CaStore::new(dir.path()));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let store = Arc::clone(&store);
            thread::spawn(move || store.get_or_create().unwrap())
        })
        .collect();
    let cas: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(cas.iter().all(|ca| Arc::ptr_eq(ca, &cas[0])));
    let certs = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "crt"))
        .count();
    assert_eq!(certs, 1);
}

#[test]
fn cleanup_tolerates_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let store = CaStore::new(dir.path());
    let ca = store.get_or_create().unwrap();
    std::fs::remove_file(&ca.cert_file).unwrap();
    store.cleanup().unwrap();
    store.cleanup().unwrap();
}
