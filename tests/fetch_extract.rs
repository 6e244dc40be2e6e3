mod common;

use common::{test_config, zip_bytes};
use scenario_ingest::{
    error::IngestError,
    fetch::{extract_bytes, fetch_archive},
    storage::{MemoryObjectStore, ObjectStore},
};

#[test]
fn extracts_sorted_relative_paths() {
    let work = tempfile::tempdir().unwrap();
    let cfg = test_config(work.path());
    let bytes = zip_bytes(&[
        ("run/DSS/s1_DV.dss", b"dv"),
        ("run/DSS/s1_SV.dss", b"sv"),
        ("README.txt", b"hello"),
    ]);

    let fetched = extract_bytes(&cfg, &bytes, work.path(), "job-1").unwrap();
    assert_eq!(
        fetched.files,
        vec!["README.txt", "run/DSS/s1_DV.dss", "run/DSS/s1_SV.dss"]
    );
    let sv = std::fs::read(fetched.root().join("run/DSS/s1_SV.dss")).unwrap();
    assert_eq!(sv, b"sv");
    assert_eq!(fetched.sha256.len(), 64);
}

#[test]
fn scratch_dir_is_removed_on_drop() {
    let work = tempfile::tempdir().unwrap();
    let cfg = test_config(work.path());
    let bytes = zip_bytes(&[("a_dv.dss", b"x")]);

    let fetched = extract_bytes(&cfg, &bytes, work.path(), "job-2").unwrap();
    let scratch = fetched.dir.path().to_path_buf();
    assert!(scratch.exists());
    drop(fetched);
    assert!(!scratch.exists());
}

#[test]
fn path_traversal_entries_are_rejected() {
    let work = tempfile::tempdir().unwrap();
    let cfg = test_config(work.path());
    let bytes = zip_bytes(&[("ok_dv.dss", b"x"), ("../../escape_sv.dss", b"y")]);

    let err = extract_bytes(&cfg, &bytes, work.path(), "job-3")
        .err()
        .expect("traversal must fail");
    assert!(matches!(err, IngestError::Extraction(_)));
    assert!(!work.path().parent().unwrap().join("escape_sv.dss").exists());
}

#[test]
fn corrupt_archive_is_an_extraction_error() {
    let work = tempfile::tempdir().unwrap();
    let cfg = test_config(work.path());
    let err = extract_bytes(&cfg, b"definitely not a zip", work.path(), "job-4")
        .err()
        .unwrap();
    assert!(matches!(err, IngestError::Extraction(_)));
}

#[test]
fn entry_limit_is_enforced() {
    let work = tempfile::tempdir().unwrap();
    let mut cfg = test_config(work.path());
    cfg.security.max_archive_entries = 1;
    let bytes = zip_bytes(&[("a.dss", b"1"), ("b.dss", b"2")]);
    assert!(extract_bytes(&cfg, &bytes, work.path(), "job-5").is_err());
}

#[test]
fn missing_object_is_a_retrieval_error() {
    let work = tempfile::tempdir().unwrap();
    let cfg = test_config(work.path());
    let store = MemoryObjectStore::new();
    store.put("other", "x.zip", b"").unwrap();

    let err = fetch_archive(&cfg, &store, "uploads", "s1.zip", work.path(), "job-6")
        .err()
        .unwrap();
    assert!(matches!(err, IngestError::Retrieval { .. }));
    assert!(err.is_fatal());
}

#[test]
fn extracted_byte_limit_counts_inflated_bytes() {
    let work = tempfile::tempdir().unwrap();
    let mut cfg = test_config(work.path());
    cfg.security.max_extracted_bytes = 1024;
    let big = vec![0u8; 4096];
    let bytes = zip_bytes(&[("big_dv.dss", big.as_slice())]);
    let err = extract_bytes(&cfg, &bytes, work.path(), "job-7")
        .err()
        .unwrap();
    assert!(matches!(err, IngestError::Extraction(_)));
}
