mod common;

use common::{FakeDecoder, flow_table, test_config, zip_bytes};
use scenario_ingest::{
    classify::Role,
    cli::{RunArgs, build_request},
    config::Config,
    engine::{Decoder, DecoderDiag},
    pipeline::{JobOutcome, JobRequest, Pipeline, ReferenceSpec},
    status::{JobStatus, MemoryStatusStore, StatusStore},
    storage::{LocalObjectStore, MemoryObjectStore, ObjectStore, StorageError},
    table::Table,
    validate::{Tolerance, ValidationResult},
};
use std::path::Path;

const BUCKET: &str = "uploads";
const ARCHIVE: &str = "incoming/s0042_baseline_20240315.zip";
const REFERENCE: &str = "references/s0042_dv.csv";
const SV: &str = "/CALSIM/I_SHSTA/FLOW-INFLOW//1MON/L2020A/";
const DV: &str = "/CALSIM/C_SAC041/CHANNEL//1MON/L2020A/";

fn sv_table() -> Table {
    flow_table(&[(SV, &[10.0, 11.0, 12.0])])
}

fn dv_table() -> Table {
    flow_table(&[(DV, &[100.0, 200.0, 300.0])])
}

fn both_files() -> Vec<u8> {
    zip_bytes(&[
        ("s0042/DSS/s0042_SV.dss", b"sv"),
        ("s0042/DSS/s0042_DV.dss", b"dv"),
        ("s0042/README.txt", b"notes"),
    ])
}

fn request(job_id: &str) -> JobRequest {
    JobRequest {
        bucket: BUCKET.into(),
        key: ARCHIVE.into(),
        job_id: job_id.into(),
        status_table: "scenario-jobs".into(),
        output_prefix: "scenarios/".into(),
        scenario_id_override: None,
        reference: None,
    }
}

fn with_reference(mut req: JobRequest, abs: f64, rel: f64) -> JobRequest {
    req.reference = Some(ReferenceSpec {
        key: REFERENCE.into(),
        tolerance: Tolerance::new(abs, rel).unwrap(),
    });
    req
}

fn run<D: Decoder>(
    cfg: &Config,
    decoder: D,
    store: &dyn ObjectStore,
    statuses: &MemoryStatusStore,
    req: &JobRequest,
) -> JobOutcome {
    Pipeline::new(cfg, decoder, store, statuses)
        .unwrap()
        .run_job(req)
}

fn full_decoder() -> FakeDecoder {
    FakeDecoder::new()
        .with_table("s0042_SV.dss", sv_table())
        .with_table("s0042_DV.dss", dv_table())
}

#[test]
fn both_roles_convert_without_reference() {
    let work = tempfile::tempdir().unwrap();
    let cfg = test_config(work.path());
    let store = MemoryObjectStore::new();
    store.put(BUCKET, ARCHIVE, &both_files()).unwrap();
    let statuses = MemoryStatusStore::new();

    let out = run(&cfg, full_decoder(), &store, &statuses, &request("job-1"));

    assert_eq!(out.status, JobStatus::Succeeded);
    assert!(out.error.is_none());
    let m = &out.manifest;
    assert_eq!(m.scenario_id, "s0042_baseline");
    assert_eq!(m.original_upload_key, ARCHIVE);
    assert_eq!(m.dss_files_detected.sv, "s0042/DSS/s0042_SV.dss");
    assert_eq!(m.dss_files_detected.calsim, "s0042/DSS/s0042_DV.dss");
    assert_eq!(
        m.csv_outputs.sv,
        "scenarios/s0042_baseline/csv/s0042_baseline_sv.csv"
    );
    assert_eq!(
        m.csv_outputs.calsim,
        "scenarios/s0042_baseline/csv/s0042_baseline_calsim.csv"
    );
    assert_eq!(m.variable_sample_b_parts.calsim, vec!["C_SAC041"]);
    assert_eq!(m.validation.result, ValidationResult::Skipped);

    let manifest_key = "scenarios/s0042_baseline/s0042_baseline_manifest.json";
    assert_eq!(out.manifest_key.as_deref(), Some(manifest_key));
    let stored: serde_json::Value =
        serde_json::from_slice(&store.get(BUCKET, manifest_key).unwrap()).unwrap();
    assert_eq!(stored["status"], "succeeded");
    assert_eq!(stored["status_summary"]["calsim_csv_written"], true);

    let csv = store.get(BUCKET, &m.csv_outputs.calsim).unwrap();
    let round = Table::read_csv(csv.as_slice()).unwrap();
    assert_eq!(round.row_count(), 3);

    let rec = statuses
        .get("scenario-jobs", "s0042_baseline")
        .unwrap()
        .unwrap();
    assert_eq!(rec.status, JobStatus::Succeeded);
    assert_eq!(rec.attributes["job_id"], "job-1");
    assert_eq!(rec.attributes["manifest_key"], manifest_key);
    assert!(!rec.attributes.contains_key("error"));
}

#[test]
fn manifest_keys_follow_wire_order() {
    let work = tempfile::tempdir().unwrap();
    let cfg = test_config(work.path());
    let store = MemoryObjectStore::new();
    store.put(BUCKET, ARCHIVE, &both_files()).unwrap();
    let statuses = MemoryStatusStore::new();

    let out = run(&cfg, full_decoder(), &store, &statuses, &request("job-1"));
    let raw = String::from_utf8(store.get(BUCKET, &out.manifest_key.unwrap()).unwrap()).unwrap();
    let order = [
        "\"scenario_id\"",
        "\"processed_at\"",
        "\"job_id\"",
        "\"status\"",
        "\"original_upload_key\"",
        "\"dss_files_detected\"",
        "\"status_summary\"",
        "\"validation\"",
        "\"variable_sample_b_parts\"",
        "\"csv_outputs\"",
    ];
    let positions: Vec<usize> = order.iter().map(|k| raw.find(k).unwrap()).collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn output_only_archive_is_partial() {
    let work = tempfile::tempdir().unwrap();
    let cfg = test_config(work.path());
    let store = MemoryObjectStore::new();
    store
        .put(BUCKET, ARCHIVE, &zip_bytes(&[("run/output/study_DV.dss", b"dv")]))
        .unwrap();
    let statuses = MemoryStatusStore::new();
    let decoder = FakeDecoder::new().with_table("study_DV.dss", dv_table());

    let out = run(&cfg, decoder, &store, &statuses, &request("job-2"));

    assert_eq!(out.status, JobStatus::SucceededPartial);
    let s = &out.manifest.status_summary;
    assert!(!s.sv_detected);
    assert!(s.calsim_detected);
    assert!(s.calsim_csv_written);
    assert!(out.manifest.csv_outputs.sv.is_empty());
}

#[test]
fn archive_without_candidates_fails_but_writes_manifest() {
    let work = tempfile::tempdir().unwrap();
    let cfg = test_config(work.path());
    let store = MemoryObjectStore::new();
    store
        .put(BUCKET, ARCHIVE, &zip_bytes(&[("docs/notes.txt", b"x")]))
        .unwrap();
    let statuses = MemoryStatusStore::new();

    let req = with_reference(request("job-3"), 0.1, 0.1);
    let out = run(&cfg, FakeDecoder::new(), &store, &statuses, &req);

    assert_eq!(out.status, JobStatus::Failed);
    assert!(out.manifest.csv_outputs.sv.is_empty());
    assert!(out.manifest.csv_outputs.calsim.is_empty());
    assert!(out.manifest_key.is_some());
    assert!(
        store
            .keys(BUCKET)
            .iter()
            .all(|k| !k.ends_with(".csv"))
    );

    let v = &out.manifest.validation;
    assert_eq!(v.result, ValidationResult::SkippedNoTargets);
    assert_eq!(v.reference_csv_key, REFERENCE);
    assert_ne!(v.summary, "no reference supplied");
    let rec = statuses
        .get("scenario-jobs", "s0042_baseline")
        .unwrap()
        .unwrap();
    assert_eq!(rec.status, JobStatus::Failed);
    assert!(rec.attributes["error"].contains("dss"));
}

#[test]
fn missing_archive_fails_job() {
    let work = tempfile::tempdir().unwrap();
    let cfg = test_config(work.path());
    let store = MemoryObjectStore::new();
    let statuses = MemoryStatusStore::new();

    let req = with_reference(request("job-4"), 0.1, 0.1);
    let out = run(&cfg, FakeDecoder::new(), &store, &statuses, &req);
    assert_eq!(out.status, JobStatus::Failed);
    assert!(out.error.unwrap().contains(ARCHIVE));
    assert_eq!(out.manifest.validation.reference_csv_key, REFERENCE);
    assert_eq!(
        out.manifest.validation.result,
        ValidationResult::SkippedNoTargets
    );
}

#[test]
fn single_cell_mismatch_fails_validation_not_job() {
    let work = tempfile::tempdir().unwrap();
    let cfg = test_config(work.path());
    let store = MemoryObjectStore::new();
    store.put(BUCKET, ARCHIVE, &both_files()).unwrap();
    let reference = flow_table(&[(DV, &[100.0, 250.0, 300.0])]);
    store
        .put(BUCKET, REFERENCE, &reference.to_csv_bytes().unwrap())
        .unwrap();
    let statuses = MemoryStatusStore::new();

    let req = with_reference(request("job-5"), 0.001, 0.001);
    let out = run(&cfg, full_decoder(), &store, &statuses, &req);

    assert_eq!(out.status, JobStatus::Succeeded);
    let v = &out.manifest.validation;
    assert_eq!(v.result, ValidationResult::Failed);
    assert_eq!(v.target, "calsim");
    assert_eq!(v.reference_csv_key, REFERENCE);
    assert!(v.summary.starts_with("1 value mismatches"));
    assert_eq!(out.validation_report.as_ref().unwrap().mismatches.len(), 1);

    assert_eq!(
        v.report_keys.json,
        "scenarios/s0042_baseline/validation/s0042_baseline_calsim_report.json"
    );
    assert!(store.get(BUCKET, &v.report_keys.json).is_ok());
    assert!(store.get(BUCKET, &v.report_keys.mismatches_csv).is_ok());

    let rec = statuses
        .get("scenario-jobs", "s0042_baseline")
        .unwrap()
        .unwrap();
    assert_eq!(rec.attributes["validation_result"], "failed");
}

#[test]
fn matching_reference_passes() {
    let work = tempfile::tempdir().unwrap();
    let cfg = test_config(work.path());
    let store = MemoryObjectStore::new();
    store.put(BUCKET, ARCHIVE, &both_files()).unwrap();
    store
        .put(BUCKET, REFERENCE, &dv_table().to_csv_bytes().unwrap())
        .unwrap();
    let statuses = MemoryStatusStore::new();

    let req = with_reference(request("job-6"), 0.0, 0.0);
    let out = run(&cfg, full_decoder(), &store, &statuses, &req);
    assert_eq!(out.manifest.validation.result, ValidationResult::Passed);
    assert_eq!(out.manifest.validation.summary, "matched 3 rows x 1 columns");
}

#[test]
fn missing_reference_is_download_failed() {
    let work = tempfile::tempdir().unwrap();
    let cfg = test_config(work.path());
    let store = MemoryObjectStore::new();
    store.put(BUCKET, ARCHIVE, &both_files()).unwrap();
    let statuses = MemoryStatusStore::new();

    let req = with_reference(request("job-7"), 0.1, 0.1);
    let out = run(&cfg, full_decoder(), &store, &statuses, &req);
    assert_eq!(out.status, JobStatus::Succeeded);
    assert_eq!(
        out.manifest.validation.result,
        ValidationResult::DownloadFailed
    );
}

#[test]
fn unreadable_reference_is_error() {
    let work = tempfile::tempdir().unwrap();
    let cfg = test_config(work.path());
    let store = MemoryObjectStore::new();
    store.put(BUCKET, ARCHIVE, &both_files()).unwrap();
    store
        .put(BUCKET, REFERENCE, b"timestamp,A\n2001-01-01,not-a-number\n")
        .unwrap();
    let statuses = MemoryStatusStore::new();

    let req = with_reference(request("job-8"), 0.1, 0.1);
    let out = run(&cfg, full_decoder(), &store, &statuses, &req);
    assert_eq!(out.status, JobStatus::Succeeded);
    assert_eq!(out.manifest.validation.result, ValidationResult::Error);
}

#[test]
fn one_failed_conversion_is_partial_and_validates_the_other() {
    let work = tempfile::tempdir().unwrap();
    let cfg = test_config(work.path());
    let store = MemoryObjectStore::new();
    store.put(BUCKET, ARCHIVE, &both_files()).unwrap();
    store
        .put(BUCKET, REFERENCE, &sv_table().to_csv_bytes().unwrap())
        .unwrap();
    let statuses = MemoryStatusStore::new();
    let decoder = FakeDecoder::new()
        .with_table("s0042_SV.dss", sv_table())
        .with_failure("s0042_DV.dss", "record catalog unreadable");

    let req = with_reference(request("job-9"), 0.0, 0.0);
    let out = run(&cfg, decoder, &store, &statuses, &req);

    assert_eq!(out.status, JobStatus::SucceededPartial);
    let s = &out.manifest.status_summary;
    assert!(s.calsim_detected);
    assert!(!s.calsim_csv_written);
    assert!(s.sv_csv_written);
    assert_eq!(out.manifest.validation.target, "sv");
    assert_eq!(out.manifest.validation.result, ValidationResult::Passed);
}

#[test]
fn no_converted_table_skips_validation() {
    let work = tempfile::tempdir().unwrap();
    let cfg = test_config(work.path());
    let store = MemoryObjectStore::new();
    store.put(BUCKET, ARCHIVE, &both_files()).unwrap();
    let statuses = MemoryStatusStore::new();
    let decoder = FakeDecoder::new()
        .with_failure("s0042_SV.dss", "boom")
        .with_failure("s0042_DV.dss", "boom");

    let req = with_reference(request("job-10"), 0.1, 0.1);
    let out = run(&cfg, decoder, &store, &statuses, &req);
    assert_eq!(out.status, JobStatus::Failed);
    assert_eq!(
        out.manifest.validation.result,
        ValidationResult::SkippedNoTargets
    );
}

#[test]
fn rerun_produces_equivalent_manifest() {
    let work = tempfile::tempdir().unwrap();
    let cfg = test_config(work.path());
    let store = MemoryObjectStore::new();
    store.put(BUCKET, ARCHIVE, &both_files()).unwrap();
    let statuses = MemoryStatusStore::new();

    let first = run(&cfg, full_decoder(), &store, &statuses, &request("job-a"));
    let second = run(&cfg, full_decoder(), &store, &statuses, &request("job-b"));

    let mut a = first.manifest.clone();
    let mut b = second.manifest.clone();
    a.processed_at.clear();
    b.processed_at.clear();
    a.job_id.clear();
    b.job_id.clear();
    assert_eq!(a, b);

    let rec = statuses
        .get("scenario-jobs", "s0042_baseline")
        .unwrap()
        .unwrap();
    assert_eq!(rec.status, JobStatus::Succeeded);
    assert_eq!(rec.attributes["job_id"], "job-b");
}

#[test]
fn sequential_mode_gives_same_outcome() {
    let work = tempfile::tempdir().unwrap();
    let mut cfg = test_config(work.path());
    cfg.global.parallel_conversions = false;
    let store = MemoryObjectStore::new();
    store.put(BUCKET, ARCHIVE, &both_files()).unwrap();
    let statuses = MemoryStatusStore::new();

    let out = run(&cfg, full_decoder(), &store, &statuses, &request("job-seq"));
    assert_eq!(out.status, JobStatus::Succeeded);
}

#[test]
fn work_dir_is_clean_after_run() {
    let work = tempfile::tempdir().unwrap();
    let cfg = test_config(work.path());
    let store = MemoryObjectStore::new();
    store.put(BUCKET, ARCHIVE, &both_files()).unwrap();
    let statuses = MemoryStatusStore::new();

    run(&cfg, full_decoder(), &store, &statuses, &request("job-11"));
    let leftovers = std::fs::read_dir(work.path()).unwrap().count();
    assert_eq!(leftovers, 0);
}

#[test]
fn scenario_id_override_drives_keys_and_status() {
    let work = tempfile::tempdir().unwrap();
    let cfg = test_config(work.path());
    let store = MemoryObjectStore::new();
    store.put(BUCKET, ARCHIVE, &both_files()).unwrap();
    let statuses = MemoryStatusStore::new();

    let mut req = request("job-12");
    req.scenario_id_override = Some("custom-7".into());
    let out = run(&cfg, full_decoder(), &store, &statuses, &req);
    assert_eq!(out.manifest.scenario_id, "custom-7");
    assert_eq!(
        out.manifest_key.as_deref(),
        Some("scenarios/custom-7/custom-7_manifest.json")
    );
    assert!(statuses.get("scenario-jobs", "custom-7").unwrap().is_some());
}

#[test]
fn status_outage_does_not_stop_the_job() {
    let work = tempfile::tempdir().unwrap();
    let cfg = test_config(work.path());
    let store = MemoryObjectStore::new();
    store.put(BUCKET, ARCHIVE, &both_files()).unwrap();
    let statuses = MemoryStatusStore::new();
    statuses.set_unavailable(true);

    let out = run(&cfg, full_decoder(), &store, &statuses, &request("job-13"));
    assert_eq!(out.status, JobStatus::Succeeded);
    assert!(out.manifest_key.is_some());
}

/// Refuses writes of the manifest object only.
struct NoManifestStore(MemoryObjectStore);

impl ObjectStore for NoManifestStore {
    fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, StorageError> {
        self.0.get(bucket, key)
    }

    fn put(&self, bucket: &str, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        if key.ends_with("_manifest.json") {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        self.0.put(bucket, key, bytes)
    }
}

#[test]
fn manifest_upload_failure_fails_the_job() {
    let work = tempfile::tempdir().unwrap();
    let cfg = test_config(work.path());
    let inner = MemoryObjectStore::new();
    inner.put(BUCKET, ARCHIVE, &both_files()).unwrap();
    let store = NoManifestStore(inner);
    let statuses = MemoryStatusStore::new();

    let out = run(&cfg, full_decoder(), &store, &statuses, &request("job-14"));
    assert_eq!(out.status, JobStatus::Failed);
    assert!(out.manifest_key.is_none());
    assert!(out.error.unwrap().contains("manifest upload failed"));
    let rec = statuses
        .get("scenario-jobs", "s0042_baseline")
        .unwrap()
        .unwrap();
    assert_eq!(rec.status, JobStatus::Failed);
}

struct PanickingDecoder;

impl Decoder for PanickingDecoder {
    fn doctor(&self) -> anyhow::Result<DecoderDiag> {
        unreachable!()
    }

    fn decode(&self, _input: &Path, _role: Role) -> anyhow::Result<Table> {
        panic!("decoder crashed")
    }
}

#[test]
fn panics_end_in_a_terminal_status() {
    let work = tempfile::tempdir().unwrap();
    for parallel in [true, false] {
        let mut cfg = test_config(work.path());
        cfg.global.parallel_conversions = parallel;
        let store = MemoryObjectStore::new();
        store.put(BUCKET, ARCHIVE, &both_files()).unwrap();
        let statuses = MemoryStatusStore::new();

        let req = with_reference(request("job-15"), 0.1, 0.1);
        let out = run(&cfg, PanickingDecoder, &store, &statuses, &req);
        assert_eq!(out.status, JobStatus::Failed);
        assert_eq!(out.manifest.validation.reference_csv_key, REFERENCE);
        assert_eq!(
            out.manifest.validation.result,
            ValidationResult::SkippedNoTargets
        );
        let rec = statuses
            .get("scenario-jobs", "s0042_baseline")
            .unwrap()
            .unwrap();
        assert!(rec.status.is_terminal());
    }
}

#[test]
fn reference_without_tolerances_is_rejected_up_front() {
    let cfg = Config::default();
    let args = RunArgs {
        bucket: BUCKET.into(),
        key: ARCHIVE.into(),
        reference_key: Some(REFERENCE.into()),
        abs_tol: Some(0.1),
        ..RunArgs::default()
    };
    assert!(build_request(&cfg, &args).is_err());

    let args = RunArgs {
        rel_tol: Some(0.01),
        ..args
    };
    let req = build_request(&cfg, &args).unwrap();
    assert_eq!(req.reference.unwrap().key, REFERENCE);
    assert!(!req.job_id.is_empty());
    assert_eq!(req.status_table, "scenario-jobs");
}

#[test]
fn missing_archive_location_is_rejected() {
    let args = RunArgs::default();
    assert!(build_request(&Config::default(), &args).is_err());

    let args = RunArgs {
        bucket: BUCKET.into(),
        key: "incoming/".into(),
        ..RunArgs::default()
    };
    assert!(build_request(&Config::default(), &args).is_err());
}

#[test]
fn dot_scenario_override_still_lands_in_local_store() {
    let work = tempfile::tempdir().unwrap();
    let root = tempfile::tempdir().unwrap();
    let cfg = test_config(work.path());
    let store = LocalObjectStore::new(root.path());
    store.put(BUCKET, ARCHIVE, &both_files()).unwrap();
    let statuses = MemoryStatusStore::new();

    let mut req = request("job-16");
    req.scenario_id_override = Some("..".into());
    let out = run(&cfg, full_decoder(), &store, &statuses, &req);
    assert_eq!(out.status, JobStatus::Succeeded);
    assert_eq!(
        out.manifest_key.as_deref(),
        Some("scenarios/__/___manifest.json")
    );
}
