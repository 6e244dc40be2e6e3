use crate::{
    classify::{ClassifiedFile, Classifier, Role},
    config::Config,
    convert::{ConversionResult, Converter},
    engine::Decoder,
    error::IngestError,
    fetch,
    manifest::{Manifest, ManifestBuilder, ReportKeys, ValidationSection},
    status::{JobStatus, StatusStore, StatusTracker},
    storage::{KeyLayout, ObjectStore},
    table::Table,
    util::now_rfc3339,
    validate::{self, Tolerance, ValidationReport, ValidationResult},
};
use anyhow::Result;
use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// A reference table and the tolerances to compare against it.
#[derive(Debug, Clone)]
pub struct ReferenceSpec {
    pub key: String,
    pub tolerance: Tolerance,
}

#[derive(Debug, Clone)]
pub struct JobRequest {
    pub bucket: String,
    pub key: String,
    pub job_id: String,
    pub status_table: String,
    pub output_prefix: String,
    pub scenario_id_override: Option<String>,
    pub reference: Option<ReferenceSpec>,
}

#[derive(Debug)]
pub struct JobOutcome {
    pub status: JobStatus,
    pub manifest: Manifest,
    /// Set only when the manifest upload succeeded.
    pub manifest_key: Option<String>,
    pub error: Option<String>,
    pub validation_report: Option<ValidationReport>,
}

pub struct Pipeline<'a, D: Decoder> {
    cfg: Config,
    decoder: D,
    classifier: Classifier,
    store: &'a dyn ObjectStore,
    status_store: &'a dyn StatusStore,
}

/// Everything one pass produced before the final manifest/status writes.
struct Execution {
    builder: ManifestBuilder,
    error: Option<String>,
    archive_sha256: Option<String>,
    report: Option<ValidationReport>,
}

impl<'a, D: Decoder> Pipeline<'a, D> {
    pub fn new(
        cfg: &Config,
        decoder: D,
        store: &'a dyn ObjectStore,
        status_store: &'a dyn StatusStore,
    ) -> Result<Self> {
        Ok(Self {
            cfg: cfg.clone(),
            decoder,
            classifier: Classifier::new(cfg)?,
            store,
            status_store,
        })
    }

    /// Runs one job to a terminal status. Every path ends with a manifest upload
    /// attempt followed by a final status write.
    pub fn run_job(&self, req: &JobRequest) -> JobOutcome {
        let started = Instant::now();
        let scenario_id = self
            .classifier
            .scenario_id(&req.key, req.scenario_id_override.as_deref());
        let layout = KeyLayout::new(&req.output_prefix, &scenario_id);
        info!(
            "job_id={} scenario_id={scenario_id} archive={}/{}",
            req.job_id, req.bucket, req.key
        );

        let mut tracker =
            StatusTracker::new(self.status_store, &req.status_table, &scenario_id, &req.job_id);
        let mut attrs = BTreeMap::from([
            ("scenario_id".to_string(), scenario_id.clone()),
            ("original_upload_key".to_string(), req.key.clone()),
        ]);
        tracker.record(JobStatus::Submitted, &attrs);
        tracker.record(JobStatus::Running, &attrs);

        let exec = catch_unwind(AssertUnwindSafe(|| self.execute(req, &scenario_id, &layout)))
            .unwrap_or_else(|panic| {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!("job panicked: {msg}");
                Execution {
                    builder: ManifestBuilder::new(&scenario_id, &req.job_id, &req.key)
                        .validation(pending_validation(req)),
                    error: Some(format!("job panicked: {msg}")),
                    archive_sha256: None,
                    report: None,
                }
            });

        let manifest = exec.builder.build(now_rfc3339());
        let manifest_key = layout.manifest();
        let mut status = manifest.status;
        let mut job_error = exec.error;

        let uploaded = serde_json::to_vec_pretty(&manifest)
            .map_err(anyhow::Error::from)
            .and_then(|bytes| {
                self.store
                    .put(&req.bucket, &manifest_key, &bytes)
                    .map_err(anyhow::Error::from)
            });
        let manifest_key = match uploaded {
            Ok(()) => {
                info!("manifest written to {}/{manifest_key}", req.bucket);
                Some(manifest_key)
            }
            Err(e) => {
                // The manifest is a required artifact: its loss fails the job.
                error!("manifest upload failed for {manifest_key}: {e:#}");
                status = JobStatus::Failed;
                job_error = Some(format!("manifest upload failed: {e:#}"));
                None
            }
        };

        if let Some(sha) = exec.archive_sha256 {
            attrs.insert("archive_sha256".into(), sha);
        }
        for role in Role::EXPECTED {
            if let Some(key) = manifest.csv_outputs.get(role).filter(|k| !k.is_empty()) {
                attrs.insert(format!("csv_{}", role.label()), key.clone());
            }
        }
        attrs.insert(
            "validation_result".into(),
            manifest.validation.result.to_string(),
        );
        if let Some(key) = &manifest_key {
            attrs.insert("manifest_key".into(), key.clone());
        }
        if let Some(e) = &job_error {
            attrs.insert("error".into(), e.clone());
        }
        tracker.record(status, &attrs);

        info!(
            "job {} finished status={status} validation={} in {:?}",
            req.job_id,
            manifest.validation.result,
            started.elapsed()
        );

        JobOutcome {
            status,
            manifest,
            manifest_key,
            error: job_error,
            validation_report: exec.report,
        }
    }

    fn execute(&self, req: &JobRequest, scenario_id: &str, layout: &KeyLayout) -> Execution {
        let mut builder = ManifestBuilder::new(scenario_id, &req.job_id, &req.key)
            .validation(pending_validation(req));
        let work_root = PathBuf::from(&self.cfg.paths.work_dir);

        let archive = match fetch::fetch_archive(
            &self.cfg,
            self.store,
            &req.bucket,
            &req.key,
            &work_root,
            &req.job_id,
        ) {
            Ok(a) => a,
            Err(e) => return Execution::fatal(builder, e, None),
        };
        let sha = Some(archive.sha256.clone());
        info!(
            "archive sha256={} bytes={} files={}",
            archive.sha256,
            archive.bytes,
            archive.files.len()
        );

        let classification = match self.classifier.classify(
            &req.key,
            req.scenario_id_override.as_deref(),
            &archive.files,
        ) {
            Ok(c) => c,
            Err(e) => return Execution::fatal(builder, e, sha),
        };
        for role in Role::EXPECTED {
            match classification.selected(role) {
                Some(f) => info!("{role}: {} ({})", f.path, f.evidence),
                None => warn!("{role}: no file detected"),
            }
        }
        for alt in &classification.alternates {
            info!("{}: passed over {} ({})", alt.role, alt.path, alt.evidence);
        }
        for f in &classification.unclassified {
            debug!("unclassified candidate {}", f.path);
        }
        builder = builder.classification(&classification);

        let out_dir = match archive.scratch("csv") {
            Ok(p) => p,
            Err(e) => return Execution::fatal(builder, e, sha),
        };
        let targets: Vec<&ClassifiedFile> = Role::EXPECTED
            .iter()
            .filter_map(|r| classification.selected(*r))
            .collect();
        let results = self.convert_all(req, layout, archive.root(), &out_dir, &targets);
        for r in &results {
            builder = builder.conversion(r);
        }

        let (section, report) = self.validate(req, layout, &results);
        builder = builder.validation(section);

        Execution {
            builder,
            error: None,
            archive_sha256: sha,
            report,
        }
    }

    fn convert_all(
        &self,
        req: &JobRequest,
        layout: &KeyLayout,
        source_root: &Path,
        out_dir: &Path,
        targets: &[&ClassifiedFile],
    ) -> Vec<ConversionResult> {
        let converter = Converter {
            decoder: &self.decoder,
            store: self.store,
            bucket: &req.bucket,
            layout,
            source_root,
            out_dir,
        };
        let converter = &converter;

        if !self.cfg.global.parallel_conversions || targets.len() < 2 {
            return targets.iter().map(|f| converter.convert(f)).collect();
        }

        // Roles are independent; join before validation.
        std::thread::scope(|s| {
            let handles: Vec<_> = targets
                .iter()
                .map(|f| s.spawn(move || converter.convert(f)))
                .collect();
            handles
                .into_iter()
                .zip(targets)
                .map(|(h, f)| {
                    h.join().unwrap_or_else(|_| {
                        error!("conversion thread for {} panicked", f.role);
                        ConversionResult::failed(f, "conversion thread panicked".into())
                    })
                })
                .collect()
        })
    }

    fn validate(
        &self,
        req: &JobRequest,
        layout: &KeyLayout,
        results: &[ConversionResult],
    ) -> (ValidationSection, Option<ValidationReport>) {
        let Some(reference) = &req.reference else {
            info!("validation skipped: no reference supplied");
            return (ValidationSection::default(), None);
        };
        let mut section = ValidationSection {
            reference_csv_key: reference.key.clone(),
            ..ValidationSection::default()
        };

        let converted = |role: Role| {
            results
                .iter()
                .find(|r| r.role == role && r.success)
                .and_then(|r| r.table.as_ref())
        };
        let Some((role, produced)) = validate::choose_target(
            converted(Role::InputSeries),
            converted(Role::OutputSeries),
        ) else {
            warn!("validation skipped: no converted table to compare");
            return (pending_validation(req), None);
        };
        section.target = role.label().to_string();

        let bytes = match self.store.get(&req.bucket, &reference.key) {
            Ok(b) => b,
            Err(e) => {
                warn!("reference download failed: {e}");
                section.result = ValidationResult::DownloadFailed;
                section.summary = e.to_string();
                return (section, None);
            }
        };
        let reference_table = match Table::read_csv(bytes.as_slice()) {
            Ok(t) => t,
            Err(e) => {
                warn!("reference is not a readable table: {e:#}");
                section.result = ValidationResult::Error;
                section.summary = format!("unreadable reference: {e:#}");
                return (section, None);
            }
        };

        let report = validate::compare(&reference_table, produced, reference.tolerance);
        section.result = report.result;
        section.summary = report.summary(reference_table.column_count());
        info!("validation {} against {}: {}", section.result, reference.key, section.summary);

        if self.cfg.output.write_validation_reports {
            section.report_keys = self.upload_reports(req, layout, role, &report);
        }
        (section, Some(report))
    }

    /// Reports are optional artifacts; a failed upload leaves its key empty.
    fn upload_reports(
        &self,
        req: &JobRequest,
        layout: &KeyLayout,
        role: Role,
        report: &ValidationReport,
    ) -> ReportKeys {
        let id = layout.scenario_id();
        let mut keys = ReportKeys::default();

        let json = serde_json::to_vec_pretty(report).map_err(anyhow::Error::from);
        let json_key = layout.validation(&format!("{id}_{}_report.json", role.label()));
        if let Some(k) = self.put_optional(req, json_key, json) {
            keys.json = k;
        }

        let csv = report.mismatches_csv();
        let csv_key = layout.validation(&format!("{id}_{}_mismatches.csv", role.label()));
        if let Some(k) = self.put_optional(req, csv_key, csv) {
            keys.mismatches_csv = k;
        }
        keys
    }

    fn put_optional(&self, req: &JobRequest, key: String, bytes: Result<Vec<u8>>) -> Option<String> {
        let result = bytes.and_then(|b| {
            self.store.put(&req.bucket, &key, &b).map_err(|source| {
                IngestError::Upload {
                    key: key.clone(),
                    source,
                }
                .into()
            })
        });
        match result {
            Ok(()) => Some(key),
            Err(e) => {
                warn!("optional artifact not written: {e:#}");
                None
            }
        }
    }
}

/// Validation section for a job that ends before anything was compared.
fn pending_validation(req: &JobRequest) -> ValidationSection {
    match &req.reference {
        Some(reference) => ValidationSection {
            reference_csv_key: reference.key.clone(),
            result: ValidationResult::SkippedNoTargets,
            summary: "no converted table to validate".into(),
            ..ValidationSection::default()
        },
        None => ValidationSection::default(),
    }
}

impl Execution {
    fn fatal(builder: ManifestBuilder, err: IngestError, archive_sha256: Option<String>) -> Self {
        debug_assert!(err.is_fatal());
        error!("{err}");
        Self {
            builder,
            error: Some(err.to_string()),
            archive_sha256,
            report: None,
        }
    }
}
