use crate::{
    classify::Classifier,
    config::Config,
    engine::{Decoder, process::ProcessDecoder},
    fetch,
    pipeline::{JobRequest, Pipeline, ReferenceSpec},
    status::{JobStatus, JsonFileStatusStore, StatusStore},
    storage::{LocalObjectStore, ObjectStore},
    table::Table,
    util::ensure_dir,
    validate::{self, Tolerance},
};
use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "scenario-ingest")]
#[command(about = "Scenario archive ingestion: classify, convert, validate, manifest")]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    /// Path to config TOML. If omitted, uses ./scenario-ingest.toml if present.
    #[arg(long, env = "SCENARIO_INGEST_CONFIG")]
    pub config: Option<PathBuf>,

    /// Override log level (trace/debug/info/warn/error).
    #[arg(long)]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Ingest one uploaded archive. Exits non-zero when the job fails.
    Run(RunArgs),
    /// Report the external decoder's diagnostics.
    Doctor {},
    /// Classify the files of a local archive without converting them.
    Classify {
        #[arg(long)]
        archive: PathBuf,
        #[arg(long)]
        scenario_id: Option<String>,
    },
    /// Compare two canonical CSV tables. Exits non-zero on mismatches.
    Validate {
        #[arg(long)]
        reference: PathBuf,
        #[arg(long)]
        produced: PathBuf,
        #[arg(long)]
        abs_tol: f64,
        #[arg(long)]
        rel_tol: f64,
    },
}

#[derive(clap::Args, Debug, Clone, Default)]
pub struct RunArgs {
    #[arg(long, env = "INGEST_BUCKET")]
    pub bucket: String,
    #[arg(long, env = "INGEST_KEY")]
    pub key: String,
    #[arg(long, env = "STATUS_TABLE")]
    pub status_table: Option<String>,
    #[arg(long, env = "OUTPUT_PREFIX")]
    pub output_prefix: Option<String>,
    #[arg(long, env = "SCENARIO_ID")]
    pub scenario_id: Option<String>,
    #[arg(long, env = "REFERENCE_KEY")]
    pub reference_key: Option<String>,
    #[arg(long, env = "ABS_TOL")]
    pub abs_tol: Option<f64>,
    #[arg(long, env = "REL_TOL")]
    pub rel_tol: Option<f64>,
    /// Defaults to a fresh UUID.
    #[arg(long, env = "JOB_ID")]
    pub job_id: Option<String>,
}

pub fn dispatch(args: Args) -> Result<()> {
    let cfg = match resolve_config_path(args.config.as_deref()) {
        Some(path) => Config::load(&path)?,
        None => Config::default(),
    };
    let log_path = resolve_log_path(&cfg);
    let _guard = init_logging(&args, &cfg, log_path.as_deref())?;

    match &args.cmd {
        Command::Run(run_args) => run(&cfg, run_args),
        Command::Doctor {} => doctor(&cfg),
        Command::Classify {
            archive,
            scenario_id,
        } => classify(&cfg, archive, scenario_id.as_deref()),
        Command::Validate {
            reference,
            produced,
            abs_tol,
            rel_tol,
        } => validate_local(reference, produced, *abs_tol, *rel_tol),
    }
}

fn resolve_config_path(user: Option<&Path>) -> Option<PathBuf> {
    if let Some(p) = user {
        return Some(p.to_path_buf());
    }
    ["scenario-ingest.toml", "scenario-ingest.example.toml"]
        .into_iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
}

/// Logs go to stderr; stdout is reserved for the JSON summary. The optional
/// file sink appends so consecutive jobs share one log.
fn init_logging(args: &Args, cfg: &Config, file_path: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let level = args
        .log_level
        .as_deref()
        .unwrap_or(cfg.logging.level.as_str());
    let filter = match EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => EnvFilter::try_new(level).with_context(|| format!("invalid log level {level:?}"))?,
    };

    let mut guard = None;
    let file_layer = match file_path {
        Some(path) => {
            let (writer, g) = tracing_appender::non_blocking(append_log(path)?);
            guard = Some(g);
            Some(fmt_layer(cfg.logging.json, false, writer))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer(cfg.logging.json, true, std::io::stderr))
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow!("failed to init logging: {e}"))?;

    Ok(guard)
}

fn fmt_layer<S, W>(json: bool, ansi: bool, writer: W) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    W: for<'w> tracing_subscriber::fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(true);
    if json {
        layer.json().boxed()
    } else {
        layer.boxed()
    }
}

fn append_log(path: &Path) -> Result<std::fs::File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        ensure_dir(parent)?;
    }
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open log file {}", path.display()))
}

fn resolve_log_path(cfg: &Config) -> Option<PathBuf> {
    if !cfg.logging.write_to_file {
        return None;
    }
    if !cfg.logging.file_path.is_empty() {
        return Some(PathBuf::from(&cfg.logging.file_path));
    }
    Some(PathBuf::from(&cfg.paths.work_dir).join("scenario-ingest.log"))
}

/// Merges CLI/env overrides over config and checks the validation inputs.
pub fn build_request(cfg: &Config, args: &RunArgs) -> Result<JobRequest> {
    if args.bucket.trim().is_empty() || args.key.trim().is_empty() {
        bail!("archive bucket and key are required");
    }
    if args.key.ends_with('/') {
        bail!("archive key {:?} names a prefix, not an object", args.key);
    }

    let reference_key = args
        .reference_key
        .clone()
        .or_else(|| cfg.validation.reference_key.clone())
        .filter(|k| !k.trim().is_empty());
    let abs = args.abs_tol.or(cfg.validation.abs_tolerance);
    let rel = args.rel_tol.or(cfg.validation.rel_tolerance);

    let reference = match reference_key {
        Some(key) => {
            let tolerance = Tolerance::from_options(abs, rel)
                .with_context(|| format!("reference {key} supplied without usable tolerances"))?;
            Some(ReferenceSpec { key, tolerance })
        }
        None => {
            if abs.is_some() || rel.is_some() {
                // Tolerances are range-checked even when unused.
                Tolerance::new(abs.unwrap_or(0.0), rel.unwrap_or(0.0))?;
            }
            None
        }
    };

    Ok(JobRequest {
        bucket: args.bucket.clone(),
        key: args.key.clone(),
        job_id: args
            .job_id
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        status_table: args
            .status_table
            .clone()
            .unwrap_or_else(|| cfg.status.table.clone()),
        output_prefix: args
            .output_prefix
            .clone()
            .unwrap_or_else(|| cfg.output.prefix.clone()),
        scenario_id_override: args.scenario_id.clone(),
        reference,
    })
}

fn object_store(cfg: &Config) -> Result<Box<dyn ObjectStore>> {
    match cfg.storage.backend.as_str() {
        "local" => Ok(Box::new(LocalObjectStore::new(&cfg.storage.root))),
        other => bail!("unsupported storage.backend: {other}"),
    }
}

fn status_store(cfg: &Config) -> Result<Box<dyn StatusStore>> {
    match cfg.status.backend.as_str() {
        "json_file" => Ok(Box::new(JsonFileStatusStore::new(&cfg.status.dir))),
        other => bail!("unsupported status.backend: {other}"),
    }
}

fn run(cfg: &Config, args: &RunArgs) -> Result<()> {
    let req = build_request(cfg, args)?;
    let store = object_store(cfg)?;
    let statuses = status_store(cfg)?;

    ensure_dir(Path::new(&cfg.paths.work_dir))?;
    if cfg.debug.dump_effective_config {
        let raw = toml::to_string(cfg).unwrap_or_default();
        std::fs::write(Path::new(&cfg.paths.work_dir).join("effective-config.toml"), raw)?;
    }

    let decoder = ProcessDecoder::new(cfg)?;
    let pipeline = Pipeline::new(cfg, decoder, store.as_ref(), statuses.as_ref())?;
    let outcome = pipeline.run_job(&req);

    if cfg.global.print_summary {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "job_id": req.job_id,
                "scenario_id": outcome.manifest.scenario_id,
                "status": outcome.status,
                "validation": outcome.manifest.validation.result,
                "manifest_key": outcome.manifest_key,
                "error": outcome.error,
            }))?
        );
    }

    if outcome.status == JobStatus::Failed {
        bail!(
            "scenario {} failed: {}",
            outcome.manifest.scenario_id,
            outcome
                .error
                .as_deref()
                .unwrap_or("no role could be converted")
        );
    }
    Ok(())
}

fn doctor(cfg: &Config) -> Result<()> {
    let decoder = ProcessDecoder::new(cfg)?;
    let diag = decoder.doctor()?;
    println!("{}", serde_json::to_string_pretty(&diag)?);
    Ok(())
}

fn classify(cfg: &Config, archive: &Path, scenario_id: Option<&str>) -> Result<()> {
    let bytes =
        std::fs::read(archive).with_context(|| format!("reading {}", archive.display()))?;
    let fetched = fetch::extract_bytes(cfg, &bytes, Path::new(&cfg.paths.work_dir), "classify")?;
    let name = archive
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let classification = Classifier::new(cfg)?.classify(&name, scenario_id, &fetched.files)?;
    info!("classified {} files from {}", fetched.files.len(), archive.display());
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "archive": archive,
            "sha256": fetched.sha256,
            "files": fetched.files,
            "classification": classification,
        }))?
    );
    Ok(())
}

fn validate_local(reference: &Path, produced: &Path, abs_tol: f64, rel_tol: f64) -> Result<()> {
    let tol = Tolerance::new(abs_tol, rel_tol)?;
    let read = |p: &Path| -> Result<Table> {
        let f = std::fs::File::open(p).with_context(|| format!("open {}", p.display()))?;
        Table::read_csv(f).with_context(|| format!("reading table {}", p.display()))
    };
    let reference_table = read(reference)?;
    let report = validate::compare(&reference_table, &read(produced)?, tol);
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.passed() {
        bail!("{}", report.summary(reference_table.column_count()));
    }
    Ok(())
}
