use super::{Decoder, types::*};
use crate::{classify::Role, config::Config, table::Table};
use anyhow::{Context, Result, anyhow};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Runs an external decoder program speaking JSON over stdin/stdout.
///
/// Request: `{"cmd": "decode", "input": <path>, "role": <role>}` or
/// `{"cmd": "doctor"}`. Response: [`DecodeOut`] or [`DecoderDiag`].
pub struct ProcessDecoder {
    cfg: Config,
    program: PathBuf,
}

impl ProcessDecoder {
    pub fn new(cfg: &Config) -> Result<Self> {
        let program = resolve_program(&cfg.decoder.program)?;
        for arg in &cfg.decoder.args {
            // Script paths must exist before any job state moves.
            let p = Path::new(arg);
            if p.extension().is_some_and(|e| e == "py") && !p.exists() {
                return Err(anyhow!("missing decoder script: {}", p.display()));
            }
        }
        Ok(Self {
            cfg: cfg.clone(),
            program,
        })
    }

    fn timeout(&self) -> Option<Duration> {
        (self.cfg.decoder.timeout_seconds > 0)
            .then(|| Duration::from_secs(self.cfg.decoder.timeout_seconds))
    }

    /// One request/response exchange. `label` names the request in errors and logs.
    fn run_json<I: serde::Serialize, O: for<'de> serde::Deserialize<'de>>(
        &self,
        input: &I,
        label: &str,
    ) -> Result<O> {
        let timeout = self.timeout();
        debug!(
            "decoder {label}: {} {:?} timeout={:?}",
            self.program.display(),
            self.cfg.decoder.args,
            timeout
        );
        let mut child = Command::new(&self.program)
            .args(&self.cfg.decoder.args)
            .envs(&self.cfg.decoder.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawning decoder {}", self.program.display()))?;

        // Dropping stdin closes it; the decoder reads one request to EOF.
        if let Some(mut stdin) = child.stdin.take() {
            let request = serde_json::to_vec(input)?;
            stdin
                .write_all(&request)
                .with_context(|| format!("sending request to decoder {label}"))?;
        }

        let output = match timeout {
            Some(limit) => wait_with_timeout(&mut child, limit, label)?,
            None => child
                .wait_with_output()
                .with_context(|| format!("waiting for decoder {label}"))?,
        };
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            return Err(anyhow!(
                "decoder {label} exited with {}: {}",
                output.status,
                stderr.trim()
            ));
        }
        if self.cfg.debug.keep_decoder_stderr && !stderr.trim().is_empty() {
            debug!("decoder {label} stderr: {}", stderr.trim());
        }

        serde_json::from_slice(&output.stdout)
            .with_context(|| format!("decoder {label} returned malformed JSON"))
    }
}

fn resolve_program(raw: &str) -> Result<PathBuf> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(anyhow!("decoder.program is empty"));
    }
    if raw.eq_ignore_ascii_case("auto") {
        if let Ok(env_val) = std::env::var("SCENARIO_DECODER") {
            return Ok(expand_tilde(&env_val));
        }
        return Ok(PathBuf::from("python3"));
    }
    Ok(expand_tilde(raw))
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

impl Decoder for ProcessDecoder {
    fn doctor(&self) -> Result<DecoderDiag> {
        self.run_json(&serde_json::json!({"cmd": "doctor"}), "doctor")
    }

    fn decode(&self, input: &Path, role: Role) -> Result<Table> {
        let req = DecodeIn {
            cmd: "decode".into(),
            input: input.display().to_string(),
            role: role.to_string(),
        };
        let label = format!("{role} {}", input.display());
        let out: DecodeOut = self.run_json(&req, &label)?;
        for w in &out.warnings {
            warn!("decoder warning ({role}): {w}");
        }
        if !out.ok {
            let msg = out
                .error
                .unwrap_or_else(|| "decoder returned ok=false".to_string());
            return Err(anyhow!(msg));
        }
        Ok(out.into_table())
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<std::io::Result<Vec<u8>>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut p) = pipe {
            p.read_to_end(&mut buf)?;
        }
        Ok(buf)
    })
}

fn collect(reader: JoinHandle<std::io::Result<Vec<u8>>>, pipe: &str) -> Result<Vec<u8>> {
    reader
        .join()
        .map_err(|_| anyhow!("decoder {pipe} reader panicked"))?
        .with_context(|| format!("reading decoder {pipe}"))
}

/// Waits for `child`, killing it at `timeout`. Both pipes are read concurrently
/// so a chatty decoder cannot stall on a full buffer.
fn wait_with_timeout(child: &mut Child, timeout: Duration, label: &str) -> Result<Output> {
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());
    let deadline = Instant::now() + timeout;

    let status = loop {
        if let Some(status) = child.try_wait().context("polling decoder")? {
            break status;
        }
        if Instant::now() >= deadline {
            warn!("decoder {label} still running after {}s, killing it", timeout.as_secs());
            let _ = child.kill();
            child.wait().context("reaping killed decoder")?;
            let _ = collect(stdout, "stdout");
            let stderr = collect(stderr, "stderr").unwrap_or_default();
            return Err(anyhow!(
                "decoder {label} exceeded timeout of {}s; stderr: {}",
                timeout.as_secs(),
                String::from_utf8_lossy(&stderr).trim()
            ));
        }
        std::thread::sleep(POLL_INTERVAL);
    };

    Ok(Output {
        status,
        stdout: collect(stdout, "stdout")?,
        stderr: collect(stderr, "stderr")?,
    })
}
