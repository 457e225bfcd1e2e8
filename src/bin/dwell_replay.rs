//! dwell_replay - evaluate a timed detection script against a fence file
//!
//! Each script step is fed to a fence manager at its `t` offset, so dwell
//! times follow the script's clock rather than the wall clock. Intrusion
//! events are printed to stdout as JSON lines.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fencewatch::{DetectionScript, Fence, FenceManager, FenceSpec};

#[derive(Parser, Debug)]
#[command(author, version, about = "Replay a detection script against geofences")]
struct Args {
    /// Fence file: `{"fences": [...]}` as JSON, or `[[fences]]` tables as TOML.
    #[arg(long)]
    fences: PathBuf,

    /// Detection script (JSON).
    #[arg(long)]
    script: PathBuf,

    /// Stream id stamped on emitted events.
    #[arg(long, default_value = "replay")]
    stream_id: String,

    /// Drop detections below this confidence before fence evaluation.
    #[arg(long, env = "FENCEWATCH_CONFIDENCE", default_value_t = 0.5)]
    confidence: f32,

    /// Seconds without a sighting before a track is forgotten.
    #[arg(long, default_value_t = 2.0)]
    stale_timeout_secs: f64,

    /// Use fuzzy containment: the fraction of box corners and center that
    /// must lie inside a fence (below 0.5 only).
    #[arg(long)]
    overlap_threshold: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct FenceFile {
    #[serde(default)]
    fences: Vec<FenceSpec>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = Args::parse();
    let stale_timeout = Duration::try_from_secs_f64(args.stale_timeout_secs)
        .ok()
        .filter(|timeout| !timeout.is_zero())
        .ok_or_else(|| anyhow!("--stale-timeout-secs must be a positive number of seconds"))?;

    let specs = read_fence_file(&args.fences)?;
    let script = DetectionScript::from_path(&args.script)?;

    let mut manager = FenceManager::new(&args.stream_id)
        .with_stale_timeout(stale_timeout);
    match args.overlap_threshold {
        None => {
            manager.load_specs(&specs)?;
        }
        Some(threshold) => {
            let mut fences = Vec::new();
            for spec in specs.iter().filter(|spec| spec.enabled) {
                fences.push(Fence::from_spec(spec)?.with_overlap_threshold(threshold)?);
            }
            for fence in fences {
                manager.add_fence(fence);
            }
        }
    }

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let start = Instant::now();
    let mut total = 0usize;
    for step in &script.steps {
        let now = step_instant(start, step.t)?;
        let detections: Vec<_> = step
            .detections
            .iter()
            .filter(|d| d.confidence >= args.confidence)
            .cloned()
            .collect();
        for event in manager.check_detections_at(&detections, now) {
            writeln!(out, "{}", serde_json::to_string(&event)?)?;
            total += 1;
        }
    }
    out.flush()?;

    log::info!(
        "replayed {} step(s) against {} fence(s): {} intrusion(s)",
        script.steps.len(),
        manager.len(),
        total
    );
    Ok(())
}

/// Clock reading for a script step `t` seconds after `start`. Negative offsets clamp to `start`.
fn step_instant(start: Instant, t: f64) -> Result<Instant> {
    let offset = if t < 0.0 { 0.0 } else { t };
    Duration::try_from_secs_f64(offset)
        .ok()
        .and_then(|offset| start.checked_add(offset))
        .ok_or_else(|| anyhow!("script step at t={} is out of range", t))
}

fn read_fence_file(path: &Path) -> Result<Vec<FenceSpec>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read fence file {}", path.display()))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let file: FenceFile = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid fence file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid fence file {}: {}", path.display(), e))?
    };
    Ok(file.fences)
}
