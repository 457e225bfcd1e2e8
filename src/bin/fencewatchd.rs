//! fencewatchd - geofence dwell-time daemon
//!
//! This daemon:
//! 1. Starts one capture + processing pipeline per enabled camera
//! 2. Runs detection on rate-limited frames
//! 3. Checks detections against the camera's fences
//! 4. Logs intrusion events and optionally appends them to a JSON-lines file
//! 5. Stops every pipeline on Ctrl-C

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use fencewatch::{
    CameraConfig, DetectionScript, Detector, FenceManager, FencewatchConfig, GuardedDetector,
    IntrusionEvent, PerformanceMonitor, RtspSource, ScriptedBackend, StopFlag, StreamPipeline,
    Supervisor,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Watch camera streams for geofence dwell intrusions")]
struct Args {
    /// Append intrusion events to this file, one JSON object per line.
    #[arg(long, env = "FENCEWATCH_EVENTS_PATH")]
    events_out: Option<PathBuf>,
}

type EventSink = Arc<Mutex<BufWriter<File>>>;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let cfg = FencewatchConfig::load()?;

    let sink = match &args.events_out {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("open events file {}", path.display()))?;
            log::info!("writing intrusion events to {}", path.display());
            Some(Arc::new(Mutex::new(BufWriter::new(file))))
        }
        None => None,
    };

    let script = match &cfg.detector.script {
        Some(path) => Some(DetectionScript::from_path(path)?),
        None => {
            log::warn!("no detector script configured; pipelines will see no detections");
            None
        }
    };

    let mut pipelines = Vec::new();
    for camera in cfg.enabled_cameras() {
        let pipeline = build_pipeline(&cfg, camera, script.clone(), sink.clone())
            .with_context(|| format!("set up camera {}", camera.id))?;
        log::info!("starting camera {} ({})", camera.id, camera.name);
        pipelines.push(pipeline.spawn()?);
    }
    log::info!("fencewatchd running with {} camera(s)", pipelines.len());

    let stop = StopFlag::new();
    let handler_stop = stop.clone();
    ctrlc::set_handler(move || {
        handler_stop.raise();
    })
    .expect("error setting Ctrl-C handler");

    let exits = Supervisor::new()
        .with_report_interval(cfg.performance.report_interval)
        .run(pipelines, &stop);
    let unclean = exits.iter().filter(|exit| !exit.is_clean()).count();
    if unclean > 0 {
        log::warn!("{} pipeline(s) did not shut down cleanly", unclean);
    }

    if let Some(sink) = sink {
        let mut writer = sink
            .lock()
            .map_err(|_| anyhow!("events file writer poisoned"))?;
        writer.flush().context("flush events file")?;
    }
    log::info!("fencewatchd stopped");
    Ok(())
}

fn build_pipeline(
    cfg: &FencewatchConfig,
    camera: &CameraConfig,
    script: Option<DetectionScript>,
    sink: Option<EventSink>,
) -> Result<StreamPipeline> {
    let source = RtspSource::new(camera.rtsp_config())?;

    let backend = match script {
        Some(script) => ScriptedBackend::new(script),
        None => ScriptedBackend::empty(),
    };
    let detector: Box<dyn Detector> = Box::new(GuardedDetector::new(backend));

    let mut fences = FenceManager::new(&camera.id).with_stale_timeout(cfg.stale_timeout);
    fences.load_specs(&camera.fences)?;
    if fences.is_empty() {
        log::warn!("[{}] no fences configured", camera.id);
    }
    if let Some(sink) = sink {
        fences.register_observer(move |event: &IntrusionEvent| write_event(&sink, event));
    }

    let settings = cfg.pipeline_settings(camera)?;
    let perf = PerformanceMonitor::new(
        cfg.performance.enable_monitoring,
        cfg.performance.window_size,
    );

    Ok(
        StreamPipeline::new(&camera.id, Box::new(source), detector, fences)
            .with_settings(settings)
            .with_performance(perf)
            .with_callback(Box::new(|stream_id, results| {
                log::debug!("[{}] {} detection result(s)", stream_id, results.len());
                Ok(())
            })),
    )
}

fn write_event(sink: &EventSink, event: &IntrusionEvent) -> Result<()> {
    let line = serde_json::to_string(event)?;
    let mut writer = sink
        .lock()
        .map_err(|_| anyhow!("events file writer poisoned"))?;
    writeln!(writer, "{}", line)?;
    writer.flush()?;
    Ok(())
}
