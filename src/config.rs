use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::fence::{Fence, FenceSpec};
use crate::ingest::{CapturePolicy, RtspConfig};
use crate::pipeline::{PipelineSettings, ProcessingSettings};

const DEFAULT_CAMERA_ID: &str = "front_camera";
const DEFAULT_RTSP_URL: &str = "stub://front_camera";
const DEFAULT_RTSP_FPS: u32 = 30;
const DEFAULT_RTSP_WIDTH: u32 = 640;
const DEFAULT_RTSP_HEIGHT: u32 = 480;
const DEFAULT_CONFIDENCE: f32 = 0.5;
const DEFAULT_PROCESS_INTERVAL_SECS: f64 = 2.0;
const DEFAULT_RELAY_CAPACITY: usize = crate::relay::DEFAULT_CAPACITY;
const DEFAULT_RELAY_WAIT_MS: u64 = 1_000;
const DEFAULT_STALE_TIMEOUT_SECS: f64 = 2.0;
const DEFAULT_REPORT_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Deserialize, Default)]
struct FencewatchConfigFile {
    detector: Option<DetectorConfigFile>,
    relay: Option<RelayConfigFile>,
    capture: Option<CaptureConfigFile>,
    tracking: Option<TrackingConfigFile>,
    performance: Option<PerformanceConfigFile>,
    cameras: Option<Vec<CameraConfigFile>>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    confidence_threshold: Option<f32>,
    script: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct RelayConfigFile {
    capacity: Option<usize>,
    wait_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    max_consecutive_failures: Option<u32>,
    retry_delay_ms: Option<u64>,
    reconnect_cooldown_ms: Option<u64>,
    read_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct TrackingConfigFile {
    stale_timeout_secs: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct PerformanceConfigFile {
    enable_monitoring: Option<bool>,
    window_size: Option<usize>,
    report_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct CameraConfigFile {
    id: String,
    name: Option<String>,
    rtsp_url: String,
    enabled: Option<bool>,
    process_interval: Option<f64>,
    target_fps: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
    #[serde(default)]
    fences: Vec<FenceSpec>,
}

#[derive(Debug, Clone)]
pub struct FencewatchConfig {
    pub detector: DetectorSettings,
    pub relay: RelaySettings,
    pub capture: CapturePolicy,
    pub stale_timeout: Duration,
    pub performance: PerformanceSettings,
    pub cameras: Vec<CameraConfig>,
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub confidence_threshold: f32,
    /// Detection script replayed by the scripted backend.
    pub script: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub capacity: usize,
    pub wait: Duration,
}

#[derive(Debug, Clone)]
pub struct PerformanceSettings {
    pub enable_monitoring: bool,
    pub window_size: usize,
    pub report_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct CameraConfig {
    pub id: String,
    pub name: String,
    pub rtsp_url: String,
    pub enabled: bool,
    /// Seconds between processed frames.
    pub process_interval: f64,
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
    pub fences: Vec<FenceSpec>,
}

impl CameraConfig {
    fn default_camera() -> Self {
        Self {
            id: DEFAULT_CAMERA_ID.to_string(),
            name: DEFAULT_CAMERA_ID.to_string(),
            rtsp_url: DEFAULT_RTSP_URL.to_string(),
            enabled: true,
            process_interval: DEFAULT_PROCESS_INTERVAL_SECS,
            target_fps: DEFAULT_RTSP_FPS,
            width: DEFAULT_RTSP_WIDTH,
            height: DEFAULT_RTSP_HEIGHT,
            fences: Vec::new(),
        }
    }

    fn from_file(file: CameraConfigFile) -> Self {
        Self {
            name: file.name.unwrap_or_else(|| file.id.clone()),
            id: file.id,
            rtsp_url: file.rtsp_url,
            enabled: file.enabled.unwrap_or(true),
            process_interval: file
                .process_interval
                .unwrap_or(DEFAULT_PROCESS_INTERVAL_SECS),
            target_fps: file.target_fps.unwrap_or(DEFAULT_RTSP_FPS),
            width: file.width.unwrap_or(DEFAULT_RTSP_WIDTH),
            height: file.height.unwrap_or(DEFAULT_RTSP_HEIGHT),
            fences: file.fences,
        }
    }

    pub fn rtsp_config(&self) -> RtspConfig {
        RtspConfig {
            url: self.rtsp_url.clone(),
            target_fps: self.target_fps,
            width: self.width,
            height: self.height,
            failure_rate: 0.0,
        }
    }

    pub fn process_interval(&self) -> Result<Duration> {
        seconds(self.process_interval)
            .map_err(|e| anyhow!("camera {} process_interval {}", self.id, e))
    }
}

impl FencewatchConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("FENCEWATCH_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: FencewatchConfigFile) -> Result<Self> {
        let detector = DetectorSettings {
            confidence_threshold: file
                .detector
                .as_ref()
                .and_then(|d| d.confidence_threshold)
                .unwrap_or(DEFAULT_CONFIDENCE),
            script: file.detector.and_then(|d| d.script),
        };
        let relay = RelaySettings {
            capacity: file
                .relay
                .as_ref()
                .and_then(|r| r.capacity)
                .unwrap_or(DEFAULT_RELAY_CAPACITY),
            wait: Duration::from_millis(
                file.relay
                    .and_then(|r| r.wait_ms)
                    .unwrap_or(DEFAULT_RELAY_WAIT_MS),
            ),
        };
        let defaults = CapturePolicy::default();
        let capture = match file.capture {
            Some(c) => CapturePolicy {
                max_consecutive_failures: c
                    .max_consecutive_failures
                    .unwrap_or(defaults.max_consecutive_failures),
                retry_delay: c
                    .retry_delay_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.retry_delay),
                reconnect_cooldown: c
                    .reconnect_cooldown_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.reconnect_cooldown),
                read_interval: c
                    .read_interval_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.read_interval),
            },
            None => defaults,
        };
        let stale_timeout_secs = file
            .tracking
            .and_then(|t| t.stale_timeout_secs)
            .unwrap_or(DEFAULT_STALE_TIMEOUT_SECS);
        let performance = PerformanceSettings {
            enable_monitoring: file
                .performance
                .as_ref()
                .and_then(|p| p.enable_monitoring)
                .unwrap_or(true),
            window_size: file
                .performance
                .as_ref()
                .and_then(|p| p.window_size)
                .unwrap_or(crate::perf::DEFAULT_WINDOW_SIZE),
            report_interval: Duration::from_secs(
                file.performance
                    .and_then(|p| p.report_interval_secs)
                    .unwrap_or(DEFAULT_REPORT_INTERVAL_SECS),
            ),
        };
        let cameras = match file.cameras {
            Some(cameras) => cameras.into_iter().map(CameraConfig::from_file).collect(),
            None => vec![CameraConfig::default_camera()],
        };
        let stale_timeout =
            seconds(stale_timeout_secs).map_err(|e| anyhow!("stale_timeout_secs {}", e))?;
        Ok(Self {
            detector,
            relay,
            capture,
            stale_timeout,
            performance,
            cameras,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(url) = std::env::var("FENCEWATCH_RTSP_URL") {
            if !url.trim().is_empty() {
                match self.cameras.first_mut() {
                    Some(camera) => camera.rtsp_url = url,
                    None => {
                        let mut camera = CameraConfig::default_camera();
                        camera.rtsp_url = url;
                        self.cameras.push(camera);
                    }
                }
            }
        }
        if let Ok(confidence) = std::env::var("FENCEWATCH_CONFIDENCE") {
            self.detector.confidence_threshold = confidence
                .trim()
                .parse()
                .map_err(|_| anyhow!("FENCEWATCH_CONFIDENCE must be a number between 0 and 1"))?;
        }
        if let Ok(timeout) = std::env::var("FENCEWATCH_STALE_TIMEOUT_SECS") {
            let secs: f64 = timeout.trim().parse().map_err(|_| {
                anyhow!("FENCEWATCH_STALE_TIMEOUT_SECS must be a number of seconds")
            })?;
            self.stale_timeout = seconds(secs)
                .map_err(|e| anyhow!("FENCEWATCH_STALE_TIMEOUT_SECS {}", e))?;
        }
        if let Ok(interval) = std::env::var("FENCEWATCH_PROCESS_INTERVAL") {
            let secs: f64 = interval.trim().parse().map_err(|_| {
                anyhow!("FENCEWATCH_PROCESS_INTERVAL must be a number of seconds")
            })?;
            for camera in &mut self.cameras {
                camera.process_interval = secs;
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.detector.confidence_threshold) {
            return Err(anyhow!("confidence_threshold must be within [0, 1]"));
        }
        if self.relay.capacity == 0 {
            return Err(anyhow!("relay capacity must be at least 1"));
        }
        if self.capture.max_consecutive_failures == 0 {
            return Err(anyhow!("max_consecutive_failures must be at least 1"));
        }
        if self.stale_timeout.is_zero() {
            return Err(anyhow!("stale_timeout_secs must be greater than zero"));
        }
        if self.performance.window_size == 0 {
            return Err(anyhow!("performance window_size must be at least 1"));
        }

        let mut ids = HashSet::new();
        for camera in &self.cameras {
            if camera.id.trim().is_empty() {
                return Err(anyhow!("camera id must not be empty"));
            }
            if !ids.insert(camera.id.as_str()) {
                return Err(anyhow!("duplicate camera id {}", camera.id));
            }
            if camera.rtsp_url.trim().is_empty() {
                return Err(anyhow!("camera {} has no rtsp_url", camera.id));
            }
            camera.process_interval()?;
            for spec in camera.fences.iter().filter(|spec| spec.enabled) {
                Fence::from_spec(spec)
                    .map_err(|e| anyhow!("camera {}: invalid fence: {}", camera.id, e))?;
            }
        }
        if self.enabled_cameras().next().is_none() {
            return Err(anyhow!("no enabled cameras configured"));
        }
        Ok(())
    }

    pub fn enabled_cameras(&self) -> impl Iterator<Item = &CameraConfig> {
        self.cameras.iter().filter(|camera| camera.enabled)
    }

    pub fn pipeline_settings(&self, camera: &CameraConfig) -> Result<PipelineSettings> {
        Ok(PipelineSettings {
            relay_capacity: self.relay.capacity,
            capture: self.capture.clone(),
            processing: ProcessingSettings {
                interval: camera.process_interval()?,
                confidence_threshold: self.detector.confidence_threshold,
                relay_wait: self.relay.wait,
            },
        })
    }
}

/// Seconds from a config value. Negative, non-finite and out-of-range values are errors.
fn seconds(secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs)
        .map_err(|_| anyhow!("must be a non-negative number of seconds, got {}", secs))
}

fn read_config_file(path: &Path) -> Result<FencewatchConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
