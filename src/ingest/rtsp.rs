//! RTSP frame source.
//!
//! `RtspSource` ingests frames from IP cameras via RTSP. URLs with the
//! `stub://` scheme select a synthetic stream that needs no network and can
//! inject read failures, which is how pipelines are exercised without cameras.
//!
//! The RTSP source MUST NOT:
//! - Store decoded frames to disk
//! - Forward raw frames over network
//! - Retain frames beyond handoff to the relay

#[cfg(feature = "rtsp-gstreamer")]
use anyhow::Context;
use anyhow::{anyhow, bail, Result};
use rand::Rng;
#[cfg(feature = "rtsp-gstreamer")]
use std::time::{Duration, Instant};

use super::FrameSource;
use crate::frame::Frame;

/// Configuration for an RTSP source.
#[derive(Clone, Debug)]
pub struct RtspConfig {
    /// RTSP URL (e.g., "rtsp://192.168.1.100:554/stream")
    pub url: String,
    /// Expected frame rate, used to size read timeouts.
    pub target_fps: u32,
    /// Frame width (synthetic frames only).
    pub width: u32,
    /// Frame height (synthetic frames only).
    pub height: u32,
    /// Probability in [0, 1] that a synthetic read fails.
    pub failure_rate: f64,
}

impl Default for RtspConfig {
    fn default() -> Self {
        Self {
            url: "rtsp://localhost:554/stream".to_string(),
            target_fps: 30,
            width: 640,
            height: 480,
            failure_rate: 0.0,
        }
    }
}

/// RTSP frame source.
///
/// Uses GStreamer for real RTSP decode, with a synthetic fallback for `stub://` URLs.
pub struct RtspSource {
    backend: RtspBackend,
}

enum RtspBackend {
    Synthetic(SyntheticRtspSource),
    #[cfg(feature = "rtsp-gstreamer")]
    Gstreamer(GstreamerRtspSource),
}

impl RtspSource {
    pub fn new(config: RtspConfig) -> Result<Self> {
        if !(0.0..=1.0).contains(&config.failure_rate) {
            bail!("failure_rate must be within [0, 1]");
        }
        if config.url.starts_with("stub://") {
            Ok(Self {
                backend: RtspBackend::Synthetic(SyntheticRtspSource::new(config)),
            })
        } else {
            #[cfg(feature = "rtsp-gstreamer")]
            {
                Ok(Self {
                    backend: RtspBackend::Gstreamer(GstreamerRtspSource::new(config)?),
                })
            }
            #[cfg(not(feature = "rtsp-gstreamer"))]
            {
                bail!("RTSP requires the rtsp-gstreamer feature ({})", config.url)
            }
        }
    }

    /// Get frame statistics.
    pub fn stats(&self) -> RtspStats {
        match &self.backend {
            RtspBackend::Synthetic(source) => source.stats(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.stats(),
        }
    }
}

impl FrameSource for RtspSource {
    fn open(&mut self) -> Result<()> {
        match &mut self.backend {
            RtspBackend::Synthetic(source) => source.open(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.open(),
        }
    }

    fn read_frame(&mut self) -> Result<Frame> {
        match &mut self.backend {
            RtspBackend::Synthetic(source) => source.read_frame(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.read_frame(),
        }
    }

    fn release(&mut self) {
        match &mut self.backend {
            RtspBackend::Synthetic(source) => source.release(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.release(),
        }
    }

    fn describe(&self) -> String {
        match &self.backend {
            RtspBackend::Synthetic(source) => format!("{} (synthetic)", source.config.url),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.config.url.clone(),
        }
    }
}

/// Statistics for an RTSP source.
#[derive(Clone, Debug)]
pub struct RtspStats {
    pub frames_captured: u64,
    pub failed_reads: u64,
    pub url: String,
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://) for tests
// ----------------------------------------------------------------------------

struct SyntheticRtspSource {
    config: RtspConfig,
    opened: bool,
    frame_count: u64,
    failed_reads: u64,
    /// Simulated scene state, bumped every 50 frames.
    scene_state: u8,
}

impl SyntheticRtspSource {
    fn new(config: RtspConfig) -> Self {
        Self {
            config,
            opened: false,
            frame_count: 0,
            failed_reads: 0,
            scene_state: 0,
        }
    }

    fn open(&mut self) -> Result<()> {
        self.opened = true;
        log::info!("RtspSource: connected to {} (synthetic)", self.config.url);
        Ok(())
    }

    fn release(&mut self) {
        self.opened = false;
    }

    fn read_frame(&mut self) -> Result<Frame> {
        if !self.opened {
            bail!("synthetic stream {} is not open", self.config.url);
        }
        if self.config.failure_rate > 0.0 && rand::thread_rng().gen_bool(self.config.failure_rate)
        {
            self.failed_reads += 1;
            return Err(anyhow!("synthetic read failure on {}", self.config.url));
        }
        self.frame_count += 1;
        let pixels = self.generate_synthetic_pixels();
        Ok(Frame::new(
            pixels,
            self.config.width,
            self.config.height,
            self.frame_count,
        ))
    }

    fn generate_synthetic_pixels(&mut self) -> Vec<u8> {
        let pixel_count = (self.config.width * self.config.height * 3) as usize; // RGB

        if self.frame_count.is_multiple_of(50) {
            self.scene_state = self.scene_state.wrapping_add(1);
        }

        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.frame_count + self.scene_state as u64) % 256) as u8;
        }
        pixels
    }

    fn stats(&self) -> RtspStats {
        RtspStats {
            frames_captured: self.frame_count,
            failed_reads: self.failed_reads,
            url: self.config.url.clone(),
        }
    }
}

// ----------------------------------------------------------------------------
// Production RTSP source using GStreamer
// ----------------------------------------------------------------------------

#[cfg(feature = "rtsp-gstreamer")]
struct GstreamerRtspSource {
    config: RtspConfig,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    frame_count: u64,
    failed_reads: u64,
    last_error: Option<String>,
}

#[cfg(feature = "rtsp-gstreamer")]
impl GstreamerRtspSource {
    /// Build the pipeline: rtspsrc ! decodebin ! videoconvert ! appsink (RGB).
    fn new(config: RtspConfig) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;

        let pipeline_description = format!(
            "rtspsrc location={} latency=0 ! decodebin ! videoconvert ! video/x-raw,format=RGB ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            config.url
        );
        let pipeline = gstreamer::parse::launch(&pipeline_description)
            .context("build RTSP pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow!("RTSP pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow!("appsink element has unexpected type"))?;

        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .build();
        appsink.set_caps(Some(&caps));
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);

        Ok(Self {
            config,
            pipeline,
            appsink,
            frame_count: 0,
            failed_reads: 0,
            last_error: None,
        })
    }

    fn open(&mut self) -> Result<()> {
        use gstreamer::prelude::*;

        self.last_error = None;
        self.pipeline
            .set_state(gstreamer::State::Playing)
            .context("set RTSP pipeline to Playing")?;
        log::info!("RtspSource: connected to {}", self.config.url);
        Ok(())
    }

    fn release(&mut self) {
        use gstreamer::prelude::*;

        if let Err(err) = self.pipeline.set_state(gstreamer::State::Null) {
            log::warn!("RtspSource: failed to stop {}: {}", self.config.url, err);
        }
    }

    fn read_frame(&mut self) -> Result<Frame> {
        self.poll_bus();
        if let Some(err) = &self.last_error {
            self.failed_reads += 1;
            bail!("{}", err);
        }

        let timeout = self.frame_timeout();
        let Some(sample) = self.appsink.try_pull_sample(timeout) else {
            self.failed_reads += 1;
            bail!("RTSP stream stalled");
        };

        let (pixels, width, height) = sample_to_pixels(&sample)?;
        self.frame_count += 1;
        Ok(Frame::new(pixels, width, height, self.frame_count))
    }

    fn stats(&self) -> RtspStats {
        RtspStats {
            frames_captured: self.frame_count,
            failed_reads: self.failed_reads,
            url: self.config.url.clone(),
        }
    }

    fn frame_timeout(&self) -> gstreamer::ClockTime {
        let base_ms = if self.config.target_fps == 0 {
            500
        } else {
            (1000 / self.config.target_fps).saturating_mul(4)
        };
        let timeout = Duration::from_millis(base_ms.max(500) as u64);
        gstreamer::ClockTime::from_mseconds(timeout.as_millis() as u64)
    }

    fn poll_bus(&mut self) {
        use gstreamer::prelude::*;

        let Some(bus) = self.pipeline.bus() else {
            return;
        };
        while let Some(message) = bus.timed_pop(gstreamer::ClockTime::ZERO) {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    self.last_error = Some(format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => {
                    self.last_error = Some("gstreamer reached EOS".to_string());
                }
                _ => {}
            }
        }
    }
}

#[cfg(feature = "rtsp-gstreamer")]
impl Drop for GstreamerRtspSource {
    fn drop(&mut self) {
        let started = Instant::now();
        self.release();
        log::debug!(
            "RtspSource: released {} in {:?}",
            self.config.url,
            started.elapsed()
        );
    }
}

#[cfg(feature = "rtsp-gstreamer")]
fn sample_to_pixels(sample: &gstreamer::Sample) -> Result<(Vec<u8>, u32, u32)> {
    let buffer = sample.buffer().context("RTSP sample missing buffer")?;
    let caps = sample.caps().context("RTSP sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse RTSP caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map RTSP buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        return Ok((data.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("RTSP buffer row is out of bounds")?,
        );
    }

    Ok((pixels, width, height))
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn stub_config() -> RtspConfig {
        RtspConfig {
            url: "stub://test".to_string(),
            target_fps: 10,
            width: 64,
            height: 48,
            failure_rate: 0.0,
        }
    }

    #[test]
    fn rtsp_source_produces_frames() -> Result<()> {
        let mut source = RtspSource::new(stub_config())?;
        source.open()?;

        let frame = source.read_frame()?;
        assert_eq!(frame.width, 64);
        assert_eq!(frame.height, 48);
        assert_eq!(frame.byte_len(), 64 * 48 * 3);
        assert_eq!(frame.sequence(), 1);
        assert_eq!(source.read_frame()?.sequence(), 2);
        assert_eq!(source.stats().frames_captured, 2);

        Ok(())
    }

    #[test]
    fn released_source_fails_reads_until_reopened() -> Result<()> {
        let mut source = RtspSource::new(stub_config())?;
        assert!(source.read_frame().is_err());
        source.open()?;
        source.read_frame()?;
        source.release();
        assert!(source.read_frame().is_err());
        source.open()?;
        source.read_frame()?;
        Ok(())
    }

    #[test]
    fn failure_rate_one_always_fails() -> Result<()> {
        let mut source = RtspSource::new(RtspConfig {
            failure_rate: 1.0,
            ..stub_config()
        })?;
        source.open()?;
        for _ in 0..3 {
            assert!(source.read_frame().is_err());
        }
        assert_eq!(source.stats().failed_reads, 3);
        Ok(())
    }

    #[test]
    fn out_of_range_failure_rate_is_rejected() {
        let config = RtspConfig {
            failure_rate: 1.5,
            ..stub_config()
        };
        assert!(RtspSource::new(config).is_err());
    }

    #[cfg(not(feature = "rtsp-gstreamer"))]
    #[test]
    fn real_rtsp_requires_feature() {
        let config = RtspConfig {
            url: "rtsp://10.0.0.2/stream".to_string(),
            ..stub_config()
        };
        assert!(RtspSource::new(config).is_err());
    }

    #[test]
    fn describe_names_the_url() -> Result<()> {
        let source = RtspSource::new(stub_config())?;
        assert!(source.describe().contains("stub://test"));
        Ok(())
    }
}
