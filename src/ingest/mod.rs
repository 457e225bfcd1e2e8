//! Frame ingestion.
//!
//! A [`FrameSource`] is a video stream handle that can be opened, read frame by
//! frame, and released. Sources are driven by a [`CaptureProducer`], which owns
//! the retry and reconnect policy and feeds the relay.
//!
//! Sources MUST NOT retain frames after handing them to the caller.

mod capture;
pub mod rtsp;

pub use capture::{CapturePolicy, CaptureProducer, CaptureStats, CaptureStatsSnapshot};
pub use rtsp::{RtspConfig, RtspSource};

use anyhow::Result;

use crate::frame::Frame;

/// A stream of frames from one camera.
pub trait FrameSource: Send {
    /// Connect to the underlying stream. Called once at startup and again on
    /// every reconnect after [`FrameSource::release`].
    fn open(&mut self) -> Result<()>;

    /// Read the next frame. An error is a transient read failure.
    fn read_frame(&mut self) -> Result<Frame>;

    /// Drop the connection. Must be safe to call on an unopened source.
    fn release(&mut self);

    /// Human-readable locator for logs.
    fn describe(&self) -> String;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn open(&mut self) -> Result<()> {
        (**self).open()
    }

    fn read_frame(&mut self) -> Result<Frame> {
        (**self).read_frame()
    }

    fn release(&mut self) {
        (**self).release()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}
