//! Frames flowing through a stream pipeline.
//!
//! A `Frame` has exactly one owner at a time: the capture unit builds it,
//! moves it into the relay, and the processing unit takes it out. There is
//! no `Clone` impl, so a frame can never be held by both units at once.
//! The capture instant travels next to the frame in the relay.

use zeroize::Zeroize;

/// Decoded RGB frame. Bytes are zeroized on drop.
pub struct Frame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Per-source sequence number, starting at 1.
    sequence: u64,
}

// Explicitly NOT implementing Clone.

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, sequence: u64) -> Self {
        Self {
            data,
            width,
            height,
            sequence,
        }
    }

    /// Read-only pixel access for detectors. Detectors must not retain the
    /// slice beyond the `detect` call.
    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("sequence", &self.sequence)
            .field("bytes", &self.data.len())
            .finish()
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        self.data.zeroize();
    }
}
