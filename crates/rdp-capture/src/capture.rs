//! Capture source abstraction.
//!
//! The wire-level X11 capture mechanism sits below the documented component
//! boundary, so this module keeps the trait small and puts the real X11
//! backend and a fixed-image test double behind it — mirroring the
//! `RdpServerDisplay`/`StaticDisplay`/`LiveDisplay` split the teacher uses for
//! its own display abstraction.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::CaptureError;
use crate::frame::Frame;

/// Produces one [`Frame`] per call. Implementations may block briefly (a
/// live X11 round-trip) but must not run the capture loop themselves; the
/// caller drives timing.
pub trait CaptureSource: Send {
    fn capture(&mut self) -> Result<Frame, CaptureError>;

    /// Current output geometry, if known ahead of the first capture.
    fn geometry(&self) -> Option<(u32, u32)> {
        None
    }
}

pub(crate) fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// A capture source that repeats a single fixed image, for tests and for
/// exercising the pipeline without a live X server.
pub struct StaticCaptureSource {
    width: u32,
    height: u32,
    stride: u32,
    pixels: Vec<u8>,
}

impl StaticCaptureSource {
    /// `pixels` must be BGRA32, top-down, tightly packed (`stride = width * 4`).
    #[must_use]
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Self {
        let stride = width * 4;
        debug_assert_eq!(pixels.len(), (stride * height) as usize);
        Self {
            width,
            height,
            stride,
            pixels,
        }
    }

    /// A uniform-color frame of the given size, handy for smoke tests.
    #[must_use]
    pub fn solid(width: u32, height: u32, bgra: [u8; 4]) -> Self {
        let stride = width * 4;
        let mut pixels = Vec::with_capacity((stride * height) as usize);
        for _ in 0..(width * height) {
            pixels.extend_from_slice(&bgra);
        }
        Self::new(width, height, pixels)
    }
}

impl CaptureSource for StaticCaptureSource {
    fn capture(&mut self) -> Result<Frame, CaptureError> {
        let mut frame = Frame::new();
        frame.fill_payload(self.pixels.len(), |buf| {
            buf.copy_from_slice(&self.pixels);
            true
        });
        frame.set_metadata(self.width, self.height, self.stride, now_us());
        Ok(frame)
    }

    fn geometry(&self) -> Option<(u32, u32)> {
        Some((self.width, self.height))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_source_reports_configured_geometry() {
        let mut source = StaticCaptureSource::solid(4, 2, [10, 20, 30, 255]);
        assert_eq!(source.geometry(), Some((4, 2)));
        let frame = source.capture().unwrap();
        assert_eq!(frame.width(), 4);
        assert_eq!(frame.height(), 2);
        assert_eq!(frame.stride(), 16);
        assert_eq!(&frame.data()[0..4], &[10, 20, 30, 255]);
    }
}
