//! Pixel and payload carriers shared by the capture, encoding, and transport
//! stages.
//!
//! [`Frame`] and [`EncodedFrame`] are reference-counted value carriers: a
//! frame is produced once (by capture, or by an encoder) and may be read by
//! several downstream consumers before it is dropped. Rust's `Arc` plays the
//! role the original implementation gave to GObject ref-counting.

use std::sync::Arc;

/// Codec tag carried by an [`EncodedFrame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameCodec {
    /// Uncompressed bottom-up BGRA.
    Raw,
    /// RemoteFX, Surface-Bits framed.
    Rfx,
    /// RemoteFX Progressive, custom-framed (see [`crate::rfx`]).
    RfxProgressive,
}

/// An uncompressed captured frame: BGRA32, top-down, row-aligned by `stride`.
///
/// Single-producer: created by capture, consumed once by the encoder.
#[derive(Debug, Clone)]
pub struct Frame {
    data: Vec<u8>,
    width: u32,
    height: u32,
    stride: u32,
    timestamp_us: u64,
}

impl Frame {
    /// An empty frame with no geometry yet assigned.
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            width: 0,
            height: 0,
            stride: 0,
            timestamp_us: 0,
        }
    }

    /// Resize the backing buffer to exactly `len` bytes and return it for
    /// writing. Prior contents beyond the new length are dropped; contents
    /// within the new length are unspecified (matches
    /// `drd_frame_ensure_capacity`'s resize-on-demand semantics).
    pub fn reserve_capacity(&mut self, len: usize) -> &mut [u8] {
        if self.data.len() != len {
            self.data.resize(len, 0);
        }
        &mut self.data
    }

    /// Write metadata describing the buffer's geometry.
    pub fn set_metadata(&mut self, width: u32, height: u32, stride: u32, timestamp_us: u64) {
        self.width = width;
        self.height = height;
        self.stride = stride;
        self.timestamp_us = timestamp_us;
    }

    /// Caller-supplied copier receives the writable span; returns whether the
    /// copy succeeded. On failure, the buffer's contents are undefined but
    /// its length is left at `len`.
    pub fn fill_payload(&mut self, len: usize, f: impl FnOnce(&mut [u8]) -> bool) -> bool {
        let buf = self.reserve_capacity(len);
        f(buf)
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[must_use]
    pub fn stride(&self) -> u32 {
        self.stride
    }

    #[must_use]
    pub fn timestamp_us(&self) -> u64 {
        self.timestamp_us
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self::new()
    }
}

/// An encoded frame payload produced by [`crate::raw::RawEncoder`] or
/// [`crate::rfx::RfxEncoder`] (re-exported from `rdp-encode` in practice; the
/// type itself lives here since capture, encode, and transport all share it).
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    payload: Vec<u8>,
    width: u32,
    height: u32,
    stride: u32,
    is_bottom_up: bool,
    timestamp_us: u64,
    codec: FrameCodec,
    quality: u8,
    qp: u8,
    is_keyframe: bool,
}

impl EncodedFrame {
    #[must_use]
    pub fn new() -> Self {
        Self {
            payload: Vec::new(),
            width: 0,
            height: 0,
            stride: 0,
            is_bottom_up: false,
            timestamp_us: 0,
            codec: FrameCodec::Raw,
            quality: 100,
            qp: 0,
            is_keyframe: true,
        }
    }

    pub fn reserve_capacity(&mut self, len: usize) -> &mut [u8] {
        if self.payload.len() != len {
            self.payload.resize(len, 0);
        }
        &mut self.payload
    }

    pub fn fill_payload(&mut self, len: usize, f: impl FnOnce(&mut [u8]) -> bool) -> bool {
        let buf = self.reserve_capacity(len);
        f(buf)
    }

    /// Straight copy of `src` into the payload buffer.
    pub fn set_payload(&mut self, src: &[u8]) {
        self.payload.clear();
        self.payload.extend_from_slice(src);
    }

    #[allow(clippy::too_many_arguments)]
    pub fn configure(
        &mut self,
        width: u32,
        height: u32,
        stride: u32,
        is_bottom_up: bool,
        timestamp_us: u64,
        codec: FrameCodec,
    ) {
        self.width = width;
        self.height = height;
        self.stride = stride;
        self.is_bottom_up = is_bottom_up;
        self.timestamp_us = timestamp_us;
        self.codec = codec;
    }

    pub fn set_quality(&mut self, quality: u8, qp: u8, is_keyframe: bool) {
        self.quality = quality;
        self.qp = qp;
        self.is_keyframe = is_keyframe;
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[must_use]
    pub fn stride(&self) -> u32 {
        self.stride
    }

    #[must_use]
    pub fn is_bottom_up(&self) -> bool {
        self.is_bottom_up
    }

    #[must_use]
    pub fn timestamp_us(&self) -> u64 {
        self.timestamp_us
    }

    #[must_use]
    pub fn codec(&self) -> FrameCodec {
        self.codec
    }

    #[must_use]
    pub fn quality(&self) -> u8 {
        self.quality
    }

    #[must_use]
    pub fn qp(&self) -> u8 {
        self.qp
    }

    #[must_use]
    pub fn is_keyframe(&self) -> bool {
        self.is_keyframe
    }
}

impl Default for EncodedFrame {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared handle to a captured frame, as stored in a [`crate::queue::FrameQueue`].
pub type SharedFrame = Arc<Frame>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_capacity_resizes_and_is_writable() {
        let mut frame = Frame::new();
        let buf = frame.reserve_capacity(16);
        assert_eq!(buf.len(), 16);
        buf[0] = 0xAB;
        assert_eq!(frame.data()[0], 0xAB);
    }

    #[test]
    fn fill_payload_reports_failure() {
        let mut frame = EncodedFrame::new();
        let ok = frame.fill_payload(8, |buf| {
            buf.fill(0x11);
            true
        });
        assert!(ok);
        assert_eq!(frame.payload(), &[0x11; 8]);
    }

    #[test]
    fn set_payload_is_a_straight_copy() {
        let mut frame = EncodedFrame::new();
        frame.set_payload(&[1, 2, 3]);
        assert_eq!(frame.payload(), &[1, 2, 3]);
        frame.set_payload(&[9]);
        assert_eq!(frame.payload(), &[9]);
    }
}
