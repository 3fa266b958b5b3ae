mod codec;
mod hash;
mod wire;

use rdp_capture::{EncodedFrame, Frame, FrameCodec};

use crate::error::EncodeError;
use hash::TileHashGrid;
use wire::RfxTile;

pub use hash::DirtyRect;

/// Which wire framing an encode call should produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RfxEncoderKind {
    SurfaceBits,
    Progressive,
}

const FIXED_QUANT: [u32; 10] = [6, 6, 6, 6, 6, 6, 6, 6, 6, 6];

pub struct RfxEncoder {
    width: u32,
    height: u32,
    enable_diff: bool,
    configured: bool,
    bottom_up_frame: Vec<u8>,
    previous_frame: Vec<u8>,
    tile_grid: Option<TileHashGrid>,
    force_keyframe: bool,
    rfx_header_sent: bool,
    frame_idx: u32,
}

impl RfxEncoder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            width: 0,
            height: 0,
            enable_diff: false,
            configured: false,
            bottom_up_frame: Vec::new(),
            previous_frame: Vec::new(),
            tile_grid: None,
            force_keyframe: true,
            rfx_header_sent: false,
            frame_idx: 0,
        }
    }

    pub fn configure(&mut self, width: u32, height: u32, enable_diff: bool) -> Result<(), EncodeError> {
        if width == 0 || height == 0 {
            return Err(EncodeError::InvalidArgument(
                "RemoteFX encoder requires non-zero width/height".into(),
            ));
        }

        self.width = width;
        self.height = height;
        self.enable_diff = enable_diff;
        self.configured = true;
        self.force_keyframe = true;
        self.rfx_header_sent = false;
        self.frame_idx = 0;

        let len = (width * height * 4) as usize;
        self.bottom_up_frame = vec![0u8; len];
        self.previous_frame = vec![0u8; len];
        self.tile_grid = Some(TileHashGrid::new(width, height));
        Ok(())
    }

    pub fn reset(&mut self) {
        self.bottom_up_frame.clear();
        self.previous_frame.clear();
        self.tile_grid = None;
        self.width = 0;
        self.height = 0;
        self.enable_diff = false;
        self.configured = false;
        self.force_keyframe = true;
        self.rfx_header_sent = false;
    }

    /// Forces the next `encode` call to emit a full-surface keyframe and
    /// resend the SYNC/CONTEXT header preamble.
    pub fn force_keyframe(&mut self) {
        self.force_keyframe = true;
        self.rfx_header_sent = false;
    }

    fn copy_frame_linear(&mut self, frame: &Frame) {
        let stride = frame.stride();
        let width = frame.width();
        let height = frame.height();
        let bytes_per_row = (width * 4) as usize;
        let src = frame.data();

        for row in 0..height {
            let src_off = (row * stride) as usize;
            let dst_off = (row as usize) * bytes_per_row;
            self.bottom_up_frame[dst_off..dst_off + bytes_per_row]
                .copy_from_slice(&src[src_off..src_off + bytes_per_row]);
        }
    }

    pub fn encode(
        &mut self,
        frame: &Frame,
        output: &mut EncodedFrame,
        kind: RfxEncoderKind,
    ) -> Result<(), EncodeError> {
        if !self.configured {
            return Err(EncodeError::Failed("RFX context not initialized".into()));
        }
        if frame.width() != self.width || frame.height() != self.height {
            return Err(EncodeError::Failed(format!(
                "frame dimensions mismatch RFX configuration ({}x{} vs {}x{})",
                frame.width(),
                frame.height(),
                self.width,
                self.height
            )));
        }

        let timestamp = frame.timestamp_us();
        let frame_codec = match kind {
            RfxEncoderKind::Progressive => FrameCodec::RfxProgressive,
            RfxEncoderKind::SurfaceBits => FrameCodec::Rfx,
        };

        self.copy_frame_linear(frame);
        let stride = self.width * 4;

        let keyframe_encode = self.force_keyframe || !self.enable_diff;
        let rects: Vec<DirtyRect> = if keyframe_encode {
            if let Some(grid) = &mut self.tile_grid {
                grid.clear();
            }
            vec![DirtyRect {
                x: 0,
                y: 0,
                width: self.width as u16,
                height: self.height as u16,
            }]
        } else {
            let previous = if self.previous_frame.len() == self.bottom_up_frame.len() {
                Some(self.previous_frame.as_slice())
            } else {
                None
            };
            let grid = self.tile_grid.as_mut().expect("configured implies a grid");
            let rects =
                grid.collect_dirty_rects(self.width, self.height, &self.bottom_up_frame, previous, stride);
            if rects.is_empty() {
                output.configure(self.width, self.height, stride, false, timestamp, frame_codec);
                output.set_quality(0, 0, false);
                return Ok(());
            }
            rects
        };

        let tiles: Vec<RfxTile> = rects
            .iter()
            .map(|rect| RfxTile {
                x_idx: rect.x / hash::TILE_SIZE as u16,
                y_idx: rect.y / hash::TILE_SIZE as u16,
                quant_idx_y: 0,
                quant_idx_cb: 0,
                quant_idx_cr: 0,
                encoded: codec::encode_tile(
                    &self.bottom_up_frame,
                    stride,
                    u32::from(rect.x),
                    u32::from(rect.y),
                    u32::from(rect.width),
                    u32::from(rect.height),
                ),
            })
            .collect();

        let needs_header = !self.rfx_header_sent;
        let payload = match kind {
            RfxEncoderKind::SurfaceBits => {
                wire::write_surface_bits_message(self.frame_idx, &rects, &FIXED_QUANT, &tiles, needs_header)
            }
            RfxEncoderKind::Progressive => {
                wire::write_progressive_message(self.frame_idx, &rects, &FIXED_QUANT, &tiles, needs_header)
            }
        };
        self.rfx_header_sent = true;

        output.set_payload(&payload);
        output.configure(self.width, self.height, stride, false, timestamp, frame_codec);
        output.set_quality(0, 0, keyframe_encode);

        self.previous_frame.copy_from_slice(&self.bottom_up_frame);
        self.force_keyframe = false;
        self.frame_idx = self.frame_idx.wrapping_add(1);

        Ok(())
    }
}

impl Default for RfxEncoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_frame(width: u32, height: u32, value: u8) -> Frame {
        let mut frame = Frame::new();
        let stride = width * 4;
        frame.fill_payload((stride * height) as usize, |buf| {
            buf.fill(value);
            true
        });
        frame.set_metadata(width, height, stride, 1234);
        frame
    }

    #[test]
    fn configure_rejects_zero_dimensions() {
        let mut enc = RfxEncoder::new();
        assert!(enc.configure(0, 64, false).is_err());
    }

    #[test]
    fn first_encode_is_always_a_keyframe() {
        let mut enc = RfxEncoder::new();
        enc.configure(64, 64, true).unwrap();
        let frame = solid_frame(64, 64, 0x20);
        let mut out = EncodedFrame::new();
        enc.encode(&frame, &mut out, RfxEncoderKind::SurfaceBits).unwrap();
        assert!(out.is_keyframe());
        assert!(!out.payload().is_empty());
    }

    #[test]
    fn unchanged_second_frame_with_diff_enabled_emits_empty_payload() {
        let mut enc = RfxEncoder::new();
        enc.configure(64, 64, true).unwrap();
        let frame = solid_frame(64, 64, 0x20);
        let mut out = EncodedFrame::new();
        enc.encode(&frame, &mut out, RfxEncoderKind::SurfaceBits).unwrap();
        enc.encode(&frame, &mut out, RfxEncoderKind::SurfaceBits).unwrap();
        assert!(out.payload().is_empty());
        assert!(!out.is_keyframe());
    }

    #[test]
    fn force_keyframe_resends_progressive_header() {
        let mut enc = RfxEncoder::new();
        enc.configure(64, 64, true).unwrap();
        let frame = solid_frame(64, 64, 0x20);
        let mut out = EncodedFrame::new();
        enc.encode(&frame, &mut out, RfxEncoderKind::Progressive).unwrap();
        enc.force_keyframe();
        enc.encode(&frame, &mut out, RfxEncoderKind::Progressive).unwrap();
        // second call after force_keyframe should again include the sync block
        assert_eq!(u16::from_le_bytes([out.payload()[0], out.payload()[1]]), 0xCCC0);
    }
}
