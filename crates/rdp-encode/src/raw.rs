//! Uncompressed bottom-up BGRA encoding, grounded on `drd_raw_encoder.c`.

use rdp_capture::{EncodedFrame, Frame, FrameCodec};

use crate::error::EncodeError;

pub struct RawEncoder {
    width: u32,
    height: u32,
    ready: bool,
}

impl RawEncoder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            width: 0,
            height: 0,
            ready: false,
        }
    }

    pub fn configure(&mut self, width: u32, height: u32) -> Result<(), EncodeError> {
        if width == 0 || height == 0 {
            return Err(EncodeError::InvalidArgument(format!(
                "raw encoder requires non-zero width/height (width={width} height={height})"
            )));
        }
        self.width = width;
        self.height = height;
        self.ready = true;
        Ok(())
    }

    pub fn reset(&mut self) {
        self.ready = false;
        self.width = 0;
        self.height = 0;
    }

    /// Flips the input row-by-row into a bottom-up BGRA buffer sized
    /// `width * 4` per row.
    pub fn encode(&self, input: &Frame, output: &mut EncodedFrame) -> Result<(), EncodeError> {
        if !self.ready {
            return Err(EncodeError::NotConfigured);
        }
        if input.width() != self.width || input.height() != self.height {
            return Err(EncodeError::Failed(format!(
                "frame dimensions mismatch encoder configuration ({}x{} vs {}x{})",
                input.width(),
                input.height(),
                self.width,
                self.height
            )));
        }

        let expected_stride = self.width * 4;
        let output_size = (expected_stride * self.height) as usize;
        let stride_in = input.stride();
        let src = input.data();
        let height = self.height;

        let ok = output.fill_payload(output_size, |dest| {
            for y in 0..height {
                let src_row = ((height - 1 - y) * stride_in) as usize;
                let dst_row = (y * expected_stride) as usize;
                let row_len = expected_stride as usize;
                if src_row + row_len > src.len() || dst_row + row_len > dest.len() {
                    return false;
                }
                dest[dst_row..dst_row + row_len].copy_from_slice(&src[src_row..src_row + row_len]);
            }
            true
        });
        if !ok {
            return Err(EncodeError::Failed("failed to write raw payload".into()));
        }

        output.configure(
            self.width,
            self.height,
            expected_stride,
            true,
            input.timestamp_us(),
            FrameCodec::Raw,
        );
        output.set_quality(100, 0, true);
        Ok(())
    }
}

impl Default for RawEncoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configure_rejects_zero_dimensions() {
        let mut enc = RawEncoder::new();
        assert!(enc.configure(0, 10).is_err());
        assert!(enc.configure(10, 0).is_err());
    }

    #[test]
    fn encode_flips_rows_bottom_up() {
        let mut enc = RawEncoder::new();
        enc.configure(2, 2).unwrap();

        let mut frame = Frame::new();
        frame.fill_payload(16, |buf| {
            // row0: 0x11 repeated, row1: 0x22 repeated.
            buf[0..8].fill(0x11);
            buf[8..16].fill(0x22);
            true
        });
        frame.set_metadata(2, 2, 8, 1000);

        let mut out = EncodedFrame::new();
        enc.encode(&frame, &mut out).unwrap();

        assert_eq!(&out.payload()[0..8], &[0x22; 8]);
        assert_eq!(&out.payload()[8..16], &[0x11; 8]);
        assert!(out.is_bottom_up());
        assert_eq!(out.codec(), FrameCodec::Raw);
        assert!(out.is_keyframe());
    }
}
