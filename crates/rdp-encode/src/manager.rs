//! Codec dispatch with RFX -> RAW fallback, grounded on
//! `drd_encoding_manager.c`.

use rdp_capture::{EncodedFrame, Frame, FrameCodec};

use crate::error::EncodeError;
use crate::raw::RawEncoder;
use crate::rfx::{RfxEncoder, RfxEncoderKind};

/// Number of frames to keep re-encoding as RAW after an RFX frame proved too
/// large for the peer's payload limit.
const RFX_FALLBACK_GRACE_FRAMES: u32 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodingMode {
    Raw,
    Rfx,
}

pub struct EncodingOptions {
    pub width: u32,
    pub height: u32,
    pub mode: EncodingMode,
    pub enable_frame_diff: bool,
}

pub struct EncodingManager {
    mode: EncodingMode,
    ready: bool,
    raw_encoder: RawEncoder,
    rfx_encoder: RfxEncoder,
    rfx_fallback_grace: u32,
    last_fallback_payload: usize,
    rfx_fallback_count: u32,
}

impl EncodingManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            mode: EncodingMode::Raw,
            ready: false,
            raw_encoder: RawEncoder::new(),
            rfx_encoder: RfxEncoder::new(),
            rfx_fallback_grace: 0,
            last_fallback_payload: 0,
            rfx_fallback_count: 0,
        }
    }

    /// Always configures RAW (it doubles as the fallback target); configures
    /// RFX too when `mode` is RFX.
    pub fn prepare(&mut self, options: &EncodingOptions) -> Result<(), EncodeError> {
        if options.width == 0 || options.height == 0 {
            return Err(EncodeError::InvalidArgument(format!(
                "encoder resolution must be non-zero (width={} height={})",
                options.width, options.height
            )));
        }

        self.rfx_fallback_grace = 0;
        self.last_fallback_payload = 0;
        self.rfx_fallback_count = 0;

        if let Err(e) = self.raw_encoder.configure(options.width, options.height) {
            self.reset();
            return Err(e);
        }

        if options.mode == EncodingMode::Rfx {
            if let Err(e) =
                self.rfx_encoder
                    .configure(options.width, options.height, options.enable_frame_diff)
            {
                self.reset();
                return Err(e);
            }
        }

        self.mode = options.mode;
        self.ready = true;
        Ok(())
    }

    pub fn reset(&mut self) {
        if !self.ready {
            return;
        }
        self.mode = EncodingMode::Raw;
        self.raw_encoder.reset();
        self.rfx_encoder.reset();
        self.ready = false;
        self.rfx_fallback_grace = 0;
        self.last_fallback_payload = 0;
        self.rfx_fallback_count = 0;
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready
    }

    #[must_use]
    pub fn rfx_fallback_count(&self) -> u32 {
        self.rfx_fallback_count
    }

    /// Encodes `input` into `scratch`. `max_payload = 0` means no limit.
    pub fn encode(
        &mut self,
        input: &Frame,
        max_payload: usize,
        desired_codec: FrameCodec,
        scratch: &mut EncodedFrame,
    ) -> Result<(), EncodeError> {
        if !self.ready {
            return Err(EncodeError::Failed("encoding manager not prepared".into()));
        }
        if self.mode == EncodingMode::Raw && desired_codec != FrameCodec::Raw {
            return Err(EncodeError::Failed(
                "encoding manager configured for RAW output only".into(),
            ));
        }

        if max_payload > 0 && self.last_fallback_payload > 0 && max_payload > self.last_fallback_payload
        {
            self.rfx_fallback_grace = 0;
            self.last_fallback_payload = 0;
        }

        match desired_codec {
            FrameCodec::Raw => self.raw_encoder.encode(input, scratch),
            FrameCodec::Rfx => {
                let prefer_raw = max_payload > 0 && self.rfx_fallback_grace > 0;
                if prefer_raw {
                    self.rfx_fallback_grace -= 1;
                    if self.rfx_fallback_grace == 0 {
                        self.last_fallback_payload = 0;
                    }
                    return self.raw_encoder.encode(input, scratch);
                }

                self.rfx_encoder.encode(input, scratch, RfxEncoderKind::SurfaceBits)?;
                if max_payload > 0 && scratch.payload().len() > max_payload {
                    self.rfx_fallback_count += 1;
                    self.rfx_fallback_grace = RFX_FALLBACK_GRACE_FRAMES;
                    self.last_fallback_payload = max_payload;
                    self.raw_encoder.encode(input, scratch)?;
                }
                Ok(())
            }
            FrameCodec::RfxProgressive => {
                self.rfx_encoder.encode(input, scratch, RfxEncoderKind::Progressive)
            }
        }
    }

    #[must_use]
    pub fn codec(&self) -> FrameCodec {
        match self.mode {
            EncodingMode::Raw => FrameCodec::Raw,
            EncodingMode::Rfx => FrameCodec::Rfx,
        }
    }

    pub fn force_keyframe(&mut self) {
        if self.mode == EncodingMode::Rfx {
            self.rfx_encoder.force_keyframe();
        }
    }
}

impl Default for EncodingManager {
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
        frame.set_metadata(width, height, stride, 42);
        frame
    }

    #[test]
    fn raw_only_manager_rejects_rfx_request() {
        let mut mgr = EncodingManager::new();
        mgr.prepare(&EncodingOptions {
            width: 64,
            height: 64,
            mode: EncodingMode::Raw,
            enable_frame_diff: false,
        })
        .unwrap();
        let frame = solid_frame(64, 64, 1);
        let mut scratch = EncodedFrame::new();
        let err = mgr.encode(&frame, 0, FrameCodec::Rfx, &mut scratch).unwrap_err();
        assert!(matches!(err, EncodeError::Failed(_)));
    }

    #[test]
    fn oversized_rfx_payload_triggers_grace_window_fallback() {
        let mut mgr = EncodingManager::new();
        mgr.prepare(&EncodingOptions {
            width: 64,
            height: 64,
            mode: EncodingMode::Rfx,
            enable_frame_diff: false,
        })
        .unwrap();
        let frame = solid_frame(64, 64, 9);
        let mut scratch = EncodedFrame::new();

        // max_payload=1 forces every RFX attempt to look oversized. The first
        // oversized call detects this mid-call and sets a fresh grace window
        // before falling back to RAW for that same call; the window only
        // starts decrementing from the *next* call onward.
        mgr.encode(&frame, 1, FrameCodec::Rfx, &mut scratch).unwrap();
        assert_eq!(mgr.rfx_fallback_count(), 1);
        assert_eq!(mgr.rfx_fallback_grace, RFX_FALLBACK_GRACE_FRAMES);
        assert!(scratch.is_bottom_up()); // fell back to RAW this call

        mgr.encode(&frame, 1, FrameCodec::Rfx, &mut scratch).unwrap();
        assert_eq!(mgr.rfx_fallback_grace, RFX_FALLBACK_GRACE_FRAMES - 1);
    }

    #[test]
    fn raised_peer_limit_clears_fallback_window() {
        let mut mgr = EncodingManager::new();
        mgr.prepare(&EncodingOptions {
            width: 64,
            height: 64,
            mode: EncodingMode::Rfx,
            enable_frame_diff: false,
        })
        .unwrap();
        let frame = solid_frame(64, 64, 9);
        let mut scratch = EncodedFrame::new();
        mgr.encode(&frame, 1, FrameCodec::Rfx, &mut scratch).unwrap();
        assert!(mgr.rfx_fallback_grace > 0);

        mgr.encode(&frame, 10_000_000, FrameCodec::Rfx, &mut scratch).unwrap();
        assert_eq!(mgr.rfx_fallback_grace, 0);
        assert_eq!(mgr.last_fallback_payload, 0);
    }
}
