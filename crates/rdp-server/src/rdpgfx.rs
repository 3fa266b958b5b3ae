//! RDPGFX (Graphics Pipeline) wire PDUs, hand-framed per MS-RDPEGFX.
//!
//! The transport state machine built on top of these PDUs is this repo's
//! core deliverable (see [`crate::graphics_pipeline`]), so — mirroring how
//! `rdp_encode::rfx::wire` hand-frames the RFX Progressive blocks instead of
//! leaning on a codec library for byte layout — the PDU headers and bodies
//! here are encoded and decoded directly rather than through a generic
//! RDPGFX crate. Only the generic dynamic-virtual-channel multiplexing
//! (`ironrdp_dvc`) and ZGFX bulk-data wrapping are treated as transport
//! plumbing below this module.
//!
//! All integer fields are little-endian, matching MS-RDPEGFX §2.2.

use std::io;

/// RDPGFX command identifiers (MS-RDPEGFX §2.2.2), big enough subset to
/// cover capability negotiation, surface lifecycle, and frame submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CmdId {
    WireToSurface1 = 0x0001,
    CreateSurface = 0x0009,
    DeleteSurface = 0x000A,
    StartFrame = 0x000B,
    EndFrame = 0x000C,
    FrameAcknowledge = 0x000D,
    ResetGraphics = 0x000E,
    MapSurfaceToOutput = 0x000F,
    CapsAdvertise = 0x0012,
    CapsConfirm = 0x0013,
}

impl CmdId {
    #[must_use]
    pub fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            0x0001 => Self::WireToSurface1,
            0x0009 => Self::CreateSurface,
            0x000A => Self::DeleteSurface,
            0x000B => Self::StartFrame,
            0x000C => Self::EndFrame,
            0x000D => Self::FrameAcknowledge,
            0x000E => Self::ResetGraphics,
            0x000F => Self::MapSurfaceToOutput,
            0x0012 => Self::CapsAdvertise,
            0x0013 => Self::CapsConfirm,
            _ => return None,
        })
    }
}

/// Codec identifiers carried in `WIRE_TO_SURFACE_1`'s `codecId` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CodecId {
    Uncompressed = 0x0000,
    RemoteFx = 0x0003,
    CapProgressive = 0x0009,
}

/// `FrameAcknowledge.queueDepth` sentinel meaning "stop sending acks".
pub const SUSPEND_FRAME_ACKNOWLEDGEMENT: u32 = 0xFFFF_FFFF;

/// Real version constants, MS-RDPEGFX §2.2.3.1 (`RDPGFX_CAPVERSION_*`).
pub mod version {
    pub const V8: u32 = 0x0008_0004;
    pub const V81: u32 = 0x0008_0105;
    pub const V10: u32 = 0x000A_0002;
    pub const V101: u32 = 0x000A_0100;
    pub const V102: u32 = 0x000A_0200;
    pub const V103: u32 = 0x000A_0301;
    pub const V104: u32 = 0x000A_0400;
    pub const V105: u32 = 0x000A_0502;
    pub const V106: u32 = 0x000A_0600;
    pub const V106_ERR: u32 = 0x000A_0601;
    pub const V107: u32 = 0x000A_0701;
}

/// Negotiation probe order: descending, per spec §4.7.
pub const NEGOTIATION_ORDER: &[u32] = &[
    version::V107,
    version::V106,
    version::V106_ERR,
    version::V105,
    version::V104,
    version::V103,
    version::V102,
    version::V101,
    version::V10,
    version::V81,
    version::V8,
];

/// Minimal internal bitflags so this module has no external dependency for
/// a handful of OR/AND checks.
macro_rules! bitflags_like {
    (
        $(#[$meta:meta])*
        pub struct $name:ident: $ty:ty {
            $(const $flag:ident = $val:expr;)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct $name(pub $ty);

        impl $name {
            $(pub const $flag: $name = $name($val);)*

            #[must_use]
            pub const fn empty() -> Self { Self(0) }

            #[must_use]
            pub const fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }

            #[must_use]
            pub const fn union(self, other: Self) -> Self {
                Self(self.0 | other.0)
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self { self.union(rhs) }
        }
    };
}

bitflags_like! {
    /// Capability flags packed into a capability set's single `capsData`
    /// word. Bit layout is this repo's own (MS-RDPEGFX reuses the word
    /// differently per version); only the flags this spec's negotiation
    /// needs are tracked.
    pub struct CapsFlags: u32 {
        const THIN_CLIENT   = 0x0000_0001;
        const SMALL_CACHE   = 0x0000_0002;
        const AVC_DISABLED  = 0x0000_0004;
        const AVC420        = 0x0000_0008;
        const AVC444        = 0x0000_0010;
        const AVC444V2      = 0x0000_0020;
        const PROGRESSIVE   = 0x0000_0040;
        const PROGRESSIVE_V2= 0x0000_0080;
        const REMOTEFX      = 0x0000_0100;
    }
}

/// A single `(version, flags)` pair as advertised by the client or
/// confirmed by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapsSet {
    pub version: u32,
    pub flags: CapsFlags,
}

/// A screen rectangle in RDPGFX wire format (`RDPGFX_RECT16`): four
/// little-endian u16 values, right/bottom exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect16 {
    pub left: u16,
    pub top: u16,
    pub right: u16,
    pub bottom: u16,
}

impl Rect16 {
    #[must_use]
    pub fn full_frame(width: u16, height: u16) -> Self {
        Self { left: 0, top: 0, right: width, bottom: height }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.left.to_le_bytes());
        out.extend_from_slice(&self.top.to_le_bytes());
        out.extend_from_slice(&self.right.to_le_bytes());
        out.extend_from_slice(&self.bottom.to_le_bytes());
    }

    fn decode(r: &mut Reader<'_>) -> io::Result<Self> {
        Ok(Self {
            left: r.u16()?,
            top: r.u16()?,
            right: r.u16()?,
            bottom: r.u16()?,
        })
    }
}

/// A tiny cursor for reading little-endian fields out of a byte slice,
/// returning `io::Error` on short reads (mirrors the style of
/// `rdp_encode::rfx::wire`'s reader, kept local since the PDU set here is
/// small and self-contained).
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> io::Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "short RDPGFX PDU"));
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    pub fn u8(&mut self) -> io::Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> io::Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn u32(&mut self) -> io::Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    #[must_use]
    pub fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }
}

/// Writes the 8-byte RDPGFX PDU header (`cmdId`, reserved `flags`,
/// `pduLength` including this header) followed by `body`.
fn frame_pdu(cmd: CmdId, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + body.len());
    out.extend_from_slice(&(cmd as u16).to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes()); // reserved flags
    #[allow(clippy::cast_possible_truncation)]
    let pdu_length = (8 + body.len()) as u32;
    out.extend_from_slice(&pdu_length.to_le_bytes());
    out.extend_from_slice(body);
    out
}

/// A decoded RDPGFX PDU header plus its body slice.
pub struct DecodedPdu<'a> {
    pub cmd: CmdId,
    pub body: &'a [u8],
}

/// Splits a ZGFX-unwrapped buffer (which may contain several back-to-back
/// RDPGFX PDUs) into individual `(cmdId, body)` pairs.
pub fn split_pdus(buf: &[u8]) -> Vec<DecodedPdu<'_>> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    while pos + 8 <= buf.len() {
        let cmd_raw = u16::from_le_bytes([buf[pos], buf[pos + 1]]);
        let pdu_length = u32::from_le_bytes([buf[pos + 4], buf[pos + 5], buf[pos + 6], buf[pos + 7]]) as usize;
        if pdu_length < 8 || pos + pdu_length > buf.len() {
            break;
        }
        if let Some(cmd) = CmdId::from_u16(cmd_raw) {
            out.push(DecodedPdu { cmd, body: &buf[pos + 8..pos + pdu_length] });
        }
        pos += pdu_length;
    }
    out
}

/// `RDPGFX_CAPS_ADVERTISE_PDU`: a list of `(version, capsData)` pairs the
/// client supports, most-preferred order is not guaranteed by the client —
/// the server probes its own fixed descending order instead (§4.7).
#[must_use]
pub fn decode_caps_advertise(body: &[u8]) -> io::Result<Vec<CapsSet>> {
    let mut r = Reader::new(body);
    let count = r.u16()?;
    let mut sets = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        let version = r.u32()?;
        let caps_data_length = r.u32()?;
        if caps_data_length != 4 {
            // Only the single-u32-flags layout is modeled; skip anything else.
            let _ = r.take(caps_data_length as usize)?;
            continue;
        }
        let flags = r.u32()?;
        sets.push(CapsSet { version, flags: CapsFlags(flags) });
    }
    Ok(sets)
}

/// `RDPGFX_CAPS_CONFIRM_PDU`: the single negotiated `(version, capsData)`.
#[must_use]
pub fn encode_caps_confirm(set: CapsSet) -> Vec<u8> {
    let mut body = Vec::with_capacity(12);
    body.extend_from_slice(&set.version.to_le_bytes());
    body.extend_from_slice(&4u32.to_le_bytes());
    body.extend_from_slice(&set.flags.0.to_le_bytes());
    frame_pdu(CmdId::CapsConfirm, &body)
}

/// `RDPGFX_CREATE_SURFACE_PDU`.
#[must_use]
pub fn encode_create_surface(surface_id: u16, width: u16, height: u16, pixel_format: u8) -> Vec<u8> {
    let mut body = Vec::with_capacity(7);
    body.extend_from_slice(&surface_id.to_le_bytes());
    body.extend_from_slice(&width.to_le_bytes());
    body.extend_from_slice(&height.to_le_bytes());
    body.push(pixel_format);
    frame_pdu(CmdId::CreateSurface, &body)
}

/// `RDPGFX_DELETE_SURFACE_PDU`.
#[must_use]
pub fn encode_delete_surface(surface_id: u16) -> Vec<u8> {
    frame_pdu(CmdId::DeleteSurface, &surface_id.to_le_bytes())
}

/// `RDPGFX_MAP_SURFACE_TO_OUTPUT_PDU`.
#[must_use]
pub fn encode_map_surface_to_output(surface_id: u16, origin_x: u32, origin_y: u32) -> Vec<u8> {
    let mut body = Vec::with_capacity(12);
    body.extend_from_slice(&surface_id.to_le_bytes());
    body.extend_from_slice(&0u16.to_le_bytes()); // reserved
    body.extend_from_slice(&origin_x.to_le_bytes());
    body.extend_from_slice(&origin_y.to_le_bytes());
    frame_pdu(CmdId::MapSurfaceToOutput, &body)
}

/// `RDPGFX_START_FRAME_PDU`.
#[must_use]
pub fn encode_start_frame(timestamp: u32, frame_id: u32) -> Vec<u8> {
    let mut body = Vec::with_capacity(8);
    body.extend_from_slice(&timestamp.to_le_bytes());
    body.extend_from_slice(&frame_id.to_le_bytes());
    frame_pdu(CmdId::StartFrame, &body)
}

/// `RDPGFX_END_FRAME_PDU`.
#[must_use]
pub fn encode_end_frame(frame_id: u32) -> Vec<u8> {
    frame_pdu(CmdId::EndFrame, &frame_id.to_le_bytes())
}

/// `RDPGFX_WIRE_TO_SURFACE_PDU_1` carrying an encoded frame's payload.
#[must_use]
pub fn encode_wire_to_surface_1(
    surface_id: u16,
    codec: CodecId,
    pixel_format: u8,
    rect: Rect16,
    payload: &[u8],
) -> Vec<u8> {
    let mut body = Vec::with_capacity(13 + payload.len());
    body.extend_from_slice(&surface_id.to_le_bytes());
    body.extend_from_slice(&(codec as u16).to_le_bytes());
    body.push(pixel_format);
    rect.encode(&mut body);
    #[allow(clippy::cast_possible_truncation)]
    let len = payload.len() as u32;
    body.extend_from_slice(&len.to_le_bytes());
    body.extend_from_slice(payload);
    frame_pdu(CmdId::WireToSurface1, &body)
}

/// Decoded `RDPGFX_FRAME_ACKNOWLEDGE_PDU`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameAcknowledge {
    pub queue_depth: u32,
    pub frame_id: u32,
    pub total_frames_decoded: u32,
}

pub fn decode_frame_acknowledge(body: &[u8]) -> io::Result<FrameAcknowledge> {
    let mut r = Reader::new(body);
    Ok(FrameAcknowledge {
        queue_depth: r.u32()?,
        frame_id: r.u32()?,
        total_frames_decoded: r.u32()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caps_advertise_round_trips() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&2u16.to_le_bytes());
        for (version, flags) in [(version::V107, 0x0000_0003u32), (version::V8, 0)] {
            buf.extend_from_slice(&version.to_le_bytes());
            buf.extend_from_slice(&4u32.to_le_bytes());
            buf.extend_from_slice(&flags.to_le_bytes());
        }
        let sets = decode_caps_advertise(&buf).unwrap();
        assert_eq!(sets.len(), 2);
        assert_eq!(sets[0].version, version::V107);
        assert!(sets[0].flags.contains(CapsFlags::SMALL_CACHE));
    }

    #[test]
    fn split_pdus_finds_back_to_back_messages() {
        let mut combined = Vec::new();
        combined.extend_from_slice(&encode_create_surface(1, 100, 100, 0x20));
        combined.extend_from_slice(&encode_map_surface_to_output(1, 0, 0));
        let pdus = split_pdus(&combined);
        assert_eq!(pdus.len(), 2);
        assert_eq!(pdus[0].cmd, CmdId::CreateSurface);
        assert_eq!(pdus[1].cmd, CmdId::MapSurfaceToOutput);
    }

    #[test]
    fn frame_acknowledge_decodes() {
        let mut body = Vec::new();
        body.extend_from_slice(&0u32.to_le_bytes());
        body.extend_from_slice(&7u32.to_le_bytes());
        body.extend_from_slice(&3u32.to_le_bytes());
        let ack = decode_frame_acknowledge(&body).unwrap();
        assert_eq!(ack, FrameAcknowledge { queue_depth: 0, frame_id: 7, total_frames_decoded: 3 });
    }

    #[test]
    fn wire_to_surface_1_encodes_header_and_payload() {
        let pdu = encode_wire_to_surface_1(1, CodecId::RemoteFx, 0x20, Rect16::full_frame(64, 64), &[1, 2, 3]);
        let pdus = split_pdus(&pdu);
        assert_eq!(pdus.len(), 1);
        assert_eq!(pdus[0].cmd, CmdId::WireToSurface1);
        assert_eq!(&pdus[0].body[pdus[0].body.len() - 3..], &[1, 2, 3]);
    }
}
