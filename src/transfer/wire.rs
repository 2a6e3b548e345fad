//! Binary chunk frame codec.
//!
//! Every chunk travels self-described, because tunnels are unordered:
//!
//! ```text
//! [0, 36)   transfer id, hyphenated ASCII
//! [36, 72)  entry id, hyphenated ASCII
//! [72, 80)  chunk index, 8 zero-padded lowercase hex ASCII digits
//! [80, ..)  raw chunk payload (last chunk of a file may be short)
//! ```

use anyhow::{bail, Context, Result};
use bytes::{BufMut, Bytes, BytesMut};
use uuid::Uuid;

const ID_LEN: usize = 36;
const INDEX_LEN: usize = 8;

/// Total header length preceding the payload.
pub const HEADER_LEN: usize = 2 * ID_LEN + INDEX_LEN;

/// A decoded chunk frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFrame {
    pub transfer_id: Uuid,
    pub entry_id: Uuid,
    pub index: u32,
    pub payload: Bytes,
}

/// Frame one chunk for transmission.
pub fn encode_chunk_frame(transfer_id: Uuid, entry_id: Uuid, index: u32, payload: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(HEADER_LEN + payload.len());
    frame.put_slice(transfer_id.hyphenated().to_string().as_bytes());
    frame.put_slice(entry_id.hyphenated().to_string().as_bytes());
    frame.put_slice(format!("{index:08x}").as_bytes());
    frame.put_slice(payload);
    frame.freeze()
}

/// Decode a frame; the payload is a zero-copy slice of the input.
pub fn decode_chunk_frame(frame: Bytes) -> Result<ChunkFrame> {
    if frame.len() < HEADER_LEN {
        bail!("chunk frame too short: {} bytes", frame.len());
    }

    let transfer_id = parse_id(&frame[..ID_LEN]).context("bad transfer id")?;
    let entry_id = parse_id(&frame[ID_LEN..2 * ID_LEN]).context("bad entry id")?;
    let index_text =
        std::str::from_utf8(&frame[2 * ID_LEN..HEADER_LEN]).context("bad index encoding")?;
    let index = u32::from_str_radix(index_text, 16).context("bad chunk index")?;

    Ok(ChunkFrame {
        transfer_id,
        entry_id,
        index,
        payload: frame.slice(HEADER_LEN..),
    })
}

fn parse_id(bytes: &[u8]) -> Result<Uuid> {
    let text = std::str::from_utf8(bytes)?;
    Ok(Uuid::parse_str(text)?)
}
