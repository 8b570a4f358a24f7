//! Length-delimited framing.
//!
//! Every frame is a 4-byte big-endian payload length followed by the
//! payload. The async side uses [`codec`]; worker harnesses, which run on
//! plain blocking streams, use [`read_frame`] and [`write_frame`].

use std::io::{self, Read, Write};

use tokio_util::codec::LengthDelimitedCodec;

use crate::error::ProtocolError;

/// Upper bound for a single frame payload.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Codec matching [`read_frame`]/[`write_frame`] for tokio streams.
pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

/// Reject payloads the other side would refuse to read.
pub fn ensure_fits(len: usize) -> Result<(), ProtocolError> {
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    Ok(())
}

pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<(), ProtocolError> {
    ensure_fits(payload.len())?;
    writer.write_all(&(payload.len() as u32).to_be_bytes())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame. Returns `Ok(None)` on a clean end of stream between frames.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>, ProtocolError> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(header) as usize;
    ensure_fits(len)?;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(Some(payload))
}
