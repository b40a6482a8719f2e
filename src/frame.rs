//! AudioSocket TLV framing (C1).
//!
//! Wire format: `Type:u8 | Length:u16 big-endian | Payload[Length]`.
//! Audio frames carry `Type = 0x10` and 8 kHz/16-bit/mono little-endian
//! PCM; other types are parsed but dropped by callers (§4.1).

use crate::error::CoreError;
use tokio::io::{ AsyncReadExt, AsyncWriteExt };

/// Frame type byte for 20 ms audio payloads.
pub const TYPE_AUDIO: u8 = 0x10;

/// One decoded AudioSocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn audio(payload: Vec<u8>) -> Self {
        Self { frame_type: TYPE_AUDIO, payload }
    }

    pub fn is_audio(&self) -> bool {
        self.frame_type == TYPE_AUDIO
    }

    /// Encode to the wire representation: `[type][len:u16be][payload]`.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(3 + self.payload.len());
        buf.push(self.frame_type);
        buf.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }
}

/// Read exactly one frame from an async reader.
///
/// EOF on the 3-byte header or on the payload both terminate the call
/// with `ConnectionClosed` — there's no such thing as a "partial frame"
/// the caller should retry on.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, CoreError> where R: AsyncReadExt + Unpin {
    let mut header = [0u8; 3];
    reader.read_exact(&mut header).await.map_err(|_| CoreError::ConnectionClosed)?;

    let frame_type = header[0];
    let length = u16::from_be_bytes([header[1], header[2]]) as usize;

    let mut payload = vec![0u8; length];
    if length > 0 {
        reader.read_exact(&mut payload).await.map_err(|_| CoreError::ConnectionClosed)?;
    }

    Ok(Frame { frame_type, payload })
}

/// Write one frame to an async writer.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), CoreError>
    where W: tokio::io::AsyncWriteExt + Unpin
{
    writer.write_all(&frame.encode()).await.map_err(|_| CoreError::ConnectionClosed)?;
    Ok(())
}

/// Encode a 20 ms audio frame from a raw PCM payload.
pub fn encode_audio(payload: &[u8]) -> Vec<u8> {
    Frame::audio(payload.to_vec()).encode()
}
