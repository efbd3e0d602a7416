//! Wire codec: JSON messages, and how payloads are delimited on the stream.
//!
//! `Framing::Legacy` writes payloads as-is; the receiver treats whatever one read
//! returns as one payload. `Framing::LengthPrefixed` adds a 4 byte LE length
//! before every payload so boundaries survive coalescing and splitting.

use serde::Deserialize;

use crate::protocol::Message;

const LEN_SIZE: usize = 4;
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// How payloads are delimited on a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Framing {
    #[default]
    Legacy,
    LengthPrefixed,
}

impl std::str::FromStr for Framing {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "legacy" => Ok(Framing::Legacy),
            "length-prefixed" => Ok(Framing::LengthPrefixed),
            other => Err(format!("unknown framing '{}'", other)),
        }
    }
}

/// Serialize a message to its JSON wire form.
pub fn encode_message(msg: &Message) -> Result<Vec<u8>, WireError> {
    Ok(serde_json::to_vec(msg)?)
}

/// Error serializing a message.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Wrap one payload for the stream. Legacy framing returns the payload unchanged.
pub fn encode_frame(payload: &[u8], framing: Framing) -> Result<Vec<u8>, FrameEncodeError> {
    match framing {
        Framing::Legacy => Ok(payload.to_vec()),
        Framing::LengthPrefixed => {
            let len = u32::try_from(payload.len()).map_err(|_| FrameEncodeError::TooLarge)?;
            if len > MAX_FRAME_LEN {
                return Err(FrameEncodeError::TooLarge);
            }
            let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
            out.extend_from_slice(&len.to_le_bytes());
            out.extend_from_slice(payload);
            Ok(out)
        }
    }
}

/// Error framing a payload (size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("frame too large")]
    TooLarge,
}

/// Decode one length-prefixed frame from the front of `bytes`.
/// Returns the payload range end (payload is `bytes[LEN_SIZE..end]`) on success.
fn decode_frame(bytes: &[u8]) -> Result<usize, FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    if len > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge);
    }
    let end = LEN_SIZE + len as usize;
    if bytes.len() < end {
        return Err(FrameDecodeError::NeedMore);
    }
    Ok(end)
}

/// Error decoding a frame (need more bytes, or declared length over the limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
}

/// Turns raw reads into payloads according to the connection's framing.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    framing: Framing,
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            buf: Vec::new(),
        }
    }

    /// Feed the bytes of one read. Returns every payload completed by it.
    /// `TooLarge` is fatal for the stream; the buffer is left as it was.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<Vec<u8>>, FrameDecodeError> {
        match self.framing {
            Framing::Legacy => {
                if bytes.is_empty() {
                    return Ok(Vec::new());
                }
                Ok(vec![bytes.to_vec()])
            }
            Framing::LengthPrefixed => {
                self.buf.extend_from_slice(bytes);
                let mut out = Vec::new();
                let mut consumed = 0;
                loop {
                    match decode_frame(&self.buf[consumed..]) {
                        Ok(end) => {
                            out.push(self.buf[consumed + LEN_SIZE..consumed + end].to_vec());
                            consumed += end;
                        }
                        Err(FrameDecodeError::NeedMore) => break,
                        Err(e) => return Err(e),
                    }
                }
                self.buf.drain(..consumed);
                Ok(out)
            }
        }
    }

    /// Bytes held back waiting for the rest of a frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}
