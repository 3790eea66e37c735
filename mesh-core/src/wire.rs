//! Framing shared by every byte stream: a 4-byte little-endian body length,
//! then the body. Protocol messages carry bincode; link frames carry ciphertext.

use crate::protocol::Message;

pub const LEN_SIZE: usize = 4;
/// Largest protocol message body (1 MiB).
pub const MAX_FRAME_LEN: u32 = 1024 * 1024;

/// Prefix `body` with its length. Bodies over `max` are refused.
pub fn prefixed(body: &[u8], max: u32) -> Result<Vec<u8>, FrameEncodeError> {
    let len = u32::try_from(body.len())
        .ok()
        .filter(|len| *len <= max)
        .ok_or(FrameEncodeError::TooLarge)?;
    let mut out = Vec::with_capacity(LEN_SIZE + body.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(body);
    Ok(out)
}

/// Body length announced by a header.
pub fn body_len(header: [u8; LEN_SIZE], max: u32) -> Result<usize, FrameDecodeError> {
    let len = u32::from_le_bytes(header);
    if len > max {
        return Err(FrameDecodeError::TooLarge);
    }
    Ok(len as usize)
}

/// Split the first complete frame off `bytes`: its body and the bytes consumed.
pub fn split_frame(bytes: &[u8], max: u32) -> Result<(&[u8], usize), FrameDecodeError> {
    let mut header = [0u8; LEN_SIZE];
    header.copy_from_slice(bytes.get(..LEN_SIZE).ok_or(FrameDecodeError::NeedMore)?);
    let end = LEN_SIZE + body_len(header, max)?;
    let body = bytes.get(LEN_SIZE..end).ok_or(FrameDecodeError::NeedMore)?;
    Ok((body, end))
}

pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, FrameEncodeError> {
    prefixed(&bincode::serialize(msg)?, MAX_FRAME_LEN)
}

/// Decode the first message in `bytes`. `NeedMore` means wait for more input.
pub fn decode_frame(bytes: &[u8]) -> Result<(Message, usize), FrameDecodeError> {
    let (body, used) = split_frame(bytes, MAX_FRAME_LEN)?;
    Ok((bincode::deserialize(body)?, used))
}

#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}
