//! Length-prefixed message framing.
//!
//! A frame is a 4-byte little-endian length followed by exactly that many
//! payload bytes. A request on the wire is a one-byte tag followed by a frame:
//!
//! ```text
//! [tag: u8][len: u32 LE][payload: len bytes]
//! ```
//!
//! Frames larger than [`MAX_MESSAGE_LEN`] are never written and never accepted.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::NetError;

/// Maximum payload size of a single frame.
pub const MAX_MESSAGE_LEN: usize = 1 << 16;

/// Size of the length prefix.
pub const LEN_PREFIX: usize = 4;

/// Builds the byte image of a frame carrying `payload`.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, NetError> {
    let len = checked_len(payload.len())?;
    let mut buf = Vec::with_capacity(LEN_PREFIX + payload.len());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Builds the byte image of a tagged request: the tag followed by a frame.
pub fn encode_request(tag: u8, payload: &[u8]) -> Result<Vec<u8>, NetError> {
    let len = checked_len(payload.len())?;
    let mut buf = Vec::with_capacity(1 + LEN_PREFIX + payload.len());
    buf.push(tag);
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

fn checked_len(len: usize) -> Result<u32, NetError> {
    if len > MAX_MESSAGE_LEN {
        return Err(NetError::Oversize { len });
    }
    u32::try_from(len).map_err(|_| NetError::Oversize { len })
}

/// Writes one frame as a single write.
///
/// # Errors
///
/// Returns [`NetError::Oversize`] without writing anything if the payload is
/// too large, or an IO error from the stream.
pub async fn write_message<W>(writer: &mut W, payload: &[u8]) -> Result<(), NetError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = encode_frame(payload)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads exactly one frame and returns its payload.
///
/// # Errors
///
/// - [`NetError::Oversize`] if the announced length exceeds [`MAX_MESSAGE_LEN`].
/// - [`NetError::Truncated`] if the stream ends inside the prefix or the payload.
pub async fn read_message<R>(reader: &mut R) -> Result<Vec<u8>, NetError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut prefix = [0u8; LEN_PREFIX];
    let received = read_full(reader, &mut prefix).await?;
    if received < LEN_PREFIX {
        return Err(NetError::Truncated {
            expected: LEN_PREFIX,
            received,
        });
    }

    let len = u32::from_le_bytes(prefix) as usize;
    if len > MAX_MESSAGE_LEN {
        return Err(NetError::Oversize { len });
    }

    let mut payload = vec![0u8; len];
    let received = read_full(reader, &mut payload).await?;
    if received < len {
        return Err(NetError::Truncated {
            expected: len,
            received,
        });
    }
    Ok(payload)
}

/// Fills `buf` from the reader, stopping early only at end of stream.
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> Result<usize, NetError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
