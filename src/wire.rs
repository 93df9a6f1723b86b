//! Delivery wire protocol between probe and center.
//!
//! A long-lived TCP connection carries a stream of length-prefixed bincode
//! frames, each holding one [`FlowUpdate`]. When the probe half-closes the
//! stream, the center replies with a single [`DeliveryReply`] frame.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum accepted frame payload, in bytes. Flow updates are tiny; anything
/// near this bound indicates a corrupt or hostile peer.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// One aggregated flow record on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowUpdate {
    pub timestamp: u64,
    pub src_ip: String,
    pub dst_ip: String,
    pub size: u64,
    pub probe_ip: String,
}

/// The center's single reply, sent when the probe closes its write half.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReply {
    pub success: bool,
    pub detail: String,
}

/// Errors surfaced by the framed codec.
#[derive(Error, Debug)]
pub enum WireError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame of {len} bytes exceeds limit of {MAX_FRAME_LEN}")]
    FrameTooLarge { len: usize },

    #[error("encoding frame: {0}")]
    Encode(#[source] bincode::Error),

    #[error("decoding frame: {0}")]
    Decode(#[source] bincode::Error),
}

/// Writes one length-prefixed bincode frame.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = bincode::serialize(value).map_err(WireError::Encode)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge { len: payload.len() });
    }

    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one length-prefixed bincode frame. `Ok(None)` means the peer closed
/// the stream cleanly at a frame boundary.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, WireError>
where
    R: AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(WireError::Io(e)),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge { len });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    let value = bincode::deserialize(&payload).map_err(WireError::Decode)?;
    Ok(Some(value))
}
