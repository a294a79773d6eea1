//! Length-prefixed JSON frame codec for vsock streams.
//!
//! Frame layout: a u32 big-endian payload length followed by a JSON body.
//! Both sides of every guest-service connection use these two functions.

use crate::errors::{ArcaError, ArcaResult};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame. Large enough for archive payloads,
/// small enough to reject a corrupted length prefix quickly.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// Serialize `msg` and write it as one frame.
pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> ArcaResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(msg)
        .map_err(|e| ArcaError::Internal(format!("frame encode failed: {e}")))?;
    if body.len() as u64 > MAX_FRAME_LEN as u64 {
        return Err(ArcaError::Internal(format!(
            "frame of {} bytes exceeds the {} byte limit",
            body.len(),
            MAX_FRAME_LEN
        )));
    }

    writer
        .write_all(&(body.len() as u32).to_be_bytes())
        .await
        .map_err(|e| ArcaError::Remote(format!("frame write failed: {e}")))?;
    writer
        .write_all(&body)
        .await
        .map_err(|e| ArcaError::Remote(format!("frame write failed: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| ArcaError::Remote(format!("frame flush failed: {e}")))?;
    Ok(())
}

/// Read one frame and deserialize it as `T`.
pub async fn read_frame<R, T>(reader: &mut R) -> ArcaResult<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| ArcaError::Remote(format!("frame read failed: {e}")))?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(ArcaError::Remote(format!(
            "peer announced a {len} byte frame, limit is {MAX_FRAME_LEN}"
        )));
    }

    let mut body = vec![0u8; len as usize];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| ArcaError::Remote(format!("frame read failed: {e}")))?;
    serde_json::from_slice(&body)
        .map_err(|e| ArcaError::Remote(format!("frame decode failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        seq: u32,
        note: String,
    }

    #[tokio::test]
    async fn frame_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let msg = Ping {
            seq: 7,
            note: "hello".into(),
        };
        write_frame(&mut a, &msg).await.unwrap();
        let got: Ping = read_frame(&mut b).await.unwrap();
        assert_eq!(got, msg);
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
        let err = read_frame::<_, Ping>(&mut b).await.unwrap_err();
        assert!(err.to_string().contains("limit"));
    }

    #[tokio::test]
    async fn truncated_stream_surfaces_remote_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&10u32.to_be_bytes()).await.unwrap();
        a.write_all(b"abc").await.unwrap();
        drop(a);
        let err = read_frame::<_, Ping>(&mut b).await.unwrap_err();
        assert!(matches!(err, ArcaError::Remote(_)));
    }
}
