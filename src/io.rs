use anyhow::{bail, Context};
use log::trace;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use std::io::ErrorKind;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest payload accepted in a single frame.
pub const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

/// Read and deserialize an object from a stream.
///
/// The stream format consists of:
/// 1. Length header (4 bytes, big endian) - Size of the serialized JSON payload
/// 2. JSON payload (length bytes) - The serialized object
///
/// # Returns
///
/// `None` when the stream was closed before a new header started.
///
pub async fn read_object<R, T>(stream: &mut R) -> Result<Option<T>, anyhow::Error>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned + Debug,
{
    let mut len_buf = [0u8; 4];
    let first = stream.read(&mut len_buf).await.context("reading payload length")?;
    if first == 0 {
        return Ok(None);
    }
    if first < len_buf.len() {
        match stream.read_exact(&mut len_buf[first..]).await {
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => bail!("stream closed inside payload length"),
            other => other.context("reading payload length")?,
        };
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        bail!("payload of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit");
    }

    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await.context("reading payload")?;
    let object = serde_json::from_slice(&payload).context("deserializing JSON payload")?;

    trace!(len, object:?; "Read object from stream");
    Ok(Some(object))
}

/// Write and serialize an object to a stream, in the format read by [`read_object`].
pub async fn write_object<W, T>(stream: &mut W, object: T) -> Result<(), anyhow::Error>
where
    W: AsyncWrite + Unpin,
    T: Serialize + Debug,
{
    let payload = serde_json::to_vec(&object).context("serializing object to JSON")?;
    let len = payload.len();
    if len > MAX_FRAME_LEN {
        bail!("payload of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit");
    }

    stream.write_all(&(len as u32).to_be_bytes()).await.context("writing payload length")?;
    stream.write_all(&payload).await.context("writing payload")?;
    stream.flush().await.context("flushing stream")?;

    trace!(len, object:?; "Wrote object to stream");
    Ok(())
}
