//! Wire codec - newline-delimited JSON frames

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use super::Message;
use crate::core::{Error, Result};

/// Handshake lines are tiny; anything longer is garbage.
const MAX_HANDSHAKE_LEN: usize = 64 * 1024;

/// Upper bound for one frame on the wire.
pub const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

/// Anything a channel can run over: TCP, a duplex pipe, ...
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxStream = Box<dyn AsyncStream>;

/// Write one value as a single JSON line.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut buf = serde_json::to_vec(value)?;
    buf.push(b'\n');
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one handshake line without buffering past it, so the stream can be
/// handed to a `Channel` afterwards with nothing lost.
pub async fn read_handshake<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = Vec::with_capacity(256);
    loop {
        let byte = match reader.read_u8().await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(Error::Transport("connection closed during handshake".into()));
            }
            Err(e) => return Err(e.into()),
        };
        if byte == b'\n' {
            break;
        }
        line.push(byte);
        if line.len() > MAX_HANDSHAKE_LEN {
            return Err(Error::Transport("handshake line too long".into()));
        }
    }
    Ok(serde_json::from_slice(&line)?)
}

/// Decodes `Message` frames from the read half of a stream.
pub struct FrameReader<R> {
    reader: BufReader<R>,
    line: Vec<u8>,
    limit: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self::with_limit(reader, MAX_FRAME_LEN)
    }

    pub fn with_limit(reader: R, limit: usize) -> Self {
        Self {
            reader: BufReader::new(reader),
            line: Vec::with_capacity(1024),
            limit,
        }
    }

    /// Next message, `None` on a clean end of stream. Blank lines are skipped.
    ///
    /// A line longer than the frame limit is a `Transport` error; the
    /// stream is not resynchronised after it.
    pub async fn next(&mut self) -> Result<Option<Message>> {
        loop {
            self.line.clear();
            let read = (&mut self.reader)
                .take(self.limit as u64 + 1)
                .read_until(b'\n', &mut self.line)
                .await?;
            if read == 0 {
                return Ok(None);
            }
            if self.line.last() == Some(&b'\n') {
                self.line.pop();
            } else if self.line.len() > self.limit {
                return Err(Error::Transport(format!(
                    "frame exceeds {} bytes",
                    self.limit
                )));
            }
            if self.line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return serde_json::from_slice(&self.line)
                .map(Some)
                .map_err(|e| Error::Transport(format!("malformed frame: {e}")));
        }
    }
}
