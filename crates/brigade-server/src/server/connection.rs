//! A [`Connection`] over a line-delimited JSON byte stream.

use brigade::{Connection, Error, Result};
use futures::{SinkExt, StreamExt};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LinesCodec};

/// One JSON value per line, in both directions.
///
/// A line longer than the configured limit or a stream that ends fails the
/// read with [`Error::ChannelError`]. A line that does not decode as the
/// expected JSON fails with [`Error::InvalidRequest`] and leaves the
/// connection usable.
pub struct LineConnection<IO> {
    framed: Framed<IO, LinesCodec>,
}

impl<IO> LineConnection<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(io: IO, max_line_bytes: usize) -> Self {
        Self {
            framed: Framed::new(io, LinesCodec::new_with_max_length(max_line_bytes)),
        }
    }

    /// Reads the next line and decodes it as `T`.
    pub async fn read_json<T: DeserializeOwned>(&mut self) -> Result<T> {
        let line = match self.framed.next().await {
            Some(Ok(line)) => line,
            Some(Err(e)) => return Err(Error::channel(format!("failed to read line: {e}"))),
            None => return Err(Error::channel("peer closed the connection")),
        };
        serde_json::from_str(&line).map_err(|e| Error::invalid_request(e.to_string()))
    }

    /// Encodes `value` and writes it as one line.
    pub async fn write_json<T: Serialize>(&mut self, value: &T) -> Result<()> {
        let line = serde_json::to_string(value)
            .map_err(|e| Error::channel(format!("failed to encode line: {e}")))?;
        self.framed
            .send(line)
            .await
            .map_err(|e| Error::channel(format!("failed to write line: {e}")))
    }
}

impl<IO> Connection for LineConnection<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send,
{
    type Message = Value;

    async fn recv(&mut self) -> Result<Value> {
        self.read_json().await
    }

    async fn send(&mut self, message: Value) -> Result<()> {
        self.write_json(&message).await
    }
}
