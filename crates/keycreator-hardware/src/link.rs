//! Byte-stream duplex channel to the reader.
//!
//! All traits use native `async fn` methods (Edition 2024). They are not
//! object safe; [`crate::AnyLink`] provides concrete dispatch instead of
//! `Box<dyn Link>`.

#![allow(async_fn_in_trait)]

use bytes::BytesMut;
use futures::FutureExt;
use keycreator_core::LinkError;
use keycreator_protocol::Twn4Codec;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::time::Instant;
use tokio_util::codec::Decoder;
use tracing::{debug, trace};

/// One read from a [`Link`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    /// Text up to the delimiter, delimiter stripped.
    Complete(String),
    /// Whatever arrived before the timeout, possibly empty.
    Partial(String),
}

impl Line {
    pub fn text(&self) -> &str {
        match self {
            Self::Complete(text) | Self::Partial(text) => text,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete(_))
    }
}

/// Duplex text channel to the reader.
///
/// # Read contract
///
/// `read` accumulates bytes until one of:
///
/// - `delimiter` arrives: [`Line::Complete`] without the delimiter
/// - `timeout` elapses: [`Line::Partial`] with whatever arrived so far
/// - more than `max_len` bytes arrived without a delimiter: `LinkError::FrameTooLong`
///
/// `write` discards input left over from earlier replies before sending.
pub trait Link: Send {
    /// Port name, for diagnostics.
    fn name(&self) -> &str;

    /// Drop stale input, then write ASCII text to the stream.
    async fn write(&mut self, data: &str) -> Result<(), LinkError>;

    /// Read one line. See the trait documentation.
    async fn read(
        &mut self,
        timeout: Duration,
        delimiter: u8,
        max_len: usize,
    ) -> Result<Line, LinkError>;
}

/// Link over any tokio byte stream.
///
/// # Examples
///
/// ```
/// use keycreator_hardware::{Line, Link, StreamLink};
/// use std::time::Duration;
/// use tokio::io::AsyncWriteExt;
///
/// #[tokio::main]
/// async fn main() -> Result<(), keycreator_core::LinkError> {
///     let (host, mut device) = tokio::io::duplex(64);
///     let mut link = StreamLink::new("duplex", host);
///
///     device.write_all(b"0001\r").await?;
///     let line = link.read(Duration::from_millis(100), b'\r', 64).await?;
///     assert_eq!(line, Line::Complete("0001".to_string()));
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct StreamLink<S> {
    name: String,
    reader: ReadHalf<S>,
    writer: WriteHalf<S>,
    buffer: BytesMut,
}

impl<S> StreamLink<S>
where
    S: AsyncRead + AsyncWrite + Send,
{
    pub fn new(name: impl Into<String>, stream: S) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            name: name.into(),
            reader: read_half,
            writer: write_half,
            buffer: BytesMut::with_capacity(256),
        }
    }
}

impl<S> Link for StreamLink<S>
where
    S: AsyncRead + AsyncWrite + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&mut self, data: &str) -> Result<(), LinkError> {
        while let Some(Ok(n)) = self.reader.read_buf(&mut self.buffer).now_or_never() {
            if n == 0 {
                break;
            }
        }
        if !self.buffer.is_empty() {
            debug!(port = %self.name, stale = self.buffer.len(), "Discarding stale input");
            self.buffer.clear();
        }

        trace!(port = %self.name, data = data.trim_end(), "link write");
        self.writer.write_all(data.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn read(
        &mut self,
        timeout: Duration,
        delimiter: u8,
        max_len: usize,
    ) -> Result<Line, LinkError> {
        let mut codec = Twn4Codec::with_max_line_len(max_len).delimiter(delimiter);
        let deadline = Instant::now() + timeout;

        loop {
            match codec.decode(&mut self.buffer) {
                Ok(Some(line)) => {
                    trace!(port = %self.name, line = %line, "link read");
                    return Ok(Line::Complete(line));
                }
                Ok(None) => {}
                Err(e) => {
                    self.buffer.clear();
                    return Err(e);
                }
            }

            match tokio::time::timeout_at(deadline, self.reader.read_buf(&mut self.buffer)).await {
                Ok(Ok(0)) => return Err(LinkError::closed(self.name.clone())),
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    let partial = self.buffer.split();
                    let partial = String::from_utf8_lossy(&partial).into_owned();
                    trace!(port = %self.name, partial = %partial, "link read timed out");
                    return Ok(Line::Partial(partial));
                }
            }
        }
    }
}
