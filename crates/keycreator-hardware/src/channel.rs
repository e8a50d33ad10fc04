//! FIFO single-flight command channel.
//!
//! Callers enqueue a [`Request`] together with a oneshot reply slot. One
//! worker task owns the link and handles jobs strictly in arrival order:
//! write request, read reply line, parse status, answer the slot, and only
//! then take the next job. Two logical callers (the provisioning loop and a
//! maintenance routine) can therefore never interleave bytes on the
//! half-duplex wire.

use crate::{
    devices::AnyLink,
    link::{Line, Link},
};
use keycreator_core::{
    LinkError, ReaderConfig, Result,
    constants::{DEFAULT_MAX_REPLY_LEN, DEFAULT_READ_TIMEOUT_MS, FRAME_DELIMITER},
};
use keycreator_protocol::{Reply, Request};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Requests waiting for the worker before `send` applies backpressure.
const QUEUE_DEPTH: usize = 32;

/// Reply handling parameters of the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOptions {
    pub read_timeout: Duration,
    pub delimiter: u8,
    pub max_reply_len: usize,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(DEFAULT_READ_TIMEOUT_MS),
            delimiter: FRAME_DELIMITER,
            max_reply_len: DEFAULT_MAX_REPLY_LEN,
        }
    }
}

impl From<&ReaderConfig> for ChannelOptions {
    fn from(config: &ReaderConfig) -> Self {
        Self {
            read_timeout: config.read_timeout(),
            delimiter: FRAME_DELIMITER,
            max_reply_len: config.max_reply_len,
        }
    }
}

struct Job {
    request: Request,
    reply: oneshot::Sender<Result<Reply>>,
}

/// Cloneable handle to the command worker.
///
/// # Examples
///
/// ```
/// use keycreator_hardware::{AnyLink, ChannelOptions, CommandChannel, MockLink};
/// use keycreator_protocol::{Opcode, Request};
///
/// #[tokio::main]
/// async fn main() -> keycreator_core::Result<()> {
///     let (link, _handle) = MockLink::with_responder(|_: &str| Some("00\r".to_string()));
///     let (channel, _worker) = CommandChannel::spawn(AnyLink::Mock(link), ChannelOptions::default());
///
///     let reply = channel.send(Request::new(Opcode::Beep)).await?;
///     assert!(reply.is_empty());
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct CommandChannel {
    tx: mpsc::Sender<Job>,
    port: String,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job").field("request", &self.request).finish()
    }
}

impl CommandChannel {
    /// Move `link` into a new worker task.
    ///
    /// The worker stops once every `CommandChannel` clone has been dropped.
    pub fn spawn(link: AnyLink, options: ChannelOptions) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let port = link.name().to_string();
        let worker = tokio::spawn(Self::worker(link, rx, options));
        (Self { tx, port }, worker)
    }

    /// Queue `request` and wait for its reply.
    ///
    /// # Errors
    ///
    /// - `Error::Link` when the link fails, the reader stays silent, or the
    ///   worker has stopped
    /// - `Error::Protocol` when the reply carries a nonzero status
    pub async fn send(&self, request: Request) -> Result<Reply> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Job {
                request,
                reply: reply_tx,
            })
            .await
            .map_err(|_| LinkError::closed(self.port.clone()))?;

        reply_rx
            .await
            .map_err(|_| LinkError::closed(self.port.clone()))?
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    async fn worker(mut link: AnyLink, mut rx: mpsc::Receiver<Job>, options: ChannelOptions) {
        debug!(port = %link.name(), "Command worker started");

        while let Some(job) = rx.recv().await {
            let result = Self::exchange(&mut link, &job.request, &options).await;
            if let Err(e) = &result {
                debug!(request = %job.request, error = %e, "Command failed");
            }
            if job.reply.send(result).is_err() {
                warn!(request = %job.request, "Caller went away before the reply");
            }
        }

        debug!(port = %link.name(), "Command worker stopped");
    }

    async fn exchange(link: &mut AnyLink, request: &Request, options: &ChannelOptions) -> Result<Reply> {
        trace!(request = %request, "->");
        link.write(&request.to_wire()).await?;

        let deadline = Instant::now() + options.read_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let line = link
                .read(remaining, options.delimiter, options.max_reply_len)
                .await?;
            trace!(reply = ?line, "<-");

            match line {
                // A bare delimiter is the tail of a reply that already timed out.
                Line::Complete(text) if text.is_empty() => {
                    debug!(request = %request, "Skipping empty line");
                }
                Line::Complete(text) => return Ok(Reply::parse(&text)?),
                Line::Partial(text) if text.is_empty() => {
                    return Err(LinkError::no_response(request.encode()).into());
                }
                Line::Partial(partial) => {
                    return Err(LinkError::Unterminated { partial }.into());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockLink;
    use keycreator_core::{Error, ProtocolError};
    use keycreator_protocol::Opcode;

    fn fast() -> ChannelOptions {
        ChannelOptions {
            read_timeout: Duration::from_millis(20),
            ..ChannelOptions::default()
        }
    }

    #[tokio::test]
    async fn test_status_error_is_mapped() {
        let (link, _handle) = MockLink::with_responder(|_: &str| Some("04\r".to_string()));
        let (channel, _worker) = CommandChannel::spawn(AnyLink::Mock(link), fast());

        let result = channel.send(Request::new(Opcode::Reset)).await;
        assert!(matches!(
            result,
            Err(Error::Protocol(ProtocolError::InvalidFunction))
        ));
    }

    #[tokio::test]
    async fn test_silent_reader_is_no_response() {
        let (link, _handle) = MockLink::with_responder(|_: &str| None);
        let (channel, _worker) = CommandChannel::spawn(AnyLink::Mock(link), fast());

        let result = channel.send(Request::new(Opcode::Reset)).await;
        assert!(matches!(
            result,
            Err(Error::Link(LinkError::NoResponse { .. }))
        ));
    }

    #[tokio::test]
    async fn test_worker_gone_is_closed() {
        let (link, _handle) = MockLink::new();
        let (channel, worker) = CommandChannel::spawn(AnyLink::Mock(link), fast());
        worker.abort();
        let _ = worker.await;

        let result = channel.send(Request::new(Opcode::Reset)).await;
        assert!(matches!(result, Err(Error::Link(LinkError::Closed { .. }))));
    }

    #[test]
    fn test_options_from_config() {
        let config = ReaderConfig {
            read_timeout_ms: 500,
            max_reply_len: 256,
            ..ReaderConfig::default()
        };
        let options = ChannelOptions::from(&config);
        assert_eq!(options.read_timeout, Duration::from_millis(500));
        assert_eq!(options.max_reply_len, 256);
        assert_eq!(options.delimiter, b'\r');
    }
}
