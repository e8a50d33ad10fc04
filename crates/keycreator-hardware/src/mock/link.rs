//! In-process link with scripted replies.

use crate::link::{Line, Link};
use keycreator_core::LinkError;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Produces the reply to one request line (delimiter stripped).
///
/// `None` means the device stays silent, which the channel reports as
/// `LinkError::NoResponse` once the read times out.
pub trait Responder: Send + 'static {
    fn respond(&mut self, request: &str) -> Option<String>;
}

impl<F> Responder for F
where
    F: FnMut(&str) -> Option<String> + Send + 'static,
{
    fn respond(&mut self, request: &str) -> Option<String> {
        self(request)
    }
}

/// Link answering from a [`Responder`], or from lines queued by its handle.
///
/// # Examples
///
/// ```
/// use keycreator_hardware::{Line, Link, MockLink};
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() -> Result<(), keycreator_core::LinkError> {
///     let (mut link, handle) = MockLink::with_responder(|request: &str| {
///         (request == "0004FF").then(|| "000454574E34\r".to_string())
///     });
///
///     link.write("0004FF\r").await?;
///     let reply = link.read(Duration::from_millis(10), b'\r', 64).await?;
///     assert_eq!(reply, Line::Complete("000454574E34".to_string()));
///     assert_eq!(handle.writes(), vec!["0004FF".to_string()]);
///     Ok(())
/// }
/// ```
pub struct MockLink {
    name: String,
    responder: Option<Box<dyn Responder>>,
    pending: String,
    scripted_rx: mpsc::UnboundedReceiver<String>,
    writes: Arc<Mutex<Vec<String>>>,
}

impl std::fmt::Debug for MockLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockLink")
            .field("name", &self.name)
            .field("pending", &self.pending)
            .finish()
    }
}

impl MockLink {
    /// Link without a responder; replies come only from the handle.
    pub fn new() -> (Self, MockLinkHandle) {
        Self::build(None)
    }

    pub fn with_responder(responder: impl Responder) -> (Self, MockLinkHandle) {
        Self::build(Some(Box::new(responder)))
    }

    fn build(responder: Option<Box<dyn Responder>>) -> (Self, MockLinkHandle) {
        let (scripted_tx, scripted_rx) = mpsc::unbounded_channel();
        let writes = Arc::new(Mutex::new(Vec::new()));

        let link = Self {
            name: "mock".to_string(),
            responder,
            pending: String::new(),
            scripted_rx,
            writes: Arc::clone(&writes),
        };
        let handle = MockLinkHandle {
            scripted_tx,
            writes,
        };
        (link, handle)
    }

    fn take_line(&mut self, delimiter: char, max_len: usize) -> Option<Result<Line, LinkError>> {
        match self.pending.find(delimiter) {
            Some(pos) if pos > max_len => {
                self.pending.clear();
                Some(Err(LinkError::FrameTooLong { max_len }))
            }
            Some(pos) => {
                let line = self.pending[..pos].to_string();
                self.pending.drain(..=pos);
                Some(Ok(Line::Complete(line)))
            }
            None if self.pending.len() > max_len => {
                self.pending.clear();
                Some(Err(LinkError::FrameTooLong { max_len }))
            }
            None => None,
        }
    }
}

impl Link for MockLink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&mut self, data: &str) -> Result<(), LinkError> {
        self.pending.clear();
        let request = data.trim_end_matches(['\r', '\n']).to_string();
        if let Ok(mut writes) = self.writes.lock() {
            writes.push(request.clone());
        }
        if let Some(responder) = self.responder.as_mut()
            && let Some(reply) = responder.respond(&request)
        {
            self.pending.push_str(&reply);
        }
        Ok(())
    }

    async fn read(
        &mut self,
        timeout: Duration,
        delimiter: u8,
        max_len: usize,
    ) -> Result<Line, LinkError> {
        let delimiter = char::from(delimiter);
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if let Some(line) = self.take_line(delimiter, max_len) {
                return line;
            }
            match tokio::time::timeout_at(deadline, self.scripted_rx.recv()).await {
                Ok(Some(chunk)) => self.pending.push_str(&chunk),
                // Handle dropped and nothing left to read: behave like a silent device.
                Ok(None) => {
                    tokio::time::sleep_until(deadline).await;
                    return Ok(Line::Partial(std::mem::take(&mut self.pending)));
                }
                Err(_) => return Ok(Line::Partial(std::mem::take(&mut self.pending))),
            }
        }
    }
}

/// Control side of a [`MockLink`].
#[derive(Debug, Clone)]
pub struct MockLinkHandle {
    scripted_tx: mpsc::UnboundedSender<String>,
    writes: Arc<Mutex<Vec<String>>>,
}

impl MockLinkHandle {
    /// Queue raw bytes for the link to read, delimiters included.
    pub fn push_reply(&self, raw: impl Into<String>) {
        let _ = self.scripted_tx.send(raw.into());
    }

    /// Every request written so far, in order, delimiter stripped.
    pub fn writes(&self) -> Vec<String> {
        self.writes.lock().map(|w| w.clone()).unwrap_or_default()
    }

    pub fn clear_writes(&self) {
        if let Ok(mut writes) = self.writes.lock() {
            writes.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_millis(20);

    #[tokio::test]
    async fn test_scripted_replies_in_order() {
        let (mut link, handle) = MockLink::new();
        handle.push_reply("0000\r0001\r");

        assert_eq!(link.read(WAIT, b'\r', 64).await.unwrap(), Line::Complete("0000".into()));
        assert_eq!(link.read(WAIT, b'\r', 64).await.unwrap(), Line::Complete("0001".into()));
    }

    #[tokio::test]
    async fn test_partial_reply_on_timeout() {
        let (mut link, handle) = MockLink::new();
        handle.push_reply("00");

        assert_eq!(link.read(WAIT, b'\r', 64).await.unwrap(), Line::Partial("00".into()));
    }

    #[tokio::test]
    async fn test_responder_silence() {
        let (mut link, _handle) = MockLink::with_responder(|_: &str| None);
        link.write("0001\r").await.unwrap();
        assert_eq!(link.read(WAIT, b'\r', 64).await.unwrap(), Line::Partial(String::new()));
    }

    #[tokio::test]
    async fn test_write_drops_unread_reply() {
        let (mut link, _handle) = MockLink::with_responder(|request: &str| {
            Some(format!("00{request}\r"))
        });
        link.write("01\r").await.unwrap();
        link.write("02\r").await.unwrap();

        assert_eq!(link.read(WAIT, b'\r', 64).await.unwrap(), Line::Complete("0002".into()));
    }

    #[tokio::test]
    async fn test_oversized_pending_reply() {
        let (mut link, handle) = MockLink::new();
        handle.push_reply("0123456789\r");

        assert!(matches!(
            link.read(WAIT, b'\r', 4).await,
            Err(LinkError::FrameTooLong { max_len: 4 })
        ));
    }

    #[tokio::test]
    async fn test_writes_are_recorded() {
        let (mut link, handle) = MockLink::new();
        link.write("0500\r").await.unwrap();
        link.write("050010\r").await.unwrap();
        assert_eq!(handle.writes(), vec!["0500", "050010"]);

        handle.clear_writes();
        assert!(handle.writes().is_empty());
    }
}
