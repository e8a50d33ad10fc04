//! Enum wrapper for link dispatch.
//!
//! Native `async fn` in traits is not object safe, so `Box<dyn Link>` is not
//! available. [`AnyLink`] gives concrete dispatch instead, which also lets the
//! channel worker be spawned on the multi-threaded runtime: every variant's
//! futures are known to be `Send`.
//!
//! # Examples
//!
//! ```
//! use keycreator_hardware::{AnyLink, Link, MockLink};
//!
//! let (link, _handle) = MockLink::new();
//! let link = AnyLink::Mock(link);
//! assert_eq!(link.name(), "mock");
//! ```

use crate::link::{Line, Link, StreamLink};
use crate::mock::MockLink;
use crate::serial::SerialLink;
use keycreator_core::LinkError;
use std::time::Duration;
use tokio::io::DuplexStream;

#[derive(Debug)]
#[non_exhaustive]
pub enum AnyLink {
    /// Reader on a serial port.
    Serial(SerialLink),
    /// In-memory pipe, the other end played by a test.
    Duplex(StreamLink<DuplexStream>),
    /// Scripted or simulated replies.
    Mock(MockLink),
}

impl Link for AnyLink {
    fn name(&self) -> &str {
        match self {
            Self::Serial(link) => link.name(),
            Self::Duplex(link) => link.name(),
            Self::Mock(link) => link.name(),
        }
    }

    async fn write(&mut self, data: &str) -> Result<(), LinkError> {
        match self {
            Self::Serial(link) => link.write(data).await,
            Self::Duplex(link) => link.write(data).await,
            Self::Mock(link) => link.write(data).await,
        }
    }

    async fn read(
        &mut self,
        timeout: Duration,
        delimiter: u8,
        max_len: usize,
    ) -> Result<Line, LinkError> {
        match self {
            Self::Serial(link) => link.read(timeout, delimiter, max_len).await,
            Self::Duplex(link) => link.read(timeout, delimiter, max_len).await,
            Self::Mock(link) => link.read(timeout, delimiter, max_len).await,
        }
    }
}

impl From<MockLink> for AnyLink {
    fn from(link: MockLink) -> Self {
        Self::Mock(link)
    }
}

impl From<SerialLink> for AnyLink {
    fn from(link: SerialLink) -> Self {
        Self::Serial(link)
    }
}

impl From<StreamLink<DuplexStream>> for AnyLink {
    fn from(link: StreamLink<DuplexStream>) -> Self {
        Self::Duplex(link)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_any_link_mock() {
        let (link, handle) = MockLink::new();
        let mut link = AnyLink::from(link);

        link.write("0001\r").await.unwrap();
        assert_eq!(handle.writes(), vec!["0001"]);
    }

    #[tokio::test]
    async fn test_any_link_duplex_name() {
        let (host, _device) = tokio::io::duplex(16);
        let link = AnyLink::from(StreamLink::new("pipe", host));
        assert_eq!(link.name(), "pipe");
    }
}
