//! Reader link and command channel.
//!
//! # Architecture
//!
//! ```text
//!  session loop ─┐                 ┌──────────────────┐      ┌─────────┐
//!                ├──► mpsc FIFO ──►│  channel worker  │─────►│ AnyLink │──► serial port
//!  maintenance ──┘   (oneshot      │  (one command    │◄─────│         │◄──
//!                     replies)     │   in flight)     │      └─────────┘
//!                                  └──────────────────┘
//! ```
//!
//! Every caller talks to the reader through a cloned [`CommandChannel`]. A
//! single worker task owns the [`AnyLink`] and drains the queue one request at
//! a time, so command N+1 is never written before the reply to command N has
//! been read. [`Twn4Reader`] puts typed methods on top of the channel.
//!
//! # Links
//!
//! - [`SerialLink`]: the reader's virtual COM port, through `serialport`
//! - [`StreamLink`]: any tokio byte stream, used with in-memory duplex pipes
//! - [`MockLink`]: scripted replies, or a [`VirtualReader`] answering like the
//!   firmware does

pub mod channel;
pub mod devices;
pub mod link;
pub mod mock;
pub mod reader;
pub mod serial;

pub use channel::{ChannelOptions, CommandChannel};
pub use devices::AnyLink;
pub use link::{Line, Link, StreamLink};
pub use mock::{MockLink, MockLinkHandle, VirtualReader};
pub use reader::{DesfireKeyChange, DesfireKeySettingsReply, SearchReply, Twn4Reader};
pub use serial::SerialLink;
