//! Simulated links for testing without a reader attached.

pub mod link;
pub mod reader;

pub use link::{MockLink, MockLinkHandle, Responder};
pub use reader::{DesfireApp, DesfireCard, DesfireFile, DesfireKeySlot, VirtualReader, VirtualTag, VirtualTagKind};
