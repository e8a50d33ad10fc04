//! Core types shared by every keycreator crate.
//!
//! This crate holds the vocabulary of the provisioning engine: the error
//! taxonomy, the technology and UID types produced by tag detection, the
//! serial number type, the per-customer transponder configuration, and the
//! application configuration loaded at startup.

pub mod config;
pub mod constants;
pub mod error;
pub mod types;

pub use config::{AppConfig, ErpConfig, ReaderConfig, SessionConfig};
pub use error::{Error, LinkError, ProtocolError, Result};
pub use types::*;

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
