//! ERP backend access.
//!
//! The backend owns transponder configurations and the register of
//! provisioned tokens. The engine only lists and reads configurations,
//! looks records up by UID, creates a record after a token passed
//! verification, and deletes one after a verified reset.

pub mod client;
pub mod error;
pub mod memory;
pub mod models;

pub use client::{ErpClient, HttpErpClient};
pub use error::{ErpError, ErpResult};
pub use memory::InMemoryErp;
pub use models::{ConfigSummary, ErpConfiguration, NewTransponder, TransponderRecord};
