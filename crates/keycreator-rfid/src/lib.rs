//! Tag level routines on top of the reader command surface.
//!
//! | module | does |
//! |---|---|
//! | [`search`] | per technology search, anti-bounce promotion of UIDs |
//! | [`classifier`] | MIFARE Classic vs DESFire by SAK |
//! | [`hitag`] | HITAG 1S number block codec and driver |
//! | [`mifare_classic`] | sector login, number program/read, sector wipe |
//! | [`desfire`] | twelve step provisioning, reset to factory key |
//! | [`feedback`] | beeps and LEDs |
//!
//! Every driver holds a cloned [`Twn4Reader`](keycreator_hardware::Twn4Reader)
//! and therefore shares the single command queue of the reader.

pub mod classifier;
pub mod desfire;
pub mod feedback;
pub mod hitag;
pub mod mifare_classic;
pub mod search;

pub use classifier::{MifareClass, TagClassifier};
pub use desfire::{DesfireDriver, ResetOutcome};
pub use feedback::Feedback;
pub use hitag::HitagDriver;
pub use mifare_classic::{ClassicReadout, MifareClassicDriver};
pub use search::{SEARCH_ORDER, SearchTarget, TagSearch};
