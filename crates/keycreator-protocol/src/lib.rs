//! Wire protocol of the TWN4-style RFID reader.
//!
//! Requests and replies are ASCII hex lines terminated by a carriage return:
//!
//! ```text
//! request  = HEX4(opcode) HEX(params) CR      e.g. "0500" "10" "\r"
//! reply    = HEX2(status) HEX(payload) CR     e.g. "00" "01800420044A3C91" "\r"
//! ```
//!
//! This crate only knows about text and bytes. Which opcode means what to a
//! tag lives in `keycreator-rfid`; who is allowed to talk to the port lives in
//! `keycreator-hardware`.

pub mod codec;
pub mod frame;
pub mod hex;
pub mod opcode;
pub mod tag_type;

pub use codec::Twn4Codec;
pub use frame::{Reply, Request};
pub use opcode::Opcode;
