//! Reader function codes.
//!
//! The high byte selects the API group, the low byte the function:
//!
//! | group | API |
//! |---|---|
//! | `0x00` | system |
//! | `0x04` | peripherals (beeper, LEDs) |
//! | `0x05` | RF search |
//! | `0x07` | HITAG 1S |
//! | `0x0B` | MIFARE Classic |
//! | `0x0F` | DESFire |
//! | `0x12` | ISO 14443 |

use std::fmt;

/// Function code sent as the first four hex digits of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Reset,
    GetVersionString,

    Beep,
    LedInit,
    LedOn,
    LedOff,
    LedBlink,

    SearchTag,
    SetTagTypes,

    HitagReadBlock,
    HitagWriteBlock,

    ClassicLogin,
    ClassicReadBlock,
    ClassicWriteBlock,

    DesfireCreateApp,
    DesfireSelectApp,
    DesfireAuthenticate,
    DesfireGetKeySettings,
    DesfireReadData,
    DesfireWriteData,
    DesfireCreateDataFile,
    DesfireChangeKeySettings,
    DesfireChangeKey,
    DesfireFormatTag,

    GetSak,
}

impl Opcode {
    pub fn code(&self) -> u16 {
        match self {
            Self::Reset => 0x0001,
            Self::GetVersionString => 0x0004,

            Self::Beep => 0x0407,
            Self::LedInit => 0x0410,
            Self::LedOn => 0x0411,
            Self::LedOff => 0x0412,
            Self::LedBlink => 0x0414,

            Self::SearchTag => 0x0500,
            Self::SetTagTypes => 0x0502,

            Self::HitagReadBlock => 0x0700,
            Self::HitagWriteBlock => 0x0701,

            Self::ClassicLogin => 0x0B00,
            Self::ClassicReadBlock => 0x0B01,
            Self::ClassicWriteBlock => 0x0B02,

            Self::DesfireCreateApp => 0x0F01,
            Self::DesfireSelectApp => 0x0F03,
            Self::DesfireAuthenticate => 0x0F04,
            Self::DesfireGetKeySettings => 0x0F05,
            Self::DesfireReadData => 0x0F08,
            Self::DesfireWriteData => 0x0F09,
            Self::DesfireCreateDataFile => 0x0F0E,
            Self::DesfireChangeKeySettings => 0x0F11,
            Self::DesfireChangeKey => 0x0F12,
            Self::DesfireFormatTag => 0x0F14,

            Self::GetSak => 0x1202,
        }
    }

    /// Reverse lookup, used by the virtual reader.
    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL.iter().copied().find(|op| op.code() == code)
    }

    pub const ALL: [Opcode; 25] = [
        Self::Reset,
        Self::GetVersionString,
        Self::Beep,
        Self::LedInit,
        Self::LedOn,
        Self::LedOff,
        Self::LedBlink,
        Self::SearchTag,
        Self::SetTagTypes,
        Self::HitagReadBlock,
        Self::HitagWriteBlock,
        Self::ClassicLogin,
        Self::ClassicReadBlock,
        Self::ClassicWriteBlock,
        Self::DesfireCreateApp,
        Self::DesfireSelectApp,
        Self::DesfireAuthenticate,
        Self::DesfireGetKeySettings,
        Self::DesfireReadData,
        Self::DesfireWriteData,
        Self::DesfireCreateDataFile,
        Self::DesfireChangeKeySettings,
        Self::DesfireChangeKey,
        Self::DesfireFormatTag,
        Self::GetSak,
    ];
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}", self.code())
    }
}
