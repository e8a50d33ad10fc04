//! MIFARE Classic / DESFire disambiguation.
//!
//! Search reports every ISO 14443A tag as generic MIFARE. The SAK byte of the
//! selected tag tells the families apart:
//!
//! | SAK bit | meaning |
//! |---|---|
//! | bit 1 set | unsupported or colliding tag |
//! | bit 3 set | MIFARE Classic |
//! | neither | MIFARE DESFire |

use keycreator_core::{Result, Technology};
use keycreator_hardware::Twn4Reader;
use std::fmt;
use tracing::debug;

/// Outcome of SAK classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MifareClass {
    Classic,
    Desfire,
    /// SAK bit 1 set, or no SAK available.
    Error,
}

impl MifareClass {
    /// Classify a SAK byte.
    ///
    /// # Examples
    ///
    /// ```
    /// use keycreator_rfid::MifareClass;
    ///
    /// assert_eq!(MifareClass::from_sak(0x08), MifareClass::Classic);
    /// assert_eq!(MifareClass::from_sak(0x20), MifareClass::Desfire);
    /// assert_eq!(MifareClass::from_sak(0x02), MifareClass::Error);
    /// ```
    pub fn from_sak(sak: u8) -> Self {
        if sak & (1 << 1) != 0 {
            Self::Error
        } else if sak & (1 << 3) != 0 {
            Self::Classic
        } else {
            Self::Desfire
        }
    }

    pub fn technology(&self) -> Option<Technology> {
        match self {
            Self::Classic => Some(Technology::MifareClassic),
            Self::Desfire => Some(Technology::MifareDesfire),
            Self::Error => None,
        }
    }
}

impl fmt::Display for MifareClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Classic => write!(f, "MIFARE_CLASSIC"),
            Self::Desfire => write!(f, "MIFARE_DESFIRE"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// Queries the SAK of the tag selected by the last search.
#[derive(Debug, Clone)]
pub struct TagClassifier {
    reader: Twn4Reader,
}

impl TagClassifier {
    pub fn new(reader: Twn4Reader) -> Self {
        Self { reader }
    }

    pub async fn classify(&self) -> Result<MifareClass> {
        let class = match self.reader.get_sak().await? {
            Some(sak) => {
                let class = MifareClass::from_sak(sak);
                debug!(sak = format_args!("0x{sak:02X}"), class = %class, "Classified MIFARE tag");
                class
            }
            None => {
                debug!("No SAK available");
                MifareClass::Error
            }
        };
        Ok(class)
    }
}
