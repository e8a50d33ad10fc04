//! Constants for the reader link, the tag layouts and the session loop.
//!
//! Values that describe the reader firmware or the tag memory layout are
//! fixed by the hardware. Values that only tune the host side (timeouts,
//! poll cadence) have a matching field in [`crate::config`] and the constant
//! is the default.

// Link

/// Serial speed of the reader's virtual COM port.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Time allowed for one reply to arrive (milliseconds).
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 3000;

/// Every request and reply is terminated by a carriage return.
pub const FRAME_DELIMITER: u8 = b'\r';

/// Upper bound on one reply line. Longest legitimate reply is a DESFire
/// read or a version string, both well below this.
pub const DEFAULT_MAX_REPLY_LEN: usize = 1024;

// Tag detection

/// A UID must be sighted this many times before it is reported.
pub const DETECTION_STABILITY_THRESHOLD: u8 = 2;

/// Maximum number of ID bytes the search command may return.
pub const SEARCH_MAX_ID_BYTES: u8 = 0x10;

/// Tag type byte reported by the reader for an HF MIFARE hit.
pub const HF_MIFARE_TAG_TYPE: u8 = 0x80;

// HITAG 1S

/// Block holding the encoded number.
pub const HITAG_DATA_BLOCK: u8 = 0x1C;

/// Size of a HITAG 1S block in bytes.
pub const HITAG_BLOCK_LEN: usize = 16;

/// Largest payload the block layout can carry (bits).
pub const HITAG_MAX_ID_BITS: u8 = 96;

// MIFARE Classic

/// Number of sectors on a 1K card.
pub const CLASSIC_SECTOR_COUNT: u8 = 16;

/// Size of a MIFARE Classic block in bytes.
pub const CLASSIC_BLOCK_LEN: usize = 16;

/// Universal transport key.
pub const CLASSIC_DEFAULT_KEY: [u8; 6] = [0xFF; 6];

/// Access bits `FF 07 80` followed by the general purpose byte `69`.
pub const CLASSIC_ACCESS_BITS: [u8; 4] = [0xFF, 0x07, 0x80, 0x69];

// DESFire

/// Crypto environment slot used for every DESFire command.
pub const DESFIRE_CRYPTO_ENV: u8 = 0;

/// Size of the data file holding the number.
pub const DESFIRE_FILE_SIZE: u32 = 4;

/// Access rights word of the number file (read key 1, everything else key 0).
pub const DESFIRE_FILE_ACCESS_RIGHTS: u16 = 0x1000;

/// Keys created with the provisioning application.
pub const DESFIRE_APP_KEY_COUNT: u32 = 2;

// Numbers

/// Serial numbers are always six decimal digits.
pub const NUMBER_DIGITS: usize = 6;

/// Width of one technology number range.
pub const NUMBER_RANGE_WIDTH: u32 = 100_000;

/// Smallest six digit number (zero padded).
pub const NUMBER_MIN: u32 = 0;

/// Largest six digit number.
pub const NUMBER_MAX: u32 = 999_999;

// Session

/// Pause between two poll rounds of the provisioning loop (milliseconds).
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 50;

/// Time a maintenance routine waits for the main loop to yield (milliseconds).
pub const DEFAULT_MAINTENANCE_GRACE_MS: u64 = 300;

/// Detection attempts made by a maintenance routine before giving up.
pub const MAINTENANCE_DETECT_ATTEMPTS: u32 = 50;

/// Pause between two maintenance detection attempts (milliseconds).
pub const MAINTENANCE_DETECT_INTERVAL_MS: u64 = 100;

/// State transitions kept for diagnostics.
pub const MAX_HISTORY_SIZE: usize = 100;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_number_bounds_are_six_digits() {
        assert_eq!(format!("{NUMBER_MIN:06}").len(), NUMBER_DIGITS);
        assert_eq!(NUMBER_MAX.to_string().len(), NUMBER_DIGITS);
    }

    #[test]
    fn test_range_width_fits_number_space() {
        assert_eq!((NUMBER_MAX + 1) % NUMBER_RANGE_WIDTH, 0);
    }
}
