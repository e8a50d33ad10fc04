//! Tag type codes reported by search and accepted by set-tag-types.
//!
//! Codes with bit 7 set are HF transponders, everything else is LF. Each
//! code enables one bit in its band's mask: `1 << (code & 0x1F)`.

pub const NONE: u8 = 0x00;
pub const EM4102: u8 = 0x40;
pub const HITAG1S: u8 = 0x41;
pub const DEISTER: u8 = 0x53;
pub const MIFARE: u8 = 0x80;

/// Mask bit enabling `tag_type` in its band. [`NONE`] enables nothing.
///
/// # Examples
///
/// ```
/// use keycreator_protocol::tag_type;
///
/// assert_eq!(tag_type::mask(tag_type::HITAG1S), 0b10);
/// assert_eq!(tag_type::mask(tag_type::NONE), 0);
/// ```
pub fn mask(tag_type: u8) -> u32 {
    if tag_type == NONE {
        0
    } else {
        1 << (tag_type & 0x1F)
    }
}

pub fn is_hf(tag_type: u8) -> bool {
    tag_type & 0x80 != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_masks_of_supported_types() {
        assert_eq!(mask(EM4102), 1);
        assert_eq!(mask(HITAG1S), 1 << 1);
        assert_eq!(mask(DEISTER), 1 << 0x13);
        assert_eq!(mask(MIFARE), 1);
    }

    #[test]
    fn test_band() {
        assert!(is_hf(MIFARE));
        assert!(!is_hf(HITAG1S));
        assert!(!is_hf(DEISTER));
    }
}
