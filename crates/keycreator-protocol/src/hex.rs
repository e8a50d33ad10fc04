//! Hex helpers for request parameters and reply payloads.
//!
//! Multi-byte integers travel little-endian on the wire: `0x1000` is sent
//! as `"0010"`, `0x00F001` as `"01F00000"`.

use keycreator_core::ProtocolError;

/// Two uppercase hex digits.
pub fn u8_hex(value: u8) -> String {
    format!("{value:02X}")
}

/// Little-endian u16 as four hex digits.
pub fn u16_le_hex(value: u16) -> String {
    bytes_hex(&value.to_le_bytes())
}

/// Little-endian u32 as eight hex digits.
///
/// # Examples
///
/// ```
/// use keycreator_protocol::hex::u32_le_hex;
///
/// assert_eq!(u32_le_hex(0x00F001), "01F00000");
/// ```
pub fn u32_le_hex(value: u32) -> String {
    bytes_hex(&value.to_le_bytes())
}

/// Uppercase hex of a byte slice, no separators.
pub fn bytes_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).collect()
}

/// Reverse the byte order of a u16.
pub fn swap16(value: u16) -> u16 {
    value.swap_bytes()
}

/// Reverse the byte order of a u32.
pub fn swap32(value: u32) -> u32 {
    value.swap_bytes()
}

/// Parse a hex string into bytes.
///
/// # Errors
///
/// Returns `ProtocolError::MalformedReply` on odd length or non-hex input.
pub fn parse_bytes(hex: &str) -> Result<Vec<u8>, ProtocolError> {
    if hex.len() % 2 != 0 {
        return Err(ProtocolError::malformed(hex));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| parse_u8(hex, i))
        .collect()
}

/// Parse the byte whose two digits start at character `offset`.
pub fn parse_u8(hex: &str, offset: usize) -> Result<u8, ProtocolError> {
    hex.get(offset..offset + 2)
        .and_then(|pair| u8::from_str_radix(pair, 16).ok())
        .ok_or_else(|| ProtocolError::malformed(hex))
}

/// Parse a little-endian u32 whose eight digits start at character `offset`.
pub fn parse_u32_le(hex: &str, offset: usize) -> Result<u32, ProtocolError> {
    let mut bytes = [0u8; 4];
    for (i, byte) in bytes.iter_mut().enumerate() {
        *byte = parse_u8(hex, offset + i * 2)?;
    }
    Ok(u32::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0x1000, "0010")]
    #[case(0x0001, "0100")]
    #[case(0xABCD, "CDAB")]
    fn test_u16_le_hex(#[case] value: u16, #[case] expected: &str) {
        assert_eq!(u16_le_hex(value), expected);
    }

    #[test]
    fn test_u32_le_roundtrip_at_offset() {
        let hex = format!("01{}", u32_le_hex(0x12345678));
        assert_eq!(parse_u32_le(&hex, 2).unwrap(), 0x12345678);
    }

    #[test]
    fn test_swap32_matches_le_encoding() {
        let mask = 1u32 << 0x0A;
        assert_eq!(format!("{:08X}", swap32(mask)), u32_le_hex(mask));
    }

    #[test]
    fn test_parse_bytes_rejects_garbage() {
        assert!(parse_bytes("0").is_err());
        assert!(parse_bytes("0G").is_err());
        assert_eq!(parse_bytes("0aFF").unwrap(), vec![0x0A, 0xFF]);
        assert!(parse_bytes("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_u8_out_of_bounds() {
        assert!(parse_u8("01", 2).is_err());
    }
}
