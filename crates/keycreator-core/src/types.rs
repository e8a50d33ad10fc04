use crate::{
    Result,
    constants::{NUMBER_DIGITS, NUMBER_MAX},
    error::Error,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Token technology the reader can detect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Technology {
    Hitag1S,
    MifareClassic,
    MifareDesfire,
    Deister,
    Em,
}

impl Technology {
    /// Every technology, in search priority order.
    pub const ALL: [Technology; 5] = [
        Technology::Hitag1S,
        Technology::MifareClassic,
        Technology::MifareDesfire,
        Technology::Deister,
        Technology::Em,
    ];

    /// Query parameter naming this technology's UID in ERP records.
    pub fn erp_uid_field(&self) -> &'static str {
        match self {
            Self::Hitag1S => "hitag_uid",
            Self::MifareClassic => "mfcl_uid",
            Self::MifareDesfire => "mfdf_uid",
            Self::Deister => "deister_uid",
            Self::Em => "em_uid",
        }
    }

    /// Whether the token needs data written to it during provisioning.
    ///
    /// Deister and EM carry a fixed factory ID.
    pub fn is_programmable(&self) -> bool {
        matches!(
            self,
            Self::Hitag1S | Self::MifareClassic | Self::MifareDesfire
        )
    }
}

impl fmt::Display for Technology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hitag1S => write!(f, "HITAG1S"),
            Self::MifareClassic => write!(f, "MIFARE_CLASSIC"),
            Self::MifareDesfire => write!(f, "MIFARE_DESFIRE"),
            Self::Deister => write!(f, "DEISTER"),
            Self::Em => write!(f, "EM"),
        }
    }
}

/// Ordered set of technologies.
///
/// Two sets are compared for exact equality when checking a token against
/// its configuration; subset or superset is a mismatch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TechnologySet(BTreeSet<Technology>);

impl TechnologySet {
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    pub fn insert(&mut self, technology: Technology) -> bool {
        self.0.insert(technology)
    }

    pub fn contains(&self, technology: Technology) -> bool {
        self.0.contains(&technology)
    }

    /// True when every technology in `other` is also in `self`.
    pub fn is_superset(&self, other: &TechnologySet) -> bool {
        self.0.is_superset(&other.0)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Technology> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<Technology> for TechnologySet {
    fn from_iter<I: IntoIterator<Item = Technology>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for TechnologySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, technology) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{technology}")?;
        }
        write!(f, "}}")
    }
}

/// Tag unique identifier as reported by the reader.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Uid(Vec<u8>);

impl Uid {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Parse a UID from its hex representation (case-insensitive).
    ///
    /// # Errors
    ///
    /// Returns `Error::Decode` if the string is empty, has odd length or
    /// contains non-hex characters.
    ///
    /// # Examples
    ///
    /// ```
    /// use keycreator_core::Uid;
    ///
    /// let uid = Uid::from_hex("044a3c91").unwrap();
    /// assert_eq!(uid.as_bytes(), &[0x04, 0x4A, 0x3C, 0x91]);
    /// assert_eq!(uid.to_hex(), "044A3C91");
    /// ```
    pub fn from_hex(hex: &str) -> Result<Self> {
        if hex.is_empty() || hex.len() % 2 != 0 {
            return Err(Error::Decode(format!("Invalid UID hex {hex:?}")));
        }
        let bytes = (0..hex.len())
            .step_by(2)
            .map(|i| {
                hex.get(i..i + 2)
                    .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                    .ok_or_else(|| Error::Decode(format!("Invalid UID hex {hex:?}")))
            })
            .collect::<Result<Vec<u8>>>()?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Uppercase hex, no separators.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02X}")).collect()
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl TryFrom<String> for Uid {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::from_hex(&value)
    }
}

impl From<Uid> for String {
    fn from(uid: Uid) -> Self {
        uid.to_hex()
    }
}

/// One sighting of a token, produced by tag search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagDetection {
    pub uid: Uid,
    pub technology: Technology,
    pub id_bit_count: u8,
}

impl TagDetection {
    pub fn new(uid: Uid, technology: Technology, id_bit_count: u8) -> Self {
        Self {
            uid,
            technology,
            id_bit_count,
        }
    }
}

impl fmt::Display for TagDetection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.technology, self.uid)
    }
}

/// Six digit serial number written to every token of one physical key.
///
/// Stored as an integer, displayed zero padded. Parsing from text is strict:
/// exactly six ASCII digits, so `"012345"` is accepted and `"12345"` is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SerialNumber(u32);

impl SerialNumber {
    /// Parse a serial number from its six digit representation.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidNumber` unless `input` is exactly six ASCII
    /// digits.
    ///
    /// # Examples
    ///
    /// ```
    /// use keycreator_core::SerialNumber;
    ///
    /// assert_eq!(SerialNumber::parse("012345").unwrap().value(), 12345);
    /// assert!(SerialNumber::parse("12345").is_err());
    /// assert!(SerialNumber::parse("1234567").is_err());
    /// ```
    pub fn parse(input: &str) -> Result<Self> {
        if input.len() != NUMBER_DIGITS || !input.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::InvalidNumber {
                input: input.to_string(),
            });
        }
        input
            .parse::<u32>()
            .map(Self)
            .map_err(|_| Error::InvalidNumber {
                input: input.to_string(),
            })
    }

    /// Build from an integer that fits six digits.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidNumber` if `value` exceeds 999999.
    pub fn new(value: u32) -> Result<Self> {
        if value > NUMBER_MAX {
            return Err(Error::InvalidNumber {
                input: value.to_string(),
            });
        }
        Ok(Self(value))
    }

    pub fn value(&self) -> u32 {
        self.0
    }

    /// The following number.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidNumber` past 999999.
    pub fn next(&self) -> Result<Self> {
        Self::new(self.0 + 1)
    }

    /// Zero padded six digit string.
    pub fn to_padded(&self) -> String {
        format!("{:06}", self.0)
    }
}

impl fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:06}", self.0)
    }
}

impl std::str::FromStr for SerialNumber {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SerialNumber {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<SerialNumber> for String {
    fn from(number: SerialNumber) -> Self {
        number.to_padded()
    }
}

/// MIFARE Classic key slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyType {
    A,
    B,
}

impl KeyType {
    /// Wire code of the key slot.
    pub fn code(&self) -> u8 {
        match self {
            Self::A => 0x00,
            Self::B => 0x01,
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::A => write!(f, "A"),
            Self::B => write!(f, "B"),
        }
    }
}

/// Six byte MIFARE Classic sector key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClassicKey([u8; 6]);

impl ClassicKey {
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// Parse up to twelve hex digits, left padded with zeros.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for empty, overlong or non-hex input.
    pub fn from_hex(hex: &str) -> Result<Self> {
        let hex = hex.trim();
        if hex.is_empty() || hex.len() > 12 {
            return Err(Error::Config(format!("Invalid MIFARE key {hex:?}")));
        }
        let value = u64::from_str_radix(hex, 16)
            .map_err(|_| Error::Config(format!("Invalid MIFARE key {hex:?}")))?;
        let be = value.to_be_bytes();
        let mut bytes = [0u8; 6];
        bytes.copy_from_slice(&be[2..]);
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02X}")).collect()
    }
}

impl fmt::Debug for ClassicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClassicKey({})", self.to_hex())
    }
}

impl TryFrom<String> for ClassicKey {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::from_hex(&value)
    }
}

impl From<ClassicKey> for String {
    fn from(key: ClassicKey) -> Self {
        key.to_hex()
    }
}

/// DESFire cipher of a key slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DesfireKeyType {
    TripleDes,
    ThreeKeyTripleDes,
    Aes,
}

impl DesfireKeyType {
    /// Reader code of the cipher.
    pub fn code(&self) -> u32 {
        match self {
            Self::TripleDes => 0,
            Self::ThreeKeyTripleDes => 1,
            Self::Aes => 2,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::TripleDes),
            1 => Some(Self::ThreeKeyTripleDes),
            2 => Some(Self::Aes),
            _ => None,
        }
    }

    /// Key length in bytes.
    pub fn key_len(&self) -> usize {
        match self {
            Self::TripleDes | Self::Aes => 16,
            Self::ThreeKeyTripleDes => 24,
        }
    }
}

impl fmt::Display for DesfireKeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TripleDes => write!(f, "3DES"),
            Self::ThreeKeyTripleDes => write!(f, "3K3DES"),
            Self::Aes => write!(f, "AES"),
        }
    }
}

/// DESFire key material, stored left aligned.
///
/// Shorter keys are zero filled on the right up to the cipher's key length
/// when sent to the reader.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DesfireKey(Vec<u8>);

impl DesfireKey {
    /// The factory default all-zero key.
    pub fn zero() -> Self {
        Self(vec![0; 16])
    }

    /// Parse hex digits. An odd trailing digit is completed with `0`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for non-hex input or more than 24 bytes.
    ///
    /// # Examples
    ///
    /// ```
    /// use keycreator_core::DesfireKey;
    ///
    /// let key = DesfireKey::from_hex("2").unwrap();
    /// assert_eq!(key.as_bytes(), &[0x20]);
    /// ```
    pub fn from_hex(hex: &str) -> Result<Self> {
        let mut digits = hex.trim().to_string();
        if digits.len() % 2 != 0 {
            digits.push('0');
        }
        if digits.len() > 48 {
            return Err(Error::Config(format!("DESFire key too long: {hex:?}")));
        }
        let bytes = (0..digits.len())
            .step_by(2)
            .map(|i| {
                digits
                    .get(i..i + 2)
                    .and_then(|pair| u8::from_str_radix(pair, 16).ok())
                    .ok_or_else(|| Error::Config(format!("Invalid DESFire key {hex:?}")))
            })
            .collect::<Result<Vec<u8>>>()?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// True when every byte is zero.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Key bytes right padded with zeros to the cipher length.
    ///
    /// # Errors
    ///
    /// Returns `Error::Encode` if the key is longer than the cipher allows.
    pub fn padded(&self, key_type: DesfireKeyType) -> Result<Vec<u8>> {
        let len = key_type.key_len();
        if self.0.len() > len {
            return Err(Error::Encode(format!(
                "Key has {} bytes, {key_type} takes {len}",
                self.0.len()
            )));
        }
        let mut bytes = self.0.clone();
        bytes.resize(len, 0);
        Ok(bytes)
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02X}")).collect()
    }
}

impl fmt::Debug for DesfireKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DesfireKey(<{} bytes>)", self.0.len())
    }
}

impl TryFrom<String> for DesfireKey {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::from_hex(&value)
    }
}

impl From<DesfireKey> for String {
    fn from(key: DesfireKey) -> Self {
        key.to_hex()
    }
}

/// HITAG 1S parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HitagParams {
    /// Number block is only written when the customer uses Feig coding.
    pub feig_coding: bool,
}

/// MIFARE Classic parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MifareClassicParams {
    pub key_a: ClassicKey,
    #[serde(default)]
    pub key_b: Option<ClassicKey>,
    pub sector: u8,
    /// Offset of the number inside the sector's data area.
    pub skip_bytes: u8,
    /// Number of bytes holding the number.
    pub read_bytes: u8,
}

impl MifareClassicParams {
    /// Absolute block holding the number.
    pub fn data_block(&self) -> u8 {
        (self.sector << 2) + (self.skip_bytes >> 4)
    }

    /// Absolute block of the sector trailer.
    pub fn trailer_block(&self) -> u8 {
        (self.sector << 2) + 3
    }
}

/// MIFARE DESFire parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesfireParams {
    pub master_key: DesfireKey,
    pub app_master_key: DesfireKey,
    pub app_read_key: DesfireKey,
    pub app_id: u32,
    pub file_id: u8,
}

/// Per-customer description of what a physical key must carry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransponderConfiguration {
    pub name: String,
    pub customer: String,
    #[serde(default)]
    pub customer_name: Option<String>,
    #[serde(default)]
    pub licence: Option<String>,
    #[serde(default)]
    pub licence_name: Option<String>,
    #[serde(default)]
    pub form: Option<String>,
    #[serde(default)]
    pub hitag: Option<HitagParams>,
    #[serde(default)]
    pub mifare_classic: Option<MifareClassicParams>,
    #[serde(default)]
    pub mifare_desfire: Option<DesfireParams>,
    #[serde(default)]
    pub deister: bool,
    #[serde(default)]
    pub em: bool,
    /// LEGIC is recorded but never detected or programmed.
    #[serde(default)]
    pub legic: bool,
}

impl TransponderConfiguration {
    pub fn new(name: impl Into<String>, customer: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            customer: customer.into(),
            customer_name: None,
            licence: None,
            licence_name: None,
            form: None,
            hitag: None,
            mifare_classic: None,
            mifare_desfire: None,
            deister: false,
            em: false,
            legic: false,
        }
    }

    pub fn with_hitag(mut self, params: HitagParams) -> Self {
        self.hitag = Some(params);
        self
    }

    pub fn with_mifare_classic(mut self, params: MifareClassicParams) -> Self {
        self.mifare_classic = Some(params);
        self
    }

    pub fn with_mifare_desfire(mut self, params: DesfireParams) -> Self {
        self.mifare_desfire = Some(params);
        self
    }

    pub fn with_deister(mut self) -> Self {
        self.deister = true;
        self
    }

    pub fn with_em(mut self) -> Self {
        self.em = true;
        self
    }

    /// Technologies a token must expose, exactly.
    pub fn required_technologies(&self) -> TechnologySet {
        let mut set = TechnologySet::new();
        if self.hitag.is_some() {
            set.insert(Technology::Hitag1S);
        }
        if self.mifare_classic.is_some() {
            set.insert(Technology::MifareClassic);
        }
        if self.mifare_desfire.is_some() {
            set.insert(Technology::MifareDesfire);
        }
        if self.deister {
            set.insert(Technology::Deister);
        }
        if self.em {
            set.insert(Technology::Em);
        }
        set
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("012345", 12345)]
    #[case("000000", 0)]
    #[case("999999", 999_999)]
    fn test_serial_number_accepts_six_digits(#[case] input: &str, #[case] value: u32) {
        let number = SerialNumber::parse(input).unwrap();
        assert_eq!(number.value(), value);
        assert_eq!(number.to_string(), input);
    }

    #[rstest]
    #[case("12345")]
    #[case("1234567")]
    #[case("12a456")]
    #[case("")]
    #[case("+12345")]
    fn test_serial_number_rejects(#[case] input: &str) {
        assert!(matches!(
            SerialNumber::parse(input),
            Err(Error::InvalidNumber { .. })
        ));
    }

    #[test]
    fn test_serial_number_next_stops_at_max() {
        let last = SerialNumber::new(999_999).unwrap();
        assert!(last.next().is_err());
        assert_eq!(SerialNumber::new(41).unwrap().next().unwrap().to_string(), "000042");
    }

    #[test]
    fn test_uid_rejects_odd_hex() {
        assert!(Uid::from_hex("ABC").is_err());
        assert!(Uid::from_hex("").is_err());
        assert!(Uid::from_hex("ZZ").is_err());
    }

    #[test]
    fn test_classic_key_left_pads() {
        let key = ClassicKey::from_hex("1").unwrap();
        assert_eq!(key.as_bytes(), &[0, 0, 0, 0, 0, 1]);
        assert_eq!(ClassicKey::from_hex("ffffffffffff").unwrap().as_bytes(), &[0xFF; 6]);
        assert!(ClassicKey::from_hex("1234567890123").is_err());
    }

    #[test]
    fn test_desfire_key_padding() {
        let key = DesfireKey::from_hex("aabb").unwrap();
        let padded = key.padded(DesfireKeyType::Aes).unwrap();
        assert_eq!(padded.len(), 16);
        assert_eq!(&padded[..2], &[0xAA, 0xBB]);
        assert!(padded[2..].iter().all(|b| *b == 0));
        assert_eq!(key.padded(DesfireKeyType::ThreeKeyTripleDes).unwrap().len(), 24);
    }

    #[test]
    fn test_desfire_key_too_long_for_cipher() {
        let key = DesfireKey::from_hex(&"11".repeat(24)).unwrap();
        assert!(key.padded(DesfireKeyType::Aes).is_err());
    }

    #[test]
    fn test_required_technologies_ignores_legic() {
        let mut config = TransponderConfiguration::new("cfg", "CUST-1")
            .with_hitag(HitagParams { feig_coding: true })
            .with_em();
        config.legic = true;
        let required = config.required_technologies();
        assert_eq!(
            required,
            TechnologySet::from_iter([Technology::Hitag1S, Technology::Em])
        );
    }

    #[test]
    fn test_classic_block_addresses() {
        let params = MifareClassicParams {
            key_a: ClassicKey::new([1; 6]),
            key_b: None,
            sector: 2,
            skip_bytes: 20,
            read_bytes: 4,
        };
        assert_eq!(params.data_block(), 9);
        assert_eq!(params.trailer_block(), 11);
    }

    #[test]
    fn test_configuration_serde_roundtrip_keeps_keys() {
        let config = TransponderConfiguration::new("cfg", "CUST-1").with_mifare_desfire(DesfireParams {
            master_key: DesfireKey::from_hex("00112233445566778899AABBCCDDEEFF").unwrap(),
            app_master_key: DesfireKey::zero(),
            app_read_key: DesfireKey::from_hex("01").unwrap(),
            app_id: 0x00F001,
            file_id: 1,
        });
        let json = serde_json::to_string(&config).unwrap();
        let back: TransponderConfiguration = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
