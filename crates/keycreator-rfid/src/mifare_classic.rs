//! MIFARE Classic 1K number sector.
//!
//! The number sits in one data block of the configured sector, little endian,
//! `read_bytes` long at `skip_bytes` into the block. Provisioning also rewrites
//! the sector trailer so that key A becomes the customer key:
//!
//! ```text
//!  trailer:  key A (6) │ FF 07 80 │ 69 │ key B = FF FF FF FF FF FF
//! ```

use keycreator_core::{
    ClassicKey, Error, KeyType, MifareClassicParams, Result, SerialNumber,
    constants::{CLASSIC_ACCESS_BITS, CLASSIC_BLOCK_LEN, CLASSIC_DEFAULT_KEY, CLASSIC_SECTOR_COUNT},
};
use keycreator_hardware::Twn4Reader;
use tracing::{debug, info, warn};

/// Keys found on factory and transport cards, tried after the configured key.
pub const WELL_KNOWN_KEYS: [ClassicKey; 3] = [
    ClassicKey::new(CLASSIC_DEFAULT_KEY),
    ClassicKey::new([0xA0, 0xA1, 0xA2, 0xA3, 0xA4, 0xA5]),
    ClassicKey::new([0xD3, 0xF7, 0xD3, 0xF7, 0xD3, 0xF7]),
];

/// Key A candidates of the sector wipe.
pub const FORMAT_KEYS_A: [ClassicKey; 5] = [
    ClassicKey::new(CLASSIC_DEFAULT_KEY),
    ClassicKey::new([0xA0, 0xA1, 0xA2, 0xA3, 0xA4, 0xA5]),
    ClassicKey::new([0xD3, 0xF7, 0xD3, 0xF7, 0xD3, 0xF7]),
    ClassicKey::new([0x12, 0x34, 0x56, 0x78, 0x00, 0x00]),
    ClassicKey::new([0x11; 6]),
];

/// Key B candidates of the sector wipe.
pub const FORMAT_KEYS_B: [ClassicKey; 1] = [ClassicKey::new(CLASSIC_DEFAULT_KEY)];

/// Widest number a sector stores.
const MAX_NUMBER_BYTES: usize = 4;

/// Key that opened a sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassicLogin {
    pub key: ClassicKey,
    pub key_type: KeyType,
}

/// Number read during maintenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassicReadout {
    pub value: u32,
    /// The sector only opened with the transport key: the tag was never
    /// provisioned or has been wiped.
    pub default_key: bool,
}

/// Sector trailer carrying `key_a`, the fixed access bits and the transport key B.
pub fn trailer(key_a: &ClassicKey) -> [u8; CLASSIC_BLOCK_LEN] {
    let mut block = [0u8; CLASSIC_BLOCK_LEN];
    block[..6].copy_from_slice(key_a.as_bytes());
    block[6..10].copy_from_slice(&CLASSIC_ACCESS_BITS);
    block[10..].copy_from_slice(&CLASSIC_DEFAULT_KEY);
    block
}

fn number_window(params: &MifareClassicParams) -> Result<(usize, usize)> {
    let offset = usize::from(params.skip_bytes) % CLASSIC_BLOCK_LEN;
    let len = usize::from(params.read_bytes);
    if len == 0 || len > MAX_NUMBER_BYTES || offset + len > CLASSIC_BLOCK_LEN {
        return Err(Error::Encode(format!(
            "MIFARE Classic window of {len} bytes at offset {offset} does not fit a block"
        )));
    }
    if params.data_block() == params.trailer_block() {
        return Err(Error::Encode(format!(
            "MIFARE Classic skip bytes {} point at the sector trailer",
            params.skip_bytes
        )));
    }
    Ok((offset, len))
}

/// Data block holding `value` as configured.
///
/// # Errors
///
/// Returns `Error::Encode` if the window leaves the block or `value` does not
/// fit into `read_bytes`.
///
/// # Examples
///
/// ```
/// use keycreator_core::{ClassicKey, MifareClassicParams};
/// use keycreator_rfid::mifare_classic::number_block;
///
/// let params = MifareClassicParams {
///     key_a: ClassicKey::new([0x11; 6]),
///     key_b: None,
///     sector: 1,
///     skip_bytes: 2,
///     read_bytes: 3,
/// };
/// let block = number_block(&params, 0x01E240).unwrap();
/// assert_eq!(&block[..6], &[0x00, 0x00, 0x40, 0xE2, 0x01, 0x00]);
/// ```
pub fn number_block(params: &MifareClassicParams, value: u32) -> Result<[u8; CLASSIC_BLOCK_LEN]> {
    let (offset, len) = number_window(params)?;
    let bytes = value.to_le_bytes();
    if bytes[len..].iter().any(|b| *b != 0) {
        return Err(Error::Encode(format!(
            "Number {value} does not fit into {len} bytes"
        )));
    }

    let mut block = [0u8; CLASSIC_BLOCK_LEN];
    block[offset..offset + len].copy_from_slice(&bytes[..len]);
    Ok(block)
}

/// Little endian number stored in `block`.
pub fn number_from_block(params: &MifareClassicParams, block: &[u8; CLASSIC_BLOCK_LEN]) -> Result<u32> {
    let (offset, len) = number_window(params)?;
    Ok(block[offset..offset + len]
        .iter()
        .rev()
        .fold(0u32, |acc, b| (acc << 8) | u32::from(*b)))
}

/// `configured` ahead of `fixed`, without duplicates.
fn with_configured(configured: Option<ClassicKey>, fixed: &[ClassicKey]) -> Vec<ClassicKey> {
    let mut keys: Vec<ClassicKey> = configured.into_iter().collect();
    for key in fixed {
        if !keys.contains(key) {
            keys.push(*key);
        }
    }
    keys
}

/// Login, program, read and wipe routines for MIFARE Classic.
#[derive(Debug, Clone)]
pub struct MifareClassicDriver {
    reader: Twn4Reader,
}

impl MifareClassicDriver {
    pub fn new(reader: Twn4Reader) -> Self {
        Self { reader }
    }

    /// Try every key of `key_a` as key A, then every key of `key_b` as key B,
    /// against `sector` only.
    pub async fn login(
        &self,
        sector: u8,
        key_a: &[ClassicKey],
        key_b: &[ClassicKey],
    ) -> Result<Option<ClassicLogin>> {
        let candidates = key_a
            .iter()
            .map(|key| (key, KeyType::A))
            .chain(key_b.iter().map(|key| (key, KeyType::B)));

        for (key, key_type) in candidates {
            if self.reader.classic_login(key, key_type, sector).await? {
                debug!(sector, key_type = %key_type, "MIFARE Classic sector opened");
                return Ok(Some(ClassicLogin {
                    key: *key,
                    key_type,
                }));
            }
        }
        debug!(sector, "No candidate key opened MIFARE Classic sector");
        Ok(None)
    }

    /// Write the trailer and the number, then read the number back.
    ///
    /// # Errors
    ///
    /// - `Error::Authentication` if neither the configured key nor a well
    ///   known key opens the sector
    /// - `Error::VerificationFailed` if the read back differs
    pub async fn program(&self, params: &MifareClassicParams, number: SerialNumber) -> Result<()> {
        let data = number_block(params, number.value())?;

        let candidates = with_configured(Some(params.key_a), &WELL_KNOWN_KEYS);
        let login = self
            .login(params.sector, &candidates, &candidates)
            .await?
            .ok_or_else(|| Error::authentication(format!("MIFARE Classic sector {}", params.sector)))?;
        debug!(sector = params.sector, key_type = %login.key_type, "Programming MIFARE Classic sector");

        self.reader
            .classic_write_block(params.trailer_block(), &trailer(&params.key_a))
            .await?;
        self.reader.classic_write_block(params.data_block(), &data).await?;

        let read_back = self.read_number(params).await?;
        if read_back != number.value() {
            warn!(expected = %number, actual = read_back, "MIFARE Classic verification failed");
            return Err(Error::verification(number.to_padded(), format!("{read_back:06}")));
        }

        info!(sector = params.sector, number = %number, "MIFARE Classic number written and verified");
        Ok(())
    }

    /// Read the number from the already opened sector.
    pub async fn read_number(&self, params: &MifareClassicParams) -> Result<u32> {
        let block = self.reader.classic_read_block(params.data_block()).await?;
        number_from_block(params, &block)
    }

    /// Open the sector with the configured key A, key B, then the transport
    /// key, and read the number.
    ///
    /// # Errors
    ///
    /// `Error::Authentication` if none of the keys opens the sector.
    pub async fn inspect(&self, params: &MifareClassicParams) -> Result<ClassicReadout> {
        let default = ClassicKey::new(CLASSIC_DEFAULT_KEY);
        let key_b: Vec<ClassicKey> = params.key_b.into_iter().collect();

        let login = match self.login(params.sector, &[params.key_a], &key_b).await? {
            Some(login) => login,
            None => self
                .login(params.sector, &[default], &[])
                .await?
                .ok_or_else(|| Error::authentication(format!("MIFARE Classic sector {}", params.sector)))?,
        };

        let value = self.read_number(params).await?;
        let default_key = login.key == default && params.key_a != default;
        debug!(sector = params.sector, value, default_key, "MIFARE Classic inspected");
        Ok(ClassicReadout { value, default_key })
    }

    /// Wipe sectors 0 to 15 back to transport keys and zeroed data.
    ///
    /// The configured keys, if any, are tried ahead of the fixed candidate
    /// lists. Sectors no key opens are skipped and reported at the end.
    ///
    /// # Errors
    ///
    /// `Error::Authentication` naming the sectors that stayed closed.
    pub async fn format(&self, configured: Option<&MifareClassicParams>) -> Result<()> {
        let key_a = with_configured(configured.map(|p| p.key_a), &FORMAT_KEYS_A);
        let key_b = with_configured(configured.and_then(|p| p.key_b), &FORMAT_KEYS_B);

        let blank = trailer(&ClassicKey::new(CLASSIC_DEFAULT_KEY));
        let mut closed = Vec::new();

        for sector in 0..CLASSIC_SECTOR_COUNT {
            if self.login(sector, &key_a, &key_b).await?.is_none() {
                warn!(sector, "MIFARE Classic sector skipped, no key matched");
                closed.push(sector);
                continue;
            }

            let first = sector * 4;
            // Block 0 is the manufacturer block.
            let data_blocks = if sector == 0 { 1..3 } else { 0..3 };
            for offset in data_blocks {
                self.reader
                    .classic_write_block(first + offset, &[0; CLASSIC_BLOCK_LEN])
                    .await?;
            }
            self.reader.classic_write_block(first + 3, &blank).await?;
            debug!(sector, "MIFARE Classic sector wiped");
        }

        if closed.is_empty() {
            info!("MIFARE Classic formatted");
            Ok(())
        } else {
            Err(Error::authentication(format!(
                "MIFARE Classic sectors {closed:?}"
            )))
        }
    }
}
