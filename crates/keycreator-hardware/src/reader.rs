//! Typed command surface of the reader.
//!
//! Every method builds one [`Request`], sends it through the
//! [`CommandChannel`] and decodes the reply payload. Methods whose reply
//! carries a result byte return `Ok(false)` / `Ok(None)` for a negative
//! result where the caller is expected to branch on it (search, login,
//! authenticate), and `Error::CommandRejected` everywhere else.

use crate::channel::CommandChannel;
use keycreator_core::{
    ClassicKey, DesfireKey, DesfireKeyType, Error, KeyType, Result,
    constants::{
        CLASSIC_BLOCK_LEN, DESFIRE_CRYPTO_ENV, DESFIRE_FILE_SIZE, HITAG_BLOCK_LEN,
        SEARCH_MAX_ID_BYTES,
    },
};
use keycreator_protocol::{Opcode, Reply, Request, hex};
use tracing::debug;

/// Answer length requested from get-version-string.
const VERSION_MAX_LEN: u8 = 0xFF;

/// DESFire EV1 authentication mode.
const DESFIRE_AUTH_EV1: u8 = 1;

/// Standard data file.
const DESFIRE_FILE_TYPE_STANDARD: u8 = 0;

/// Plain communication.
const DESFIRE_COMM_PLAIN: u8 = 0;

/// A tag found by search-tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchReply {
    pub tag_type: u8,
    pub id_bit_count: u8,
    pub uid: Vec<u8>,
}

/// Answer of DESFire get-key-settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DesfireKeySettingsReply {
    pub settings: u8,
    pub num_keys: u32,
    /// `None` when the tag reports a key type code the reader does not know.
    pub key_type: Option<DesfireKeyType>,
}

/// Arguments of DESFire change-key.
#[derive(Debug, Clone, Copy)]
pub struct DesfireKeyChange<'a> {
    pub key_no: u8,
    pub old: &'a DesfireKey,
    pub new: &'a DesfireKey,
    /// Type of both keys.
    pub key_type: DesfireKeyType,
    /// Key settings of the application the key belongs to.
    pub settings: u8,
    pub num_keys: u32,
}

/// Reader commands over a [`CommandChannel`].
///
/// Cheap to clone; clones share the channel and therefore its FIFO order.
#[derive(Debug, Clone)]
pub struct Twn4Reader {
    channel: CommandChannel,
}

impl Twn4Reader {
    pub fn new(channel: CommandChannel) -> Self {
        Self { channel }
    }

    pub fn channel(&self) -> &CommandChannel {
        &self.channel
    }

    async fn call(&self, request: Request) -> Result<Reply> {
        self.channel.send(request).await
    }

    /// Send and require a positive result byte.
    async fn call_ok(&self, request: Request, operation: &str) -> Result<Reply> {
        let reply = self.call(request).await?;
        if reply.result()? {
            Ok(reply)
        } else {
            debug!(operation, "Command rejected");
            Err(Error::rejected(operation))
        }
    }

    // System

    pub async fn reset(&self) -> Result<()> {
        self.call(Request::new(Opcode::Reset)).await?;
        Ok(())
    }

    /// Firmware version, e.g. `TWN4/B1.64/CCL4.14/PRS1.06`.
    pub async fn version_string(&self) -> Result<String> {
        let reply = self
            .call(Request::new(Opcode::GetVersionString).param_u8(VERSION_MAX_LEN))
            .await?;
        let bytes = reply.bytes()?;
        let Some((&len, text)) = bytes.split_first() else {
            return Err(keycreator_core::ProtocolError::malformed(reply.payload()).into());
        };
        let text = text.get(..usize::from(len)).unwrap_or(text);
        Ok(String::from_utf8_lossy(text).into_owned())
    }

    // Peripherals

    pub async fn beep(&self, volume: u8, frequency: u16, on_ms: u16, off_ms: u16) -> Result<()> {
        let request = Request::new(Opcode::Beep)
            .param_u8(volume)
            .param_u16_le(frequency)
            .param_u16_le(on_ms)
            .param_u16_le(off_ms);
        self.call(request).await?;
        Ok(())
    }

    pub async fn led_init(&self, leds: u8) -> Result<()> {
        self.call(Request::new(Opcode::LedInit).param_u8(leds)).await?;
        Ok(())
    }

    pub async fn led_on(&self, leds: u8) -> Result<()> {
        self.call(Request::new(Opcode::LedOn).param_u8(leds)).await?;
        Ok(())
    }

    pub async fn led_off(&self, leds: u8) -> Result<()> {
        self.call(Request::new(Opcode::LedOff).param_u8(leds)).await?;
        Ok(())
    }

    pub async fn led_blink(&self, leds: u8, on_ms: u16, off_ms: u16) -> Result<()> {
        let request = Request::new(Opcode::LedBlink)
            .param_u8(leds)
            .param_u16_le(on_ms)
            .param_u16_le(off_ms);
        self.call(request).await?;
        Ok(())
    }

    // Search

    /// Restrict search to the tag types enabled in the LF and HF masks.
    pub async fn set_tag_types(&self, lf_mask: u32, hf_mask: u32) -> Result<()> {
        let request = Request::new(Opcode::SetTagTypes)
            .param_u32_le(lf_mask)
            .param_u32_le(hf_mask);
        self.call(request).await?;
        Ok(())
    }

    /// Look for a tag of an enabled type. `None` when the field is empty.
    pub async fn search_tag(&self) -> Result<Option<SearchReply>> {
        let reply = self
            .call(Request::new(Opcode::SearchTag).param_u8(SEARCH_MAX_ID_BYTES))
            .await?;
        if !reply.result()? {
            return Ok(None);
        }

        let tag_type = reply.byte(1)?;
        let id_bit_count = reply.byte(2)?;
        let id_len = usize::from(reply.byte(3)?);
        let uid_hex = reply
            .payload()
            .get(8..8 + id_len * 2)
            .ok_or_else(|| keycreator_core::ProtocolError::malformed(reply.payload()))?;

        Ok(Some(SearchReply {
            tag_type,
            id_bit_count,
            uid: hex::parse_bytes(uid_hex)?,
        }))
    }

    /// SAK of the selected ISO 14443A tag. `None` if no tag is selected.
    pub async fn get_sak(&self) -> Result<Option<u8>> {
        let reply = self.call(Request::new(Opcode::GetSak)).await?;
        if !reply.result()? {
            return Ok(None);
        }
        Ok(Some(reply.byte(1)?))
    }

    // HITAG 1S

    pub async fn hitag_read_block(&self, block: u8) -> Result<[u8; HITAG_BLOCK_LEN]> {
        let reply = self
            .call_ok(
                Request::new(Opcode::HitagReadBlock).param_u8(block),
                "HITAG read block",
            )
            .await?;
        // Result byte, length byte, then the block.
        block_from(&reply, 2)
    }

    pub async fn hitag_write_block(&self, block: u8, data: &[u8; HITAG_BLOCK_LEN]) -> Result<()> {
        let request = Request::new(Opcode::HitagWriteBlock)
            .param_u8(block)
            .param_bytes(data);
        self.call_ok(request, "HITAG write block").await?;
        Ok(())
    }

    // MIFARE Classic

    /// Authenticate `sector` with `key`. `Ok(false)` when the key is wrong.
    pub async fn classic_login(&self, key: &ClassicKey, key_type: KeyType, sector: u8) -> Result<bool> {
        let request = Request::new(Opcode::ClassicLogin)
            .param_bytes(key.as_bytes())
            .param_u8(key_type.code())
            .param_u8(sector);
        Ok(self.call(request).await?.result()?)
    }

    pub async fn classic_read_block(&self, block: u8) -> Result<[u8; CLASSIC_BLOCK_LEN]> {
        let reply = self
            .call_ok(
                Request::new(Opcode::ClassicReadBlock).param_u8(block),
                "MIFARE Classic read block",
            )
            .await?;
        block_from(&reply, 1)
    }

    pub async fn classic_write_block(&self, block: u8, data: &[u8; CLASSIC_BLOCK_LEN]) -> Result<()> {
        let request = Request::new(Opcode::ClassicWriteBlock)
            .param_u8(block)
            .param_bytes(data);
        self.call_ok(request, "MIFARE Classic write block").await?;
        Ok(())
    }

    // DESFire

    fn desfire(opcode: Opcode) -> Request {
        Request::new(opcode).param_u8(DESFIRE_CRYPTO_ENV)
    }

    /// EV1 authenticate `key_no` of the selected application.
    ///
    /// # Errors
    ///
    /// Returns `Error::Encode` if `key` is longer than `key_type` allows.
    pub async fn desfire_authenticate(
        &self,
        key_no: u8,
        key: &DesfireKey,
        key_type: DesfireKeyType,
    ) -> Result<bool> {
        let request = Self::desfire(Opcode::DesfireAuthenticate)
            .param_u8(key_no)
            .param_prefixed(&key.padded(key_type)?)?
            .param_u8(key_type.code() as u8)
            .param_u8(DESFIRE_AUTH_EV1);
        Ok(self.call(request).await?.result()?)
    }

    /// Key settings of the selected application. `None` when the tag refuses.
    pub async fn desfire_get_key_settings(&self) -> Result<Option<DesfireKeySettingsReply>> {
        let reply = self
            .call(Self::desfire(Opcode::DesfireGetKeySettings))
            .await?;
        if !reply.result()? {
            return Ok(None);
        }
        let payload = reply.payload();
        Ok(Some(DesfireKeySettingsReply {
            settings: reply.byte(1)?,
            num_keys: hex::parse_u32_le(payload, 4)?,
            key_type: DesfireKeyType::from_code(hex::parse_u32_le(payload, 12)?),
        }))
    }

    pub async fn desfire_change_key_settings(
        &self,
        settings: u8,
        num_keys: u32,
        key_type: DesfireKeyType,
    ) -> Result<()> {
        let request = Self::desfire(Opcode::DesfireChangeKeySettings)
            .param_u8(settings)
            .param_u32_le(num_keys)
            .param_u32_le(key_type.code());
        self.call_ok(request, "DESFire change key settings").await?;
        Ok(())
    }

    pub async fn desfire_change_key(&self, change: DesfireKeyChange<'_>) -> Result<()> {
        let request = Self::desfire(Opcode::DesfireChangeKey)
            .param_u8(change.key_no)
            .param_prefixed(&change.old.padded(change.key_type)?)?
            .param_prefixed(&change.new.padded(change.key_type)?)?
            .param_u8(0)
            .param_u8(change.settings)
            .param_u32_le(change.num_keys)
            .param_u32_le(change.key_type.code());
        self.call_ok(request, "DESFire change key").await?;
        Ok(())
    }

    pub async fn desfire_create_app(
        &self,
        aid: u32,
        settings: u8,
        num_keys: u32,
        key_type: DesfireKeyType,
    ) -> Result<()> {
        let request = Self::desfire(Opcode::DesfireCreateApp)
            .param_u32_le(aid)
            .param_u8(settings)
            .param_u32_le(num_keys)
            .param_u32_le(key_type.code());
        self.call_ok(request, "DESFire create application").await?;
        Ok(())
    }

    /// Select application `aid`; `0` selects the PICC level.
    pub async fn desfire_select_app(&self, aid: u32) -> Result<()> {
        let request = Self::desfire(Opcode::DesfireSelectApp).param_u32_le(aid);
        self.call_ok(request, "DESFire select application").await?;
        Ok(())
    }

    /// Create a plain standard data file sized for one number.
    pub async fn desfire_create_data_file(&self, file_no: u8, access_rights: u16) -> Result<()> {
        let request = Self::desfire(Opcode::DesfireCreateDataFile)
            .param_u8(file_no)
            .param_u8(DESFIRE_FILE_TYPE_STANDARD)
            .param_u8(DESFIRE_COMM_PLAIN)
            .param_u16_le(access_rights)
            .param_u32_le(DESFIRE_FILE_SIZE)
            .param_bytes(&[0; 12]);
        self.call_ok(request, "DESFire create data file").await?;
        Ok(())
    }

    /// Write `value` little endian at offset 0 of `file_no`.
    pub async fn desfire_write_u32(&self, file_no: u8, value: u32) -> Result<()> {
        let request = Self::desfire(Opcode::DesfireWriteData)
            .param_u8(file_no)
            .param_u16_le(0)
            .param_prefixed(&value.to_le_bytes())?
            .param_u8(DESFIRE_COMM_PLAIN);
        self.call_ok(request, "DESFire write data").await?;
        Ok(())
    }

    /// Read the little endian value at offset 0 of `file_no`.
    pub async fn desfire_read_u32(&self, file_no: u8) -> Result<u32> {
        let request = Self::desfire(Opcode::DesfireReadData)
            .param_u8(file_no)
            .param_u16_le(0)
            .param_u8(4)
            .param_u8(DESFIRE_COMM_PLAIN);
        let reply = self.call_ok(request, "DESFire read data").await?;
        // Result byte, length byte, then the data.
        Ok(hex::parse_u32_le(reply.payload(), 4)?)
    }

    /// Erase every application. Needs PICC master key authentication.
    pub async fn desfire_format(&self) -> Result<()> {
        self.call_ok(Self::desfire(Opcode::DesfireFormatTag), "DESFire format")
            .await?;
        Ok(())
    }
}

fn block_from<const N: usize>(reply: &Reply, skip: usize) -> Result<[u8; N]> {
    let bytes = reply.bytes()?;
    bytes
        .get(skip..skip + N)
        .and_then(|slice| <[u8; N]>::try_from(slice).ok())
        .ok_or_else(|| keycreator_core::ProtocolError::malformed(reply.payload()).into())
}
