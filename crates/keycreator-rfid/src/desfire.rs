//! MIFARE DESFire provisioning and reset.
//!
//! # Provisioning
//!
//! A factory card (zero 3DES PICC master key, no applications) is turned into
//! a customer card in twelve steps, each of which aborts the pipeline:
//!
//! 1. authenticate PICC key 0 with the zero key (3DES)
//! 2. read the PICC key settings
//! 3. rewrite the key settings with key type AES
//! 4. change the PICC master key to the customer master key (AES)
//! 5. authenticate with the new master key
//! 6. create and select the application (2 AES keys)
//! 7. authenticate application key 0 with the zero key
//! 8. change application key 0 to the application master key
//! 9. authenticate with the application master key
//! 10. change application key 1 to the read key, reselect, authenticate again
//! 11. create the number file and write the number
//! 12. authenticate with the read key and read the number back
//!
//! The settings byte and key count read in step 2 are reused by every later
//! settings, application and key change.
//!
//! # Reset
//!
//! [`DesfireDriver::reset_to_default`] brings a card back to factory state.
//! A card that already authenticates with the zero key and reports a single
//! 3DES or AES key is left untouched.

use keycreator_core::{
    DesfireKey, DesfireKeyType, DesfireParams, Error, Result, SerialNumber,
    constants::{DESFIRE_APP_KEY_COUNT, DESFIRE_FILE_ACCESS_RIGHTS},
};
use keycreator_hardware::{DesfireKeyChange, DesfireKeySettingsReply, Twn4Reader};
use tracing::{debug, info, warn};

/// Application id of the card level.
const PICC: u32 = 0;

const MASTER_KEY: u8 = 0;
const READ_KEY: u8 = 1;

/// What [`DesfireDriver::reset_to_default`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetOutcome {
    /// The card already carried the factory key; nothing was changed.
    AlreadyDefault,
    /// The card was formatted and its master key set back to zero.
    Formatted,
}

/// Key that opened the PICC during a reset.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PiccLogin {
    key: DesfireKey,
    key_type: DesfireKeyType,
}

impl PiccLogin {
    /// Which key this is, for logs. Never the key material.
    fn origin(&self) -> &'static str {
        if self.key.is_zero() { "default" } else { "configured" }
    }
}

/// DESFire routines over a [`Twn4Reader`].
#[derive(Debug, Clone)]
pub struct DesfireDriver {
    reader: Twn4Reader,
}

impl DesfireDriver {
    pub fn new(reader: Twn4Reader) -> Self {
        Self { reader }
    }

    async fn authenticate(
        &self,
        key_no: u8,
        key: &DesfireKey,
        key_type: DesfireKeyType,
        target: &str,
    ) -> Result<()> {
        if self.reader.desfire_authenticate(key_no, key, key_type).await? {
            debug!(key_no, key_type = %key_type, target, "DESFire authenticated");
            Ok(())
        } else {
            warn!(key_no, key_type = %key_type, target, "DESFire authentication refused");
            Err(Error::authentication(target))
        }
    }

    async fn key_settings(&self) -> Result<DesfireKeySettingsReply> {
        self.reader
            .desfire_get_key_settings()
            .await?
            .ok_or_else(|| Error::rejected("DESFire get key settings"))
    }

    /// Provision a factory card with `params` and store `number`.
    ///
    /// # Errors
    ///
    /// - `Error::Authentication` naming the step whose login was refused
    /// - `Error::CommandRejected` naming the command the card refused
    /// - `Error::VerificationFailed` if the file reads back differently
    pub async fn provision(&self, params: &DesfireParams, number: SerialNumber) -> Result<()> {
        let zero = DesfireKey::zero();
        let aes = DesfireKeyType::Aes;

        self.reader.desfire_select_app(PICC).await?;
        self.authenticate(MASTER_KEY, &zero, DesfireKeyType::TripleDes, "PICC default key")
            .await?;

        let settings = self.key_settings().await?;
        debug!(
            settings = format_args!("0x{:02X}", settings.settings),
            num_keys = settings.num_keys,
            "DESFire PICC key settings"
        );

        self.reader
            .desfire_change_key_settings(settings.settings, settings.num_keys, aes)
            .await?;
        self.reader
            .desfire_change_key(DesfireKeyChange {
                key_no: MASTER_KEY,
                old: &zero,
                new: &params.master_key,
                key_type: aes,
                settings: settings.settings,
                num_keys: settings.num_keys,
            })
            .await?;
        self.authenticate(MASTER_KEY, &params.master_key, aes, "PICC master key")
            .await?;

        self.reader
            .desfire_create_app(params.app_id, settings.settings, DESFIRE_APP_KEY_COUNT, aes)
            .await?;
        self.reader.desfire_select_app(params.app_id).await?;
        debug!(aid = format_args!("0x{:06X}", params.app_id), "DESFire application created");

        self.authenticate(MASTER_KEY, &zero, aes, "application default key")
            .await?;
        self.reader
            .desfire_change_key(DesfireKeyChange {
                key_no: MASTER_KEY,
                old: &zero,
                new: &params.app_master_key,
                key_type: aes,
                settings: settings.settings,
                num_keys: settings.num_keys,
            })
            .await?;
        self.authenticate(MASTER_KEY, &params.app_master_key, aes, "application master key")
            .await?;

        self.reader
            .desfire_change_key(DesfireKeyChange {
                key_no: READ_KEY,
                old: &zero,
                new: &params.app_read_key,
                key_type: aes,
                settings: settings.settings,
                num_keys: settings.num_keys,
            })
            .await?;
        self.reader.desfire_select_app(params.app_id).await?;
        self.authenticate(MASTER_KEY, &params.app_master_key, aes, "application master key")
            .await?;

        self.reader
            .desfire_create_data_file(params.file_id, DESFIRE_FILE_ACCESS_RIGHTS)
            .await?;
        self.reader
            .desfire_write_u32(params.file_id, number.value())
            .await?;

        self.authenticate(READ_KEY, &params.app_read_key, aes, "application read key")
            .await?;
        let read_back = self.reader.desfire_read_u32(params.file_id).await?;
        if read_back != number.value() {
            warn!(expected = %number, actual = read_back, "DESFire verification failed");
            return Err(Error::verification(number.to_padded(), format!("{read_back:06}")));
        }

        info!(
            aid = format_args!("0x{:06X}", params.app_id),
            number = %number,
            "DESFire number written and verified"
        );
        Ok(())
    }

    /// Read the number file with the application read key.
    pub async fn read_number(&self, params: &DesfireParams) -> Result<u32> {
        self.reader.desfire_select_app(params.app_id).await?;
        self.authenticate(
            READ_KEY,
            &params.app_read_key,
            DesfireKeyType::Aes,
            "application read key",
        )
        .await?;
        self.reader.desfire_read_u32(params.file_id).await
    }

    /// Open the PICC: the configured master key first (AES, then 3DES), the
    /// zero key (3DES, then AES) only if that fails.
    async fn open_picc(&self, master_key: Option<&DesfireKey>) -> Result<Option<PiccLogin>> {
        let zero = DesfireKey::zero();
        let configured = master_key
            .filter(|key| **key != zero)
            .into_iter()
            .flat_map(|key| {
                [DesfireKeyType::Aes, DesfireKeyType::TripleDes].map(|key_type| PiccLogin {
                    key: key.clone(),
                    key_type,
                })
            });
        let default = [DesfireKeyType::TripleDes, DesfireKeyType::Aes].map(|key_type| PiccLogin {
            key: zero.clone(),
            key_type,
        });

        for login in configured.chain(default) {
            if self
                .reader
                .desfire_authenticate(MASTER_KEY, &login.key, login.key_type)
                .await?
            {
                debug!(key_type = %login.key_type, default = login.key.is_zero(), "DESFire PICC opened");
                return Ok(Some(login));
            }
        }
        Ok(None)
    }

    /// Format the card and set the PICC master key back to zero (3DES).
    ///
    /// `master_key` is the customer master key, if known. The key passed as
    /// the old key of the final key change is the first candidate, the
    /// customer key when given, regardless of which key opened the card.
    ///
    /// # Errors
    ///
    /// - `Error::Authentication` if no candidate key opens the card
    /// - `Error::PartialFormat` if the format went through but the card
    ///   could not be brought back to the zero key
    pub async fn reset_to_default(&self, master_key: Option<&DesfireKey>) -> Result<ResetOutcome> {
        let zero = DesfireKey::zero();

        self.reader.desfire_select_app(PICC).await?;
        let login = self
            .open_picc(master_key)
            .await?
            .ok_or_else(|| Error::authentication("DESFire PICC master key"))?;

        if login.key.is_zero() {
            let settings = self.key_settings().await?;
            let factory_type = matches!(
                settings.key_type,
                Some(DesfireKeyType::TripleDes | DesfireKeyType::Aes)
            );
            if settings.num_keys == 1 && factory_type {
                info!("DESFire already at factory key, format skipped");
                return Ok(ResetOutcome::AlreadyDefault);
            }
        }

        self.reader.desfire_format().await?;
        info!("DESFire formatted");

        let old_key = master_key.unwrap_or(&zero);
        self.restore_master_key(&login, old_key).await.map_err(|err| {
            warn!(error = %err, "DESFire key reset failed after format");
            Error::partial_format(err.to_string())
        })?;

        info!("DESFire master key reset to default");
        Ok(ResetOutcome::Formatted)
    }

    async fn restore_master_key(&self, login: &PiccLogin, old_key: &DesfireKey) -> Result<()> {
        let zero = DesfireKey::zero();
        let tdes = DesfireKeyType::TripleDes;

        let settings = self.key_settings().await?;
        debug!(num_keys = settings.num_keys, "DESFire key settings readable after format");

        if self
            .reader
            .desfire_authenticate(MASTER_KEY, &login.key, login.key_type)
            .await?
        {
            debug!(
                key = login.origin(),
                key_type = ?login.key_type,
                "DESFire sanity authentication with the opening key passed"
            );
        } else {
            warn!(
                key = login.origin(),
                key_type = ?login.key_type,
                "DESFire sanity authentication with the opening key refused, continuing reset"
            );
        }

        self.reader
            .desfire_change_key_settings(settings.settings, settings.num_keys, tdes)
            .await?;
        self.reader
            .desfire_change_key(DesfireKeyChange {
                key_no: MASTER_KEY,
                old: old_key,
                new: &zero,
                key_type: tdes,
                settings: settings.settings,
                num_keys: settings.num_keys,
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keycreator_hardware::mock::{DesfireApp, VirtualTag, VirtualTagKind};
    use keycreator_hardware::{AnyLink, ChannelOptions, CommandChannel, MockLink, VirtualReader};
    use keycreator_protocol::Opcode;

    const UID: [u8; 7] = [0x04, 0x52, 0x1A, 0x22, 0x6B, 0x5E, 0x80];

    fn params() -> DesfireParams {
        DesfireParams {
            master_key: DesfireKey::from_hex("2").unwrap(),
            app_master_key: DesfireKey::from_hex("00112233445566778899AABBCCDDEEFF").unwrap(),
            app_read_key: DesfireKey::from_hex("F0E1D2C3B4A5968778695A4B3C2D1E0F").unwrap(),
            app_id: 0x00F1_0001,
            file_id: 1,
        }
    }

    fn driver(sim: &VirtualReader) -> DesfireDriver {
        let (link, _handle) = MockLink::with_responder(sim.clone());
        let (channel, _worker) = CommandChannel::spawn(AnyLink::Mock(link), ChannelOptions::default());
        DesfireDriver::new(Twn4Reader::new(channel))
    }

    fn provisioned(sim: &VirtualReader) -> DesfireDriver {
        sim.place(VirtualTag::desfire(UID));
        driver(sim)
    }

    #[test]
    fn test_login_origin_names_the_key() {
        let default = PiccLogin {
            key: DesfireKey::zero(),
            key_type: DesfireKeyType::TripleDes,
        };
        let configured = PiccLogin {
            key: params().master_key,
            key_type: DesfireKeyType::Aes,
        };
        assert_eq!(default.origin(), "default");
        assert_eq!(configured.origin(), "configured");
    }

    #[tokio::test]
    async fn test_provision_factory_card() {
        let sim = VirtualReader::new();
        let driver = provisioned(&sim);
        let params = params();

        driver
            .provision(&params, SerialNumber::parse("123456").unwrap())
            .await
            .unwrap();

        let tag = sim.tag(&UID).unwrap();
        let card = tag.desfire_card().unwrap();
        assert_eq!(card.master.key, params.master_key.padded(DesfireKeyType::Aes).unwrap());
        assert_eq!(card.master.key_type, 2);

        let app = &card.apps[&params.app_id];
        assert_eq!(app.keys[0], params.app_master_key.as_bytes());
        assert_eq!(app.keys[1], params.app_read_key.as_bytes());
        assert_eq!(app.files[&1].access_rights, 0x1000);
        assert_eq!(app.files[&1].data, 123_456u32.to_le_bytes());

        assert_eq!(driver.read_number(&params).await.unwrap(), 123_456);
    }

    #[tokio::test]
    async fn test_provision_aborts_on_customer_card() {
        let sim = VirtualReader::new();
        let driver = provisioned(&sim);
        let params = params();
        driver
            .provision(&params, SerialNumber::parse("100000").unwrap())
            .await
            .unwrap();

        let again = driver
            .provision(&params, SerialNumber::parse("100001").unwrap())
            .await;
        assert!(matches!(again, Err(Error::Authentication { .. })));
        assert_eq!(driver.read_number(&params).await.unwrap(), 100_000);
    }

    #[tokio::test]
    async fn test_provision_names_rejected_step() {
        let sim = VirtualReader::new();
        let mut tag = VirtualTag::desfire(UID);
        if let VirtualTagKind::Desfire { card, .. } = &mut tag.kind {
            card.apps.insert(
                params().app_id,
                DesfireApp {
                    settings: 0x0F,
                    key_type: 2,
                    keys: vec![vec![0; 16]; 2],
                    files: Default::default(),
                },
            );
        }
        sim.place(tag);
        let driver = driver(&sim);

        let result = driver
            .provision(&params(), SerialNumber::parse("100000").unwrap())
            .await;
        match result {
            Err(Error::CommandRejected { operation }) => {
                assert_eq!(operation, "DESFire create application")
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(sim.count(Opcode::DesfireCreateDataFile), 0);
    }

    #[tokio::test]
    async fn test_reset_factory_card_skips_format() {
        let sim = VirtualReader::new();
        let driver = provisioned(&sim);

        let outcome = driver.reset_to_default(Some(&params().master_key)).await.unwrap();
        assert_eq!(outcome, ResetOutcome::AlreadyDefault);
        assert_eq!(sim.count(Opcode::DesfireFormatTag), 0);
    }

    #[tokio::test]
    async fn test_reset_provisioned_card() {
        let sim = VirtualReader::new();
        let driver = provisioned(&sim);
        let params = params();
        driver
            .provision(&params, SerialNumber::parse("123456").unwrap())
            .await
            .unwrap();

        let outcome = driver.reset_to_default(Some(&params.master_key)).await.unwrap();
        assert_eq!(outcome, ResetOutcome::Formatted);

        let tag = sim.tag(&UID).unwrap();
        let card = tag.desfire_card().unwrap();
        assert!(card.apps.is_empty());
        assert_eq!(card.master.key, vec![0; 16]);
        assert_eq!(card.master.key_type, 0);

        let second = driver.reset_to_default(Some(&params.master_key)).await.unwrap();
        assert_eq!(second, ResetOutcome::AlreadyDefault);
        assert_eq!(sim.count(Opcode::DesfireFormatTag), 1);
    }

    #[tokio::test]
    async fn test_reset_with_unknown_key_fails_authentication() {
        let sim = VirtualReader::new();
        let driver = provisioned(&sim);
        driver
            .provision(&params(), SerialNumber::parse("123456").unwrap())
            .await
            .unwrap();

        let other = DesfireKey::from_hex("77").unwrap();
        let result = driver.reset_to_default(Some(&other)).await;
        assert!(matches!(result, Err(Error::Authentication { .. })));
        assert_eq!(sim.count(Opcode::DesfireFormatTag), 0);
    }

    #[tokio::test]
    async fn test_key_reset_failure_is_partial_format() {
        let sim = VirtualReader::new();
        let driver = provisioned(&sim);
        let params = params();
        driver
            .provision(&params, SerialNumber::parse("123456").unwrap())
            .await
            .unwrap();

        sim.force_status(Opcode::DesfireChangeKey, 0x04);
        let result = driver.reset_to_default(Some(&params.master_key)).await;
        assert!(matches!(result, Err(Error::PartialFormat { .. })));

        let tag = sim.tag(&UID).unwrap();
        assert!(tag.desfire_card().unwrap().apps.is_empty());
    }
}
