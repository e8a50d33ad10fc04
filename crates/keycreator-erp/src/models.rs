//! Records as the ERP backend sends them.
//!
//! The backend stores booleans as `0`/`1` and mixes numeric and string
//! fields freely; the serde helpers at the bottom of this module accept both
//! spellings.

use crate::error::{ErpError, ErpResult};
use keycreator_core::{
    ClassicKey, DesfireKey, DesfireParams, HitagParams, MifareClassicParams, SerialNumber,
    Technology, TransponderConfiguration, Uid,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Entry of the configuration list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSummary {
    #[serde(default)]
    pub name: String,
    pub customer: String,
    #[serde(default)]
    pub customer_name: Option<String>,
    #[serde(default)]
    pub licence: Option<String>,
    #[serde(default)]
    pub licence_name: Option<String>,
}

impl ConfigSummary {
    /// `customer name - licence name`, falling back to the customer id.
    pub fn label(&self) -> String {
        let customer = self.customer_name.as_deref().unwrap_or(&self.customer);
        match self.licence_name.as_deref() {
            Some(licence) if !licence.is_empty() => format!("{customer} - {licence}"),
            _ => customer.to_string(),
        }
    }
}

/// Transponder configuration with the backend's flat field layout.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErpConfiguration {
    pub name: String,
    pub customer: Option<String>,
    pub customer_name: Option<String>,
    pub licence: Option<String>,
    pub licence_name: Option<String>,
    pub form: Option<String>,
    #[serde(with = "flag")]
    pub ht1: bool,
    #[serde(with = "flag")]
    pub mfcl: bool,
    #[serde(with = "flag")]
    pub mfdf: bool,
    #[serde(with = "flag")]
    pub deister: bool,
    #[serde(with = "flag")]
    pub em: bool,
    #[serde(with = "flag")]
    pub legic: bool,
    #[serde(with = "flag")]
    pub feig_coding: bool,
    pub key_a: Option<String>,
    pub key_b: Option<String>,
    pub sector: Option<u8>,
    pub skip_bytes: Option<u8>,
    pub read_bytes: Option<u8>,
    pub master_key: Option<String>,
    pub app_master_key: Option<String>,
    pub app_read_key: Option<String>,
    pub app_id: Option<serde_json::Value>,
    pub file_byte: Option<u8>,
    /// Customers sharing this configuration.
    pub customers: Vec<ConfigSummary>,
}

impl ErpConfiguration {
    /// Typed configuration for `customer`.
    ///
    /// Customer name and licence come from the matching entry of
    /// `customers` when present.
    ///
    /// # Errors
    ///
    /// `ErpError::InvalidConfiguration` when an enabled technology lacks a
    /// parameter or a key is not valid hex.
    pub fn into_configuration(self, customer: &str) -> ErpResult<TransponderConfiguration> {
        let entry = self.customers.iter().find(|c| c.customer == customer);
        let mut config = TransponderConfiguration::new(self.name.clone(), customer);
        config.customer_name = entry
            .and_then(|c| c.customer_name.clone())
            .or_else(|| self.customer_name.clone());
        config.licence = entry
            .and_then(|c| c.licence.clone())
            .or_else(|| self.licence.clone());
        config.licence_name = entry
            .and_then(|c| c.licence_name.clone())
            .or_else(|| self.licence_name.clone());
        config.form = self.form.clone();
        config.deister = self.deister;
        config.em = self.em;
        config.legic = self.legic;

        if self.ht1 {
            config.hitag = Some(HitagParams {
                feig_coding: self.feig_coding,
            });
        }
        if self.mfcl {
            config.mifare_classic = Some(self.classic_params()?);
        }
        if self.mfdf {
            config.mifare_desfire = Some(self.desfire_params()?);
        }
        Ok(config)
    }

    fn invalid(&self, reason: impl Into<String>) -> ErpError {
        ErpError::invalid_configuration(&self.name, reason)
    }

    fn required<'a, T>(&self, value: &'a Option<T>, field: &str) -> ErpResult<&'a T> {
        value
            .as_ref()
            .ok_or_else(|| self.invalid(format!("missing {field}")))
    }

    fn classic_key(&self, hex: &str, field: &str) -> ErpResult<ClassicKey> {
        ClassicKey::from_hex(hex).map_err(|err| self.invalid(format!("{field}: {err}")))
    }

    fn desfire_key(&self, value: &Option<String>, field: &str) -> ErpResult<DesfireKey> {
        let hex = self.required(value, field)?;
        DesfireKey::from_hex(hex).map_err(|err| self.invalid(format!("{field}: {err}")))
    }

    fn classic_params(&self) -> ErpResult<MifareClassicParams> {
        let key_a = self.classic_key(self.required(&self.key_a, "key_a")?, "key_a")?;
        let key_b = match self.key_b.as_deref() {
            Some(hex) if !hex.is_empty() => Some(self.classic_key(hex, "key_b")?),
            _ => None,
        };
        Ok(MifareClassicParams {
            key_a,
            key_b,
            sector: *self.required(&self.sector, "sector")?,
            skip_bytes: self.skip_bytes.unwrap_or(0),
            read_bytes: *self.required(&self.read_bytes, "read_bytes")?,
        })
    }

    fn desfire_params(&self) -> ErpResult<DesfireParams> {
        let app_id = self.required(&self.app_id, "app_id")?;
        Ok(DesfireParams {
            master_key: self.desfire_key(&self.master_key, "master_key")?,
            app_master_key: self.desfire_key(&self.app_master_key, "app_master_key")?,
            app_read_key: self.desfire_key(&self.app_read_key, "app_read_key")?,
            app_id: parse_app_id(app_id).ok_or_else(|| self.invalid(format!("app_id {app_id}")))?,
            file_id: *self.required(&self.file_byte, "file_byte")?,
        })
    }
}

/// Numbers are taken as they are, strings as hex (`"F10001"`, `"0xF10001"`).
fn parse_app_id(value: &serde_json::Value) -> Option<u32> {
    match value {
        serde_json::Value::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        serde_json::Value::String(s) => {
            let digits = s.trim().trim_start_matches("0x").trim_start_matches("0X");
            u32::from_str_radix(digits, 16).ok()
        }
        _ => None,
    }
}

/// A registered physical key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransponderRecord {
    pub name: String,
    #[serde(with = "text")]
    pub code: String,
    pub customer: Option<String>,
    pub hitag_uid: Option<String>,
    pub mfcl_uid: Option<String>,
    pub mfdf_uid: Option<String>,
    pub deister_uid: Option<String>,
    pub em_uid: Option<String>,
    pub legic_uid: Option<String>,
    #[serde(with = "flag")]
    pub test_key: bool,
}

impl TransponderRecord {
    pub fn uid(&self, technology: Technology) -> Option<&str> {
        let uid = match technology {
            Technology::Hitag1S => &self.hitag_uid,
            Technology::MifareClassic => &self.mfcl_uid,
            Technology::MifareDesfire => &self.mfdf_uid,
            Technology::Deister => &self.deister_uid,
            Technology::Em => &self.em_uid,
        };
        uid.as_deref().filter(|u| !u.is_empty())
    }

    pub fn set_uid(&mut self, technology: Technology, uid: &Uid) {
        let slot = match technology {
            Technology::Hitag1S => &mut self.hitag_uid,
            Technology::MifareClassic => &mut self.mfcl_uid,
            Technology::MifareDesfire => &mut self.mfdf_uid,
            Technology::Deister => &mut self.deister_uid,
            Technology::Em => &mut self.em_uid,
        };
        *slot = Some(uid.to_hex());
    }

    /// Whether the record lists `uid` for `technology`, ignoring hex case.
    pub fn matches(&self, technology: Technology, uid: &Uid) -> bool {
        self.uid(technology)
            .is_some_and(|stored| stored.eq_ignore_ascii_case(&uid.to_hex()))
    }

    /// Technologies with a UID on record.
    pub fn technologies(&self) -> impl Iterator<Item = Technology> + '_ {
        Technology::ALL
            .into_iter()
            .filter(|t| self.uid(*t).is_some())
    }

    /// Code as a serial number, if it is one.
    pub fn number(&self) -> Option<SerialNumber> {
        self.code
            .parse::<u32>()
            .ok()
            .and_then(|value| SerialNumber::new(value).ok())
    }
}

/// Input of a create call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTransponder {
    pub customer: String,
    pub number: SerialNumber,
    pub uids: BTreeMap<Technology, Uid>,
    pub test_key: bool,
}

impl NewTransponder {
    /// Query parameters of `create_transponder`.
    ///
    /// `test_key` is only sent when set; the backend defaults it to 0.
    pub fn query(&self) -> Vec<(&'static str, String)> {
        let mut query = vec![
            ("customer", self.customer.clone()),
            ("code", self.number.to_padded()),
        ];
        query.extend(
            self.uids
                .iter()
                .map(|(technology, uid)| (technology.erp_uid_field(), uid.to_hex())),
        );
        if self.test_key {
            query.push(("test_key", "1".to_string()));
        }
        query
    }

    /// Whether `message`, the backend's answer to create, echoes the number.
    pub fn is_confirmed_by(&self, message: &serde_json::Value) -> bool {
        match message {
            serde_json::Value::String(s) => {
                s.trim() == self.number.to_padded()
                    || s.trim().parse::<u32>().ok() == Some(self.number.value())
            }
            serde_json::Value::Number(n) => n.as_u64() == Some(u64::from(self.number.value())),
            _ => false,
        }
    }
}

/// `0`/`1`, `true`/`false` or `null` as a bool.
mod flag {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Bool(bool),
        Int(i64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &bool, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(u8::from(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        Ok(match Option::<Raw>::deserialize(deserializer)? {
            Some(Raw::Bool(b)) => b,
            Some(Raw::Int(i)) => i != 0,
            Some(Raw::Text(s)) => matches!(s.trim(), "1" | "true"),
            None => false,
        })
    }
}

/// String or number as a string.
mod text {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Int(u64),
    }

    pub fn serialize<S: Serializer>(value: &str, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
        Ok(match Option::<Raw>::deserialize(deserializer)? {
            Some(Raw::Text(s)) => s,
            Some(Raw::Int(i)) => i.to_string(),
            None => String::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    fn full_config() -> serde_json::Value {
        json!({
            "name": "TC-0007",
            "customer_name": "Fallback GmbH",
            "ht1": 1,
            "mfcl": 1,
            "mfdf": 0,
            "deister": 0,
            "em": 1,
            "legic": 1,
            "feig_coding": 1,
            "key_a": "A1B2C3D4E5F6",
            "key_b": "",
            "sector": 2,
            "skip_bytes": 0,
            "read_bytes": 3,
            "customers": [
                {"customer": "CUST-1", "customer_name": "Acme", "licence_name": "Main"},
                {"customer": "CUST-2", "customer_name": "Other"}
            ]
        })
    }

    #[test]
    fn test_flat_record_becomes_typed_configuration() {
        let raw: ErpConfiguration = serde_json::from_value(full_config()).unwrap();
        let config = raw.into_configuration("CUST-1").unwrap();

        assert_eq!(config.name, "TC-0007");
        assert_eq!(config.customer_name.as_deref(), Some("Acme"));
        assert_eq!(config.licence_name.as_deref(), Some("Main"));
        assert_eq!(config.hitag, Some(HitagParams { feig_coding: true }));
        let classic = config.mifare_classic.unwrap();
        assert_eq!(classic.sector, 2);
        assert_eq!(classic.key_b, None);
        assert!(config.em);
        assert!(config.legic);
        assert!(config.mifare_desfire.is_none());
    }

    #[test]
    fn test_unknown_customer_keeps_record_names() {
        let raw: ErpConfiguration = serde_json::from_value(full_config()).unwrap();
        let config = raw.into_configuration("CUST-9").unwrap();
        assert_eq!(config.customer, "CUST-9");
        assert_eq!(config.customer_name.as_deref(), Some("Fallback GmbH"));
    }

    #[test]
    fn test_missing_classic_sector_is_invalid() {
        let mut value = full_config();
        value["sector"] = serde_json::Value::Null;
        let raw: ErpConfiguration = serde_json::from_value(value).unwrap();
        assert!(matches!(
            raw.into_configuration("CUST-1"),
            Err(ErpError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn test_desfire_fields() {
        let raw: ErpConfiguration = serde_json::from_value(json!({
            "name": "TC-0010",
            "mfdf": true,
            "master_key": "2",
            "app_master_key": "00112233445566778899AABBCCDDEEFF",
            "app_read_key": "FFEEDDCCBBAA99887766554433221100",
            "app_id": "F10001",
            "file_byte": 1
        }))
        .unwrap();
        let desfire = raw.into_configuration("CUST-1").unwrap().mifare_desfire.unwrap();
        assert_eq!(desfire.app_id, 0xF1_0001);
        assert_eq!(desfire.master_key.as_bytes(), &[0x20]);
        assert_eq!(desfire.file_id, 1);
    }

    #[rstest]
    #[case(json!(15794177), Some(15_794_177))]
    #[case(json!("0xF10001"), Some(0xF1_0001))]
    #[case(json!("zz"), None)]
    #[case(json!(null), None)]
    fn test_app_id_spellings(#[case] value: serde_json::Value, #[case] expected: Option<u32>) {
        assert_eq!(parse_app_id(&value), expected);
    }

    #[test]
    fn test_record_matches_uid_case_insensitively() {
        let record: TransponderRecord = serde_json::from_value(json!({
            "name": "TR-1",
            "code": 123456,
            "hitag_uid": "044a3c91",
            "mfcl_uid": null,
            "test_key": "1"
        }))
        .unwrap();

        let uid = Uid::from_hex("044A3C91").unwrap();
        assert!(record.matches(Technology::Hitag1S, &uid));
        assert!(!record.matches(Technology::MifareClassic, &uid));
        assert_eq!(record.code, "123456");
        assert!(record.test_key);
        assert_eq!(record.number(), Some(SerialNumber::parse("123456").unwrap()));
        assert_eq!(record.technologies().collect::<Vec<_>>(), vec![Technology::Hitag1S]);
    }

    #[test]
    fn test_create_query_and_confirmation() {
        let mut uids = BTreeMap::new();
        uids.insert(Technology::MifareClassic, Uid::from_hex("9F3C1102").unwrap());
        uids.insert(Technology::Hitag1S, Uid::from_hex("044A3C91").unwrap());
        let new = NewTransponder {
            customer: "CUST-1".into(),
            number: SerialNumber::parse("012345").unwrap(),
            uids,
            test_key: false,
        };

        assert_eq!(
            new.query(),
            vec![
                ("customer", "CUST-1".to_string()),
                ("code", "012345".to_string()),
                ("hitag_uid", "044A3C91".to_string()),
                ("mfcl_uid", "9F3C1102".to_string()),
            ]
        );
        assert!(new.is_confirmed_by(&json!("012345")));
        assert!(new.is_confirmed_by(&json!(12345)));
        assert!(new.is_confirmed_by(&json!("12345")));
        assert!(!new.is_confirmed_by(&json!("Transponder exists")));
    }

    #[test]
    fn test_summary_label() {
        let summary = ConfigSummary {
            name: "TC-1".into(),
            customer: "CUST-1".into(),
            customer_name: Some("Acme".into()),
            licence: None,
            licence_name: Some("Main".into()),
        };
        assert_eq!(summary.label(), "Acme - Main");
    }
}
