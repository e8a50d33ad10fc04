//! In-process ERP used by tests and offline runs.

use crate::client::ErpClient;
use crate::error::{ErpError, ErpResult};
use crate::models::{ConfigSummary, NewTransponder, TransponderRecord};
use keycreator_core::{Technology, TransponderConfiguration, Uid};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

#[derive(Debug, Default)]
struct Inner {
    configurations: BTreeMap<String, TransponderConfiguration>,
    records: Vec<TransponderRecord>,
    deleted: Vec<String>,
    next_id: u32,
}

/// Shared, cloneable in-memory backend with the HTTP client's semantics.
#[derive(Debug, Clone, Default)]
pub struct InMemoryErp {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryErp {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn with_configuration(self, config: TransponderConfiguration) -> Self {
        self.lock()
            .configurations
            .insert(config.customer.clone(), config);
        self
    }

    /// Store a record as if it had been created earlier.
    pub fn insert_record(&self, mut record: TransponderRecord) {
        let mut inner = self.lock();
        if record.name.is_empty() {
            inner.next_id += 1;
            record.name = format!("TR-{:05}", inner.next_id);
        }
        inner.records.push(record);
    }

    pub fn records(&self) -> Vec<TransponderRecord> {
        self.lock().records.clone()
    }

    /// Codes passed to `delete_transponder`, in call order.
    pub fn deleted(&self) -> Vec<String> {
        self.lock().deleted.clone()
    }
}

impl ErpClient for InMemoryErp {
    async fn list_configurations(&self) -> ErpResult<Vec<ConfigSummary>> {
        let mut list: Vec<ConfigSummary> = self
            .lock()
            .configurations
            .values()
            .map(|config| ConfigSummary {
                name: config.name.clone(),
                customer: config.customer.clone(),
                customer_name: config.customer_name.clone(),
                licence: config.licence.clone(),
                licence_name: config.licence_name.clone(),
            })
            .collect();
        list.sort_by_key(ConfigSummary::label);
        Ok(list)
    }

    async fn get_configuration(&self, customer: &str) -> ErpResult<TransponderConfiguration> {
        self.lock()
            .configurations
            .get(customer)
            .cloned()
            .ok_or_else(|| ErpError::not_found("configuration", customer))
    }

    async fn get_transponder_by_uid(
        &self,
        technology: Technology,
        uid: &Uid,
    ) -> ErpResult<Option<TransponderRecord>> {
        Ok(self
            .lock()
            .records
            .iter()
            .find(|record| record.matches(technology, uid))
            .cloned())
    }

    async fn create_transponder(&self, transponder: &NewTransponder) -> ErpResult<()> {
        let mut inner = self.lock();
        let existing: Vec<String> = transponder
            .uids
            .iter()
            .filter(|(technology, uid)| inner.records.iter().any(|r| r.matches(**technology, uid)))
            .map(|(technology, uid)| format!("{technology} {uid}"))
            .collect();
        if !existing.is_empty() {
            return Err(ErpError::AlreadyExists { uids: existing });
        }

        inner.next_id += 1;
        let mut record = TransponderRecord {
            name: format!("TR-{:05}", inner.next_id),
            code: transponder.number.to_padded(),
            customer: Some(transponder.customer.clone()),
            test_key: transponder.test_key,
            ..TransponderRecord::default()
        };
        for (technology, uid) in &transponder.uids {
            record.set_uid(*technology, uid);
        }
        debug!(code = %record.code, "Stored transponder");
        inner.records.push(record);
        Ok(())
    }

    async fn delete_transponder(&self, code: &str) -> ErpResult<()> {
        let mut inner = self.lock();
        inner.records.retain(|record| record.code != code);
        inner.deleted.push(code.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keycreator_core::{HitagParams, SerialNumber};

    fn new_transponder(uid: &str, number: &str) -> NewTransponder {
        let mut uids = BTreeMap::new();
        uids.insert(Technology::Hitag1S, Uid::from_hex(uid).unwrap());
        NewTransponder {
            customer: "CUST-1".into(),
            number: SerialNumber::parse(number).unwrap(),
            uids,
            test_key: true,
        }
    }

    #[tokio::test]
    async fn test_create_then_lookup_then_delete() {
        let erp = InMemoryErp::new();
        erp.create_transponder(&new_transponder("044A3C91", "000123"))
            .await
            .unwrap();

        let uid = Uid::from_hex("044a3c91").unwrap();
        let record = erp
            .get_transponder_by_uid(Technology::Hitag1S, &uid)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.code, "000123");
        assert!(record.test_key);

        erp.delete_transponder(&record.code).await.unwrap();
        assert!(erp.records().is_empty());
        assert_eq!(erp.deleted(), vec!["000123".to_string()]);
    }

    #[tokio::test]
    async fn test_duplicate_uid_is_refused() {
        let erp = InMemoryErp::new();
        erp.create_transponder(&new_transponder("044A3C91", "000123"))
            .await
            .unwrap();

        let result = erp
            .create_transponder(&new_transponder("044A3C91", "000124"))
            .await;
        assert!(matches!(result, Err(ErpError::AlreadyExists { .. })));
        assert_eq!(erp.records().len(), 1);
    }

    #[tokio::test]
    async fn test_configuration_lookup() {
        let erp = InMemoryErp::new().with_configuration(
            TransponderConfiguration::new("TC-1", "CUST-1")
                .with_hitag(HitagParams { feig_coding: true }),
        );

        let config = erp.get_configuration("CUST-1").await.unwrap();
        assert_eq!(config.name, "TC-1");
        assert!(matches!(
            erp.get_configuration("CUST-2").await,
            Err(ErpError::NotFound { .. })
        ));
        assert_eq!(erp.list_configurations().await.unwrap().len(), 1);
    }
}
