#![allow(async_fn_in_trait)]

//! Contract with the ERP backend and its HTTP implementation.

use crate::error::{ErpError, ErpResult};
use crate::models::{ConfigSummary, ErpConfiguration, NewTransponder, TransponderRecord};
use keycreator_core::{ErpConfig, Technology, TransponderConfiguration, Uid};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

/// Read, create and delete access to configurations and transponder records.
///
/// Calls are single point requests. Nothing here retries.
pub trait ErpClient {
    /// Configurations, sorted by customer name.
    async fn list_configurations(&self) -> ErpResult<Vec<ConfigSummary>>;

    async fn get_configuration(&self, customer: &str) -> ErpResult<TransponderConfiguration>;

    /// First record listing `uid` for `technology`.
    async fn get_transponder_by_uid(
        &self,
        technology: Technology,
        uid: &Uid,
    ) -> ErpResult<Option<TransponderRecord>>;

    /// Register a provisioned token.
    ///
    /// # Errors
    ///
    /// `ErpError::AlreadyExists` if any of the UIDs is already on record,
    /// `ErpError::Rejected` if the backend does not echo the number.
    async fn create_transponder(&self, transponder: &NewTransponder) -> ErpResult<()>;

    async fn delete_transponder(&self, code: &str) -> ErpResult<()>;
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    message: Option<T>,
}

/// Frappe style method endpoints under one base URL.
#[derive(Debug, Clone)]
pub struct HttpErpClient {
    client: Client,
    base_url: String,
}

impl HttpErpClient {
    /// # Errors
    ///
    /// Returns `ErpError::Http` if the TLS backend cannot be initialised.
    pub fn new(config: &ErpConfig) -> ErpResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .cookie_store(true)
            .build()?;
        Ok(Self::with_client(client, &config.base_url))
    }

    pub fn with_client(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim().to_string(),
        }
    }

    /// `base.method`, or `base` + `method` when the base already ends in a
    /// separator.
    pub fn endpoint(&self, method: &str) -> String {
        if self.base_url.ends_with('/') || self.base_url.ends_with('.') {
            format!("{}{method}", self.base_url)
        } else {
            format!("{}.{method}", self.base_url)
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        query: &[(&str, String)],
    ) -> ErpResult<Option<T>> {
        let url = self.endpoint(method);
        debug!(method, "ERP request");

        let response = self.client.get(&url).query(query).send().await?;
        match response.status() {
            StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => {
                warn!(method, "ERP session invalid");
                return Err(ErpError::Unauthorized);
            }
            status if !status.is_success() => {
                warn!(method, status = status.as_u16(), "ERP request failed");
                return Err(ErpError::Status {
                    status: status.as_u16(),
                    method: method.to_string(),
                });
            }
            _ => {}
        }

        let envelope: Envelope<T> = response.json().await?;
        Ok(envelope.message)
    }
}

impl ErpClient for HttpErpClient {
    async fn list_configurations(&self) -> ErpResult<Vec<ConfigSummary>> {
        let mut list: Vec<ConfigSummary> = self
            .call("get_transponder_config_list", &[])
            .await?
            .unwrap_or_default();
        list.sort_by_key(ConfigSummary::label);
        Ok(list)
    }

    async fn get_configuration(&self, customer: &str) -> ErpResult<TransponderConfiguration> {
        let raw: ErpConfiguration = self
            .call("get_transponder_config", &[("customer", customer.to_string())])
            .await?
            .ok_or_else(|| ErpError::not_found("configuration", customer))?;
        let config = raw.into_configuration(customer)?;
        info!(
            customer,
            name = %config.name,
            required = %config.required_technologies(),
            "Loaded transponder configuration"
        );
        Ok(config)
    }

    async fn get_transponder_by_uid(
        &self,
        technology: Technology,
        uid: &Uid,
    ) -> ErpResult<Option<TransponderRecord>> {
        let records: Vec<TransponderRecord> = self
            .call(
                "get_transponder",
                &[(technology.erp_uid_field(), uid.to_hex())],
            )
            .await?
            .unwrap_or_default();
        Ok(records.into_iter().next())
    }

    async fn create_transponder(&self, transponder: &NewTransponder) -> ErpResult<()> {
        let mut existing = Vec::new();
        for (technology, uid) in &transponder.uids {
            if self.get_transponder_by_uid(*technology, uid).await?.is_some() {
                existing.push(format!("{technology} {uid}"));
            }
        }
        if !existing.is_empty() {
            return Err(ErpError::AlreadyExists { uids: existing });
        }

        let message: serde_json::Value = self
            .call("create_transponder", &transponder.query())
            .await?
            .unwrap_or(serde_json::Value::Null);
        if !transponder.is_confirmed_by(&message) {
            return Err(ErpError::Rejected {
                message: message.to_string(),
            });
        }
        info!(number = %transponder.number, customer = %transponder.customer, "Transponder created");
        Ok(())
    }

    async fn delete_transponder(&self, code: &str) -> ErpResult<()> {
        let _: Option<serde_json::Value> = self
            .call("del_transponder", &[("code", code.to_string())])
            .await?;
        info!(code, "Transponder deleted");
        Ok(())
    }
}
