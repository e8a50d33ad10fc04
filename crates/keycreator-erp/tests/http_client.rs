//! HTTP client against a local axum stand-in for the ERP backend.

use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use keycreator_core::{ErpConfig, SerialNumber, Technology, Uid};
use keycreator_erp::{ErpClient, ErpError, HttpErpClient, NewTransponder};
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

const PREFIX: &str = "/api/method/keycreator.api";

type Records = Arc<Mutex<Vec<Value>>>;
type Params = Query<HashMap<String, String>>;

async fn config_list() -> Json<Value> {
    Json(json!({ "message": [
        { "name": "TC-2", "customer": "CUST-2", "customer_name": "Zeta AG" },
        { "name": "TC-1", "customer": "CUST-1", "customer_name": "Acme", "licence_name": "Main" }
    ]}))
}

async fn config(Query(params): Params) -> Json<Value> {
    if params.get("customer").map(String::as_str) != Some("CUST-1") {
        return Json(json!({ "message": null }));
    }
    Json(json!({ "message": {
        "name": "TC-1",
        "ht1": 1,
        "mfcl": 1,
        "feig_coding": 0,
        "key_a": "A1B2C3D4E5F6",
        "sector": 1,
        "skip_bytes": 0,
        "read_bytes": 4,
        "customers": [{ "customer": "CUST-1", "customer_name": "Acme" }]
    }}))
}

async fn transponder(State(records): State<Records>, Query(params): Params) -> Json<Value> {
    let records = records.lock().unwrap();
    let found: Vec<Value> = records
        .iter()
        .filter(|record| {
            params
                .iter()
                .any(|(field, uid)| record.get(field).and_then(Value::as_str) == Some(uid.as_str()))
        })
        .cloned()
        .collect();
    Json(json!({ "message": found }))
}

async fn create(State(records): State<Records>, Query(params): Params) -> Json<Value> {
    let code = params.get("code").cloned().unwrap_or_default();
    records.lock().unwrap().push(json!(params));
    Json(json!({ "message": code }))
}

async fn delete(State(records): State<Records>, Query(params): Params) -> Json<Value> {
    let code = params.get("code").cloned().unwrap_or_default();
    records
        .lock()
        .unwrap()
        .retain(|record| record.get("code").and_then(Value::as_str) != Some(code.as_str()));
    Json(json!({ "message": "ok" }))
}

async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}{PREFIX}")
}

async fn backend() -> (HttpErpClient, Records) {
    let records: Records = Arc::default();
    let router = Router::new()
        .route(&format!("{PREFIX}.get_transponder_config_list"), get(config_list))
        .route(&format!("{PREFIX}.get_transponder_config"), get(config))
        .route(&format!("{PREFIX}.get_transponder"), get(transponder))
        .route(&format!("{PREFIX}.create_transponder"), get(create))
        .route(&format!("{PREFIX}.del_transponder"), get(delete))
        .with_state(records.clone());
    let base_url = serve(router).await;
    let client = HttpErpClient::new(&ErpConfig {
        base_url,
        timeout_ms: 2000,
    })
    .unwrap();
    (client, records)
}

fn hitag_token(uid: &str, number: &str) -> NewTransponder {
    let mut uids = BTreeMap::new();
    uids.insert(Technology::Hitag1S, Uid::from_hex(uid).unwrap());
    NewTransponder {
        customer: "CUST-1".into(),
        number: SerialNumber::parse(number).unwrap(),
        uids,
        test_key: false,
    }
}

#[tokio::test]
async fn test_configuration_list_is_sorted_by_label() {
    let (client, _) = backend().await;
    let list = client.list_configurations().await.unwrap();
    let labels: Vec<String> = list.iter().map(|c| c.label()).collect();
    assert_eq!(labels, vec!["Acme - Main", "Zeta AG"]);
}

#[tokio::test]
async fn test_configuration_for_customer() {
    let (client, _) = backend().await;
    let config = client.get_configuration("CUST-1").await.unwrap();
    assert_eq!(config.customer_name.as_deref(), Some("Acme"));
    assert_eq!(
        config.required_technologies().iter().collect::<Vec<_>>(),
        vec![Technology::Hitag1S, Technology::MifareClassic]
    );

    assert!(matches!(
        client.get_configuration("CUST-9").await,
        Err(ErpError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_create_lookup_delete() {
    let (client, records) = backend().await;
    client
        .create_transponder(&hitag_token("044A3C91", "000123"))
        .await
        .unwrap();
    assert_eq!(records.lock().unwrap().len(), 1);
    assert!(records.lock().unwrap()[0].get("test_key").is_none());

    let uid = Uid::from_hex("044A3C91").unwrap();
    let record = client
        .get_transponder_by_uid(Technology::Hitag1S, &uid)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.code, "000123");

    let duplicate = client
        .create_transponder(&hitag_token("044A3C91", "000124"))
        .await;
    assert!(matches!(duplicate, Err(ErpError::AlreadyExists { .. })));

    client.delete_transponder("000123").await.unwrap();
    assert!(
        client
            .get_transponder_by_uid(Technology::Hitag1S, &uid)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_forbidden_means_invalid_session() {
    let router = Router::new().fallback(|| async { StatusCode::FORBIDDEN.into_response() });
    let client = HttpErpClient::new(&ErpConfig {
        base_url: serve(router).await,
        timeout_ms: 2000,
    })
    .unwrap();

    assert!(matches!(
        client.list_configurations().await,
        Err(ErpError::Unauthorized)
    ));
}

#[tokio::test]
async fn test_server_error_carries_status() {
    let router =
        Router::new().fallback(|| async { StatusCode::INTERNAL_SERVER_ERROR.into_response() });
    let client = HttpErpClient::new(&ErpConfig {
        base_url: serve(router).await,
        timeout_ms: 2000,
    })
    .unwrap();

    let result = client
        .get_transponder_by_uid(Technology::Em, &Uid::from_hex("0102030405").unwrap())
        .await;
    assert!(matches!(result, Err(ErpError::Status { status: 500, .. })));
}
