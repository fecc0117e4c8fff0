//! Odoo inventory store over JSON-RPC
//!
//! Protocol:
//! - POST `<url>/jsonrpc`, body `{"jsonrpc":"2.0","method":"call","params":{...}}`
//! - `common.login(db, user, password)` returns the uid (or `false`)
//! - `object.execute_kw(db, uid, password, model, method, args, kwargs)`
//! - Many2one fields read back as `[id, "display name"]` or `false`
//! - Datetimes are naive UTC strings `%Y-%m-%d %H:%M:%S`

use super::InventoryStore;
use crate::domain::error::StoreError;
use crate::domain::types::{EntityKind, NewTag, RecordId, TagRecord};
use crate::infra::config::Config;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info};

const PRODUCT_MODEL: &str = "product.product";
const LOCATION_MODEL: &str = "stock.location";
const TAG_MODEL: &str = "rfid.tag";
const QUANT_MODEL: &str = "stock.quant";

const TAG_FIELDS: [&str; 5] =
    ["id", "epc_code", "product_id", "last_scan_time", "last_scan_location"];

const ODOO_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Connection settings for an Odoo instance
#[derive(Debug, Clone)]
pub struct OdooConnection {
    pub url: String,
    pub db: String,
    pub username: String,
    pub password: String,
    pub timeout: Duration,
}

impl OdooConnection {
    pub fn from_config(config: &Config) -> Self {
        Self {
            url: config.odoo_url().to_string(),
            db: config.odoo_db().to_string(),
            username: config.odoo_username().to_string(),
            password: config.odoo_password().to_string(),
            timeout: config.store_call_timeout(),
        }
    }
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    method: &'static str,
    params: RpcParams<'a>,
    id: u64,
}

#[derive(Debug, Serialize)]
struct RpcParams<'a> {
    service: &'static str,
    method: &'a str,
    args: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    message: String,
    #[serde(default)]
    data: Option<RpcErrorData>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorData {
    #[serde(default)]
    message: Option<String>,
}

pub struct OdooStore {
    client: reqwest::Client,
    endpoint: String,
    config: OdooConnection,
    /// Cached uid from the first successful login
    uid: OnceCell<i64>,
    request_id: AtomicU64,
}

impl OdooStore {
    pub fn new(config: OdooConnection) -> Result<Self, StoreError> {
        // Create HTTP client once for reuse (connection pooling)
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        let endpoint = format!("{}/jsonrpc", config.url.trim_end_matches('/'));

        info!(
            endpoint = %endpoint,
            db = %config.db,
            user = %config.username,
            "odoo_store_initialized"
        );

        Ok(Self { client, endpoint, config, uid: OnceCell::new(), request_id: AtomicU64::new(1) })
    }

    async fn call(
        &self,
        service: &'static str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, StoreError> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            method: "call",
            params: RpcParams { service, method, args },
            id: self.request_id.fetch_add(1, Ordering::Relaxed),
        };

        let response = self.client.post(&self.endpoint).json(&request).send().await?;
        let status = response.status();
        if status.is_server_error() {
            return Err(StoreError::Unavailable(format!("HTTP {}", status.as_u16())));
        }
        if !status.is_success() {
            return Err(StoreError::Rpc {
                method: method.to_string(),
                message: format!("HTTP {}", status.as_u16()),
            });
        }

        let body: RpcResponse = response
            .json()
            .await
            .map_err(|e| StoreError::InvalidResponse(format!("{method}: {e}")))?;

        if let Some(error) = body.error {
            let detail = error.data.and_then(|d| d.message).unwrap_or(error.message);
            return Err(StoreError::Rpc { method: method.to_string(), message: detail });
        }

        Ok(body.result.unwrap_or(Value::Null))
    }

    async fn uid(&self) -> Result<i64, StoreError> {
        self.uid
            .get_or_try_init(|| async {
                let result = self
                    .call(
                        "common",
                        "login",
                        vec![
                            json!(self.config.db),
                            json!(self.config.username),
                            json!(self.config.password),
                        ],
                    )
                    .await?;
                let uid = result
                    .as_i64()
                    .ok_or_else(|| StoreError::AuthenticationFailed(self.config.username.clone()))?;
                info!(uid = %uid, "odoo_authenticated");
                Ok(uid)
            })
            .await
            .copied()
    }

    async fn execute_kw(
        &self,
        model: &str,
        method: &str,
        args: Value,
        kwargs: Value,
    ) -> Result<Value, StoreError> {
        let uid = self.uid().await?;
        debug!(model = %model, method = %method, "odoo_execute_kw");
        self.call(
            "object",
            "execute_kw",
            vec![
                json!(self.config.db),
                json!(uid),
                json!(self.config.password),
                json!(model),
                json!(method),
                args,
                kwargs,
            ],
        )
        .await
        .map_err(|e| match e {
            StoreError::Rpc { message, .. } => {
                StoreError::Rpc { method: format!("{model}.{method}"), message }
            }
            other => other,
        })
    }

    async fn search_ids(
        &self,
        model: &str,
        domain: Value,
        limit: Option<u32>,
    ) -> Result<Vec<RecordId>, StoreError> {
        let kwargs = match limit {
            Some(limit) => json!({ "limit": limit, "order": "id asc" }),
            None => json!({ "order": "id asc" }),
        };
        let result = self.execute_kw(model, "search", json!([domain]), kwargs).await?;
        parse_id_list(&result)
    }

    async fn quant_ids(
        &self,
        product_id: RecordId,
        location_id: RecordId,
    ) -> Result<Vec<RecordId>, StoreError> {
        self.search_ids(QUANT_MODEL, quant_domain(product_id, location_id), None).await
    }
}

fn quant_domain(product_id: RecordId, location_id: RecordId) -> Value {
    json!([["product_id", "=", product_id.0], ["location_id", "=", location_id.0]])
}

#[async_trait]
impl InventoryStore for OdooStore {
    async fn find_by_name(
        &self,
        kind: EntityKind,
        name: &str,
    ) -> Result<Option<RecordId>, StoreError> {
        let model = match kind {
            EntityKind::Product => PRODUCT_MODEL,
            EntityKind::Location => LOCATION_MODEL,
        };
        let ids = self.search_ids(model, json!([["name", "=", name]]), Some(1)).await?;
        Ok(ids.first().copied())
    }

    async fn find_tag_by_epc(&self, epc: &str) -> Result<Option<TagRecord>, StoreError> {
        let result = self
            .execute_kw(
                TAG_MODEL,
                "search_read",
                json!([[["epc_code", "=", epc]]]),
                json!({ "fields": TAG_FIELDS, "limit": 1, "order": "id asc" }),
            )
            .await?;

        let records = result
            .as_array()
            .ok_or_else(|| not_a_list("search_read"))?;
        records.first().map(parse_tag_record).transpose()
    }

    async fn create_tag(&self, tag: &NewTag) -> Result<RecordId, StoreError> {
        let values = json!({
            "epc_code": tag.epc_code,
            "product_id": tag.product_id.0,
            "last_scan_time": format_odoo_datetime(&tag.scan_time),
            "last_scan_location": tag.location_id.0,
        });
        let result = self.execute_kw(TAG_MODEL, "create", json!([values]), json!({})).await?;
        parse_created_id(&result)
    }

    async fn update_tag(
        &self,
        id: RecordId,
        scan_time: DateTime<Utc>,
        location_id: RecordId,
    ) -> Result<(), StoreError> {
        let values = json!({
            "last_scan_time": format_odoo_datetime(&scan_time),
            "last_scan_location": location_id.0,
        });
        self.execute_kw(TAG_MODEL, "write", json!([[id.0], values]), json!({})).await?;
        Ok(())
    }

    async fn delete_tag(&self, id: RecordId) -> Result<(), StoreError> {
        self.execute_kw(TAG_MODEL, "unlink", json!([[id.0]]), json!({})).await?;
        Ok(())
    }

    async fn read_inventory_level(
        &self,
        product_id: RecordId,
        location_id: RecordId,
    ) -> Result<Option<f64>, StoreError> {
        let domain = quant_domain(product_id, location_id);
        let result = self
            .execute_kw(
                QUANT_MODEL,
                "search_read",
                json!([domain]),
                json!({ "fields": ["quantity"], "limit": 1, "order": "id asc" }),
            )
            .await?;

        let records = result
            .as_array()
            .ok_or_else(|| not_a_list("search_read"))?;
        match records.first() {
            None => Ok(None),
            Some(record) => record
                .get("quantity")
                .and_then(Value::as_f64)
                .map(Some)
                .ok_or_else(|| StoreError::InvalidResponse("stock.quant without quantity".into())),
        }
    }

    async fn write_inventory_level(
        &self,
        product_id: RecordId,
        location_id: RecordId,
        quantity: f64,
    ) -> Result<(), StoreError> {
        let ids = self.quant_ids(product_id, location_id).await?;
        if ids.is_empty() {
            return Err(StoreError::Rpc {
                method: format!("{QUANT_MODEL}.write"),
                message: format!("no quant for product {product_id} at location {location_id}"),
            });
        }
        let ids: Vec<i64> = ids.iter().map(|id| id.0).collect();
        self.execute_kw(QUANT_MODEL, "write", json!([ids, { "quantity": quantity }]), json!({}))
            .await?;
        Ok(())
    }

    async fn create_inventory_level(
        &self,
        product_id: RecordId,
        location_id: RecordId,
        quantity: f64,
    ) -> Result<(), StoreError> {
        let values = json!({
            "product_id": product_id.0,
            "location_id": location_id.0,
            "quantity": quantity,
        });
        self.execute_kw(QUANT_MODEL, "create", json!([values]), json!({})).await?;
        Ok(())
    }
}

fn format_odoo_datetime(t: &DateTime<Utc>) -> String {
    t.format(ODOO_DATETIME_FORMAT).to_string()
}

fn parse_odoo_datetime(value: &Value) -> Option<DateTime<Utc>> {
    let s = value.as_str()?;
    NaiveDateTime::parse_from_str(s, ODOO_DATETIME_FORMAT).ok().map(|n| n.and_utc())
}

/// Many2one value: `[id, "name"]`, a bare id, or `false`
fn parse_many2one(value: &Value) -> Option<RecordId> {
    match value {
        Value::Array(items) => items.first().and_then(Value::as_i64).map(RecordId),
        Value::Number(n) => n.as_i64().map(RecordId),
        _ => None,
    }
}

fn not_a_list(method: &str) -> StoreError {
    StoreError::InvalidResponse(format!("{method} did not return a list"))
}

fn parse_id_list(value: &Value) -> Result<Vec<RecordId>, StoreError> {
    let items = value
        .as_array()
        .ok_or_else(|| StoreError::InvalidResponse(format!("expected id list, got {value}")))?;
    items
        .iter()
        .map(|v| {
            v.as_i64()
                .map(RecordId)
                .ok_or_else(|| StoreError::InvalidResponse(format!("non-integer id {v}")))
        })
        .collect()
}

fn parse_created_id(value: &Value) -> Result<RecordId, StoreError> {
    // Newer servers return a list of ids from create
    let id = match value {
        Value::Array(items) => items.first().and_then(Value::as_i64),
        other => other.as_i64(),
    };
    id.map(RecordId)
        .ok_or_else(|| StoreError::InvalidResponse(format!("create returned {value}")))
}

fn parse_tag_record(value: &Value) -> Result<TagRecord, StoreError> {
    let id = value
        .get("id")
        .and_then(Value::as_i64)
        .ok_or_else(|| StoreError::InvalidResponse("rfid.tag without id".into()))?;
    let epc_code = value
        .get("epc_code")
        .and_then(Value::as_str)
        .ok_or_else(|| StoreError::InvalidResponse(format!("rfid.tag {id} without epc_code")))?;
    let product_id = value
        .get("product_id")
        .and_then(parse_many2one)
        .ok_or_else(|| StoreError::InvalidResponse(format!("rfid.tag {id} without product")))?;

    Ok(TagRecord {
        id: RecordId(id),
        epc_code: epc_code.to_string(),
        product_id,
        last_scan_time: value.get("last_scan_time").and_then(parse_odoo_datetime),
        last_scan_location: value.get("last_scan_location").and_then(parse_many2one),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_tag_record() {
        let value = json!({
            "id": 12,
            "epc_code": "AAAAAAAAAAAAAAAAAAAAAAAA",
            "product_id": [7, "Blue Widget"],
            "last_scan_time": "2024-05-01 08:30:00",
            "last_scan_location": [3, "WH/Stock"],
        });
        let tag = parse_tag_record(&value).unwrap();
        assert_eq!(tag.id, RecordId(12));
        assert_eq!(tag.product_id, RecordId(7));
        assert_eq!(tag.last_scan_location, Some(RecordId(3)));
        assert_eq!(tag.last_scan_time, Some(Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap()));
    }

    #[test]
    fn test_parse_tag_record_with_false_fields() {
        let value = json!({
            "id": 12,
            "epc_code": "E",
            "product_id": [7, "Blue Widget"],
            "last_scan_time": false,
            "last_scan_location": false,
        });
        let tag = parse_tag_record(&value).unwrap();
        assert_eq!(tag.last_scan_time, None);
        assert_eq!(tag.last_scan_location, None);
    }

    #[test]
    fn test_parse_tag_record_without_product_is_invalid() {
        let value = json!({ "id": 12, "epc_code": "E", "product_id": false });
        assert!(matches!(parse_tag_record(&value), Err(StoreError::InvalidResponse(_))));
    }

    #[test]
    fn test_parse_created_id_forms() {
        assert_eq!(parse_created_id(&json!(41)).unwrap(), RecordId(41));
        assert_eq!(parse_created_id(&json!([42])).unwrap(), RecordId(42));
        assert!(parse_created_id(&json!(false)).is_err());
    }

    #[test]
    fn test_parse_id_list() {
        assert_eq!(parse_id_list(&json!([1, 2])).unwrap(), vec![RecordId(1), RecordId(2)]);
        assert!(parse_id_list(&json!([])).unwrap().is_empty());
        assert!(parse_id_list(&json!({"ids": [1]})).is_err());
        assert!(parse_id_list(&json!(["1"])).is_err());
    }

    #[test]
    fn test_datetime_format_round_trip() {
        let t = Utc.with_ymd_and_hms(2024, 12, 31, 23, 59, 58).unwrap();
        let s = format_odoo_datetime(&t);
        assert_eq!(s, "2024-12-31 23:59:58");
        assert_eq!(parse_odoo_datetime(&json!(s)), Some(t));
    }

    #[test]
    fn test_request_serialization() {
        let request = RpcRequest {
            jsonrpc: "2.0",
            method: "call",
            params: RpcParams {
                service: "common",
                method: "login",
                args: vec![json!("db"), json!("admin"), json!("secret")],
            },
            id: 1,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["params"]["service"], "common");
        assert_eq!(value["params"]["method"], "login");
        assert_eq!(value["params"]["args"][1], "admin");
    }

    #[test]
    fn test_error_response_prefers_data_message() {
        let body: RpcResponse = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": 3,
            "error": { "message": "Odoo Server Error", "data": { "message": "Access Denied" } }
        }))
        .unwrap();
        let error = body.error.unwrap();
        assert_eq!(error.data.and_then(|d| d.message).as_deref(), Some("Access Denied"));
        assert!(body.result.is_none());
    }

    #[test]
    fn test_connection_from_config() {
        let connection = OdooConnection::from_config(&Config::default());
        assert_eq!(connection.url, "http://localhost:8069");
        assert_eq!(connection.db, "warehouseDB");
        assert_eq!(connection.timeout, Duration::from_millis(5000));
    }

    #[test]
    fn test_endpoint_trims_trailing_slash() {
        let store = OdooStore::new(OdooConnection {
            url: "http://localhost:8069/".to_string(),
            db: "warehouseDB".to_string(),
            username: "admin".to_string(),
            password: "admin".to_string(),
            timeout: Duration::from_secs(1),
        })
        .unwrap();
        assert_eq!(store.endpoint, "http://localhost:8069/jsonrpc");
    }
}
