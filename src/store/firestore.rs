use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

use crate::profile::{ProfileId, FIREBASE_API_KEY, FIREBASE_PROJECT_ID};
use crate::settings;
use crate::store::{
    BookRecord, CategoryRecord, EntityKind, EntityRecord, EntityStore, OrderItemRecord,
    OrderRecord, PingError, SchemaPresence, SettingsMap, UpsertOutcome, UserRecord, VideoRecord,
    WriteError,
};
use crate::{AppError, AppResult};

/// Standard Firestore emulator override, same convention as the official
/// SDKs. When set, requests go to `http://<host>/v1` without TLS.
pub const FIRESTORE_EMULATOR_ENV: &str = "FIRESTORE_EMULATOR_HOST";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const DOC_ID_LEN: usize = 24;

/// Firestore backend over the REST API. Documents carry natural keys in
/// their fields, so unlike the SQL stores there are no ids to resolve.
pub struct FirestoreStore {
    client: reqwest::Client,
    project_id: String,
    api_key: String,
    base_url: String,
}

impl FirestoreStore {
    pub fn new(settings: &SettingsMap) -> AppResult<Self> {
        let project_id = settings::require(settings, FIREBASE_PROJECT_ID)?.to_string();
        let api_key = settings::require(settings, FIREBASE_API_KEY)?.to_string();
        let base_url = match std::env::var(FIRESTORE_EMULATOR_ENV) {
            Ok(host) if !host.trim().is_empty() => format!("http://{}/v1", host.trim()),
            _ => "https://firestore.googleapis.com/v1".to_string(),
        };
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        tracing::info!(
            target: "switchboard",
            event = "store_open",
            backend = "firebase",
            project_id = %project_id
        );

        Ok(Self {
            client,
            project_id,
            api_key,
            base_url,
        })
    }

    fn documents_url(&self) -> String {
        format!(
            "{}/projects/{}/databases/(default)/documents",
            self.base_url, self.project_id
        )
    }

    /// Runs a structured query and returns (document name, fields) pairs.
    async fn run_query(&self, body: Value) -> AppResult<Vec<(String, Value)>> {
        let url = format!("{}:runQuery?key={}", self.documents_url(), self.api_key);
        let resp = self.client.post(&url).json(&body).send().await?;
        let resp = check_status(resp, "runQuery").await?;
        let entries: Value = resp.json::<Value>().await?;
        let mut out = Vec::new();
        for entry in entries.as_array().into_iter().flatten() {
            let Some(doc) = entry.get("document") else {
                continue;
            };
            let name = doc
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let fields = doc.get("fields").cloned().unwrap_or_else(|| json!({}));
            out.push((name, fields));
        }
        Ok(out)
    }

    /// Looks up at most one document by natural key.
    async fn find_by_key(&self, record: &EntityRecord) -> AppResult<Option<(String, Value)>> {
        let filters: Vec<Value> = key_filter_values(record)
            .into_iter()
            .map(|(field, value)| {
                json!({
                    "fieldFilter": {
                        "field": {"fieldPath": field},
                        "op": "EQUAL",
                        "value": value,
                    }
                })
            })
            .collect();
        let filter = if filters.len() == 1 {
            filters.into_iter().next().unwrap_or_default()
        } else {
            json!({"compositeFilter": {"op": "AND", "filters": filters}})
        };
        let body = json!({
            "structuredQuery": {
                "from": [{"collectionId": record.kind().table()}],
                "where": filter,
                "limit": 2,
            }
        });
        let mut matches = self.run_query(body).await?;
        if matches.len() > 1 {
            tracing::warn!(
                target: "switchboard",
                event = "firestore_duplicate_key",
                collection = record.kind().table(),
                key = %record.key_display()
            );
        }
        Ok(if matches.is_empty() {
            None
        } else {
            Some(matches.swap_remove(0))
        })
    }

    async fn patch_document(
        &self,
        url: &str,
        fields: &Value,
        context: &str,
    ) -> Result<(), WriteError> {
        let resp = self
            .client
            .patch(url)
            .json(&json!({"fields": fields}))
            .send()
            .await
            .map_err(|e| WriteError::Fatal(AppError::from(e)))?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = body_preview(resp).await;
        if status.is_client_error() {
            Err(WriteError::Row(format!(
                "{context}: HTTP {status}: {body}"
            )))
        } else {
            Err(WriteError::Fatal(
                AppError::new("HTTP/STATUS", "Firestore write failed")
                    .with_context("status", status.as_u16().to_string())
                    .with_context("operation", context.to_string())
                    .with_context("body", body),
            ))
        }
    }

}

#[async_trait]
impl EntityStore for FirestoreStore {
    fn profile(&self) -> ProfileId {
        ProfileId::Firebase
    }

    async fn ping(&self) -> Result<(), PingError> {
        let url = format!(
            "{}/categories?pageSize=1&key={}",
            self.documents_url(),
            self.api_key
        );
        let resp = match self.client.get(&url).send().await {
            Ok(resp) => resp,
            Err(e) => {
                return Err(PingError::Transient(
                    AppError::from(e).with_context("backend", "firebase"),
                ))
            }
        };
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = body_preview(resp).await;
        let err = AppError::new("HTTP/STATUS", "Firestore rejected the probe request")
            .with_context("backend", "firebase")
            .with_context("status", status.as_u16().to_string())
            .with_context("body", body);
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            Err(PingError::Auth(err))
        } else {
            Err(PingError::Transient(err))
        }
    }

    /// Firestore has no declared schema: a collection exists the moment
    /// its first document lands and cannot be told apart from an empty
    /// one. The expected collections are therefore always present.
    async fn schema_presence(&self) -> AppResult<SchemaPresence> {
        Ok(SchemaPresence::Present)
    }

    /// Collections materialize on first write; there is nothing to create
    /// up front.
    async fn apply_schema(&self) -> AppResult<()> {
        tracing::info!(
            target: "switchboard",
            event = "schema_applied",
            backend = "firebase",
            statements = 0usize
        );
        Ok(())
    }

    async fn read_all(&self, entity: EntityKind) -> AppResult<Vec<Result<EntityRecord, String>>> {
        let body = json!({
            "structuredQuery": {
                "from": [{"collectionId": entity.table()}],
                "orderBy": [{"field": {"fieldPath": "__name__"}, "direction": "ASCENDING"}],
            }
        });
        let docs = self.run_query(body).await?;
        Ok(docs
            .into_iter()
            .map(|(_, fields)| decode_record(entity, &fields))
            .collect())
    }

    async fn upsert(&self, record: &EntityRecord) -> Result<UpsertOutcome, WriteError> {
        let fields = encode_fields(record).map_err(WriteError::Row)?;
        let existing = self.find_by_key(record).await.map_err(WriteError::Fatal)?;
        match existing {
            Some((name, current_fields)) => {
                if matches!(
                    decode_record(record.kind(), &current_fields),
                    Ok(current) if current == *record
                ) {
                    return Ok(UpsertOutcome::Unchanged);
                }
                let url = format!("{}/{}?key={}", self.base_url, name, self.api_key);
                self.patch_document(&url, &fields, "update document").await?;
                Ok(UpsertOutcome::Updated)
            }
            None => {
                let url = format!(
                    "{}/{}/{}?key={}",
                    self.documents_url(),
                    record.kind().table(),
                    doc_id(record),
                    self.api_key
                );
                self.patch_document(&url, &fields, "create document").await?;
                Ok(UpsertOutcome::Inserted)
            }
        }
    }

    async fn count(&self, entity: EntityKind) -> AppResult<i64> {
        let url = format!(
            "{}:runAggregationQuery?key={}",
            self.documents_url(),
            self.api_key
        );
        let body = json!({
            "structuredAggregationQuery": {
                "structuredQuery": {"from": [{"collectionId": entity.table()}]},
                "aggregations": [{"alias": "n", "count": {}}],
            }
        });
        let resp = self.client.post(&url).json(&body).send().await?;
        let resp = check_status(resp, "runAggregationQuery").await?;
        let entries: Value = resp.json::<Value>().await?;
        let raw = entries
            .as_array()
            .and_then(|a| a.first())
            .and_then(|e| e.pointer("/result/aggregateFields/n/integerValue"))
            .and_then(Value::as_str)
            .unwrap_or("0");
        raw.parse().map_err(|_| {
            AppError::new("HTTP/DECODE", "Firestore count response was not a number")
                .with_context("value", raw.to_string())
        })
    }
}

async fn check_status(resp: reqwest::Response, operation: &str) -> AppResult<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = body_preview(resp).await;
    Err(AppError::new("HTTP/STATUS", "Firestore request failed")
        .with_context("operation", operation.to_string())
        .with_context("status", status.as_u16().to_string())
        .with_context("body", body))
}

async fn body_preview(resp: reqwest::Response) -> String {
    let text = resp.text().await.unwrap_or_default();
    let flat = text.replace('\n', " ");
    if flat.len() > 200 {
        format!("{}...", &flat[..200])
    } else {
        flat
    }
}

/// Deterministic document id derived from the natural key, so that
/// re-running a migration addresses the same documents.
fn doc_id(record: &EntityRecord) -> String {
    let mut hasher = Sha256::new();
    hasher.update(record.kind().table().as_bytes());
    for (field, value) in record.key_fields() {
        hasher.update([0x1f]);
        hasher.update(field.as_bytes());
        hasher.update([0x1f]);
        hasher.update(value.as_bytes());
    }
    let digest = hasher.finalize();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..DOC_ID_LEN].to_string()
}

fn string_value(s: &str) -> Value {
    json!({"stringValue": s})
}

fn integer_value(n: i64) -> Value {
    json!({"integerValue": n.to_string()})
}

fn null_value() -> Value {
    json!({"nullValue": null})
}

fn optional_string_value(s: Option<&str>) -> Value {
    match s {
        Some(s) => string_value(s),
        None => null_value(),
    }
}

fn timestamp_value(ms: i64) -> Result<Value, String> {
    use chrono::{SecondsFormat, TimeZone, Utc};
    match Utc.timestamp_millis_opt(ms).single() {
        Some(dt) => Ok(json!({
            "timestampValue": dt.to_rfc3339_opts(SecondsFormat::Millis, true)
        })),
        None => Err(format!("timestamp {ms}ms is out of range")),
    }
}

fn encode_fields(record: &EntityRecord) -> Result<Value, String> {
    let fields = match record {
        EntityRecord::Category(c) => json!({
            "name": string_value(&c.name),
            "created_at": timestamp_value(c.created_at_ms)?,
        }),
        EntityRecord::User(u) => json!({
            "email": string_value(&u.email),
            "display_name": string_value(&u.display_name),
            "created_at": timestamp_value(u.created_at_ms)?,
        }),
        EntityRecord::Book(b) => json!({
            "title": string_value(&b.title),
            "author": string_value(&b.author),
            "category": optional_string_value(b.category.as_deref()),
            "price_cents": integer_value(b.price_cents),
            "created_at": timestamp_value(b.created_at_ms)?,
        }),
        EntityRecord::Video(v) => json!({
            "title": string_value(&v.title),
            "category": optional_string_value(v.category.as_deref()),
            "duration_seconds": integer_value(v.duration_seconds),
            "created_at": timestamp_value(v.created_at_ms)?,
        }),
        EntityRecord::Order(o) => json!({
            "order_ref": string_value(&o.order_ref),
            "user_email": string_value(&o.user_email),
            "total_cents": integer_value(o.total_cents),
            "placed_at": timestamp_value(o.placed_at_ms)?,
        }),
        EntityRecord::OrderItem(i) => json!({
            "order_ref": string_value(&i.order_ref),
            "line_no": integer_value(i.line_no),
            "book_title": string_value(&i.book_title),
            "book_author": string_value(&i.book_author),
            "quantity": integer_value(i.quantity),
            "unit_price_cents": integer_value(i.unit_price_cents),
        }),
    };
    Ok(fields)
}

fn fields_map(fields: &Value) -> Result<&Map<String, Value>, String> {
    fields
        .as_object()
        .ok_or_else(|| "document has no fields".to_string())
}

fn get_string(fields: &Map<String, Value>, key: &str) -> Result<String, String> {
    fields
        .get(key)
        .and_then(|v| v.get("stringValue"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| format!("field {key}: missing or not a string"))
}

fn get_opt_string(fields: &Map<String, Value>, key: &str) -> Result<Option<String>, String> {
    match fields.get(key) {
        None => Ok(None),
        Some(v) if v.get("nullValue").is_some() => Ok(None),
        Some(v) => v
            .get("stringValue")
            .and_then(Value::as_str)
            .map(|s| Some(s.to_string()))
            .ok_or_else(|| format!("field {key}: not a string")),
    }
}

/// Integers come back as `integerValue` strings; accept a bare JSON number
/// too, which the emulator has been seen to emit.
fn get_integer(fields: &Map<String, Value>, key: &str) -> Result<i64, String> {
    let value = fields
        .get(key)
        .and_then(|v| v.get("integerValue"))
        .ok_or_else(|| format!("field {key}: missing integerValue"))?;
    match value {
        Value::String(s) => s
            .parse()
            .map_err(|_| format!("field {key}: '{s}' is not an integer")),
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| format!("field {key}: number out of range")),
        _ => Err(format!("field {key}: unexpected integerValue shape")),
    }
}

/// Timestamps are stored as `timestampValue`, but documents written by
/// older import jobs carry epoch milliseconds in an `integerValue`.
fn get_timestamp_ms(fields: &Map<String, Value>, key: &str) -> Result<i64, String> {
    let holder = fields
        .get(key)
        .ok_or_else(|| format!("field {key}: missing"))?;
    if let Some(ts) = holder.get("timestampValue").and_then(Value::as_str) {
        return chrono::DateTime::parse_from_rfc3339(ts)
            .map(|dt| dt.timestamp_millis())
            .map_err(|e| format!("field {key}: bad timestamp '{ts}': {e}"));
    }
    if holder.get("integerValue").is_some() {
        return get_integer(fields, key);
    }
    Err(format!("field {key}: neither timestamp nor integer"))
}

fn decode_record(entity: EntityKind, fields: &Value) -> Result<EntityRecord, String> {
    let map = fields_map(fields)?;
    let record = match entity {
        EntityKind::Categories => EntityRecord::Category(CategoryRecord {
            name: get_string(map, "name")?,
            created_at_ms: get_timestamp_ms(map, "created_at")?,
        }),
        EntityKind::Users => EntityRecord::User(UserRecord {
            email: get_string(map, "email")?,
            display_name: get_string(map, "display_name")?,
            created_at_ms: get_timestamp_ms(map, "created_at")?,
        }),
        EntityKind::Books => EntityRecord::Book(BookRecord {
            title: get_string(map, "title")?,
            author: get_string(map, "author")?,
            category: get_opt_string(map, "category")?,
            price_cents: get_integer(map, "price_cents")?,
            created_at_ms: get_timestamp_ms(map, "created_at")?,
        }),
        EntityKind::Videos => EntityRecord::Video(VideoRecord {
            title: get_string(map, "title")?,
            category: get_opt_string(map, "category")?,
            duration_seconds: get_integer(map, "duration_seconds")?,
            created_at_ms: get_timestamp_ms(map, "created_at")?,
        }),
        EntityKind::Orders => EntityRecord::Order(OrderRecord {
            order_ref: get_string(map, "order_ref")?,
            user_email: get_string(map, "user_email")?,
            total_cents: get_integer(map, "total_cents")?,
            placed_at_ms: get_timestamp_ms(map, "placed_at")?,
        }),
        EntityKind::OrderItems => EntityRecord::OrderItem(OrderItemRecord {
            order_ref: get_string(map, "order_ref")?,
            line_no: get_integer(map, "line_no")?,
            book_title: get_string(map, "book_title")?,
            book_author: get_string(map, "book_author")?,
            quantity: get_integer(map, "quantity")?,
            unit_price_cents: get_integer(map, "unit_price_cents")?,
        }),
    };
    Ok(record)
}

/// Natural-key fields with properly typed Firestore values, for equality
/// filters.
fn key_filter_values(record: &EntityRecord) -> Vec<(&'static str, Value)> {
    match record {
        EntityRecord::Category(c) => vec![("name", string_value(&c.name))],
        EntityRecord::User(u) => vec![("email", string_value(&u.email))],
        EntityRecord::Book(b) => vec![
            ("title", string_value(&b.title)),
            ("author", string_value(&b.author)),
        ],
        EntityRecord::Video(v) => vec![("title", string_value(&v.title))],
        EntityRecord::Order(o) => vec![("order_ref", string_value(&o.order_ref))],
        EntityRecord::OrderItem(i) => vec![
            ("order_ref", string_value(&i.order_ref)),
            ("line_no", integer_value(i.line_no)),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_book() -> EntityRecord {
        EntityRecord::Book(BookRecord {
            title: "Dune".into(),
            author: "Frank Herbert".into(),
            category: Some("Sci-Fi".into()),
            price_cents: 1299,
            created_at_ms: 1_700_000_000_000,
        })
    }

    #[test]
    fn doc_id_is_deterministic_and_key_scoped() {
        let a = doc_id(&sample_book());
        let b = doc_id(&sample_book());
        assert_eq!(a, b);
        assert_eq!(a.len(), DOC_ID_LEN);

        let other = EntityRecord::Book(BookRecord {
            title: "Dune Messiah".into(),
            author: "Frank Herbert".into(),
            category: None,
            price_cents: 1299,
            created_at_ms: 1_700_000_000_000,
        });
        assert_ne!(a, doc_id(&other));
    }

    #[test]
    fn encode_decode_roundtrip_preserves_the_record() {
        let record = sample_book();
        let fields = encode_fields(&record).unwrap();
        let back = decode_record(EntityKind::Books, &fields).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn none_category_encodes_as_null_and_decodes_back() {
        let record = EntityRecord::Video(VideoRecord {
            title: "Intro".into(),
            category: None,
            duration_seconds: 90,
            created_at_ms: 0,
        });
        let fields = encode_fields(&record).unwrap();
        assert!(fields["category"].get("nullValue").is_some());
        assert_eq!(decode_record(EntityKind::Videos, &fields).unwrap(), record);
    }

    #[test]
    fn timestamps_encode_as_rfc3339() {
        let fields = encode_fields(&EntityRecord::Category(CategoryRecord {
            name: "Fiction".into(),
            created_at_ms: 0,
        }))
        .unwrap();
        assert_eq!(
            fields["created_at"]["timestampValue"],
            "1970-01-01T00:00:00.000Z"
        );
    }

    #[test]
    fn legacy_integer_timestamps_decode() {
        let fields = json!({
            "name": {"stringValue": "Fiction"},
            "created_at": {"integerValue": "1700000000000"},
        });
        match decode_record(EntityKind::Categories, &fields).unwrap() {
            EntityRecord::Category(c) => assert_eq!(c.created_at_ms, 1_700_000_000_000),
            other => panic!("unexpected record {other:?}"),
        }
    }

    #[test]
    fn missing_field_is_reported_by_name() {
        let fields = json!({"name": {"stringValue": "Fiction"}});
        let err = decode_record(EntityKind::Categories, &fields).unwrap_err();
        assert!(err.contains("created_at"), "{err}");
    }

    #[tokio::test]
    async fn schema_presence_reports_implicit_collections_as_present() {
        let mut settings = SettingsMap::new();
        settings.insert(FIREBASE_PROJECT_ID.into(), "demo-project".into());
        settings.insert(FIREBASE_API_KEY.into(), "test-key".into());
        let store = FirestoreStore::new(&settings).unwrap();
        assert!(matches!(
            store.schema_presence().await.unwrap(),
            SchemaPresence::Present
        ));
    }

    #[test]
    fn order_item_key_filter_types_line_no_as_integer() {
        let record = EntityRecord::OrderItem(OrderItemRecord {
            order_ref: "ORD-1".into(),
            line_no: 3,
            book_title: "Dune".into(),
            book_author: "Frank Herbert".into(),
            quantity: 1,
            unit_price_cents: 1299,
        });
        let filters = key_filter_values(&record);
        assert_eq!(filters[0].0, "order_ref");
        assert_eq!(filters[1].1["integerValue"], "3");
    }
}
