//! HTTP access to a HAT.
//!
//! [`Transport`] is the seam between HAT Core and the network. It only fails
//! for transport-level problems; status codes are classified here by
//! [`HatApi`]:
//!
//! - 2xx: success
//! - 401: [`HatError::Unauthorized`], after marking the token expired
//! - 404: [`HatError::TableNotFound`] for table lookups and calls on a
//!   table handle, [`HatError::NotFound`] otherwise
//! - anything else: [`HatError::UnexpectedResponse`]

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{Client, Method};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth::AuthSession;
use crate::error::{HatError, HatResult};
use crate::models::{LocationSample, NoteAttachments, NoteKind, NoteRecord, RemoteTableHandle};

/// A request to a HAT, addressed by absolute URL.
#[derive(Debug, Clone)]
pub struct HatRequest {
    pub method: Method,
    pub url: String,
    /// Sent as `X-Auth-Token` when present
    pub token: Option<String>,
    pub body: Option<Value>,
}

/// Raw response: status plus decoded body (`Null` when empty, a JSON string
/// when the body was not JSON).
#[derive(Debug, Clone, PartialEq)]
pub struct HatResponse {
    pub status: u16,
    pub body: Value,
}

impl HatResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Sends requests to a HAT.
///
/// Implementations return `Err(HatError::Network)` only when no response was
/// received. Every status code, including errors, is an `Ok`.
pub trait Transport: Send + Sync {
    fn send(
        &self,
        request: HatRequest,
    ) -> impl std::future::Future<Output = HatResult<HatResponse>> + Send;
}

/// reqwest-backed transport
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> HatResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HatError::Network(e.to_string()))?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    async fn send(&self, request: HatRequest) -> HatResult<HatResponse> {
        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .header("Accept", "application/json");

        if let Some(token) = &request.token {
            builder = builder.header("X-Auth-Token", token);
        }
        if let Some(body) = &request.body {
            // Sets Content-Type: application/json
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| HatError::Network(e.to_string()))?;
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| HatError::Network(e.to_string()))?;

        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        tracing::debug!(method = %request.method, url = %request.url, status, "HAT request");
        Ok(HatResponse { status, body })
    }
}

/// Notes parsed from a table fetch
#[derive(Debug, Clone, Default)]
pub struct FetchedNotes {
    pub notes: Vec<NoteRecord>,
    /// Records dropped for failing validation
    pub skipped: usize,
}

#[derive(Debug, Deserialize)]
struct TableLookup {
    #[serde(default)]
    id: Option<i64>,
    #[serde(default)]
    fields: Vec<TableField>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableField {
    #[serde(default)]
    table_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoteRecord {
    id: i64,
    last_updated: String,
    #[serde(default)]
    data: HashMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct NotableFields {
    message: String,
    #[serde(default)]
    kind: Option<String>,
    created_time: String,
    #[serde(default)]
    updated_time: Option<String>,
    #[serde(default)]
    shared: Option<Value>,
    #[serde(default)]
    shared_on: Option<String>,
    #[serde(default)]
    public_until: Option<String>,
    #[serde(default)]
    authorv1: Option<Value>,
    #[serde(default)]
    photov1: Option<Value>,
    #[serde(default)]
    locationv1: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct PostedRecord {
    #[serde(default)]
    id: Option<i64>,
    #[serde(default)]
    record: Option<PostedRecordId>,
}

#[derive(Debug, Deserialize)]
struct PostedRecordId {
    id: Option<i64>,
}

/// HAT data API client.
pub struct HatApi<T: Transport> {
    transport: T,
    auth: Arc<AuthSession>,
    domain: RwLock<Option<String>>,
}

impl<T: Transport> HatApi<T> {
    pub fn new(transport: T, auth: Arc<AuthSession>, domain: Option<String>) -> Self {
        Self {
            transport,
            auth,
            domain: RwLock::new(domain),
        }
    }

    pub fn auth(&self) -> &Arc<AuthSession> {
        &self.auth
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn domain(&self) -> HatResult<String> {
        self.domain
            .read()?
            .clone()
            .ok_or_else(|| HatError::Config("no HAT domain configured".to_string()))
    }

    pub fn set_domain(&self, domain: Option<String>) -> HatResult<()> {
        *self.domain.write()? = domain;
        Ok(())
    }

    fn base_url(&self) -> HatResult<String> {
        Ok(format!("https://{}/data", self.domain()?))
    }

    /// Send an authenticated request to the HAT data API.
    async fn send_authed(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> HatResult<HatResponse> {
        let token = self.auth.current_token()?;
        let url = format!("{}{}", self.base_url()?, path);
        self.transport
            .send(HatRequest {
                method,
                url,
                token: Some(token),
                body,
            })
            .await
    }

    /// Apply the status classification, with a caller-specific 404.
    fn classify(
        &self,
        response: HatResponse,
        not_found: impl FnOnce() -> HatError,
    ) -> HatResult<Value> {
        match response.status {
            s if (200..300).contains(&s) => Ok(response.body),
            401 => {
                self.auth.note_unauthorized();
                Err(HatError::Unauthorized(format!(
                    "HAT rejected the access token: {}",
                    error_message(&response.body)
                )))
            }
            404 => Err(not_found()),
            status => Err(HatError::unexpected(status, error_message(&response.body))),
        }
    }

    /// Look up a table by name and source.
    pub async fn find_table(&self, table: &str, source: &str) -> HatResult<RemoteTableHandle> {
        let path = format!(
            "/table?name={}&source={}",
            urlencoding::encode(table),
            urlencoding::encode(source)
        );
        let response = self.send_authed(Method::GET, &path, None).await?;
        let body = self.classify(response, || HatError::TableNotFound {
            table: table.to_string(),
            source_name: source.to_string(),
        })?;

        let lookup: TableLookup = serde_json::from_value(body)
            .map_err(|e| HatError::unexpected(200, format!("malformed table lookup: {}", e)))?;
        let table_id = lookup
            .fields
            .first()
            .and_then(|f| f.table_id)
            .or(lookup.id)
            .ok_or_else(|| HatError::unexpected(200, "table lookup carried no table id"))?;

        Ok(RemoteTableHandle {
            table_id,
            table_name: table.to_string(),
            source_name: source.to_string(),
        })
    }

    /// Create a table from a structure document.
    pub async fn create_table(&self, structure: &Value) -> HatResult<()> {
        let response = self
            .send_authed(Method::POST, "/table", Some(structure.clone()))
            .await?;
        self.classify(response, || HatError::NotFound("table endpoint".to_string()))?;
        Ok(())
    }

    /// Fetch all records of a notes table, skipping invalid ones.
    pub async fn fetch_notes(&self, handle: &RemoteTableHandle) -> HatResult<FetchedNotes> {
        let path = format!("/table/{}/values?pretty=true", handle.table_id);
        let response = self.send_authed(Method::GET, &path, None).await?;
        let body = self.classify(response, || missing_table(handle))?;

        let records = match body {
            Value::Array(records) => records,
            Value::Null => Vec::new(),
            other => {
                return Err(HatError::unexpected(
                    200,
                    format!("expected an array of records, got {}", json_kind(&other)),
                ))
            }
        };

        let mut fetched = FetchedNotes::default();
        for record in records {
            match parse_note(record, &handle.table_name) {
                Ok(note) => fetched.notes.push(note),
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping invalid note record");
                    fetched.skipped += 1;
                }
            }
        }

        tracing::debug!(
            table = %handle.table_name,
            notes = fetched.notes.len(),
            skipped = fetched.skipped,
            "Fetched notes"
        );
        Ok(fetched)
    }

    /// Post one note. Returns the remote id when the HAT reports it.
    pub async fn post_note(
        &self,
        handle: &RemoteTableHandle,
        note: &NoteRecord,
    ) -> HatResult<Option<i64>> {
        let body = note_body(handle, note);
        let response = self
            .send_authed(Method::POST, "/record/values", Some(body))
            .await?;
        let body = self.classify(response, || missing_table(handle))?;
        Ok(posted_id(body))
    }

    /// Upload a batch of location samples as one request.
    pub async fn post_locations(
        &self,
        handle: &RemoteTableHandle,
        samples: &[LocationSample],
    ) -> HatResult<()> {
        let body = Value::Array(samples.iter().map(|s| location_body(handle, s)).collect());
        let response = self
            .send_authed(Method::POST, "/record/values", Some(body))
            .await?;
        self.classify(response, || missing_table(handle))?;
        Ok(())
    }

    pub async fn delete_record(&self, record_id: i64) -> HatResult<()> {
        let path = format!("/record/{}", record_id);
        let response = self.send_authed(Method::DELETE, &path, None).await?;
        self.classify(response, || {
            HatError::NotFound(format!("record {}", record_id))
        })?;
        Ok(())
    }

    /// Notify the notables bulletin that this HAT has new notes.
    pub async fn tickle(&self, bulletin_url: &str) -> HatResult<()> {
        let domain = self.domain()?;
        let url = format!("{}?phata={}", bulletin_url, urlencoding::encode(&domain));
        let response = self
            .transport
            .send(HatRequest {
                method: Method::GET,
                url,
                token: None,
                body: None,
            })
            .await?;

        if response.is_success() {
            Ok(())
        } else {
            Err(HatError::unexpected(
                response.status,
                error_message(&response.body),
            ))
        }
    }
}

fn missing_table(handle: &RemoteTableHandle) -> HatError {
    HatError::TableNotFound {
        table: handle.table_name.clone(),
        source_name: handle.source_name.clone(),
    }
}

/// Parse one record from a notes table fetch.
pub fn parse_note(record: Value, table_name: &str) -> HatResult<NoteRecord> {
    let mut record: RemoteRecord = serde_json::from_value(record)
        .map_err(|e| HatError::validation("record", e.to_string()))?;

    let fields = record
        .data
        .remove(table_name)
        .ok_or_else(|| HatError::validation("data", format!("missing '{}' entry", table_name)))?;
    let fields: NotableFields =
        serde_json::from_value(fields).map_err(|e| HatError::validation("data", e.to_string()))?;

    let kind = match fields.kind.as_deref() {
        Some(kind) => kind.parse::<NoteKind>()?,
        None => NoteKind::Note,
    };
    let created_at = parse_time("created_time", &fields.created_time)?;
    let updated_at = match fields.updated_time.as_deref() {
        Some(t) if !t.is_empty() => parse_time("updated_time", t)?,
        _ => created_at,
    };
    let last_local_update = parse_time("lastUpdated", &record.last_updated)?;
    let public_until = match fields.public_until.as_deref() {
        Some(t) if !t.is_empty() => Some(parse_time("public_until", t)?),
        _ => None,
    };
    let shared = match fields.shared {
        Some(Value::Bool(b)) => b,
        Some(Value::String(s)) => s == "true",
        _ => false,
    };

    Ok(NoteRecord {
        id: Some(record.id),
        local_id: None,
        message: fields.message,
        kind,
        created_at,
        updated_at,
        last_local_update,
        shared_on: fields.shared_on.unwrap_or_default(),
        shared,
        public_until,
        attachments: NoteAttachments {
            author: fields.authorv1,
            photo: fields.photov1,
            location: fields.locationv1,
        },
    })
}

fn parse_time(field: &str, value: &str) -> HatResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| HatError::validation(field, format!("'{}': {}", value, e)))
}

fn note_body(handle: &RemoteTableHandle, note: &NoteRecord) -> Value {
    let shared = if note.shared { "true" } else { "false" };
    let mut fields = json!({
        "message": note.message,
        "kind": note.kind.as_str(),
        "created_time": note.created_at.to_rfc3339(),
        "updated_time": note.updated_at.to_rfc3339(),
        "shared": shared,
        "shared_on": note.shared_on,
    });
    if let Some(until) = note.public_until {
        fields["public_until"] = Value::String(until.to_rfc3339());
    }
    let attachments = &note.attachments;
    for (key, value) in [
        ("authorv1", &attachments.author),
        ("photov1", &attachments.photo),
        ("locationv1", &attachments.location),
    ] {
        if let Some(value) = value {
            fields[key] = value.clone();
        }
    }

    record_body(handle, fields)
}

fn location_body(handle: &RemoteTableHandle, sample: &LocationSample) -> Value {
    record_body(
        handle,
        json!({
            "latitude": sample.latitude,
            "longitude": sample.longitude,
            "accuracy": sample.horizontal_accuracy,
            "timestamp": sample.captured_at.to_rfc3339(),
        }),
    )
}

fn record_body(handle: &RemoteTableHandle, fields: Value) -> Value {
    let mut data = serde_json::Map::new();
    data.insert(handle.table_name.clone(), fields);
    json!({
        "record": { "name": handle.table_name },
        "table": {
            "id": handle.table_id,
            "name": handle.table_name,
            "source": handle.source_name,
        },
        "data": data,
    })
}

fn posted_id(body: Value) -> Option<i64> {
    let posted: PostedRecord = serde_json::from_value(body).ok()?;
    posted.record.and_then(|r| r.id).or(posted.id)
}

/// Structure document for the notables table.
pub fn notables_structure(table: &str, source: &str) -> Value {
    table_structure(
        table,
        source,
        &[
            "message",
            "kind",
            "created_time",
            "updated_time",
            "shared",
            "shared_on",
            "public_until",
        ],
    )
}

/// Structure document for the locations table.
pub fn locations_structure(table: &str, source: &str) -> Value {
    table_structure(
        table,
        source,
        &["latitude", "longitude", "accuracy", "timestamp"],
    )
}

fn table_structure(table: &str, source: &str, fields: &[&str]) -> Value {
    json!({
        "name": table,
        "source": source,
        "fields": fields.iter().map(|f| json!({ "name": f })).collect::<Vec<_>>(),
    })
}

fn error_message(body: &Value) -> String {
    match body {
        Value::Null => "empty response".to_string(),
        Value::String(s) => s.clone(),
        Value::Object(map) => map
            .get("message")
            .or_else(|| map.get("error"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| body.to_string()),
        other => other.to_string(),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
