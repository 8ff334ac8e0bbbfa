//! Response body formatters keyed by content type.
//!
//! Every formatter sets `Content-Length` to the exact byte length of the
//! body it returns. The `application/json` entry is always [`JsonFormatter`]:
//! it unwraps [`WrappedError`] envelopes to their cause and encodes binary
//! bodies as base64 before serializing.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::Response;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AppError, AppResult};

/// JSON content type.
pub const CONTENT_TYPE_JSON: &str = "application/json";
/// Plain text content type.
pub const CONTENT_TYPE_TEXT: &str = "text/plain";
/// Raw binary content type.
pub const CONTENT_TYPE_BINARY: &str = "application/octet-stream";

/// Discriminator value marking an application error envelope.
pub const APP_ERROR_KIND: &str = "AppError";

/// Response body before formatting.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Structured data.
    Json(Value),
    /// Raw bytes.
    Binary(Bytes),
    /// Text.
    Text(String),
}

impl Payload {
    /// Serialize any value into a JSON payload.
    pub fn json<T: Serialize>(value: &T) -> AppResult<Self> {
        Ok(Self::Json(serde_json::to_value(value)?))
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Self::Binary(bytes)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Binary(Bytes::from(bytes))
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

/// Application error envelope: `{"kind": "AppError", "underlyingCause": ...}`.
///
/// Only the cause is ever sent to clients by [`JsonFormatter`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename = "AppError")]
pub struct WrappedError {
    /// Public description of the failure.
    #[serde(rename = "underlyingCause")]
    pub underlying_cause: Value,
    /// Internal context; stripped on output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
}

impl WrappedError {
    /// Wrap `cause`.
    pub fn new(cause: impl Into<Value>) -> Self {
        Self {
            underlying_cause: cause.into(),
            context: None,
        }
    }

    /// Attach internal context.
    pub fn with_context(mut self, context: impl Into<Value>) -> Self {
        self.context = Some(context.into());
        self
    }
}

impl From<WrappedError> for Payload {
    fn from(error: WrappedError) -> Self {
        let mut envelope = serde_json::Map::new();
        envelope.insert("kind".into(), Value::String(APP_ERROR_KIND.into()));
        envelope.insert("underlyingCause".into(), error.underlying_cause);
        if let Some(context) = error.context {
            envelope.insert("context".into(), context);
        }
        Self::Json(Value::Object(envelope))
    }
}

/// The cause carried by an application error envelope, if `value` is one.
pub fn underlying_cause(value: &Value) -> Option<&Value> {
    let object = value.as_object()?;
    if object.get("kind").and_then(Value::as_str) != Some(APP_ERROR_KIND) {
        return None;
    }
    object.get("underlyingCause")
}

/// Turns a payload into body bytes.
pub trait Formatter: Send + Sync {
    /// Format `payload`, setting `Content-Length` (and any other headers) on `headers`.
    fn format(&self, payload: Payload, headers: &mut HeaderMap) -> AppResult<Bytes>;
}

fn finish(data: Vec<u8>, headers: &mut HeaderMap) -> Bytes {
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(data.len()));
    Bytes::from(data)
}

/// Mandatory `application/json` formatter.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFormatter;

impl Formatter for JsonFormatter {
    fn format(&self, payload: Payload, headers: &mut HeaderMap) -> AppResult<Bytes> {
        let value = match payload {
            Payload::Json(value) => match underlying_cause(&value) {
                Some(cause) => cause.clone(),
                None => value,
            },
            Payload::Binary(bytes) => Value::String(BASE64.encode(bytes)),
            Payload::Text(text) => Value::String(text),
        };
        let data = serde_json::to_vec(&value)?;
        Ok(finish(data, headers))
    }
}

/// Default `text/plain` formatter.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextFormatter;

impl Formatter for TextFormatter {
    fn format(&self, payload: Payload, headers: &mut HeaderMap) -> AppResult<Bytes> {
        let data = match payload {
            Payload::Text(text) => text.into_bytes(),
            Payload::Json(Value::String(text)) => text.into_bytes(),
            Payload::Json(value) => value.to_string().into_bytes(),
            Payload::Binary(bytes) => String::from_utf8_lossy(&bytes).into_owned().into_bytes(),
        };
        Ok(finish(data, headers))
    }
}

/// Default `application/octet-stream` formatter.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryFormatter;

impl Formatter for BinaryFormatter {
    fn format(&self, payload: Payload, headers: &mut HeaderMap) -> AppResult<Bytes> {
        let data = match payload {
            Payload::Binary(bytes) => bytes.to_vec(),
            Payload::Text(text) => text.into_bytes(),
            Payload::Json(value) => serde_json::to_vec(&value)?,
        };
        Ok(finish(data, headers))
    }
}

/// Formatter table used to render responses.
#[derive(Clone)]
pub struct Formatters {
    by_type: HashMap<String, Arc<dyn Formatter>>,
}

impl std::fmt::Debug for Formatters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<&str> = self.by_type.keys().map(String::as_str).collect();
        types.sort_unstable();
        f.debug_struct("Formatters").field("types", &types).finish()
    }
}

impl Default for Formatters {
    fn default() -> Self {
        Self::new(HashMap::new())
    }
}

impl Formatters {
    /// Build the table from caller formatters.
    ///
    /// Text and binary defaults fill gaps; the JSON formatter always replaces
    /// any caller entry for `application/json`.
    pub fn new(custom: HashMap<String, Arc<dyn Formatter>>) -> Self {
        let mut by_type: HashMap<String, Arc<dyn Formatter>> = custom
            .into_iter()
            .map(|(content_type, formatter)| (normalize(&content_type), formatter))
            .collect();
        by_type
            .entry(CONTENT_TYPE_TEXT.to_string())
            .or_insert_with(|| Arc::new(TextFormatter));
        by_type
            .entry(CONTENT_TYPE_BINARY.to_string())
            .or_insert_with(|| Arc::new(BinaryFormatter));
        by_type.insert(CONTENT_TYPE_JSON.to_string(), Arc::new(JsonFormatter));
        Self { by_type }
    }

    /// Formatter registered for `content_type` (parameters ignored).
    pub fn get(&self, content_type: &str) -> Option<&Arc<dyn Formatter>> {
        self.by_type.get(&normalize(content_type))
    }

    /// Whether a formatter is registered for `content_type`.
    pub fn contains(&self, content_type: &str) -> bool {
        self.get(content_type).is_some()
    }

    /// Format `payload` as `content_type`.
    pub fn format(
        &self,
        content_type: &str,
        payload: Payload,
        headers: &mut HeaderMap,
    ) -> AppResult<Bytes> {
        let formatter = self
            .get(content_type)
            .ok_or_else(|| AppError::UnsupportedContentType(content_type.to_string()))?;
        formatter.format(payload, headers)
    }

    /// Render a full response through the formatter for `content_type`.
    pub fn render(
        &self,
        status: StatusCode,
        content_type: &str,
        payload: impl Into<Payload>,
    ) -> AppResult<Response> {
        let mut headers = HeaderMap::new();
        let body = self.format(content_type, payload.into(), &mut headers)?;
        let content_type = HeaderValue::from_str(content_type)
            .map_err(|_| AppError::UnsupportedContentType(content_type.to_string()))?;
        headers.insert(header::CONTENT_TYPE, content_type);

        let mut response = Response::new(Body::from(body));
        *response.status_mut() = status;
        response.headers_mut().extend(headers);
        Ok(response)
    }

    /// Render `payload` as JSON.
    pub fn json(&self, status: StatusCode, payload: impl Into<Payload>) -> AppResult<Response> {
        self.render(status, CONTENT_TYPE_JSON, payload)
    }
}

fn normalize(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}
