//! Cached record shape.
//!
//! Content is a tagged union keyed by content type, so every stored record
//! can be validated against its declared type on read.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::expiry;

/// Field name standing for the whole content of non-object records.
///
/// Text, HTML, binary references and non-object JSON values have no
/// addressable sub-fields, so merges treat them as a single field.
pub const WHOLE_CONTENT_FIELD: &str = "$";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "kebab-case")]
pub enum ContentType {
    Text,
    Html,
    Json,
    BinaryRef,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Text => "text",
            ContentType::Html => "html",
            ContentType::Json => "json",
            ContentType::BinaryRef => "binary-ref",
        }
    }

    /// Parse the `type` strings used by the origin service.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "text/plain" => Some(ContentType::Text),
            "html" | "text/html" => Some(ContentType::Html),
            "json" | "application/json" => Some(ContentType::Json),
            "binary-ref" | "binary" | "binary_ref" => Some(ContentType::BinaryRef),
            _ => None,
        }
    }
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "kebab-case")]
pub enum Content {
    Text(String),
    Html(String),
    Json(Value),
    #[serde(rename_all = "camelCase")]
    BinaryRef {
        uri: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        media_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        byte_len: Option<u64>,
    },
}

impl Content {
    pub fn content_type(&self) -> ContentType {
        match self {
            Content::Text(_) => ContentType::Text,
            Content::Html(_) => ContentType::Html,
            Content::Json(_) => ContentType::Json,
            Content::BinaryRef { .. } => ContentType::BinaryRef,
        }
    }

    /// Estimated serialized size in bytes.
    pub fn estimated_size(&self) -> u64 {
        serde_json::to_vec(self)
            .map(|b| b.len() as u64)
            .unwrap_or(0)
    }

    /// Build content of the given type from a loosely typed value.
    pub fn from_value(content_type: ContentType, value: Value) -> Result<Self, String> {
        match content_type {
            ContentType::Text => match value {
                Value::String(s) => Ok(Content::Text(s)),
                other => Err(format!("text content must be a string, got {}", kind_of(&other))),
            },
            ContentType::Html => match value {
                Value::String(s) => Ok(Content::Html(s)),
                other => Err(format!("html content must be a string, got {}", kind_of(&other))),
            },
            ContentType::Json => Ok(Content::Json(value)),
            ContentType::BinaryRef => match value {
                Value::String(uri) => Ok(Content::BinaryRef {
                    uri,
                    media_type: None,
                    byte_len: None,
                }),
                Value::Object(map) => {
                    let uri = map
                        .get("uri")
                        .and_then(Value::as_str)
                        .ok_or_else(|| "binary reference is missing a uri".to_string())?
                        .to_string();
                    Ok(Content::BinaryRef {
                        uri,
                        media_type: map
                            .get("mediaType")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                        byte_len: map.get("byteLen").and_then(Value::as_u64),
                    })
                }
                other => Err(format!(
                    "binary reference must be a string or object, got {}",
                    kind_of(&other)
                )),
            },
        }
    }

    /// Inverse of `from_value`.
    pub fn to_value(&self) -> Value {
        match self {
            Content::Text(s) | Content::Html(s) => Value::String(s.clone()),
            Content::Json(v) => v.clone(),
            Content::BinaryRef {
                uri,
                media_type,
                byte_len,
            } => {
                let mut map = Map::new();
                map.insert("uri".to_string(), Value::String(uri.clone()));
                if let Some(mt) = media_type {
                    map.insert("mediaType".to_string(), Value::String(mt.clone()));
                }
                if let Some(len) = byte_len {
                    map.insert("byteLen".to_string(), Value::from(*len));
                }
                Value::Object(map)
            }
        }
    }

    /// Addressable fields for field-level merges.
    ///
    /// JSON objects expose their top-level keys; everything else is a single
    /// `WHOLE_CONTENT_FIELD`.
    pub fn fields(&self) -> BTreeMap<String, Value> {
        match self {
            Content::Json(Value::Object(map)) => map
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            other => BTreeMap::from([(WHOLE_CONTENT_FIELD.to_string(), other.to_value())]),
        }
    }

    /// Rebuild content from a field map produced by `fields` (possibly edited).
    pub fn from_fields(
        content_type: ContentType,
        mut fields: BTreeMap<String, Value>,
    ) -> Result<Self, String> {
        if let Some(whole) = fields.remove(WHOLE_CONTENT_FIELD) {
            if !fields.is_empty() {
                return Err("whole-content field cannot be combined with other fields".to_string());
            }
            return Self::from_value(content_type, whole);
        }
        match content_type {
            ContentType::Json => Ok(Content::Json(Value::Object(fields.into_iter().collect()))),
            other => Err(format!("{} content requires the whole-content field", other)),
        }
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ============================================================================
// CacheRecord
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub content_type: ContentType,
    pub content: Content,
    pub cached_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub size_bytes: u64,
    #[serde(default)]
    pub access_count: u64,
    pub last_accessed_at: DateTime<Utc>,
    pub version: u64,
    /// Tab that produced `version`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub writer: Option<String>,
    /// Version at which each content field last changed
    #[serde(default)]
    pub field_versions: BTreeMap<String, u64>,
    /// Set while an optimistic update awaits confirmation
    #[serde(default)]
    pub pending: bool,
}

impl CacheRecord {
    /// First version of a record, valid for `ttl` from `now`.
    pub fn new(
        id: impl Into<String>,
        category: Option<String>,
        content: Content,
        ttl: Duration,
        now: DateTime<Utc>,
        writer: &str,
    ) -> Self {
        let field_versions = content.fields().into_keys().map(|f| (f, 1)).collect();
        Self {
            id: id.into(),
            category,
            content_type: content.content_type(),
            size_bytes: content.estimated_size(),
            content,
            cached_at: now,
            expires_at: expiry::window_end(now, ttl),
            access_count: 0,
            last_accessed_at: now,
            version: 1,
            writer: Some(writer.to_string()),
            field_versions,
            pending: false,
        }
    }

    /// Replace the content, keeping type and size in step.
    pub fn set_content(&mut self, content: Content) {
        self.content_type = content.content_type();
        self.size_bytes = content.estimated_size();
        self.content = content;
    }

    pub fn record_access(&mut self, now: DateTime<Utc>) {
        self.access_count = self.access_count.saturating_add(1);
        self.last_accessed_at = now;
    }

    /// Force the record to read as expired from `now` on.
    pub fn expire(&mut self, now: DateTime<Utc>) {
        if self.cached_at > now {
            self.cached_at = now;
        }
        self.expires_at = self.cached_at;
    }

    pub fn age_minutes(&self, now: DateTime<Utc>) -> i64 {
        (now - self.cached_at).num_minutes()
    }

    pub fn age_display(&self, now: DateTime<Utc>) -> String {
        let minutes = self.age_minutes(now);
        if minutes < 1 {
            // Covers clock skew too
            "just now".to_string()
        } else if minutes < 60 {
            format!("{}m ago", minutes)
        } else if minutes < 1440 {
            let hours = minutes / 60;
            if minutes % 60 >= 30 {
                format!("{}h ago", hours + 1)
            } else {
                format!("{}h ago", hours)
            }
        } else {
            let days = minutes / 1440;
            if (minutes % 1440) / 60 >= 12 {
                format!("{}d ago", days + 1)
            } else {
                format!("{}d ago", days)
            }
        }
    }
}
