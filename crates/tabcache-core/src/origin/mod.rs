//! Origin content service contract.
//!
//! The engine only needs one operation from the origin: given an id or a
//! category-style key, return the current content item or fail. Opaque ids
//! and human-readable keys are treated the same way.
//!
//! `HttpOrigin` implements the contract over REST; tests use
//! [`StaticOrigin`](crate::testing::StaticOrigin).

pub mod client;
pub mod error;

pub use client::HttpOrigin;
pub use error::OriginError;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::record::{Content, ContentType};

/// Item shape returned by the origin service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OriginItem {
    pub id: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(rename = "type")]
    pub content_type: String,
    pub value: Value,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl OriginItem {
    pub fn new(id: impl Into<String>, content_type: ContentType, value: Value) -> Self {
        Self {
            id: id.into(),
            category: None,
            content_type: content_type.as_str().to_string(),
            value,
            status: None,
            created_at: None,
            updated_at: None,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Convert the loosely typed origin value into typed content.
    pub fn to_content(&self) -> Result<Content, OriginError> {
        let content_type = ContentType::parse(&self.content_type).ok_or_else(|| {
            OriginError::InvalidResponse(format!(
                "unknown content type {} for {}",
                self.content_type, self.id
            ))
        })?;
        Content::from_value(content_type, self.value.clone())
            .map_err(|reason| OriginError::InvalidResponse(format!("{}: {}", self.id, reason)))
    }
}

/// Fetch contract the engine consumes.
#[async_trait]
pub trait ContentFetcher: Send + Sync {
    async fn fetch(&self, key: &str) -> Result<OriginItem, OriginError>;
}
