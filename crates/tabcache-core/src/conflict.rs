//! Optimistic concurrency between writers sharing one store.
//!
//! Each record carries a version counter and, per content field, the version
//! at which that field last changed. A write names the version it was based
//! on. When that base is current the write commits; when another writer got
//! there first, the fields the two writes touched are compared:
//! - disjoint fields merge, producing the next version
//! - overlapping fields keep the already-committed value and are reported
//!   back as a `FieldConflict` carrying both candidates

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{CacheError, Result};
use crate::expiry;
use crate::record::{CacheRecord, Content};

/// Field-level change set. `None` removes the field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentPatch {
    fields: BTreeMap<String, Option<Value>>,
}

impl ContentPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: impl Into<String>, value: Value) -> Self {
        self.fields.insert(field.into(), Some(value));
        self
    }

    pub fn remove(mut self, field: impl Into<String>) -> Self {
        self.fields.insert(field.into(), None);
        self
    }

    /// Patch that replaces the whole content.
    pub fn replace(content: &Content) -> Self {
        Self {
            fields: content
                .fields()
                .into_iter()
                .map(|(k, v)| (k, Some(v)))
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn touched(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn get(&self, field: &str) -> Option<&Option<Value>> {
        self.fields.get(field)
    }

    fn iter(&self) -> impl Iterator<Item = (&String, &Option<Value>)> {
        self.fields.iter()
    }
}

/// One field both writers changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldConflict {
    pub field: String,
    /// Value already committed by the other writer (kept)
    pub stored: Option<Value>,
    /// Value the stale write wanted
    pub incoming: Option<Value>,
    /// Version at which `stored` was written
    pub stored_version: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Base version was current
    Committed(CacheRecord),
    /// Base was stale, but the writes touched disjoint fields
    Merged {
        record: CacheRecord,
        merged_fields: Vec<String>,
    },
    /// Some fields overlapped. `record` holds every non-overlapping change;
    /// `changed` is false when nothing could be applied at all.
    Conflicted {
        record: CacheRecord,
        conflicts: Vec<FieldConflict>,
        changed: bool,
    },
}

impl Resolution {
    pub fn record(&self) -> &CacheRecord {
        match self {
            Resolution::Committed(record)
            | Resolution::Merged { record, .. }
            | Resolution::Conflicted { record, .. } => record,
        }
    }

    /// Whether the resolved record differs from what is stored.
    pub fn needs_write(&self) -> bool {
        match self {
            Resolution::Committed(_) | Resolution::Merged { .. } => true,
            Resolution::Conflicted { changed, .. } => *changed,
        }
    }
}

pub struct ConflictResolver;

impl ConflictResolver {
    /// Resolve a write based on `base_version` against the stored `current`.
    pub fn resolve(
        current: &CacheRecord,
        base_version: u64,
        patch: &ContentPatch,
        writer: &str,
    ) -> Result<Resolution> {
        let next_version = current.version + 1;

        if base_version == current.version {
            let mut record = current.clone();
            apply(&mut record, patch.iter(), next_version, writer)?;
            return Ok(Resolution::Committed(record));
        }

        let stored_fields = current.content.fields();
        let concurrent: BTreeSet<&str> = current
            .field_versions
            .iter()
            .filter(|(_, v)| **v > base_version)
            .map(|(f, _)| f.as_str())
            .collect();

        let mut conflicts = Vec::new();
        let mut mergeable = Vec::new();
        for (field, incoming) in patch.iter() {
            let stored = stored_fields.get(field).cloned();
            if concurrent.contains(field.as_str()) && stored != *incoming {
                conflicts.push(FieldConflict {
                    field: field.clone(),
                    stored,
                    incoming: incoming.clone(),
                    stored_version: current.field_versions.get(field).copied().unwrap_or(0),
                });
            } else {
                mergeable.push((field, incoming));
            }
        }

        debug!(
            id = %current.id,
            base_version,
            current_version = current.version,
            conflicts = conflicts.len(),
            merged = mergeable.len(),
            "Resolving stale write"
        );

        let mut record = current.clone();
        let changed = !mergeable.is_empty();
        let merged_fields: Vec<String> = mergeable.iter().map(|(f, _)| (*f).clone()).collect();
        if changed {
            apply(&mut record, mergeable.into_iter(), next_version, writer)?;
        }

        if conflicts.is_empty() {
            Ok(Resolution::Merged {
                record,
                merged_fields,
            })
        } else {
            Ok(Resolution::Conflicted {
                record,
                conflicts,
                changed,
            })
        }
    }

    /// Fold an authoritative origin copy into the stored record. Only fields
    /// whose value actually changed get the new version; an identical copy
    /// just renews the freshness window.
    pub fn refresh(
        current: &CacheRecord,
        content: Content,
        category: Option<String>,
        ttl: Duration,
        now: DateTime<Utc>,
        writer: &str,
    ) -> Result<CacheRecord> {
        let mut record = current.clone();
        record.category = category;
        record.cached_at = now;
        record.expires_at = expiry::window_end(now, ttl);
        record.pending = false;

        if content == current.content {
            return Ok(record);
        }

        let old = current.content.fields();
        let new = content.fields();
        let version = current.version + 1;
        record.set_content(content);
        record.field_versions.retain(|f, _| new.contains_key(f));
        for (field, value) in &new {
            if old.get(field) != Some(value) {
                record.field_versions.insert(field.clone(), version);
            }
        }
        for field in old.keys().filter(|f| !new.contains_key(*f)) {
            debug!(id = %record.id, field = %field, "Origin dropped field");
        }
        record.version = version;
        record.writer = Some(writer.to_string());
        Ok(record)
    }
}

fn apply<'a>(
    record: &mut CacheRecord,
    changes: impl Iterator<Item = (&'a String, &'a Option<Value>)>,
    version: u64,
    writer: &str,
) -> Result<()> {
    let mut fields = record.content.fields();
    for (field, value) in changes {
        match value {
            Some(v) => {
                fields.insert(field.clone(), v.clone());
            }
            None => {
                fields.remove(field);
            }
        }
        record.field_versions.insert(field.clone(), version);
    }

    let content = Content::from_fields(record.content_type, fields).map_err(|reason| {
        CacheError::Corrupt {
            key: record.id.clone(),
            reason,
        }
    })?;
    record.set_content(content);
    record.version = version;
    record.writer = Some(writer.to_string());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record_at_version(version: u64) -> CacheRecord {
        let mut rec = CacheRecord::new(
            "post-1",
            Some("feed".to_string()),
            Content::Json(json!({"title": "Hello", "body": "First", "likes": 0})),
            Duration::hours(1),
            Utc::now(),
            "tab-a",
        );
        rec.version = version;
        for v in rec.field_versions.values_mut() {
            *v = version;
        }
        rec
    }

    #[test]
    fn test_current_base_commits() {
        let current = record_at_version(3);
        let patch = ContentPatch::new().set("title", json!("Updated"));

        let resolution = ConflictResolver::resolve(&current, 3, &patch, "tab-a").unwrap();
        let Resolution::Committed(rec) = resolution else {
            panic!("expected commit");
        };
        assert_eq!(rec.version, 4);
        assert_eq!(rec.content.fields()["title"], json!("Updated"));
        assert_eq!(rec.field_versions["title"], 4);
        assert_eq!(rec.field_versions["body"], 3);
    }

    #[test]
    fn test_disjoint_stale_writes_merge() {
        let base = record_at_version(3);
        let a = ConflictResolver::resolve(
            &base,
            3,
            &ContentPatch::new().set("title", json!("From A")),
            "tab-a",
        )
        .unwrap();
        let stored = a.record().clone();
        assert_eq!(stored.version, 4);

        let b = ConflictResolver::resolve(
            &stored,
            3,
            &ContentPatch::new().set("body", json!("From B")),
            "tab-b",
        )
        .unwrap();
        let Resolution::Merged { record, merged_fields } = b else {
            panic!("expected merge");
        };
        assert_eq!(record.version, 5);
        assert_eq!(merged_fields, vec!["body".to_string()]);
        let fields = record.content.fields();
        assert_eq!(fields["title"], json!("From A"));
        assert_eq!(fields["body"], json!("From B"));
        assert_eq!(fields["likes"], json!(0));
    }

    #[test]
    fn test_overlapping_stale_writes_conflict() {
        let base = record_at_version(3);
        let stored = ConflictResolver::resolve(
            &base,
            3,
            &ContentPatch::new().set("title", json!("From A")),
            "tab-a",
        )
        .unwrap()
        .record()
        .clone();

        let resolution = ConflictResolver::resolve(
            &stored,
            3,
            &ContentPatch::new().set("title", json!("From B")),
            "tab-b",
        )
        .unwrap();
        let Resolution::Conflicted { record, conflicts, changed } = resolution else {
            panic!("expected conflict");
        };
        assert!(!changed);
        assert_eq!(record.version, 4);
        assert_eq!(record.content.fields()["title"], json!("From A"));
        assert_eq!(
            conflicts,
            vec![FieldConflict {
                field: "title".to_string(),
                stored: Some(json!("From A")),
                incoming: Some(json!("From B")),
                stored_version: 4,
            }]
        );
    }

    #[test]
    fn test_partial_overlap_merges_the_rest() {
        let base = record_at_version(1);
        let stored = ConflictResolver::resolve(
            &base,
            1,
            &ContentPatch::new().set("title", json!("A")),
            "tab-a",
        )
        .unwrap()
        .record()
        .clone();

        let resolution = ConflictResolver::resolve(
            &stored,
            1,
            &ContentPatch::new()
                .set("title", json!("B"))
                .set("likes", json!(7)),
            "tab-b",
        )
        .unwrap();
        assert!(resolution.needs_write());
        let Resolution::Conflicted { record, conflicts, .. } = resolution else {
            panic!("expected conflict");
        };
        assert_eq!(record.version, 3);
        assert_eq!(record.content.fields()["likes"], json!(7));
        assert_eq!(conflicts.len(), 1);
    }

    #[test]
    fn test_identical_overlap_is_not_a_conflict() {
        let base = record_at_version(1);
        let stored = ConflictResolver::resolve(
            &base,
            1,
            &ContentPatch::new().set("title", json!("Same")),
            "tab-a",
        )
        .unwrap()
        .record()
        .clone();

        let resolution = ConflictResolver::resolve(
            &stored,
            1,
            &ContentPatch::new().set("title", json!("Same")),
            "tab-b",
        )
        .unwrap();
        assert!(matches!(resolution, Resolution::Merged { .. }));
    }

    #[test]
    fn test_remove_field() {
        let current = record_at_version(1);
        let resolution =
            ConflictResolver::resolve(&current, 1, &ContentPatch::new().remove("likes"), "tab-a")
                .unwrap();
        assert!(!resolution.record().content.fields().contains_key("likes"));
    }

    #[test]
    fn test_whole_content_patch_on_text() {
        let current = CacheRecord::new(
            "greeting",
            None,
            Content::Text("hi".into()),
            Duration::hours(1),
            Utc::now(),
            "tab-a",
        );
        let patch = ContentPatch::replace(&Content::Text("hello".into()));
        let resolution = ConflictResolver::resolve(&current, 1, &patch, "tab-a").unwrap();
        assert_eq!(resolution.record().content, Content::Text("hello".into()));
        assert_eq!(resolution.record().version, 2);
    }

    #[test]
    fn test_invalid_patch_rejected() {
        let current = CacheRecord::new(
            "greeting",
            None,
            Content::Text("hi".into()),
            Duration::hours(1),
            Utc::now(),
            "tab-a",
        );
        let patch = ContentPatch::new().set("title", json!("nope"));
        assert!(ConflictResolver::resolve(&current, 1, &patch, "tab-a").is_err());
    }

    #[test]
    fn test_refresh_versions_only_changed_fields() {
        let current = record_at_version(2);
        let now = Utc::now();
        let refreshed = ConflictResolver::refresh(
            &current,
            Content::Json(json!({"title": "Hello", "body": "Edited", "likes": 0})),
            Some("feed".to_string()),
            Duration::hours(1),
            now,
            "tab-b",
        )
        .unwrap();
        assert_eq!(refreshed.version, 3);
        assert_eq!(refreshed.field_versions["body"], 3);
        assert_eq!(refreshed.field_versions["title"], 2);
        assert_eq!(refreshed.cached_at, now);
    }

    #[test]
    fn test_refresh_identical_content_keeps_version() {
        let current = record_at_version(2);
        let refreshed = ConflictResolver::refresh(
            &current,
            current.content.clone(),
            current.category.clone(),
            Duration::hours(1),
            Utc::now(),
            "tab-b",
        )
        .unwrap();
        assert_eq!(refreshed.version, 2);
        assert_eq!(refreshed.writer.as_deref(), Some("tab-a"));
    }
}
