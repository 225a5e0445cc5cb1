//! Cached document records.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use tracing::{debug, warn};

use lodestone_store::RawDocument;

/// Field names computed by the engine. A remote document reusing one of
/// these keeps the computed value; the remote value is discarded.
pub const RESERVED_FIELDS: &[&str] = &["id", "exists", "hasPendingWrites"];

/// Behavior configuration for reading documents.
///
/// Deliberately excluded from the cache key: changing how a result is
/// parsed or delivered must not fragment cache identity (it forces one
/// explicit revalidation instead).
#[derive(Debug, Clone, Default)]
pub struct ReadBehavior {
    /// Field paths (dot-separated for nesting) coerced into RFC 3339
    /// timestamps on ingest.
    pub parse_dates: Vec<String>,
    /// Retain the raw store document on each record.
    pub keep_snapshots: bool,
}

/// One cached document.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// Document id (last path segment). Reserved.
    pub id: String,
    /// Full document path.
    pub path: String,
    /// Whether the document exists in the backing store. Reserved.
    pub exists: bool,
    /// True while a locally issued write is unconfirmed. Reserved.
    pub has_pending_writes: bool,
    /// Remote field data, minus reserved names.
    pub data: serde_json::Map<String, Value>,
    /// The raw store document, retained only under
    /// [`ReadBehavior::keep_snapshots`].
    pub snapshot: Option<RawDocument>,
}

impl Document {
    /// Build a cached record from a raw store document.
    pub fn from_raw(raw: RawDocument, behavior: &ReadBehavior) -> Self {
        let path = raw.path();
        let mut data = raw.fields.clone();

        let collisions: Vec<&str> = RESERVED_FIELDS
            .iter()
            .copied()
            .filter(|f| data.contains_key(*f))
            .collect();
        if !collisions.is_empty() {
            if cfg!(debug_assertions) {
                warn!(
                    id = %raw.id,
                    fields = ?collisions,
                    "document uses reserved field names; remote values are discarded"
                );
            }
            for field in collisions {
                data.remove(field);
            }
        }

        for field_path in &behavior.parse_dates {
            if let Some(value) = lookup_path_mut(&mut data, field_path) {
                coerce_date(value, field_path);
            }
        }

        Self {
            id: raw.id.clone(),
            path,
            exists: raw.exists,
            has_pending_writes: raw.has_pending_writes,
            data,
            snapshot: behavior.keep_snapshots.then_some(raw),
        }
    }

    /// Read a (possibly nested) field.
    pub fn get(&self, field_path: &str) -> Option<&Value> {
        lookup_path(&self.data, field_path)
    }

    /// Read a field as a timestamp.
    ///
    /// Fields named in [`ReadBehavior::parse_dates`] are already in
    /// RFC 3339 form; anything else parses on a best-effort basis.
    pub fn date(&self, field_path: &str) -> Option<DateTime<Utc>> {
        match self.get(field_path)? {
            Value::String(s) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
            Value::Number(n) => n.as_i64().and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
            _ => None,
        }
    }
}

fn lookup_path<'a>(map: &'a serde_json::Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = map.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn lookup_path_mut<'a>(
    map: &'a mut serde_json::Map<String, Value>,
    path: &str,
) -> Option<&'a mut Value> {
    let mut segments = path.split('.');
    let mut current = map.get_mut(segments.next()?)?;
    for segment in segments {
        current = current.as_object_mut()?.get_mut(segment)?;
    }
    Some(current)
}

/// Rewrite a temporal wire value into a canonical RFC 3339 string.
///
/// Accepted inputs: epoch milliseconds, `{seconds, nanos}` objects, and
/// strings already parseable as RFC 3339. Anything else is left alone.
fn coerce_date(value: &mut Value, field_path: &str) {
    let parsed: Option<DateTime<Utc>> = match &*value {
        Value::Number(n) => n.as_i64().and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        Value::Object(obj) => {
            let seconds = obj.get("seconds").and_then(Value::as_i64);
            let nanos = obj.get("nanos").and_then(Value::as_i64).unwrap_or(0);
            seconds.and_then(|s| Utc.timestamp_opt(s, nanos as u32).single())
        }
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        _ => None,
    };

    match parsed {
        Some(dt) => *value = Value::String(dt.to_rfc3339()),
        None => debug!(field = %field_path, "date field could not be coerced"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn raw(id: &str, fields: Value) -> RawDocument {
        RawDocument {
            id: id.to_string(),
            parent: "users".to_string(),
            exists: true,
            has_pending_writes: false,
            fields: fields.as_object().cloned().unwrap(),
        }
    }

    #[test]
    fn test_from_raw_keeps_field_data() {
        let doc = Document::from_raw(
            raw("a", json!({"name": "Ada", "age": 36})),
            &ReadBehavior::default(),
        );
        assert_eq!(doc.id, "a");
        assert_eq!(doc.path, "users/a");
        assert!(doc.exists);
        assert!(!doc.has_pending_writes);
        assert_eq!(doc.data["name"], json!("Ada"));
        assert!(doc.snapshot.is_none());
    }

    #[test]
    fn test_reserved_fields_are_discarded() {
        let doc = Document::from_raw(
            raw("a", json!({"name": "Ada", "id": "spoofed", "exists": false})),
            &ReadBehavior::default(),
        );
        assert_eq!(doc.id, "a");
        assert!(doc.exists);
        assert!(!doc.data.contains_key("id"));
        assert!(!doc.data.contains_key("exists"));
        assert_eq!(doc.data["name"], json!("Ada"));
    }

    #[test]
    fn test_keep_snapshots_retains_raw_document() {
        let source = raw("a", json!({"name": "Ada"}));
        let doc = Document::from_raw(
            source.clone(),
            &ReadBehavior {
                keep_snapshots: true,
                ..Default::default()
            },
        );
        assert_eq!(doc.snapshot, Some(source));
    }

    #[test]
    fn test_parse_dates_from_epoch_millis() {
        let behavior = ReadBehavior {
            parse_dates: vec!["createdAt".into()],
            ..Default::default()
        };
        let doc = Document::from_raw(raw("a", json!({"createdAt": 1700000000000_i64})), &behavior);
        let dt = doc.date("createdAt").unwrap();
        assert_eq!(dt.timestamp_millis(), 1700000000000);
    }

    #[test]
    fn test_parse_dates_from_timestamp_object() {
        let behavior = ReadBehavior {
            parse_dates: vec!["createdAt".into()],
            ..Default::default()
        };
        let doc = Document::from_raw(
            raw("a", json!({"createdAt": {"seconds": 1700000000, "nanos": 0}})),
            &behavior,
        );
        assert_eq!(doc.date("createdAt").unwrap().timestamp(), 1700000000);
    }

    #[test]
    fn test_parse_dates_nested_path() {
        let behavior = ReadBehavior {
            parse_dates: vec!["user.createdAt".into()],
            ..Default::default()
        };
        let doc = Document::from_raw(
            raw("a", json!({"user": {"createdAt": 1700000000000_i64}})),
            &behavior,
        );
        assert!(doc.date("user.createdAt").is_some());
        assert!(doc.get("user.createdAt").unwrap().is_string());
    }

    #[test]
    fn test_uncoercible_date_is_left_alone() {
        let behavior = ReadBehavior {
            parse_dates: vec!["createdAt".into()],
            ..Default::default()
        };
        let doc = Document::from_raw(raw("a", json!({"createdAt": true})), &behavior);
        assert_eq!(doc.data["createdAt"], json!(true));
        assert!(doc.date("createdAt").is_none());
    }

    #[test]
    fn test_get_nested_field() {
        let doc = Document::from_raw(
            raw("a", json!({"address": {"city": "London"}})),
            &ReadBehavior::default(),
        );
        assert_eq!(doc.get("address.city"), Some(&json!("London")));
        assert_eq!(doc.get("address.zip"), None);
    }
}
