//! Change event representation
//!
//! The unit published downstream: one row-level change decoded from the
//! binlog. Row values are JSON maps; the row decoder is responsible for
//! coercing raw byte columns (UTF-8 text for TEXT declarations, base64 for
//! everything else) before they land here, so serialization is plain serde.

use crate::common::Result;
use serde::{Deserialize, Serialize};

/// A single row image: column name → JSON value.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Change operation type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Insert,
    Update,
    Delete,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventType::Insert => write!(f, "INSERT"),
            EventType::Update => write!(f, "UPDATE"),
            EventType::Delete => write!(f, "DELETE"),
        }
    }
}

impl EventType {
    /// Parse the wire spelling ("INSERT" / "UPDATE" / "DELETE").
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "INSERT" => Some(EventType::Insert),
            "UPDATE" => Some(EventType::Update),
            "DELETE" => Some(EventType::Delete),
            _ => None,
        }
    }
}

/// A row-level change captured from the binlog.
///
/// `rows` holds the post-image for INSERT/UPDATE and the affected image for
/// DELETE. `old_rows` is populated only for UPDATE, paired positionally with
/// `rows`, and omitted from the wire format when empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub database: String,
    pub table: String,
    /// Wall-clock seconds at decode time
    pub timestamp: i64,
    pub rows: Vec<Row>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub old_rows: Vec<Row>,
    /// Verbatim serialization produced by a script transform. Carries fields
    /// the canonical shape cannot; published as-is when present.
    #[serde(skip)]
    pub raw: Option<Vec<u8>>,
}

impl ChangeEvent {
    /// Create a new INSERT event
    pub fn insert(
        database: impl Into<String>,
        table: impl Into<String>,
        rows: Vec<Row>,
        timestamp: i64,
    ) -> Self {
        Self {
            event_type: EventType::Insert,
            database: database.into(),
            table: table.into(),
            timestamp,
            rows,
            old_rows: Vec::new(),
            raw: None,
        }
    }

    /// Create a new UPDATE event. `old_rows` pairs positionally with `rows`.
    pub fn update(
        database: impl Into<String>,
        table: impl Into<String>,
        rows: Vec<Row>,
        old_rows: Vec<Row>,
        timestamp: i64,
    ) -> Self {
        Self {
            event_type: EventType::Update,
            database: database.into(),
            table: table.into(),
            timestamp,
            rows,
            old_rows,
            raw: None,
        }
    }

    /// Create a new DELETE event. `rows` holds the deleted images.
    pub fn delete(
        database: impl Into<String>,
        table: impl Into<String>,
        rows: Vec<Row>,
        timestamp: i64,
    ) -> Self {
        Self {
            event_type: EventType::Delete,
            database: database.into(),
            table: table.into(),
            timestamp,
            rows,
            old_rows: Vec::new(),
            raw: None,
        }
    }

    /// Publish payload: the opaque script tail verbatim when present,
    /// otherwise the canonical JSON serialization.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if let Some(raw) = &self.raw {
            return Ok(raw.clone());
        }
        Ok(serde_json::to_vec(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(pairs: &[(&str, serde_json::Value)]) -> Row {
        let mut map = Row::new();
        for (k, v) in pairs {
            map.insert(k.to_string(), v.clone());
        }
        map
    }

    #[test]
    fn test_insert_event() {
        let event = ChangeEvent::insert(
            "shop",
            "orders",
            vec![row(&[("id", json!(42))])],
            1705000000,
        );

        assert_eq!(event.event_type, EventType::Insert);
        assert_eq!(event.rows.len(), 1);
        assert!(event.old_rows.is_empty());
    }

    #[test]
    fn test_update_event_pairing() {
        let event = ChangeEvent::update(
            "shop",
            "orders",
            vec![row(&[("status", json!("done"))]), row(&[("status", json!("done"))])],
            vec![row(&[("status", json!("new"))]), row(&[("status", json!("new"))])],
            1705000000,
        );

        assert_eq!(event.rows.len(), event.old_rows.len());
        assert_eq!(event.rows.len(), 2);
    }

    #[test]
    fn test_serialization_field_names() {
        let event = ChangeEvent::insert(
            "shop",
            "orders",
            vec![row(&[("id", json!(42)), ("code", json!("hi"))])],
            1700000000,
        );

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "INSERT");
        assert_eq!(json["database"], "shop");
        assert_eq!(json["table"], "orders");
        assert_eq!(json["timestamp"], 1700000000);
        assert_eq!(json["rows"][0]["id"], 42);
        // old_rows is omitted when empty
        assert!(json.get("old_rows").is_none());
    }

    #[test]
    fn test_serialization_includes_old_rows_for_update() {
        let event = ChangeEvent::update(
            "shop",
            "users",
            vec![row(&[("id", json!(1))])],
            vec![row(&[("id", json!(1))])],
            0,
        );

        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("old_rows").is_some());
        assert_eq!(json["type"], "UPDATE");
    }

    #[test]
    fn test_round_trip() {
        let event = ChangeEvent::update(
            "db",
            "t",
            vec![row(&[("a", json!("x")), ("n", json!(7))])],
            vec![row(&[("a", json!("y")), ("n", json!(6))])],
            1712345678,
        );

        let bytes = event.encode().unwrap();
        let parsed: ChangeEvent = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(parsed.event_type, EventType::Update);
        assert_eq!(parsed.database, "db");
        assert_eq!(parsed.table, "t");
        assert_eq!(parsed.timestamp, 1712345678);
        assert_eq!(parsed.rows, event.rows);
        assert_eq!(parsed.old_rows, event.old_rows);
    }

    #[test]
    fn test_encode_prefers_raw_tail() {
        let mut event = ChangeEvent::insert("db", "t", vec![], 0);
        event.raw = Some(br#"{"type":"INSERT","extra":"field"}"#.to_vec());

        let bytes = event.encode().unwrap();
        assert_eq!(bytes, br#"{"type":"INSERT","extra":"field"}"#);
    }

    #[test]
    fn test_event_type_parse() {
        assert_eq!(EventType::parse("INSERT"), Some(EventType::Insert));
        assert_eq!(EventType::parse("UPDATE"), Some(EventType::Update));
        assert_eq!(EventType::parse("DELETE"), Some(EventType::Delete));
        assert_eq!(EventType::parse("insert"), None);
        assert_eq!(EventType::parse("TRUNCATE"), None);
    }
}
