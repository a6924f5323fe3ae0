//! Row event → change event construction
//!
//! Joins a rows event with its TableMap and the schema catalog entry to
//! produce [`ChangeEvent`]s with named, typed column values.
//!
//! Column names come from the TableMap when the server embeds them
//! (binlog_row_metadata=FULL), otherwise from the schema catalog. Declaration
//! strings always come from the catalog; the binlog never carries them.

use crate::common::{CdcError, ChangeEvent, EventType, Result, Row};
use crate::mysql::decoder::{ColumnValue, RowsEvent, TableMapEvent};
use crate::mysql::schema::{is_textual, SchemaEntry};
use base64::Engine as _;
use std::collections::HashSet;
use std::time::SystemTime;
use tracing::warn;

/// Raw byte values longer than this are never heuristically promoted to
/// strings.
const TEXT_HEURISTIC_MAX_LEN: usize = 64 * 1024;

/// Builds change events from decoded rows events.
pub struct RowEventBuilder {
    /// Promote undeclared byte values to strings when they look like ASCII
    /// text. Off by default: a short single-byte binary value is
    /// indistinguishable from text.
    lenient_text: bool,
    /// Tables already warned about a name/value count mismatch.
    warned_tables: HashSet<(String, String)>,
}

impl Default for RowEventBuilder {
    fn default() -> Self {
        Self::new(false)
    }
}

impl RowEventBuilder {
    pub fn new(lenient_text: bool) -> Self {
        Self {
            lenient_text,
            warned_tables: HashSet::new(),
        }
    }

    /// Build a change event from one rows event.
    ///
    /// `schema` is the catalog entry for the table, when resolution
    /// succeeded; without it, events can still be built from TableMap-embedded
    /// names, just without declaration-driven coercion.
    pub fn build(
        &mut self,
        event_type: EventType,
        rows_event: &RowsEvent,
        table_map: &TableMapEvent,
        schema: Option<&SchemaEntry>,
    ) -> Result<ChangeEvent> {
        let database = table_map.schema_name.clone();
        let table = table_map.table_name.clone();

        let names: &[String] = if !table_map.column_names.is_empty() {
            &table_map.column_names
        } else if let Some(entry) = schema {
            &entry.names
        } else {
            return Err(CdcError::schema(format!(
                "no column names available for {database}.{table}"
            )));
        };
        if names.is_empty() {
            return Err(CdcError::schema(format!(
                "no column names available for {database}.{table}"
            )));
        }

        let types: &[String] = schema.map(|entry| entry.types.as_slice()).unwrap_or(&[]);

        let timestamp = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;

        let mut rows = Vec::new();
        let mut old_rows = Vec::new();

        for image in &rows_event.rows {
            match event_type {
                EventType::Insert => {
                    if let Some(after) = &image.after {
                        rows.push(self.image_to_row(&database, &table, after, names, types));
                    }
                }
                EventType::Delete => {
                    if let Some(before) = &image.before {
                        rows.push(self.image_to_row(&database, &table, before, names, types));
                    }
                }
                EventType::Update => {
                    // pre/post images stay positionally paired
                    if let (Some(before), Some(after)) = (&image.before, &image.after) {
                        old_rows.push(self.image_to_row(&database, &table, before, names, types));
                        rows.push(self.image_to_row(&database, &table, after, names, types));
                    }
                }
            }
        }

        Ok(match event_type {
            EventType::Insert => ChangeEvent::insert(database, table, rows, timestamp),
            EventType::Update => ChangeEvent::update(database, table, rows, old_rows, timestamp),
            EventType::Delete => ChangeEvent::delete(database, table, rows, timestamp),
        })
    }

    /// Zip values with names up to the shorter of the two; excess values are
    /// dropped with a warning emitted once per table.
    fn image_to_row(
        &mut self,
        database: &str,
        table: &str,
        values: &[ColumnValue],
        names: &[String],
        types: &[String],
    ) -> Row {
        if values.len() > names.len() {
            let key = (database.to_string(), table.to_string());
            if self.warned_tables.insert(key) {
                warn!(
                    "Column count mismatch for {database}.{table}: {} values, {} names; \
                     emitting the named prefix only",
                    values.len(),
                    names.len()
                );
            }
        }

        let mut row = Row::new();
        for (idx, (name, value)) in names.iter().zip(values.iter()).enumerate() {
            let declaration = types.get(idx).map(String::as_str);
            row.insert(name.clone(), self.coerce(value, declaration));
        }
        row
    }

    /// Type-aware value coercion: TEXT-declared bytes become UTF-8 strings;
    /// undeclared bytes optionally go through the ASCII heuristic; all other
    /// bytes are base64-encoded for the JSON wire format.
    fn coerce(&self, value: &ColumnValue, declaration: Option<&str>) -> serde_json::Value {
        match value {
            ColumnValue::Bytes(bytes) => {
                if let Some(decl) = declaration {
                    if is_textual(decl) {
                        return serde_json::Value::String(
                            String::from_utf8_lossy(bytes).to_string(),
                        );
                    }
                } else if self.lenient_text && looks_like_text(bytes) {
                    return serde_json::Value::String(
                        String::from_utf8_lossy(bytes).to_string(),
                    );
                }
                serde_json::Value::String(
                    base64::engine::general_purpose::STANDARD.encode(bytes),
                )
            }
            other => plain_value(other),
        }
    }
}

/// Best-effort text detection for byte values with no declaration: bounded
/// size and byte count equal to rune count under UTF-8 (i.e. ASCII).
fn looks_like_text(bytes: &[u8]) -> bool {
    if bytes.is_empty() || bytes.len() >= TEXT_HEURISTIC_MAX_LEN {
        return false;
    }
    match std::str::from_utf8(bytes) {
        Ok(s) => s.chars().count() == bytes.len(),
        Err(_) => false,
    }
}

/// JSON mapping for values that need no schema input.
fn plain_value(value: &ColumnValue) -> serde_json::Value {
    match value {
        ColumnValue::Null => serde_json::Value::Null,
        ColumnValue::SignedInt(v) => serde_json::json!(*v),
        ColumnValue::Float(v) => serde_json::json!(*v),
        ColumnValue::Double(v) => serde_json::json!(*v),
        ColumnValue::Decimal(v) => serde_json::json!(v),
        ColumnValue::String(v) => serde_json::json!(v),
        ColumnValue::Bytes(v) => {
            serde_json::json!(base64::engine::general_purpose::STANDARD.encode(v))
        }
        ColumnValue::Date { year, month, day } => {
            serde_json::json!(format!("{year:04}-{month:02}-{day:02}"))
        }
        ColumnValue::Time {
            hours,
            minutes,
            seconds,
            microseconds,
            negative,
        } => {
            let sign = if *negative { "-" } else { "" };
            if *microseconds > 0 {
                serde_json::json!(format!(
                    "{sign}{hours:02}:{minutes:02}:{seconds:02}.{microseconds:06}"
                ))
            } else {
                serde_json::json!(format!("{sign}{hours:02}:{minutes:02}:{seconds:02}"))
            }
        }
        ColumnValue::DateTime {
            year,
            month,
            day,
            hour,
            minute,
            second,
            microsecond,
        } => {
            if *microsecond > 0 {
                serde_json::json!(format!(
                    "{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}.{microsecond:06}"
                ))
            } else {
                serde_json::json!(format!(
                    "{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}"
                ))
            }
        }
        ColumnValue::Timestamp(v) => serde_json::json!(*v),
        ColumnValue::Year(v) => serde_json::json!(*v),
        ColumnValue::Enum(v) => serde_json::json!(*v),
        ColumnValue::Set(v) => serde_json::json!(*v),
        ColumnValue::Bit(v) => {
            serde_json::json!(base64::engine::general_purpose::STANDARD.encode(v))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mysql::decoder::{ColumnType, RowImage};

    fn orders_table_map(column_names: Vec<String>) -> TableMapEvent {
        TableMapEvent {
            table_id: 42,
            schema_name: "shop".into(),
            table_name: "orders".into(),
            column_count: 3,
            column_types: vec![ColumnType::Long, ColumnType::Blob, ColumnType::Blob],
            column_metadata: vec![0, 2, 2],
            column_names,
        }
    }

    fn orders_schema() -> SchemaEntry {
        SchemaEntry {
            names: vec!["id".into(), "code".into(), "blob_col".into()],
            types: vec!["int(11)".into(), "text".into(), "blob".into()],
        }
    }

    fn insert_event(values: Vec<ColumnValue>) -> RowsEvent {
        RowsEvent {
            table_id: 42,
            column_count: values.len(),
            rows: vec![RowImage {
                before: None,
                after: Some(values),
            }],
        }
    }

    #[test]
    fn test_insert_text_and_blob_coercion() {
        let mut builder = RowEventBuilder::default();
        let schema = orders_schema();

        let event = builder
            .build(
                EventType::Insert,
                &insert_event(vec![
                    ColumnValue::SignedInt(42),
                    ColumnValue::Bytes(vec![0x68, 0x69]),
                    ColumnValue::Bytes(vec![0x00, 0x01, 0xFF]),
                ]),
                &orders_table_map(vec![]),
                Some(&schema),
            )
            .unwrap();

        assert_eq!(event.event_type, EventType::Insert);
        assert_eq!(event.database, "shop");
        assert_eq!(event.table, "orders");
        assert_eq!(event.rows.len(), 1);
        assert!(event.old_rows.is_empty());

        let row = &event.rows[0];
        assert_eq!(row["id"], serde_json::json!(42));
        assert_eq!(row["code"], serde_json::json!("hi"));
        assert_eq!(row["blob_col"], serde_json::json!("AAH/"));
    }

    #[test]
    fn test_embedded_names_preferred() {
        let mut builder = RowEventBuilder::default();
        // catalog disagrees; the TableMap names win
        let schema = SchemaEntry {
            names: vec!["stale_a".into(), "stale_b".into(), "stale_c".into()],
            types: vec!["int(11)".into(), "text".into(), "blob".into()],
        };

        let event = builder
            .build(
                EventType::Insert,
                &insert_event(vec![
                    ColumnValue::SignedInt(1),
                    ColumnValue::Bytes(b"x".to_vec()),
                    ColumnValue::Null,
                ]),
                &orders_table_map(vec!["id".into(), "code".into(), "blob_col".into()]),
                Some(&schema),
            )
            .unwrap();

        let row = &event.rows[0];
        assert!(row.contains_key("id"));
        assert!(!row.contains_key("stale_a"));
        // types still come from the catalog
        assert_eq!(row["code"], serde_json::json!("x"));
    }

    #[test]
    fn test_update_pairs_rows() {
        let mut builder = RowEventBuilder::default();
        let schema = SchemaEntry {
            names: vec!["id".into(), "status".into()],
            types: vec!["int(11)".into(), "varchar(16)".into()],
        };
        let table_map = TableMapEvent {
            table_id: 7,
            schema_name: "shop".into(),
            table_name: "jobs".into(),
            column_count: 2,
            column_types: vec![ColumnType::Long, ColumnType::Varchar],
            column_metadata: vec![0, 16],
            column_names: vec![],
        };

        let rows_event = RowsEvent {
            table_id: 7,
            column_count: 2,
            rows: vec![
                RowImage {
                    before: Some(vec![
                        ColumnValue::SignedInt(1),
                        ColumnValue::String("new".into()),
                    ]),
                    after: Some(vec![
                        ColumnValue::SignedInt(1),
                        ColumnValue::String("done".into()),
                    ]),
                },
                RowImage {
                    before: Some(vec![
                        ColumnValue::SignedInt(2),
                        ColumnValue::String("new".into()),
                    ]),
                    after: Some(vec![
                        ColumnValue::SignedInt(2),
                        ColumnValue::String("done".into()),
                    ]),
                },
            ],
        };

        let event = builder
            .build(EventType::Update, &rows_event, &table_map, Some(&schema))
            .unwrap();

        assert_eq!(event.rows.len(), 2);
        assert_eq!(event.old_rows.len(), 2);
        // positional pairing preserves row identity
        for i in 0..2 {
            assert_eq!(event.rows[i]["id"], event.old_rows[i]["id"]);
            assert_eq!(event.old_rows[i]["status"], serde_json::json!("new"));
            assert_eq!(event.rows[i]["status"], serde_json::json!("done"));
        }
    }

    #[test]
    fn test_delete_populates_rows() {
        let mut builder = RowEventBuilder::default();
        let schema = orders_schema();

        let rows_event = RowsEvent {
            table_id: 42,
            column_count: 3,
            rows: vec![RowImage {
                before: Some(vec![
                    ColumnValue::SignedInt(9),
                    ColumnValue::Null,
                    ColumnValue::Null,
                ]),
                after: None,
            }],
        };

        let event = builder
            .build(
                EventType::Delete,
                &rows_event,
                &orders_table_map(vec![]),
                Some(&schema),
            )
            .unwrap();

        assert_eq!(event.event_type, EventType::Delete);
        assert_eq!(event.rows.len(), 1);
        assert!(event.old_rows.is_empty());
        assert_eq!(event.rows[0]["id"], serde_json::json!(9));
        assert_eq!(event.rows[0]["code"], serde_json::Value::Null);
    }

    #[test]
    fn test_column_count_mismatch_emits_named_prefix() {
        let mut builder = RowEventBuilder::default();
        let schema = SchemaEntry {
            names: vec!["id".into()],
            types: vec!["int(11)".into()],
        };

        let event = builder
            .build(
                EventType::Insert,
                &insert_event(vec![
                    ColumnValue::SignedInt(1),
                    ColumnValue::String("orphan".into()),
                ]),
                &orders_table_map(vec![]),
                Some(&schema),
            )
            .unwrap();

        let row = &event.rows[0];
        assert_eq!(row.len(), 1);
        assert_eq!(row["id"], serde_json::json!(1));
    }

    #[test]
    fn test_no_names_is_an_error() {
        let mut builder = RowEventBuilder::default();
        let result = builder.build(
            EventType::Insert,
            &insert_event(vec![ColumnValue::SignedInt(1)]),
            &orders_table_map(vec![]),
            None,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_heuristic_disabled_by_default() {
        let mut builder = RowEventBuilder::default();
        // schema present but with no type entry for the column
        let schema = SchemaEntry {
            names: vec!["payload".into()],
            types: vec![],
        };
        let table_map = TableMapEvent {
            table_id: 1,
            schema_name: "db".into(),
            table_name: "t".into(),
            column_count: 1,
            column_types: vec![ColumnType::Blob],
            column_metadata: vec![2],
            column_names: vec![],
        };

        let event = builder
            .build(
                EventType::Insert,
                &insert_event(vec![ColumnValue::Bytes(b"hello".to_vec())]),
                &table_map,
                Some(&schema),
            )
            .unwrap();

        // base64("hello")
        assert_eq!(event.rows[0]["payload"], serde_json::json!("aGVsbG8="));
    }

    #[test]
    fn test_heuristic_enabled() {
        let mut builder = RowEventBuilder::new(true);
        let schema = SchemaEntry {
            names: vec!["payload".into()],
            types: vec![],
        };
        let table_map = TableMapEvent {
            table_id: 1,
            schema_name: "db".into(),
            table_name: "t".into(),
            column_count: 1,
            column_types: vec![ColumnType::Blob],
            column_metadata: vec![2],
            column_names: vec![],
        };

        let event = builder
            .build(
                EventType::Insert,
                &insert_event(vec![ColumnValue::Bytes(b"hello".to_vec())]),
                &table_map,
                Some(&schema),
            )
            .unwrap();
        assert_eq!(event.rows[0]["payload"], serde_json::json!("hello"));

        // non-ASCII bytes stay binary even with the heuristic on
        let event = builder
            .build(
                EventType::Insert,
                &insert_event(vec![ColumnValue::Bytes(vec![0x00, 0x01, 0xFF])]),
                &table_map,
                Some(&schema),
            )
            .unwrap();
        assert_eq!(event.rows[0]["payload"], serde_json::json!("AAH/"));
    }

    #[test]
    fn test_looks_like_text() {
        assert!(looks_like_text(b"hello world"));
        // single-byte runes throughout, embedded NUL included
        assert!(looks_like_text(b"ab\x00cd"));
        assert!(!looks_like_text(b""));
        assert!(!looks_like_text(&[0xFE, 0x01])); // invalid UTF-8
        assert!(!looks_like_text("héllo".as_bytes())); // multi-byte rune
        assert!(!looks_like_text(&vec![b'a'; TEXT_HEURISTIC_MAX_LEN]));
    }

    #[test]
    fn test_plain_value_formats() {
        assert_eq!(
            plain_value(&ColumnValue::Date {
                year: 2024,
                month: 1,
                day: 15
            }),
            serde_json::json!("2024-01-15")
        );
        assert_eq!(
            plain_value(&ColumnValue::DateTime {
                year: 2024,
                month: 1,
                day: 15,
                hour: 12,
                minute: 30,
                second: 45,
                microsecond: 0
            }),
            serde_json::json!("2024-01-15T12:30:45")
        );
        assert_eq!(
            plain_value(&ColumnValue::Decimal("12.34".into())),
            serde_json::json!("12.34")
        );
        assert_eq!(plain_value(&ColumnValue::Null), serde_json::Value::Null);
    }
}
