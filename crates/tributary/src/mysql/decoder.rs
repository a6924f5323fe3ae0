//! MySQL binlog event decoder
//!
//! Decodes the binary log events the pipeline cares about:
//! - FORMAT_DESCRIPTION_EVENT (checksum negotiation)
//! - TABLE_MAP_EVENT (including optional row metadata with column names)
//! - WRITE_ROWS / UPDATE_ROWS / DELETE_ROWS (v1 and v2)
//! - ROTATE_EVENT, XID_EVENT, QUERY_EVENT, GTID events, heartbeats
//!
//! The decoder owns the TableMap cache: a `table_id` may be reused after a
//! schema change, so every TABLE_MAP_EVENT replaces the prior entry for
//! that id.

use crate::common::{CdcError, Result};
use bytes::{Buf, Bytes};
use std::collections::HashMap;
use std::io::{Cursor, Read};
use tracing::{debug, trace};

/// Binlog event type codes (the subset this pipeline dispatches on).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventKind {
    Unknown = 0,
    Query = 2,
    Stop = 3,
    Rotate = 4,
    FormatDescription = 15,
    Xid = 16,
    TableMap = 19,
    WriteRowsV1 = 23,
    UpdateRowsV1 = 24,
    DeleteRowsV1 = 25,
    Heartbeat = 27,
    WriteRowsV2 = 30,
    UpdateRowsV2 = 31,
    DeleteRowsV2 = 32,
    Gtid = 33,
    AnonymousGtid = 34,
    PreviousGtids = 35,
}

impl EventKind {
    pub fn from_u8(value: u8) -> Self {
        match value {
            2 => EventKind::Query,
            3 => EventKind::Stop,
            4 => EventKind::Rotate,
            15 => EventKind::FormatDescription,
            16 => EventKind::Xid,
            19 => EventKind::TableMap,
            23 => EventKind::WriteRowsV1,
            24 => EventKind::UpdateRowsV1,
            25 => EventKind::DeleteRowsV1,
            27 => EventKind::Heartbeat,
            30 => EventKind::WriteRowsV2,
            31 => EventKind::UpdateRowsV2,
            32 => EventKind::DeleteRowsV2,
            33 => EventKind::Gtid,
            34 => EventKind::AnonymousGtid,
            35 => EventKind::PreviousGtids,
            _ => EventKind::Unknown,
        }
    }

    pub fn is_row_event(&self) -> bool {
        matches!(
            self,
            EventKind::WriteRowsV1
                | EventKind::WriteRowsV2
                | EventKind::UpdateRowsV1
                | EventKind::UpdateRowsV2
                | EventKind::DeleteRowsV1
                | EventKind::DeleteRowsV2
        )
    }

    fn is_v2_row_event(&self) -> bool {
        matches!(
            self,
            EventKind::WriteRowsV2 | EventKind::UpdateRowsV2 | EventKind::DeleteRowsV2
        )
    }
}

/// MySQL column type codes as they appear in TABLE_MAP events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ColumnType {
    Decimal = 0,
    Tiny = 1,
    Short = 2,
    Long = 3,
    Float = 4,
    Double = 5,
    Null = 6,
    Timestamp = 7,
    LongLong = 8,
    Int24 = 9,
    Date = 10,
    Time = 11,
    DateTime = 12,
    Year = 13,
    Varchar = 15,
    Bit = 16,
    Timestamp2 = 17,
    DateTime2 = 18,
    Time2 = 19,
    Json = 245,
    NewDecimal = 246,
    Enum = 247,
    Set = 248,
    TinyBlob = 249,
    MediumBlob = 250,
    LongBlob = 251,
    Blob = 252,
    VarString = 253,
    String = 254,
    Geometry = 255,
}

impl ColumnType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => ColumnType::Decimal,
            1 => ColumnType::Tiny,
            2 => ColumnType::Short,
            3 => ColumnType::Long,
            4 => ColumnType::Float,
            5 => ColumnType::Double,
            6 => ColumnType::Null,
            7 => ColumnType::Timestamp,
            8 => ColumnType::LongLong,
            9 => ColumnType::Int24,
            10 => ColumnType::Date,
            11 => ColumnType::Time,
            12 => ColumnType::DateTime,
            13 => ColumnType::Year,
            15 => ColumnType::Varchar,
            16 => ColumnType::Bit,
            17 => ColumnType::Timestamp2,
            18 => ColumnType::DateTime2,
            19 => ColumnType::Time2,
            245 => ColumnType::Json,
            246 => ColumnType::NewDecimal,
            247 => ColumnType::Enum,
            248 => ColumnType::Set,
            249 => ColumnType::TinyBlob,
            250 => ColumnType::MediumBlob,
            251 => ColumnType::LongBlob,
            252 => ColumnType::Blob,
            253 => ColumnType::VarString,
            254 => ColumnType::String,
            255 => ColumnType::Geometry,
            _ => ColumnType::VarString,
        }
    }
}

/// Common 19-byte event header.
#[derive(Debug, Clone)]
pub struct EventHeader {
    pub timestamp: u32,
    pub event_kind: EventKind,
    pub server_id: u32,
    pub event_length: u32,
    /// End-of-event offset in the current binlog file (`log_pos`); 0 for
    /// artificial events.
    pub next_position: u32,
    pub flags: u16,
}

impl EventHeader {
    pub const SIZE: usize = 19;

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(CdcError::decode(format!(
                "event header too short: {} bytes",
                data.len()
            )));
        }

        let mut cursor = Cursor::new(data);
        let timestamp = cursor.get_u32_le();
        let event_kind = EventKind::from_u8(cursor.get_u8());
        let server_id = cursor.get_u32_le();
        let event_length = cursor.get_u32_le();
        let next_position = cursor.get_u32_le();
        let flags = cursor.get_u16_le();

        Ok(Self {
            timestamp,
            event_kind,
            server_id,
            event_length,
            next_position,
            flags,
        })
    }
}

/// Decoded binlog event.
#[derive(Debug, Clone)]
pub enum BinlogEvent {
    FormatDescription { server_version: String },
    TableMap(TableMapEvent),
    WriteRows(RowsEvent),
    UpdateRows(RowsEvent),
    DeleteRows(RowsEvent),
    Rotate(RotateEvent),
    Xid(u64),
    Query { schema: String, query: String },
    Gtid,
    Heartbeat,
    Unknown(EventKind),
}

/// TABLE_MAP_EVENT: associates a transient table_id with a table and its
/// column layout. `column_names` is populated when the server writes row
/// metadata (MySQL 8.0+ with binlog_row_metadata=FULL).
#[derive(Debug, Clone)]
pub struct TableMapEvent {
    pub table_id: u64,
    pub schema_name: String,
    pub table_name: String,
    pub column_count: usize,
    pub column_types: Vec<ColumnType>,
    pub column_metadata: Vec<u16>,
    pub column_names: Vec<String>,
}

/// A rows event (WRITE/UPDATE/DELETE) with decoded row images.
#[derive(Debug, Clone)]
pub struct RowsEvent {
    pub table_id: u64,
    pub column_count: usize,
    pub rows: Vec<RowImage>,
}

/// One decoded row: before image for UPDATE/DELETE, after image for
/// INSERT/UPDATE.
#[derive(Debug, Clone)]
pub struct RowImage {
    pub before: Option<Vec<ColumnValue>>,
    pub after: Option<Vec<ColumnValue>>,
}

/// ROTATE_EVENT: the stream continues in `next_file` at `position`.
#[derive(Debug, Clone)]
pub struct RotateEvent {
    pub position: u64,
    pub next_file: String,
}

/// Decoded column value.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Null,
    SignedInt(i64),
    Float(f32),
    Double(f64),
    Decimal(String),
    String(String),
    Bytes(Vec<u8>),
    Date {
        year: u16,
        month: u8,
        day: u8,
    },
    Time {
        hours: u8,
        minutes: u8,
        seconds: u8,
        microseconds: u32,
        negative: bool,
    },
    DateTime {
        year: u16,
        month: u8,
        day: u8,
        hour: u8,
        minute: u8,
        second: u8,
        microsecond: u32,
    },
    Timestamp(u32),
    Year(u16),
    Enum(u16),
    Set(u64),
    Bit(Vec<u8>),
}

/// Decoder with TableMap cache and checksum state.
#[derive(Debug)]
pub struct BinlogDecoder {
    table_cache: HashMap<u64, TableMapEvent>,
    /// CRC32 checksums trail every event once the format event announces them.
    checksummed: bool,
}

impl Default for BinlogDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl BinlogDecoder {
    pub fn new() -> Self {
        Self {
            table_cache: HashMap::new(),
            checksummed: false,
        }
    }

    /// Decode one event packet (header + payload).
    pub fn decode(&mut self, data: &Bytes) -> Result<(EventHeader, BinlogEvent)> {
        let header = EventHeader::parse(data)?;
        let mut payload = &data[EventHeader::SIZE..];

        // The format description event carries the checksum algorithm; every
        // other event loses its 4-byte CRC32 trailer here so the individual
        // parsers see exactly the documented layout.
        if header.event_kind == EventKind::FormatDescription {
            self.checksummed = detect_checksum(payload);
        } else if self.checksummed && payload.len() >= 4 {
            payload = &payload[..payload.len() - 4];
        }

        trace!(
            "decoding {:?} event, {} bytes payload",
            header.event_kind,
            payload.len()
        );

        let event = match header.event_kind {
            EventKind::FormatDescription => {
                let server_version = parse_format_description(payload)?;
                debug!("binlog format description: server={server_version}");
                BinlogEvent::FormatDescription { server_version }
            }
            EventKind::TableMap => {
                let table_map = self.decode_table_map(payload)?;
                self.table_cache.insert(table_map.table_id, table_map.clone());
                BinlogEvent::TableMap(table_map)
            }
            EventKind::WriteRowsV1 | EventKind::WriteRowsV2 => {
                BinlogEvent::WriteRows(self.decode_rows(payload, header.event_kind)?)
            }
            EventKind::UpdateRowsV1 | EventKind::UpdateRowsV2 => {
                BinlogEvent::UpdateRows(self.decode_rows(payload, header.event_kind)?)
            }
            EventKind::DeleteRowsV1 | EventKind::DeleteRowsV2 => {
                BinlogEvent::DeleteRows(self.decode_rows(payload, header.event_kind)?)
            }
            EventKind::Rotate => BinlogEvent::Rotate(decode_rotate(payload)?),
            EventKind::Xid => {
                if payload.len() < 8 {
                    return Err(CdcError::decode("truncated XID event"));
                }
                let mut cursor = Cursor::new(payload);
                BinlogEvent::Xid(cursor.get_u64_le())
            }
            EventKind::Query => {
                let (schema, query) = decode_query(payload)?;
                BinlogEvent::Query { schema, query }
            }
            EventKind::Gtid | EventKind::AnonymousGtid | EventKind::PreviousGtids => {
                BinlogEvent::Gtid
            }
            EventKind::Heartbeat => BinlogEvent::Heartbeat,
            other => BinlogEvent::Unknown(other),
        };

        Ok((header, event))
    }

    /// TableMap for a table_id, if one has been seen.
    pub fn table(&self, table_id: u64) -> Option<&TableMapEvent> {
        self.table_cache.get(&table_id)
    }

    fn decode_table_map(&self, data: &[u8]) -> Result<TableMapEvent> {
        let mut cursor = Cursor::new(data);

        let table_id = read_table_id(&mut cursor)?;
        let _flags = get_u16_checked(&mut cursor)?;

        let schema_name = read_u8_prefixed_string(&mut cursor)?;
        skip(&mut cursor, 1)?; // null terminator
        let table_name = read_u8_prefixed_string(&mut cursor)?;
        skip(&mut cursor, 1)?; // null terminator

        let column_count = read_packed_int(&mut cursor)? as usize;

        let mut column_types = Vec::with_capacity(column_count);
        for _ in 0..column_count {
            column_types.push(ColumnType::from_u8(get_u8_checked(&mut cursor)?));
        }

        let _metadata_len = read_packed_int(&mut cursor)?;
        let column_metadata = decode_column_metadata(&column_types, &mut cursor)?;

        let null_bitmap_len = column_count.div_ceil(8);
        skip(&mut cursor, null_bitmap_len)?;

        // Optional metadata (MySQL 8.0+): TLV blocks; we only care about
        // COLUMN_NAME (type 4), everything else is skipped.
        let column_names = decode_optional_metadata(&mut cursor).unwrap_or_default();

        Ok(TableMapEvent {
            table_id,
            schema_name,
            table_name,
            column_count,
            column_types,
            column_metadata,
            column_names,
        })
    }

    fn decode_rows(&self, data: &[u8], kind: EventKind) -> Result<RowsEvent> {
        let mut cursor = Cursor::new(data);

        let table_id = read_table_id(&mut cursor)?;
        let _flags = get_u16_checked(&mut cursor)?;

        // v2 events carry a variable extra-data block
        if kind.is_v2_row_event() {
            let extra_len = get_u16_checked(&mut cursor)? as usize;
            if extra_len > 2 {
                skip(&mut cursor, extra_len - 2)?;
            }
        }

        let column_count = read_packed_int(&mut cursor)? as usize;

        let bitmap_len = column_count.div_ceil(8);
        let mut present_bitmap = vec![0u8; bitmap_len];
        cursor
            .read_exact(&mut present_bitmap)
            .map_err(truncated)?;

        let is_update = matches!(kind, EventKind::UpdateRowsV1 | EventKind::UpdateRowsV2);
        let is_delete = matches!(kind, EventKind::DeleteRowsV1 | EventKind::DeleteRowsV2);

        let after_bitmap = if is_update {
            let mut bitmap = vec![0u8; bitmap_len];
            cursor.read_exact(&mut bitmap).map_err(truncated)?;
            Some(bitmap)
        } else {
            None
        };

        let table_map = self.table_cache.get(&table_id);
        let mut rows = Vec::new();

        while cursor.has_remaining() {
            let present = count_set_bits(&present_bitmap);
            let null_bitmap_len = present.div_ceil(8);
            if cursor.remaining() < null_bitmap_len {
                break;
            }

            if is_update || is_delete {
                let before = self.decode_row_image(
                    &mut cursor,
                    table_map,
                    column_count,
                    &present_bitmap,
                )?;

                if is_update {
                    let after_present = after_bitmap.as_deref().unwrap_or(&present_bitmap);
                    if cursor.remaining() < count_set_bits(after_present).div_ceil(8) {
                        rows.push(RowImage {
                            before: Some(before),
                            after: None,
                        });
                        break;
                    }
                    let after = self.decode_row_image(
                        &mut cursor,
                        table_map,
                        column_count,
                        after_present,
                    )?;
                    rows.push(RowImage {
                        before: Some(before),
                        after: Some(after),
                    });
                } else {
                    rows.push(RowImage {
                        before: Some(before),
                        after: None,
                    });
                }
            } else {
                let after = self.decode_row_image(
                    &mut cursor,
                    table_map,
                    column_count,
                    &present_bitmap,
                )?;
                rows.push(RowImage {
                    before: None,
                    after: Some(after),
                });
            }
        }

        Ok(RowsEvent {
            table_id,
            column_count,
            rows,
        })
    }

    fn decode_row_image(
        &self,
        cursor: &mut Cursor<&[u8]>,
        table_map: Option<&TableMapEvent>,
        column_count: usize,
        present_bitmap: &[u8],
    ) -> Result<Vec<ColumnValue>> {
        let present = count_set_bits(present_bitmap);
        let null_bitmap_len = present.div_ceil(8);
        let mut null_bitmap = vec![0u8; null_bitmap_len];
        cursor.read_exact(&mut null_bitmap).map_err(truncated)?;

        let mut values = Vec::with_capacity(column_count);
        let mut null_idx = 0;

        for col_idx in 0..column_count {
            if !is_bit_set(present_bitmap, col_idx) {
                continue;
            }

            if is_bit_set(&null_bitmap, null_idx) {
                values.push(ColumnValue::Null);
                null_idx += 1;
                continue;
            }

            let col_type = table_map
                .and_then(|tm| tm.column_types.get(col_idx))
                .copied()
                .unwrap_or(ColumnType::VarString);
            let metadata = table_map
                .and_then(|tm| tm.column_metadata.get(col_idx))
                .copied()
                .unwrap_or(0);

            values.push(decode_column_value(cursor, col_type, metadata)?);
            null_idx += 1;
        }

        Ok(values)
    }
}

/// FORMAT_DESCRIPTION layout: version(2) + server_version(50) + create_ts(4)
/// + header_len(1) + per-type header lengths. When checksums are enabled the
/// payload ends with the algorithm byte followed by the event's own CRC32.
fn detect_checksum(payload: &[u8]) -> bool {
    if payload.len() < 2 + 50 + 4 + 1 + 5 {
        return false;
    }
    payload[payload.len() - 5] == 1
}

fn parse_format_description(data: &[u8]) -> Result<String> {
    let mut cursor = Cursor::new(data);
    let _binlog_version = get_u16_checked(&mut cursor)?;

    let mut version_bytes = [0u8; 50];
    cursor.read_exact(&mut version_bytes).map_err(truncated)?;
    Ok(String::from_utf8_lossy(&version_bytes)
        .trim_end_matches('\0')
        .to_string())
}

fn decode_column_metadata(
    column_types: &[ColumnType],
    cursor: &mut Cursor<&[u8]>,
) -> Result<Vec<u16>> {
    let mut metadata = Vec::with_capacity(column_types.len());

    for col_type in column_types {
        let meta = match col_type {
            ColumnType::Float
            | ColumnType::Double
            | ColumnType::Blob
            | ColumnType::TinyBlob
            | ColumnType::MediumBlob
            | ColumnType::LongBlob
            | ColumnType::Json
            | ColumnType::Geometry => get_u8_checked(cursor)? as u16,
            ColumnType::Bit
            | ColumnType::Varchar
            | ColumnType::VarString
            | ColumnType::String
            | ColumnType::Enum
            | ColumnType::Set => get_u16_checked(cursor)?,
            ColumnType::NewDecimal => {
                let precision = get_u8_checked(cursor)?;
                let scale = get_u8_checked(cursor)?;
                ((precision as u16) << 8) | (scale as u16)
            }
            ColumnType::Time2 | ColumnType::DateTime2 | ColumnType::Timestamp2 => {
                get_u8_checked(cursor)? as u16
            }
            _ => 0,
        };
        metadata.push(meta);
    }

    Ok(metadata)
}

/// Optional TABLE_MAP metadata: repeated `type(1) length(packed) value` blocks.
/// COLUMN_NAME (type 4) holds length-prefixed names in column order.
fn decode_optional_metadata(cursor: &mut Cursor<&[u8]>) -> Result<Vec<String>> {
    const TYPE_COLUMN_NAME: u8 = 4;
    let mut names = Vec::new();

    while cursor.remaining() > 1 {
        let block_type = get_u8_checked(cursor)?;
        let block_len = read_packed_int(cursor)? as usize;
        if cursor.remaining() < block_len {
            break;
        }

        if block_type == TYPE_COLUMN_NAME {
            let end = cursor.position() as usize + block_len;
            while (cursor.position() as usize) < end {
                let name_len = read_packed_int(cursor)? as usize;
                let mut name = vec![0u8; name_len];
                cursor.read_exact(&mut name).map_err(truncated)?;
                names.push(String::from_utf8_lossy(&name).to_string());
            }
        } else {
            skip(cursor, block_len)?;
        }
    }

    Ok(names)
}

fn decode_rotate(data: &[u8]) -> Result<RotateEvent> {
    if data.len() < 8 {
        return Err(CdcError::decode("truncated rotate event"));
    }
    let mut cursor = Cursor::new(data);
    let position = cursor.get_u64_le();

    let mut name_bytes = vec![0u8; data.len() - cursor.position() as usize];
    cursor.read_exact(&mut name_bytes).map_err(truncated)?;
    let next_file = String::from_utf8_lossy(&name_bytes)
        .trim_end_matches('\0')
        .to_string();

    Ok(RotateEvent {
        position,
        next_file,
    })
}

fn decode_query(data: &[u8]) -> Result<(String, String)> {
    if data.len() < 13 {
        return Err(CdcError::decode("truncated query event"));
    }
    let mut cursor = Cursor::new(data);

    let _thread_id = cursor.get_u32_le();
    let _exec_time = cursor.get_u32_le();
    let schema_len = get_u8_checked(&mut cursor)? as usize;
    let _error_code = get_u16_checked(&mut cursor)?;

    let status_vars_len = get_u16_checked(&mut cursor)? as usize;
    skip(&mut cursor, status_vars_len)?;

    let mut schema_bytes = vec![0u8; schema_len];
    cursor.read_exact(&mut schema_bytes).map_err(truncated)?;
    let schema = String::from_utf8_lossy(&schema_bytes).to_string();
    skip(&mut cursor, 1)?; // null terminator

    let mut query_bytes = vec![0u8; data.len() - cursor.position() as usize];
    cursor.read_exact(&mut query_bytes).map_err(truncated)?;
    let query = String::from_utf8_lossy(&query_bytes).to_string();

    Ok((schema, query))
}

fn decode_column_value(
    cursor: &mut Cursor<&[u8]>,
    col_type: ColumnType,
    metadata: u16,
) -> Result<ColumnValue> {
    match col_type {
        ColumnType::Tiny => Ok(ColumnValue::SignedInt(cursor.get_i8() as i64)),
        ColumnType::Short => Ok(ColumnValue::SignedInt(cursor.get_i16_le() as i64)),
        ColumnType::Int24 => {
            let b1 = get_u8_checked(cursor)? as u32;
            let b2 = get_u8_checked(cursor)? as u32;
            let b3 = get_u8_checked(cursor)? as u32;
            let val = b1 | (b2 << 8) | (b3 << 16);
            let signed = if val & 0x80_0000 != 0 {
                (val | 0xFF00_0000) as i32
            } else {
                val as i32
            };
            Ok(ColumnValue::SignedInt(signed as i64))
        }
        ColumnType::Long => Ok(ColumnValue::SignedInt(cursor.get_i32_le() as i64)),
        ColumnType::LongLong => Ok(ColumnValue::SignedInt(cursor.get_i64_le())),
        ColumnType::Float => Ok(ColumnValue::Float(cursor.get_f32_le())),
        ColumnType::Double => Ok(ColumnValue::Double(cursor.get_f64_le())),
        ColumnType::Year => Ok(ColumnValue::Year(get_u8_checked(cursor)? as u16 + 1900)),
        ColumnType::Date => {
            let packed = get_u8_checked(cursor)? as u32
                | ((get_u8_checked(cursor)? as u32) << 8)
                | ((get_u8_checked(cursor)? as u32) << 16);
            Ok(ColumnValue::Date {
                day: (packed & 0x1F) as u8,
                month: ((packed >> 5) & 0x0F) as u8,
                year: ((packed >> 9) & 0x7FFF) as u16,
            })
        }
        ColumnType::Time => {
            let packed = get_u8_checked(cursor)? as u32
                | ((get_u8_checked(cursor)? as u32) << 8)
                | ((get_u8_checked(cursor)? as u32) << 16);
            Ok(ColumnValue::Time {
                seconds: (packed % 100) as u8,
                minutes: ((packed / 100) % 100) as u8,
                hours: (packed / 10000) as u8,
                microseconds: 0,
                negative: false,
            })
        }
        ColumnType::DateTime => {
            let packed = cursor.get_u64_le();
            Ok(ColumnValue::DateTime {
                second: (packed % 100) as u8,
                minute: ((packed / 100) % 100) as u8,
                hour: ((packed / 10_000) % 100) as u8,
                day: ((packed / 1_000_000) % 100) as u8,
                month: ((packed / 100_000_000) % 100) as u8,
                year: (packed / 10_000_000_000) as u16,
                microsecond: 0,
            })
        }
        ColumnType::Timestamp => Ok(ColumnValue::Timestamp(cursor.get_u32_le())),
        ColumnType::Timestamp2 => {
            // big-endian seconds + fractional part per fsp
            let secs = cursor.get_u32();
            let _frac = read_fractional_seconds(cursor, metadata as u8)?;
            Ok(ColumnValue::Timestamp(secs))
        }
        ColumnType::DateTime2 => {
            let packed = read_be_uint(cursor, 5)?;
            let frac = read_fractional_seconds(cursor, metadata as u8)?;

            let year_month = (packed >> 22) & 0x1FFFF;
            Ok(ColumnValue::DateTime {
                year: (year_month / 13) as u16,
                month: (year_month % 13) as u8,
                day: ((packed >> 17) & 0x1F) as u8,
                hour: ((packed >> 12) & 0x1F) as u8,
                minute: ((packed >> 6) & 0x3F) as u8,
                second: (packed & 0x3F) as u8,
                microsecond: frac,
            })
        }
        ColumnType::Time2 => {
            let packed = read_be_uint(cursor, 3)? as u32;
            let frac = read_fractional_seconds(cursor, metadata as u8)?;

            let negative = (packed & 0x80_0000) == 0;
            let value = if negative {
                0x80_0000 - (packed & 0x7F_FFFF)
            } else {
                packed & 0x7F_FFFF
            };

            Ok(ColumnValue::Time {
                hours: ((value >> 12) & 0x3FF) as u8,
                minutes: ((value >> 6) & 0x3F) as u8,
                seconds: (value & 0x3F) as u8,
                microseconds: frac,
                negative,
            })
        }
        ColumnType::Varchar | ColumnType::VarString => {
            let len = if metadata < 256 {
                get_u8_checked(cursor)? as usize
            } else {
                get_u16_checked(cursor)? as usize
            };
            let mut bytes = vec![0u8; len];
            cursor.read_exact(&mut bytes).map_err(truncated)?;
            Ok(ColumnValue::String(
                String::from_utf8_lossy(&bytes).to_string(),
            ))
        }
        ColumnType::String => {
            // metadata high byte holds the real type for ENUM/SET stored
            // as STRING
            let real_type = (metadata >> 8) as u8;
            let max_len = metadata & 0xFF;

            if real_type == ColumnType::Enum as u8 {
                let val = if max_len == 1 {
                    get_u8_checked(cursor)? as u16
                } else {
                    get_u16_checked(cursor)?
                };
                Ok(ColumnValue::Enum(val))
            } else if real_type == ColumnType::Set as u8 {
                let byte_count = max_len.div_ceil(8) as usize;
                let mut val = 0u64;
                for i in 0..byte_count {
                    val |= (get_u8_checked(cursor)? as u64) << (i * 8);
                }
                Ok(ColumnValue::Set(val))
            } else {
                let len = if max_len < 256 {
                    get_u8_checked(cursor)? as usize
                } else {
                    get_u16_checked(cursor)? as usize
                };
                let mut bytes = vec![0u8; len];
                cursor.read_exact(&mut bytes).map_err(truncated)?;
                Ok(ColumnValue::String(
                    String::from_utf8_lossy(&bytes).to_string(),
                ))
            }
        }
        ColumnType::Blob
        | ColumnType::TinyBlob
        | ColumnType::MediumBlob
        | ColumnType::LongBlob
        | ColumnType::Json
        | ColumnType::Geometry => {
            // TEXT columns arrive as blobs too; the row builder decides
            // string vs binary from the declared type.
            let len = match metadata {
                1 => get_u8_checked(cursor)? as usize,
                2 => get_u16_checked(cursor)? as usize,
                3 => {
                    let b1 = get_u8_checked(cursor)? as usize;
                    let b2 = get_u8_checked(cursor)? as usize;
                    let b3 = get_u8_checked(cursor)? as usize;
                    b1 | (b2 << 8) | (b3 << 16)
                }
                4 => cursor.get_u32_le() as usize,
                _ => get_u8_checked(cursor)? as usize,
            };
            let mut bytes = vec![0u8; len];
            cursor.read_exact(&mut bytes).map_err(truncated)?;
            Ok(ColumnValue::Bytes(bytes))
        }
        ColumnType::NewDecimal => {
            let precision = (metadata >> 8) as usize;
            let scale = (metadata & 0xFF) as usize;
            Ok(ColumnValue::Decimal(decode_decimal(
                cursor, precision, scale,
            )?))
        }
        ColumnType::Bit => {
            let nbits = ((metadata >> 8) * 8 + (metadata & 0xFF)) as usize;
            let mut bytes = vec![0u8; nbits.div_ceil(8)];
            cursor.read_exact(&mut bytes).map_err(truncated)?;
            Ok(ColumnValue::Bit(bytes))
        }
        ColumnType::Enum => {
            let val = if metadata == 1 {
                get_u8_checked(cursor)? as u16
            } else {
                get_u16_checked(cursor)?
            };
            Ok(ColumnValue::Enum(val))
        }
        ColumnType::Set => {
            let byte_count = metadata as usize;
            let mut val = 0u64;
            for i in 0..byte_count {
                val |= (get_u8_checked(cursor)? as u64) << (i * 8);
            }
            Ok(ColumnValue::Set(val))
        }
        ColumnType::Null => Ok(ColumnValue::Null),
        ColumnType::Decimal => Err(CdcError::decode(
            "legacy DECIMAL columns are not supported; use NewDecimal (5.0+)",
        )),
    }
}

// ---------------------------------------------------------------------------
// wire helpers

fn truncated(e: std::io::Error) -> CdcError {
    CdcError::decode(format!("truncated event payload: {e}"))
}

fn get_u8_checked(cursor: &mut Cursor<&[u8]>) -> Result<u8> {
    if !cursor.has_remaining() {
        return Err(CdcError::decode("truncated event payload"));
    }
    Ok(cursor.get_u8())
}

fn get_u16_checked(cursor: &mut Cursor<&[u8]>) -> Result<u16> {
    if cursor.remaining() < 2 {
        return Err(CdcError::decode("truncated event payload"));
    }
    Ok(cursor.get_u16_le())
}

fn skip(cursor: &mut Cursor<&[u8]>, n: usize) -> Result<()> {
    if cursor.remaining() < n {
        return Err(CdcError::decode("truncated event payload"));
    }
    cursor.advance(n);
    Ok(())
}

fn read_u8_prefixed_string(cursor: &mut Cursor<&[u8]>) -> Result<String> {
    let len = get_u8_checked(cursor)? as usize;
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes).map_err(truncated)?;
    Ok(String::from_utf8_lossy(&bytes).to_string())
}

fn read_table_id(cursor: &mut Cursor<&[u8]>) -> Result<u64> {
    if cursor.remaining() < 6 {
        return Err(CdcError::decode("truncated event payload"));
    }
    let mut id = 0u64;
    for i in 0..6 {
        id |= (cursor.get_u8() as u64) << (i * 8);
    }
    Ok(id)
}

fn read_packed_int(cursor: &mut Cursor<&[u8]>) -> Result<u64> {
    let first = get_u8_checked(cursor)?;
    match first {
        0..=250 => Ok(first as u64),
        252 => Ok(get_u16_checked(cursor)? as u64),
        253 => {
            let b1 = get_u8_checked(cursor)? as u64;
            let b2 = get_u8_checked(cursor)? as u64;
            let b3 = get_u8_checked(cursor)? as u64;
            Ok(b1 | (b2 << 8) | (b3 << 16))
        }
        254 => {
            if cursor.remaining() < 8 {
                return Err(CdcError::decode("truncated event payload"));
            }
            Ok(cursor.get_u64_le())
        }
        other => Err(CdcError::decode(format!("invalid packed int: {other}"))),
    }
}

fn read_fractional_seconds(cursor: &mut Cursor<&[u8]>, fsp: u8) -> Result<u32> {
    let bytes = (fsp as usize).div_ceil(2);
    let mut val = 0u32;
    for _ in 0..bytes {
        val = (val << 8) | (get_u8_checked(cursor)? as u32);
    }
    if fsp == 0 {
        return Ok(0);
    }
    Ok(val * 10u32.pow(6 - fsp as u32))
}

fn read_be_uint(cursor: &mut Cursor<&[u8]>, bytes: usize) -> Result<u64> {
    let mut val = 0u64;
    for _ in 0..bytes {
        val = (val << 8) | (get_u8_checked(cursor)? as u64);
    }
    Ok(val)
}

fn count_set_bits(bitmap: &[u8]) -> usize {
    bitmap.iter().map(|b| b.count_ones() as usize).sum()
}

fn is_bit_set(bitmap: &[u8], idx: usize) -> bool {
    let byte_idx = idx / 8;
    byte_idx < bitmap.len() && (bitmap[byte_idx] & (1 << (idx % 8))) != 0
}

/// MySQL packed DECIMAL: groups of 9 digits per 4 bytes, sign bit flipped on
/// the first byte, negative values stored as complement.
fn decode_decimal(cursor: &mut Cursor<&[u8]>, precision: usize, scale: usize) -> Result<String> {
    let int_digits = precision.saturating_sub(scale);
    let int_words = int_digits / 9;
    let int_leftover = int_digits % 9;
    let frac_words = scale / 9;
    let frac_leftover = scale % 9;

    let leftover_bytes = |digits: usize| -> usize {
        match digits {
            0 => 0,
            1..=2 => 1,
            3..=4 => 2,
            5..=6 => 3,
            _ => 4,
        }
    };

    let int_leftover_bytes = leftover_bytes(int_leftover);
    let frac_leftover_bytes = leftover_bytes(frac_leftover);
    let total = int_leftover_bytes + int_words * 4 + frac_words * 4 + frac_leftover_bytes;

    let mut bytes = vec![0u8; total];
    cursor.read_exact(&mut bytes).map_err(truncated)?;

    if bytes.is_empty() {
        return Ok("0".to_string());
    }

    let negative = (bytes[0] & 0x80) == 0;
    bytes[0] ^= 0x80;
    if negative {
        for b in bytes.iter_mut() {
            *b = !*b;
        }
    }

    let mut inner = Cursor::new(bytes.as_slice());
    let mut int_part = String::new();

    if int_leftover_bytes > 0 {
        let val = read_be_uint(&mut inner, int_leftover_bytes)?;
        if val > 0 || int_words == 0 {
            int_part.push_str(&val.to_string());
        }
    }

    for _ in 0..int_words {
        let val = inner.get_u32();
        if int_part.is_empty() {
            if val > 0 {
                int_part.push_str(&val.to_string());
            }
        } else {
            int_part.push_str(&format!("{val:09}"));
        }
    }

    if int_part.is_empty() {
        int_part.push('0');
    }

    let mut result = String::new();
    if negative {
        result.push('-');
    }
    result.push_str(&int_part);

    if scale > 0 {
        result.push('.');
        for _ in 0..frac_words {
            let val = inner.get_u32();
            result.push_str(&format!("{val:09}"));
        }
        if frac_leftover_bytes > 0 {
            let val = read_be_uint(&mut inner, frac_leftover_bytes)?;
            result.push_str(&format!("{val:0width$}", width = frac_leftover));
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    fn header_bytes(kind: EventKind, event_length: u32, next_position: u32) -> Vec<u8> {
        let mut out = Vec::new();
        out.put_u32_le(1700000000); // timestamp
        out.put_u8(kind as u8);
        out.put_u32_le(1); // server_id
        out.put_u32_le(event_length);
        out.put_u32_le(next_position);
        out.put_u16_le(0); // flags
        out
    }

    /// TABLE_MAP payload for shop.orders(id INT, code TEXT, blob_col BLOB),
    /// optionally with embedded column names.
    fn table_map_payload(with_names: bool) -> Vec<u8> {
        let mut p = Vec::new();
        p.extend_from_slice(&[42, 0, 0, 0, 0, 0]); // table_id = 42
        p.put_u16_le(1); // flags
        p.put_u8(4);
        p.extend_from_slice(b"shop");
        p.put_u8(0);
        p.put_u8(6);
        p.extend_from_slice(b"orders");
        p.put_u8(0);
        p.put_u8(3); // column count
        p.put_u8(ColumnType::Long as u8);
        p.put_u8(ColumnType::Blob as u8);
        p.put_u8(ColumnType::Blob as u8);
        p.put_u8(2); // metadata length
        p.put_u8(2); // blob length-byte count for `code`
        p.put_u8(2); // blob length-byte count for `blob_col`
        p.put_u8(0); // null bitmap (3 cols → 1 byte)
        if with_names {
            let mut names = Vec::new();
            for name in ["id", "code", "blob_col"] {
                names.push(name.len() as u8);
                names.extend_from_slice(name.as_bytes());
            }
            p.put_u8(4); // optional metadata type COLUMN_NAME
            p.put_u8(names.len() as u8);
            p.extend_from_slice(&names);
        }
        p
    }

    fn decode_table_map_fixture(with_names: bool) -> (BinlogDecoder, TableMapEvent) {
        let mut decoder = BinlogDecoder::new();
        let payload = table_map_payload(with_names);
        let mut packet = header_bytes(
            EventKind::TableMap,
            (EventHeader::SIZE + payload.len()) as u32,
            500,
        );
        packet.extend_from_slice(&payload);

        let (_, event) = decoder.decode(&Bytes::from(packet)).unwrap();
        match event {
            BinlogEvent::TableMap(tm) => (decoder, tm),
            other => panic!("expected TableMap, got {other:?}"),
        }
    }

    #[test]
    fn test_event_kind_from_u8() {
        assert_eq!(EventKind::from_u8(15), EventKind::FormatDescription);
        assert_eq!(EventKind::from_u8(19), EventKind::TableMap);
        assert_eq!(EventKind::from_u8(30), EventKind::WriteRowsV2);
        assert_eq!(EventKind::from_u8(31), EventKind::UpdateRowsV2);
        assert_eq!(EventKind::from_u8(32), EventKind::DeleteRowsV2);
        assert_eq!(EventKind::from_u8(4), EventKind::Rotate);
        assert_eq!(EventKind::from_u8(16), EventKind::Xid);
        assert_eq!(EventKind::from_u8(200), EventKind::Unknown);
    }

    #[test]
    fn test_is_row_event() {
        assert!(EventKind::WriteRowsV1.is_row_event());
        assert!(EventKind::WriteRowsV2.is_row_event());
        assert!(EventKind::UpdateRowsV2.is_row_event());
        assert!(EventKind::DeleteRowsV2.is_row_event());
        assert!(!EventKind::TableMap.is_row_event());
        assert!(!EventKind::Query.is_row_event());
    }

    #[test]
    fn test_event_header_parse() {
        let bytes = header_bytes(EventKind::Xid, 31, 1234);
        let header = EventHeader::parse(&bytes).unwrap();
        assert_eq!(header.event_kind, EventKind::Xid);
        assert_eq!(header.event_length, 31);
        assert_eq!(header.next_position, 1234);
        assert_eq!(header.server_id, 1);
    }

    #[test]
    fn test_event_header_too_short() {
        assert!(EventHeader::parse(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_bit_helpers() {
        assert_eq!(count_set_bits(&[0b1111_1111]), 8);
        assert_eq!(count_set_bits(&[0b1010_1010]), 4);
        assert_eq!(count_set_bits(&[]), 0);

        let bitmap = [0b0000_0101];
        assert!(is_bit_set(&bitmap, 0));
        assert!(!is_bit_set(&bitmap, 1));
        assert!(is_bit_set(&bitmap, 2));
        assert!(!is_bit_set(&bitmap, 100));
    }

    #[test]
    fn test_packed_int() {
        let data = [42u8];
        assert_eq!(read_packed_int(&mut Cursor::new(&data[..])).unwrap(), 42);

        let data = [252u8, 0x10, 0x27];
        assert_eq!(
            read_packed_int(&mut Cursor::new(&data[..])).unwrap(),
            10000
        );

        let data = [251u8];
        assert!(read_packed_int(&mut Cursor::new(&data[..])).is_err());
    }

    #[test]
    fn test_decode_table_map() {
        let (decoder, tm) = decode_table_map_fixture(false);
        assert_eq!(tm.table_id, 42);
        assert_eq!(tm.schema_name, "shop");
        assert_eq!(tm.table_name, "orders");
        assert_eq!(tm.column_count, 3);
        assert_eq!(tm.column_types[0], ColumnType::Long);
        assert_eq!(tm.column_types[1], ColumnType::Blob);
        assert!(tm.column_names.is_empty());
        assert!(decoder.table(42).is_some());
        assert!(decoder.table(43).is_none());
    }

    #[test]
    fn test_decode_table_map_with_embedded_names() {
        let (_, tm) = decode_table_map_fixture(true);
        assert_eq!(tm.column_names, vec!["id", "code", "blob_col"]);
    }

    #[test]
    fn test_table_map_replaced_on_reuse() {
        let (mut decoder, _) = decode_table_map_fixture(false);

        // same table_id, new schema shape (single column)
        let mut p = Vec::new();
        p.extend_from_slice(&[42, 0, 0, 0, 0, 0]);
        p.put_u16_le(1);
        p.put_u8(4);
        p.extend_from_slice(b"shop");
        p.put_u8(0);
        p.put_u8(6);
        p.extend_from_slice(b"orders");
        p.put_u8(0);
        p.put_u8(1);
        p.put_u8(ColumnType::Long as u8);
        p.put_u8(0); // metadata length
        p.put_u8(0); // null bitmap

        let mut packet = header_bytes(
            EventKind::TableMap,
            (EventHeader::SIZE + p.len()) as u32,
            600,
        );
        packet.extend_from_slice(&p);
        decoder.decode(&Bytes::from(packet)).unwrap();

        assert_eq!(decoder.table(42).unwrap().column_count, 1);
    }

    #[test]
    fn test_decode_write_rows() {
        let (mut decoder, _) = decode_table_map_fixture(false);

        // One row: id=7, code=b"hi", blob_col=[0x00, 0x01, 0xFF]
        let mut p = Vec::new();
        p.extend_from_slice(&[42, 0, 0, 0, 0, 0]);
        p.put_u16_le(1); // flags
        p.put_u16_le(2); // v2 extra data length (just the length field)
        p.put_u8(3); // column count
        p.put_u8(0b0000_0111); // present bitmap
        p.put_u8(0b0000_0000); // null bitmap
        p.put_u32_le(7); // id
        p.put_u16_le(2); // code length (2-byte blob length)
        p.extend_from_slice(b"hi");
        p.put_u16_le(3); // blob_col length
        p.extend_from_slice(&[0x00, 0x01, 0xFF]);

        let mut packet = header_bytes(
            EventKind::WriteRowsV2,
            (EventHeader::SIZE + p.len()) as u32,
            700,
        );
        packet.extend_from_slice(&p);

        let (header, event) = decoder.decode(&Bytes::from(packet)).unwrap();
        assert_eq!(header.next_position, 700);

        let rows = match event {
            BinlogEvent::WriteRows(rows) => rows,
            other => panic!("expected WriteRows, got {other:?}"),
        };
        assert_eq!(rows.table_id, 42);
        assert_eq!(rows.rows.len(), 1);

        let after = rows.rows[0].after.as_ref().unwrap();
        assert_eq!(after[0], ColumnValue::SignedInt(7));
        assert_eq!(after[1], ColumnValue::Bytes(b"hi".to_vec()));
        assert_eq!(after[2], ColumnValue::Bytes(vec![0x00, 0x01, 0xFF]));
        assert!(rows.rows[0].before.is_none());
    }

    #[test]
    fn test_decode_update_rows_pairs_images() {
        let (mut decoder, _) = decode_table_map_fixture(false);

        let mut p = Vec::new();
        p.extend_from_slice(&[42, 0, 0, 0, 0, 0]);
        p.put_u16_le(1);
        p.put_u16_le(2);
        p.put_u8(3);
        p.put_u8(0b0000_0111); // before present
        p.put_u8(0b0000_0111); // after present
        // before image: id=1, code="a", blob NULL
        p.put_u8(0b0000_0100); // null bitmap: third present column null
        p.put_u32_le(1);
        p.put_u16_le(1);
        p.extend_from_slice(b"a");
        // after image: id=1, code="b", blob NULL
        p.put_u8(0b0000_0100);
        p.put_u32_le(1);
        p.put_u16_le(1);
        p.extend_from_slice(b"b");

        let mut packet = header_bytes(
            EventKind::UpdateRowsV2,
            (EventHeader::SIZE + p.len()) as u32,
            800,
        );
        packet.extend_from_slice(&p);

        let (_, event) = decoder.decode(&Bytes::from(packet)).unwrap();
        let rows = match event {
            BinlogEvent::UpdateRows(rows) => rows,
            other => panic!("expected UpdateRows, got {other:?}"),
        };

        assert_eq!(rows.rows.len(), 1);
        let before = rows.rows[0].before.as_ref().unwrap();
        let after = rows.rows[0].after.as_ref().unwrap();
        assert_eq!(before[1], ColumnValue::Bytes(b"a".to_vec()));
        assert_eq!(after[1], ColumnValue::Bytes(b"b".to_vec()));
        assert_eq!(before[2], ColumnValue::Null);
    }

    #[test]
    fn test_decode_rotate() {
        let mut p = Vec::new();
        p.put_u64_le(4);
        p.extend_from_slice(b"mysql-bin.000005");

        let mut packet = header_bytes(
            EventKind::Rotate,
            (EventHeader::SIZE + p.len()) as u32,
            0,
        );
        packet.extend_from_slice(&p);

        let mut decoder = BinlogDecoder::new();
        let (_, event) = decoder.decode(&Bytes::from(packet)).unwrap();
        match event {
            BinlogEvent::Rotate(rotate) => {
                assert_eq!(rotate.next_file, "mysql-bin.000005");
                assert_eq!(rotate.position, 4);
            }
            other => panic!("expected Rotate, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_xid() {
        let mut p = Vec::new();
        p.put_u64_le(99);
        let mut packet = header_bytes(EventKind::Xid, (EventHeader::SIZE + p.len()) as u32, 0);
        packet.extend_from_slice(&p);

        let mut decoder = BinlogDecoder::new();
        let (_, event) = decoder.decode(&Bytes::from(packet)).unwrap();
        assert!(matches!(event, BinlogEvent::Xid(99)));
    }

    #[test]
    fn test_checksum_stripping() {
        // Format description announcing CRC32, then a rotate with a 4-byte
        // trailer that must not leak into the file name.
        let mut fde = Vec::new();
        fde.put_u16_le(4); // binlog version
        let mut version = [0u8; 50];
        version[..5].copy_from_slice(b"8.0.0");
        fde.extend_from_slice(&version);
        fde.put_u32_le(0); // create timestamp
        fde.put_u8(19); // header length
        fde.extend_from_slice(&[0u8; 40]); // per-type header lengths
        fde.put_u8(1); // checksum algorithm: CRC32
        fde.extend_from_slice(&[0xAA; 4]); // FDE's own checksum

        let mut packet = header_bytes(
            EventKind::FormatDescription,
            (EventHeader::SIZE + fde.len()) as u32,
            0,
        );
        packet.extend_from_slice(&fde);

        let mut decoder = BinlogDecoder::new();
        decoder.decode(&Bytes::from(packet)).unwrap();
        assert!(decoder.checksummed);

        let mut rotate = Vec::new();
        rotate.put_u64_le(4);
        rotate.extend_from_slice(b"mysql-bin.000002");
        rotate.extend_from_slice(&[0xBB; 4]); // CRC32 trailer

        let mut packet = header_bytes(
            EventKind::Rotate,
            (EventHeader::SIZE + rotate.len()) as u32,
            0,
        );
        packet.extend_from_slice(&rotate);

        let (_, event) = decoder.decode(&Bytes::from(packet)).unwrap();
        match event {
            BinlogEvent::Rotate(r) => assert_eq!(r.next_file, "mysql-bin.000002"),
            other => panic!("expected Rotate, got {other:?}"),
        }
    }

    #[test]
    fn test_decimal_decode() {
        // DECIMAL(4,2) value 12.34: int part 12 (1 byte group), frac 34
        let bytes = [0x80 | 12, 34];
        let mut cursor = Cursor::new(&bytes[..]);
        assert_eq!(decode_decimal(&mut cursor, 4, 2).unwrap(), "12.34");
    }
}
