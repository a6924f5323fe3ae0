//! MySQL/MariaDB binlog replication
//!
//! - MySQL 5.7+, 8.0+ and MariaDB 10.2+
//! - Row-based replication (binlog_format=ROW)
//! - File+offset positioning with durable resume
//!
//! ```text
//! MySQL Binlog → MySqlBinlogClient → BinlogDecoder → RowEventBuilder → ChangeEvent
//! ```

pub mod decoder;
pub mod preflight;
pub mod protocol;
pub mod rows;
pub mod schema;
pub mod source;

pub use decoder::{
    BinlogDecoder, BinlogEvent, ColumnType, ColumnValue, EventHeader, EventKind, RotateEvent,
    RowsEvent, TableMapEvent,
};
pub use preflight::check_source;
pub use protocol::MySqlBinlogClient;
pub use rows::RowEventBuilder;
pub use schema::{is_textual, SchemaCache, SchemaEntry, SchemaResolver};
pub use source::{BinlogSource, Flavor, SourceConfig};
