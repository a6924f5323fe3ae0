//! # tributary - MySQL binlog CDC to NATS
//!
//! Attaches to a MySQL/MariaDB server as a replication client, decodes
//! row-level changes from the binary log, optionally transforms each event
//! (declarative rules or an embedded ECMAScript program), and publishes the
//! result on a NATS subject.
//!
//! ## Architecture
//!
//! ```text
//! MySQL Binlog → BinlogSource → RowEventBuilder → Transformer → EventSink
//!                     │               │
//!               PositionStore   SchemaResolver
//! ```
//!
//! Delivery is at-least-once: the replication cursor is persisted after every
//! event, so a restart resumes at or before the last published change and
//! never skips one.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tributary::mysql::{BinlogSource, SourceConfig};
//! use tributary::common::PositionStore;
//!
//! # async fn example() -> tributary::Result<()> {
//! let config = SourceConfig::new("localhost", "repl")
//!     .with_password("secret")
//!     .with_server_id(1001);
//!
//! let store = PositionStore::new("/var/lib/tributary/position", 4);
//! let mut source = BinlogSource::connect(config, store).await?;
//! let (_header, _event) = source.next().await?;
//! # Ok(())
//! # }
//! ```

pub mod common;
pub mod mysql;
pub mod pipeline;
pub mod sink;
pub mod transform;

pub use common::{CdcError, ChangeEvent, EventType, Position, PositionStore, Result, Row};
pub use pipeline::Pipeline;
pub use sink::{EventSink, NatsSink, ScriptBus, SinkConfig};
pub use transform::{TransformConfig, TransformRule, Transformer};
