//! Driver loop
//!
//! Single consumer loop over the binlog source:
//!
//! - TABLE_MAP → refresh the schema cache (memoized catalog lookup)
//! - WRITE/UPDATE/DELETE rows → classify, build, transform, publish
//! - ROTATE → logged (the source already advanced the position)
//! - QUERY / XID / other → logged at debug
//!
//! Read timeouts are "no event yet" and retry silently. Any other error is
//! logged, backed off for a second, and, when it looks like a broken
//! session, followed by a reconnect from the persisted position. Nothing
//! past startup is fatal: the loop is the recovery boundary.

use crate::common::{EventType, Result};
use crate::mysql::decoder::{BinlogEvent, RowsEvent};
use crate::mysql::rows::RowEventBuilder;
use crate::mysql::schema::SchemaResolver;
use crate::mysql::source::BinlogSource;
use crate::sink::EventSink;
use crate::transform::Transformer;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Backoff between consecutive loop errors.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// The assembled CDC pipeline.
pub struct Pipeline<S: EventSink> {
    source: BinlogSource,
    schema: SchemaResolver,
    builder: RowEventBuilder,
    transformer: Transformer,
    sink: S,
}

impl<S: EventSink> Pipeline<S> {
    pub fn new(
        source: BinlogSource,
        schema: SchemaResolver,
        builder: RowEventBuilder,
        transformer: Transformer,
        sink: S,
    ) -> Self {
        Self {
            source,
            schema,
            builder,
            transformer,
            sink,
        }
    }

    /// Run until the shutdown channel fires. Performs a final position flush
    /// on the way out.
    pub async fn run(&mut self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        info!("Starting CDC pipeline");

        loop {
            let next = tokio::select! {
                _ = shutdown.recv() => {
                    info!("Shutdown signal received, stopping pipeline");
                    break;
                }
                next = self.source.next() => next,
            };

            match next {
                Ok((_header, event)) => self.dispatch(event).await,
                Err(e) if e.is_timeout() => continue,
                Err(e) => {
                    error!("Error reading binlog event: {e}");
                    tokio::time::sleep(ERROR_BACKOFF).await;
                    if e.needs_reconnect() {
                        if let Err(reconnect_err) = self.source.reconnect().await {
                            error!("Failed to reopen replication session: {reconnect_err}");
                        }
                    }
                }
            }
        }

        if let Err(e) = self.source.flush_position().await {
            warn!("Final position flush failed: {e}");
        }
        info!("Pipeline stopped at {}", self.source.position());
        Ok(())
    }

    async fn dispatch(&mut self, event: BinlogEvent) {
        match event {
            BinlogEvent::TableMap(table_map) => {
                debug!(
                    "Table map: {}.{} (table_id={})",
                    table_map.schema_name, table_map.table_name, table_map.table_id
                );
                // memoized; only the first event per table hits the catalog
                if let Err(e) = self
                    .schema
                    .columns(&table_map.schema_name, &table_map.table_name)
                    .await
                {
                    warn!(
                        "Failed to resolve columns for {}.{}: {e}",
                        table_map.schema_name, table_map.table_name
                    );
                }
            }
            BinlogEvent::WriteRows(rows) => self.handle_rows(EventType::Insert, rows).await,
            BinlogEvent::UpdateRows(rows) => self.handle_rows(EventType::Update, rows).await,
            BinlogEvent::DeleteRows(rows) => self.handle_rows(EventType::Delete, rows).await,
            BinlogEvent::Rotate(rotate) => {
                info!("Binlog rotated to {}", rotate.next_file);
            }
            BinlogEvent::Query { query, .. } => {
                debug!("Query event: {query}");
            }
            BinlogEvent::Xid(xid) => {
                debug!("XID event: {xid}");
            }
            BinlogEvent::FormatDescription { server_version } => {
                info!("Binlog format description from server {server_version}");
            }
            BinlogEvent::Gtid => debug!("GTID event"),
            BinlogEvent::Heartbeat => debug!("Heartbeat received"),
            BinlogEvent::Unknown(kind) => debug!("Unhandled event kind: {kind:?}"),
        }
    }

    async fn handle_rows(&mut self, event_type: EventType, rows: RowsEvent) {
        let table_map = match self.source.table(rows.table_id) {
            Some(table_map) => table_map,
            None => {
                error!("Table map not found for table ID {}", rows.table_id);
                return;
            }
        };

        let schema = self
            .schema
            .cached(&table_map.schema_name, &table_map.table_name);

        let event = match self.builder.build(event_type, &rows, table_map, schema) {
            Ok(event) => event,
            Err(e) => {
                error!("Error processing {event_type} event: {e}");
                return;
            }
        };

        let (database, table) = (event.database.clone(), event.table.clone());

        let transformed = match self.transformer.transform(event) {
            Ok(Some(event)) => event,
            Ok(None) => {
                debug!("Event rejected by transformer: {database}.{table} ({event_type})");
                return;
            }
            Err(e) => {
                error!("Error transforming event: {e}");
                return;
            }
        };

        if let Err(e) = self.sink.publish(&transformed).await {
            error!("Error publishing event: {e}");
            return;
        }

        info!(
            "Processed {event_type} event for {}.{} ({} rows)",
            transformed.database,
            transformed.table,
            transformed.rows.len()
        );
    }
}
