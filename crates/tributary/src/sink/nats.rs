//! NATS sink
//!
//! Publishes the canonical serialization of each event on the configured
//! subject (the opaque script tail verbatim when present). Connection
//! lifecycle events are logged: disconnect at warn, reconnect at info,
//! close at warn. The JetStream key-value facility backs the script
//! transformer's `nats.kv.*` bindings.

use crate::common::{CdcError, ChangeEvent, Result};
use crate::sink::{EventSink, ScriptBus};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info, warn};

/// NATS connection options.
#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub url: String,
    pub subject: String,
    /// 0 = reconnect forever
    pub max_reconnect: usize,
    pub reconnect_wait: Duration,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            url: "nats://127.0.0.1:4222".to_string(),
            subject: "mysql.cdc.events".to_string(),
            max_reconnect: 0,
            reconnect_wait: Duration::from_secs(2),
        }
    }
}

/// NATS-backed [`EventSink`] and [`ScriptBus`].
pub struct NatsSink {
    client: async_nats::Client,
    jetstream: async_nats::jetstream::Context,
    subject: String,
    /// Runtime handle for bridging the synchronous [`ScriptBus`] calls.
    handle: tokio::runtime::Handle,
}

impl NatsSink {
    /// Connect with reconnect policy and lifecycle logging.
    pub async fn connect(config: &SinkConfig) -> Result<Self> {
        let max_reconnects = if config.max_reconnect > 0 {
            Some(config.max_reconnect)
        } else {
            None
        };
        let reconnect_wait = config.reconnect_wait;

        let options = async_nats::ConnectOptions::new()
            .max_reconnects(max_reconnects)
            .reconnect_delay_callback(move |_attempts| reconnect_wait)
            .event_callback(|event| async move {
                match event {
                    async_nats::Event::Disconnected => warn!("NATS disconnected"),
                    async_nats::Event::Connected => info!("NATS reconnected"),
                    async_nats::Event::Closed => warn!("NATS connection closed"),
                    other => debug!("NATS event: {other}"),
                }
            });

        let client = options
            .connect(config.url.as_str())
            .await
            .map_err(|e| CdcError::sink(format!("failed to connect to NATS: {e}")))?;

        info!("Connected to NATS at {}", config.url);

        let jetstream = async_nats::jetstream::new(client.clone());

        Ok(Self {
            client,
            jetstream,
            subject: config.subject.clone(),
            handle: tokio::runtime::Handle::current(),
        })
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    async fn publish_bytes(&self, subject: String, payload: Vec<u8>) -> Result<()> {
        self.client
            .publish(subject, payload.into())
            .await
            .map_err(|e| CdcError::sink(format!("failed to publish to NATS: {e}")))
    }

    /// Drain buffered messages before shutdown.
    pub async fn flush(&self) -> Result<()> {
        self.client
            .flush()
            .await
            .map_err(|e| CdcError::sink(format!("failed to flush NATS connection: {e}")))
    }

    fn block_on<F, T>(&self, fut: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        tokio::task::block_in_place(|| self.handle.block_on(fut))
    }
}

#[async_trait]
impl EventSink for NatsSink {
    async fn publish(&self, event: &ChangeEvent) -> Result<()> {
        let payload = event.encode()?;
        self.publish_bytes(self.subject.clone(), payload).await?;
        debug!(
            "Published {} event for {}.{}",
            event.event_type, event.database, event.table
        );
        Ok(())
    }
}

impl ScriptBus for NatsSink {
    fn publish(&self, subject: &str, payload: &[u8]) -> Result<()> {
        self.block_on(self.publish_bytes(subject.to_string(), payload.to_vec()))
    }

    fn kv_get(&self, bucket: &str, key: &str) -> Result<Option<String>> {
        self.block_on(async {
            let store = self
                .jetstream
                .get_key_value(bucket)
                .await
                .map_err(|e| CdcError::sink(format!("failed to get KV bucket '{bucket}': {e}")))?;
            let entry = store
                .get(key)
                .await
                .map_err(|e| CdcError::sink(format!("KV get failed: {e}")))?;
            Ok(entry.map(|bytes| String::from_utf8_lossy(&bytes).to_string()))
        })
    }

    fn kv_put(&self, bucket: &str, key: &str, value: &[u8]) -> Result<()> {
        self.block_on(async {
            let store = self
                .jetstream
                .get_key_value(bucket)
                .await
                .map_err(|e| CdcError::sink(format!("failed to get KV bucket '{bucket}': {e}")))?;
            store
                .put(key, value.to_vec().into())
                .await
                .map_err(|e| CdcError::sink(format!("KV put failed: {e}")))?;
            Ok(())
        })
    }

    fn kv_delete(&self, bucket: &str, key: &str) -> Result<()> {
        self.block_on(async {
            let store = self
                .jetstream
                .get_key_value(bucket)
                .await
                .map_err(|e| CdcError::sink(format!("failed to get KV bucket '{bucket}': {e}")))?;
            store
                .delete(key)
                .await
                .map_err(|e| CdcError::sink(format!("KV delete failed: {e}")))?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_config_defaults() {
        let config = SinkConfig::default();
        assert_eq!(config.subject, "mysql.cdc.events");
        assert_eq!(config.reconnect_wait, Duration::from_secs(2));
        assert_eq!(config.max_reconnect, 0);
    }
}
