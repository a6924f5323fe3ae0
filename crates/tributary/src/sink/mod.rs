//! Event publishing
//!
//! The pipeline depends only on [`EventSink`]; the script transformer on
//! [`ScriptBus`]. Other transports plug in behind the same traits.

mod nats;

pub use nats::{NatsSink, SinkConfig};

use crate::common::{ChangeEvent, Result};
use async_trait::async_trait;

/// Publishes accepted change events on the configured subject.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: &ChangeEvent) -> Result<()>;
}

#[async_trait]
impl<T: EventSink + ?Sized> EventSink for std::sync::Arc<T> {
    async fn publish(&self, event: &ChangeEvent) -> Result<()> {
        (**self).publish(event).await
    }
}

/// Side-effect surface exposed to transformation scripts: auxiliary publish
/// plus a durable key-value facility on the same bus.
///
/// Methods are synchronous because they are invoked from inside a script
/// engine callback; implementations bridge to async I/O internally.
pub trait ScriptBus: Send + Sync {
    fn publish(&self, subject: &str, payload: &[u8]) -> Result<()>;
    fn kv_get(&self, bucket: &str, key: &str) -> Result<Option<String>>;
    fn kv_put(&self, bucket: &str, key: &str, value: &[u8]) -> Result<()>;
    fn kv_delete(&self, bucket: &str, key: &str) -> Result<()>;
}
