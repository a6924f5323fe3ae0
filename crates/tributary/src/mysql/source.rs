//! Binlog source: replication session + position tracking
//!
//! Owns the protocol client, the event decoder, and the position store.
//! Every delivered event advances the in-memory [`Position`] and persists it:
//! rotate events install the announced file and offset, any other event with
//! a positive `log_pos` installs that offset. Persistence failures are logged
//! and suppressed; the next successful save covers the progress made since.

use crate::common::{CdcError, Position, PositionStore, Result};
use crate::mysql::decoder::{BinlogDecoder, BinlogEvent, EventHeader, TableMapEvent};
use crate::mysql::protocol::MySqlBinlogClient;
use crate::mysql::schema::catalog_url;
use mysql_async::prelude::*;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Per-read timeout; elapsing is "no event yet", not a failure.
const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Server flavor label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Flavor {
    #[default]
    MySql,
    MariaDb,
}

impl Flavor {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "mysql" => Some(Flavor::MySql),
            "mariadb" => Some(Flavor::MariaDb),
            _ => None,
        }
    }
}

/// Replication source configuration.
///
/// `Debug` redacts the password so configs can be logged.
#[derive(Clone)]
pub struct SourceConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    /// Replica identifier; must be unique among the server's replicas.
    pub server_id: u32,
    pub flavor: Flavor,
    /// GTID positioning is not implemented; `true` is a startup error.
    pub use_gtid: bool,
}

impl std::fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("server_id", &self.server_id)
            .field("flavor", &self.flavor)
            .field("use_gtid", &self.use_gtid)
            .finish()
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3306,
            user: "root".to_string(),
            password: None,
            server_id: 1001,
            flavor: Flavor::MySql,
            use_gtid: false,
        }
    }
}

impl SourceConfig {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            ..Default::default()
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_server_id(mut self, server_id: u32) -> Self {
        self.server_id = server_id;
        self
    }

    pub fn with_flavor(mut self, flavor: Flavor) -> Self {
        self.flavor = flavor;
        self
    }
}

/// Streaming binlog source with durable position tracking.
#[derive(Debug)]
pub struct BinlogSource {
    config: SourceConfig,
    client: MySqlBinlogClient,
    decoder: BinlogDecoder,
    store: PositionStore,
    position: Position,
}

impl BinlogSource {
    /// Open a replication session, resuming from the stored position when one
    /// exists, otherwise from the server's current position.
    pub async fn connect(config: SourceConfig, store: PositionStore) -> Result<Self> {
        if config.use_gtid {
            return Err(CdcError::config(
                "use_gtid is set but GTID positioning is not implemented; \
                 set use_gtid: false to use file+offset positioning",
            ));
        }
        if config.server_id == 0 {
            return Err(CdcError::config("server_id must be non-zero"));
        }

        let position = match store.load().await? {
            Some(position) => position,
            None => Position::new("", store.start_offset()),
        };

        let position = if position.file.is_empty() {
            let current = current_server_position(&config).await?;
            info!("No stored position; starting from server position {current}");
            current
        } else {
            info!("Resuming from stored position {position}");
            position
        };

        let client = Self::open_session(&config, &position).await?;

        Ok(Self {
            config,
            client,
            decoder: BinlogDecoder::new(),
            store,
            position,
        })
    }

    async fn open_session(
        config: &SourceConfig,
        position: &Position,
    ) -> Result<MySqlBinlogClient> {
        let mut client = MySqlBinlogClient::connect(
            &config.host,
            config.port,
            &config.user,
            config.password.as_deref(),
        )
        .await?;

        let mariadb = config.flavor == Flavor::MariaDb || client.is_mariadb();

        // Checksum negotiation. MariaDB wants the explicit CRC32 setting and
        // it must precede @mariadb_slave_capability.
        if mariadb {
            if let Err(e) = client.query("SET @master_binlog_checksum = 'CRC32'").await {
                debug!("MariaDB binlog checksum set failed: {e}");
            }
            if let Err(e) = client.query("SET @mariadb_slave_capability = 4").await {
                debug!("MariaDB slave capability set failed: {e}");
            }
        } else if let Err(e) = client
            .query("SET @source_binlog_checksum = @@global.binlog_checksum")
            .await
        {
            // older variable name for MySQL < 8.0.26
            if let Err(e2) = client
                .query("SET @master_binlog_checksum = @@global.binlog_checksum")
                .await
            {
                debug!("Binlog checksum negotiation failed: {e} / {e2}");
            }
        }

        client.register_replica(config.server_id).await?;
        client
            .start_dump(config.server_id, &position.file, position.offset as u32)
            .await?;

        Ok(client)
    }

    /// Read, decode, and position-track the next event.
    ///
    /// `CdcError::Timeout` means no event arrived within the read window;
    /// the caller retries. Other errors indicate a broken session worth
    /// reopening via [`reconnect`](Self::reconnect).
    pub async fn next(&mut self) -> Result<(EventHeader, BinlogEvent)> {
        let data = match self.client.next_event(READ_TIMEOUT).await? {
            Some(data) => data,
            None => return Err(CdcError::ConnectionClosed),
        };

        let (header, event) = self.decoder.decode(&data)?;

        match &event {
            BinlogEvent::Rotate(rotate) => {
                info!(
                    "Rotating to binlog file {} at offset {}",
                    rotate.next_file, rotate.position
                );
                self.position = Position::new(rotate.next_file.clone(), rotate.position);
                self.persist_position().await;
            }
            _ if header.next_position > 0 => {
                self.position.offset = header.next_position as u64;
                self.persist_position().await;
            }
            _ => {}
        }

        Ok((header, event))
    }

    async fn persist_position(&self) {
        if let Err(e) = self.store.save(&self.position).await {
            warn!("Failed to save position {}: {e}", self.position);
        }
    }

    /// Reopen the replication session from the current position after a
    /// stream failure. The TableMap cache is rebuilt from the new stream,
    /// which re-emits TABLE_MAP events before row events.
    pub async fn reconnect(&mut self) -> Result<()> {
        info!("Reopening replication session at {}", self.position);
        self.client = Self::open_session(&self.config, &self.position).await?;
        self.decoder = BinlogDecoder::new();
        Ok(())
    }

    /// Current in-memory position.
    pub fn position(&self) -> &Position {
        &self.position
    }

    /// TableMap for a table_id seen on this stream.
    pub fn table(&self, table_id: u64) -> Option<&TableMapEvent> {
        self.decoder.table(table_id)
    }

    /// Final best-effort flush, called on shutdown.
    pub async fn flush_position(&self) -> Result<()> {
        self.store.save(&self.position).await
    }
}

/// `SHOW MASTER STATUS` (or `SHOW BINARY LOG STATUS` on MySQL 8.2+) over a
/// regular connection; the replication client cannot read result sets.
async fn current_server_position(config: &SourceConfig) -> Result<Position> {
    use mysql_async::Row;

    let pool = {
        let url = catalog_url(config);
        mysql_async::Pool::new(url.as_str())
    };
    let mut conn = pool
        .get_conn()
        .await
        .map_err(|e| CdcError::replication(format!("failed to connect for binlog position: {e}")))?;

    let rows: Vec<Row> = match conn.query("SHOW BINARY LOG STATUS").await {
        Ok(rows) => rows,
        Err(_) => conn
            .query("SHOW MASTER STATUS")
            .await
            .map_err(|e| CdcError::replication(format!("failed to query binlog position: {e}")))?,
    };

    drop(conn);
    pool.disconnect().await.ok();

    let row = rows.into_iter().next().ok_or_else(|| {
        CdcError::preflight(
            "SHOW MASTER STATUS returned no rows; binary logging may be disabled",
        )
    })?;

    let file: String = row.get(0).unwrap_or_default();
    let offset: u64 = row.get(1).unwrap_or(4);

    if file.is_empty() {
        return Err(CdcError::preflight(
            "SHOW MASTER STATUS returned an empty file name; binary logging may be disabled",
        ));
    }

    Ok(Position::new(file, offset))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = SourceConfig::new("db.internal", "repl")
            .with_password("secret")
            .with_port(3307)
            .with_server_id(4242)
            .with_flavor(Flavor::MariaDb);

        assert_eq!(config.host, "db.internal");
        assert_eq!(config.user, "repl");
        assert_eq!(config.password, Some("secret".to_string()));
        assert_eq!(config.port, 3307);
        assert_eq!(config.server_id, 4242);
        assert_eq!(config.flavor, Flavor::MariaDb);
    }

    #[test]
    fn test_config_debug_redacts_password() {
        let config = SourceConfig::new("localhost", "repl").with_password("super_secret");
        let debug = format!("{config:?}");

        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("super_secret"));
        assert!(debug.contains("localhost"));
    }

    #[test]
    fn test_config_debug_shows_none_without_password() {
        let config = SourceConfig::new("localhost", "repl");
        assert!(format!("{config:?}").contains("None"));
    }

    #[test]
    fn test_flavor_parse() {
        assert_eq!(Flavor::parse("mysql"), Some(Flavor::MySql));
        assert_eq!(Flavor::parse("mariadb"), Some(Flavor::MariaDb));
        assert_eq!(Flavor::parse("postgres"), None);
        assert_eq!(Flavor::default(), Flavor::MySql);
    }

    #[tokio::test]
    async fn test_connect_rejects_gtid() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = PositionStore::new(dir.path().join("position"), 4);
        let config = SourceConfig {
            use_gtid: true,
            ..SourceConfig::new("localhost", "repl")
        };

        let err = BinlogSource::connect(config, store).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("use_gtid"));
    }

    #[tokio::test]
    async fn test_connect_rejects_zero_server_id() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = PositionStore::new(dir.path().join("position"), 4);
        let config = SourceConfig {
            server_id: 0,
            ..SourceConfig::new("localhost", "repl")
        };

        let err = BinlogSource::connect(config, store).await.unwrap_err();
        assert!(err.is_fatal());
    }
}
