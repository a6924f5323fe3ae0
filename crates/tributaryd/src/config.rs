//! YAML configuration
//!
//! ```yaml
//! mysql:
//!   host: 127.0.0.1
//!   port: 3306
//!   user: repl
//!   password: secret
//!   server_id: 1001
//!   flavor: mysql          # or mariadb
//!   use_gtid: false
//! binlog:
//!   position_file: ./tributary.pos
//!   start_position: 4
//!   lenient_text_detection: false
//! nats:
//!   url: nats://127.0.0.1:4222
//!   subject: mysql.cdc.events
//!   max_reconnect: 10
//!   reconnect_wait_secs: 2
//! transformer:
//!   enabled: true
//!   script: ./transform.js # or rules: [...]
//! logging:
//!   level: info
//! ```

use anyhow::{bail, Context};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tributary::mysql::{Flavor, SourceConfig};
use tributary::{SinkConfig, TransformConfig};

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub mysql: MySqlSection,
    #[serde(default)]
    pub binlog: BinlogSection,
    #[serde(default)]
    pub nats: NatsSection,
    #[serde(default)]
    pub transformer: TransformConfig,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MySqlSection {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub server_id: u32,
    pub flavor: String,
    pub use_gtid: bool,
}

impl Default for MySqlSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3306,
            user: "root".to_string(),
            password: String::new(),
            server_id: 0,
            flavor: "mysql".to_string(),
            use_gtid: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BinlogSection {
    pub position_file: PathBuf,
    pub start_position: u64,
    /// Advisory; accepted for compatibility, not used for positioning.
    pub start_timestamp: u32,
    pub lenient_text_detection: bool,
}

impl Default for BinlogSection {
    fn default() -> Self {
        Self {
            position_file: PathBuf::from("tributary.pos"),
            start_position: 4,
            start_timestamp: 0,
            lenient_text_detection: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NatsSection {
    pub url: String,
    pub subject: String,
    pub max_reconnect: usize,
    pub reconnect_wait_secs: u64,
}

impl Default for NatsSection {
    fn default() -> Self {
        Self {
            url: "nats://127.0.0.1:4222".to_string(),
            subject: "mysql.cdc.events".to_string(),
            max_reconnect: 0,
            reconnect_wait_secs: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mysql.server_id == 0 {
            bail!("mysql.server_id must be set to a non-zero value unique among replicas");
        }
        if Flavor::parse(&self.mysql.flavor).is_none() {
            bail!(
                "mysql.flavor must be 'mysql' or 'mariadb', got '{}'",
                self.mysql.flavor
            );
        }
        if self.mysql.use_gtid {
            bail!("mysql.use_gtid is not supported; set it to false to use file+offset positioning");
        }
        if self.transformer.script.is_some() && !self.transformer.rules.is_empty() {
            bail!("transformer accepts either `script` or `rules`, not both");
        }
        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => bail!("logging.level must be one of trace/debug/info/warn/error, got '{other}'"),
        }
        Ok(())
    }

    pub fn source_config(&self) -> SourceConfig {
        SourceConfig {
            host: self.mysql.host.clone(),
            port: self.mysql.port,
            user: self.mysql.user.clone(),
            password: if self.mysql.password.is_empty() {
                None
            } else {
                Some(self.mysql.password.clone())
            },
            server_id: self.mysql.server_id,
            flavor: Flavor::parse(&self.mysql.flavor).unwrap_or_default(),
            use_gtid: self.mysql.use_gtid,
        }
    }

    pub fn sink_config(&self) -> SinkConfig {
        SinkConfig {
            url: self.nats.url.clone(),
            subject: self.nats.subject.clone(),
            max_reconnect: self.nats.max_reconnect,
            reconnect_wait: Duration::from_secs(self.nats.reconnect_wait_secs),
        }
    }
}
