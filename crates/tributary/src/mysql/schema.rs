//! Schema catalog resolution
//!
//! Binlog row events carry values but no column names or declarations; both
//! come from INFORMATION_SCHEMA, queried once per table and memoized. The
//! declaration text (`COLUMN_TYPE`, e.g. `"varchar(64)"`, `"mediumtext"`) is
//! what discriminates TEXT columns from BLOB columns when coercing raw byte
//! values.

use crate::common::{CdcError, Result};
use crate::mysql::source::SourceConfig;
use mysql_async::prelude::*;
use std::collections::{HashMap, VecDeque};
use tracing::debug;

/// Column layout of one table: names and declaration strings in ordinal
/// order.
#[derive(Debug, Clone, Default)]
pub struct SchemaEntry {
    pub names: Vec<String>,
    pub types: Vec<String>,
}

/// A type declaration is textual when its upper-cased form contains `TEXT`
/// (TINYTEXT, TEXT, MEDIUMTEXT, LONGTEXT). Everything else, BLOBs included,
/// stays binary.
pub fn is_textual(declaration: &str) -> bool {
    declaration.to_uppercase().contains("TEXT")
}

/// Memoization cache keyed by (database, table) with FIFO eviction to bound
/// memory on servers with very many tables.
pub struct SchemaCache {
    entries: HashMap<(String, String), SchemaEntry>,
    insertion_order: VecDeque<(String, String)>,
    max_entries: usize,
}

impl Default for SchemaCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaCache {
    const DEFAULT_MAX_ENTRIES: usize = 1000;

    pub fn new() -> Self {
        Self::with_max_entries(Self::DEFAULT_MAX_ENTRIES)
    }

    pub fn with_max_entries(max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            insertion_order: VecDeque::new(),
            max_entries,
        }
    }

    pub fn get(&self, database: &str, table: &str) -> Option<&SchemaEntry> {
        self.entries
            .get(&(database.to_string(), table.to_string()))
    }

    pub fn contains(&self, database: &str, table: &str) -> bool {
        self.entries
            .contains_key(&(database.to_string(), table.to_string()))
    }

    pub fn insert(&mut self, database: &str, table: &str, entry: SchemaEntry) {
        use std::collections::hash_map::Entry;

        let key = (database.to_string(), table.to_string());
        match self.entries.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                occupied.insert(entry);
            }
            Entry::Vacant(vacant) => {
                self.insertion_order.push_back(key);
                vacant.insert(entry);

                while self.entries.len() > self.max_entries {
                    if let Some(oldest) = self.insertion_order.pop_front() {
                        self.entries.remove(&oldest);
                        debug!("Evicted schema cache entry for {}.{}", oldest.0, oldest.1);
                    } else {
                        break;
                    }
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.insertion_order.clear();
    }
}

/// Resolves column layouts from INFORMATION_SCHEMA over a dedicated catalog
/// connection pool, memoized in a [`SchemaCache`].
pub struct SchemaResolver {
    pool: mysql_async::Pool,
    cache: SchemaCache,
}

impl SchemaResolver {
    /// Build a resolver for the configured server. Credentials are
    /// URL-encoded so special characters survive; the URL itself stays inside
    /// this scope and never reaches a log line.
    pub fn new(config: &SourceConfig) -> Self {
        let pool = {
            let url = catalog_url(config);
            mysql_async::Pool::new(url.as_str())
        };
        Self {
            pool,
            cache: SchemaCache::new(),
        }
    }

    /// Column names and declarations for a table, queried once and cached.
    pub async fn columns(&mut self, database: &str, table: &str) -> Result<&SchemaEntry> {
        if !self.cache.contains(database, table) {
            let entry = self.fetch(database, table).await?;
            debug!(
                "Cached {} columns for {database}.{table}",
                entry.names.len()
            );
            self.cache.insert(database, table, entry);
        }

        self.cache
            .get(database, table)
            .ok_or_else(|| CdcError::schema(format!("schema entry vanished for {database}.{table}")))
    }

    /// Cache-only lookup; `None` when the table has not been resolved yet or
    /// its lookup failed.
    pub fn cached(&self, database: &str, table: &str) -> Option<&SchemaEntry> {
        self.cache.get(database, table)
    }

    async fn fetch(&self, database: &str, table: &str) -> Result<SchemaEntry> {
        let mut conn = self
            .pool
            .get_conn()
            .await
            .map_err(|e| CdcError::schema(format!("catalog connection failed: {e}")))?;

        let query = r"
            SELECT COLUMN_NAME, COLUMN_TYPE
            FROM INFORMATION_SCHEMA.COLUMNS
            WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?
            ORDER BY ORDINAL_POSITION
        ";

        let columns: Vec<(String, String)> = conn
            .exec(query, (database, table))
            .await
            .map_err(|e| {
                CdcError::schema(format!("column lookup failed for {database}.{table}: {e}"))
            })?;

        let (names, types) = columns.into_iter().unzip();
        Ok(SchemaEntry { names, types })
    }

    /// Close the catalog pool.
    pub async fn disconnect(self) {
        self.pool.disconnect().await.ok();
    }
}

/// Connection URL for catalog queries, with URL-encoded credentials.
pub(crate) fn catalog_url(config: &SourceConfig) -> String {
    let user = url::form_urlencoded::byte_serialize(config.user.as_bytes()).collect::<String>();
    let password = url::form_urlencoded::byte_serialize(
        config.password.as_deref().unwrap_or("").as_bytes(),
    )
    .collect::<String>();
    format!(
        "mysql://{user}:{password}@{}:{}/",
        config.host, config.port
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_textual() {
        assert!(is_textual("text"));
        assert!(is_textual("TEXT"));
        assert!(is_textual("tinytext"));
        assert!(is_textual("mediumtext"));
        assert!(is_textual("longtext"));

        assert!(!is_textual("blob"));
        assert!(!is_textual("longblob"));
        assert!(!is_textual("varchar(64)"));
        assert!(!is_textual("int(11)"));
        assert!(!is_textual("json"));
    }

    #[test]
    fn test_cache_basic() {
        let mut cache = SchemaCache::new();
        assert!(cache.is_empty());

        cache.insert(
            "shop",
            "orders",
            SchemaEntry {
                names: vec!["id".into(), "code".into()],
                types: vec!["int(11)".into(), "text".into()],
            },
        );

        assert_eq!(cache.len(), 1);
        assert!(cache.contains("shop", "orders"));
        assert!(!cache.contains("shop", "users"));

        let entry = cache.get("shop", "orders").unwrap();
        assert_eq!(entry.names, vec!["id", "code"]);
        assert_eq!(entry.types, vec!["int(11)", "text"]);
    }

    #[test]
    fn test_cache_update_replaces() {
        let mut cache = SchemaCache::new();
        cache.insert(
            "db",
            "t",
            SchemaEntry {
                names: vec!["a".into()],
                types: vec!["int".into()],
            },
        );
        cache.insert(
            "db",
            "t",
            SchemaEntry {
                names: vec!["a".into(), "b".into()],
                types: vec!["int".into(), "text".into()],
            },
        );

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("db", "t").unwrap().names.len(), 2);
    }

    #[test]
    fn test_cache_fifo_eviction() {
        let mut cache = SchemaCache::with_max_entries(2);
        cache.insert("db", "t1", SchemaEntry::default());
        cache.insert("db", "t2", SchemaEntry::default());
        cache.insert("db", "t3", SchemaEntry::default());

        assert_eq!(cache.len(), 2);
        assert!(!cache.contains("db", "t1"));
        assert!(cache.contains("db", "t2"));
        assert!(cache.contains("db", "t3"));
    }

    #[test]
    fn test_cache_clear() {
        let mut cache = SchemaCache::new();
        cache.insert("db", "t", SchemaEntry::default());
        cache.clear();
        assert!(cache.is_empty());
    }
}
