//! Replication cursor persistence
//!
//! A [`Position`] is a point in the binlog stream: `(file_name, byte_offset)`,
//! ordered by file name first (the server's rotation names are monotonic in
//! practice) then offset. The [`PositionStore`] persists it to a single text
//! file whose content is the literal `"<name>:<offset>"`.
//!
//! Writes go through a temp file + rename so readers observe either the
//! pre-image or a complete post-image. Legacy files holding only a bare log
//! name are accepted on read, with the offset defaulting to the configured
//! start offset.

use crate::common::{CdcError, Result};
use std::path::PathBuf;
use tokio::fs;
use tracing::{debug, info};

/// A point in the binlog stream.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Position {
    pub file: String,
    pub offset: u64,
}

impl Position {
    pub fn new(file: impl Into<String>, offset: u64) -> Self {
        Self {
            file: file.into(),
            offset,
        }
    }

    /// Parse the persisted form. The offset is everything after the last
    /// colon so log names containing colons survive; content without a
    /// parseable offset is treated as a legacy bare name.
    pub fn parse(content: &str, default_offset: u64) -> Self {
        let content = content.trim();
        if let Some((file, offset)) = content.rsplit_once(':') {
            if !file.is_empty() {
                if let Ok(offset) = offset.parse::<u64>() {
                    return Self::new(file, offset);
                }
            }
        }
        Self::new(content, default_offset)
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.file, self.offset)
    }
}

/// File-backed position store.
#[derive(Debug)]
pub struct PositionStore {
    path: PathBuf,
    start_offset: u64,
}

impl PositionStore {
    pub fn new(path: impl Into<PathBuf>, start_offset: u64) -> Self {
        Self {
            path: path.into(),
            start_offset,
        }
    }

    /// Load the persisted position. Returns `None` when the file is missing
    /// or empty (start behavior is then decided by the source).
    pub async fn load(&self) -> Result<Option<Position>> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(CdcError::position(format!(
                    "failed to read position file {}: {e}",
                    self.path.display()
                )))
            }
        };

        if content.trim().is_empty() {
            return Ok(None);
        }

        let position = Position::parse(&content, self.start_offset);
        info!("Loaded binlog position from file: {position}");
        Ok(Some(position))
    }

    /// Persist a position. Write-then-rename keeps the file parseable under
    /// a crash mid-write.
    pub async fn save(&self, position: &Position) -> Result<()> {
        if position.file.is_empty() {
            return Ok(());
        }

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, position.to_string())
            .await
            .map_err(|e| CdcError::position(format!("failed to write position file: {e}")))?;
        fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| CdcError::position(format!("failed to rename position file: {e}")))?;

        debug!("Saved binlog position {position}");
        Ok(())
    }

    /// Configured start offset, used for legacy files and fresh streams.
    pub fn start_offset(&self) -> u64 {
        self.start_offset
    }
}
