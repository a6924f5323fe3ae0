//! CLI argument parsing

use clap::Parser;
use std::path::PathBuf;

/// tributary - MySQL binlog CDC to NATS
///
/// Streams row-level changes from a MySQL/MariaDB binlog, optionally
/// transforms them, and publishes them on a NATS subject.
#[derive(Parser, Debug)]
#[command(name = "tributaryd")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the YAML configuration file
    #[arg(default_value = "config.yaml", env = "TRIBUTARY_CONFIG")]
    pub config: PathBuf,
}
