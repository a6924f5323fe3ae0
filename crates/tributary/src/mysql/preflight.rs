//! Pre-flight checks against the source server
//!
//! Run before the replication session opens:
//! 1. the configured user can connect,
//! 2. its grants include REPLICATION SLAVE, REPLICATION CLIENT, and SELECT
//!    (ALL PRIVILEGES satisfies all three),
//! 3. binary logging is enabled (fatal otherwise),
//! 4. binlog_format is ROW (warning otherwise).

use crate::common::{CdcError, Result};
use crate::mysql::schema::catalog_url;
use crate::mysql::source::SourceConfig;
use mysql_async::prelude::*;
use tracing::{info, warn};

const REQUIRED_PRIVILEGES: [&str; 3] = ["REPLICATION SLAVE", "REPLICATION CLIENT", "SELECT"];

/// Verify connectivity, grants, and binlog settings.
pub async fn check_source(config: &SourceConfig) -> Result<()> {
    let pool = {
        let url = catalog_url(config);
        mysql_async::Pool::new(url.as_str())
    };

    let result = run_checks(&pool).await;
    pool.disconnect().await.ok();
    result
}

async fn run_checks(pool: &mysql_async::Pool) -> Result<()> {
    let mut conn = pool
        .get_conn()
        .await
        .map_err(|e| CdcError::preflight(format!("failed to connect to MySQL server: {e}")))?;

    info!("Successfully connected to MySQL server");

    check_grants(&mut conn).await?;
    check_binlog_enabled(&mut conn).await?;
    check_binlog_format(&mut conn).await;

    Ok(())
}

async fn check_grants(conn: &mut mysql_async::Conn) -> Result<()> {
    let grants: Vec<String> = match conn.query("SHOW GRANTS FOR CURRENT_USER()").await {
        Ok(grants) => grants,
        // some 5.6 builds only accept the bare form
        Err(_) => conn
            .query("SHOW GRANTS")
            .await
            .map_err(|e| CdcError::preflight(format!("failed to check grants: {e}")))?,
    };

    let grants_upper = grants.join("; ").to_uppercase();

    let missing: Vec<&str> = REQUIRED_PRIVILEGES
        .iter()
        .filter(|priv_name| {
            !grants_upper.contains(*priv_name) && !grants_upper.contains("ALL PRIVILEGES")
        })
        .copied()
        .collect();

    if !missing.is_empty() {
        return Err(CdcError::preflight(format!(
            "missing required permissions: {}. Current grants: {}",
            missing.join(", "),
            grants.join("; ")
        )));
    }

    info!("All required permissions verified");
    Ok(())
}

async fn check_binlog_enabled(conn: &mut mysql_async::Conn) -> Result<()> {
    match conn
        .query_first::<(String, String), _>("SHOW VARIABLES LIKE 'log_bin'")
        .await
    {
        Ok(Some((_, value))) => {
            if !(value.eq_ignore_ascii_case("ON") || value == "1") {
                return Err(CdcError::preflight(format!(
                    "binary logging (log_bin) is not enabled (current value: {value})"
                )));
            }
        }
        _ => match conn.query_first::<i64, _>("SELECT @@log_bin").await {
            Ok(Some(0)) => {
                return Err(CdcError::preflight(
                    "binary logging (log_bin) is not enabled",
                ))
            }
            Ok(_) => {}
            Err(_) => {
                warn!("Could not verify binlog status");
                return Ok(());
            }
        },
    }

    info!("Binary logging is enabled");
    Ok(())
}

async fn check_binlog_format(conn: &mut mysql_async::Conn) {
    let format = match conn
        .query_first::<(String, String), _>("SHOW VARIABLES LIKE 'binlog_format'")
        .await
    {
        Ok(Some((_, value))) => value,
        _ => match conn.query_first::<String, _>("SELECT @@binlog_format").await {
            Ok(Some(value)) => value,
            _ => return,
        },
    };

    if format != "ROW" {
        warn!("binlog_format is '{format}'; ROW format is required for row-level capture");
    } else {
        info!("binlog_format is ROW");
    }
}
