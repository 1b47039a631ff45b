//! ClickHouse health probe.

use crate::client::{storage_err, ClickHouseClient};
use engine_core::{Error, Result};
use tracing::debug;

/// Checks the server answers and the configured database exists.
pub async fn check_connection(client: &ClickHouseClient) -> Result<()> {
    let databases: u64 = client
        .inner()
        .query("SELECT count() FROM system.databases WHERE name = ?")
        .bind(client.database())
        .fetch_one()
        .await
        .map_err(storage_err("health probe"))?;

    if databases == 0 {
        return Err(Error::storage(format!(
            "database {} does not exist",
            client.database()
        )));
    }

    debug!(database = %client.database(), "ClickHouse reachable");
    Ok(())
}
