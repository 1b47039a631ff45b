//! ClickHouse client wrapper.

use crate::config::ClickHouseConfig;
use clickhouse::Client;
use engine_core::{Error, Result};
use tracing::info;

/// Maps a driver error into the storage error class.
pub(crate) fn storage_err(context: &str) -> impl Fn(clickhouse::error::Error) -> Error + '_ {
    move |e| Error::storage(format!("{}: {}", context, e))
}

/// ClickHouse client bound to the pipeline database.
#[derive(Clone)]
pub struct ClickHouseClient {
    inner: Client,
    config: ClickHouseConfig,
}

impl ClickHouseClient {
    /// Creates a new ClickHouse client.
    pub fn new(config: ClickHouseConfig) -> Result<Self> {
        if config.database.is_empty() {
            return Err(Error::validation("clickhouse database name is empty"));
        }

        let client = Self::base_client(&config).with_database(&config.database);

        info!(
            url = %config.url,
            database = %config.database,
            "Created ClickHouse client"
        );

        Ok(Self {
            inner: client,
            config,
        })
    }

    fn base_client(config: &ClickHouseConfig) -> Client {
        let mut client = Client::default().with_url(&config.url);

        if let Some(ref user) = config.username {
            client = client.with_user(user);
        }

        if let Some(ref pass) = config.password {
            client = client.with_password(pass);
        }

        client
    }

    /// Creates the configured database if it does not exist.
    ///
    /// Runs on a connection without a default database, which would
    /// otherwise reject the request.
    pub async fn ensure_database(&self) -> Result<()> {
        Self::base_client(&self.config)
            .query(&format!(
                "CREATE DATABASE IF NOT EXISTS {}",
                self.config.database
            ))
            .execute()
            .await
            .map_err(storage_err("create database"))
    }

    /// Returns the inner clickhouse client.
    pub fn inner(&self) -> &Client {
        &self.inner
    }

    pub fn database(&self) -> &str {
        &self.config.database
    }
}
