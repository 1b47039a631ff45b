//! Pulse ingestion service
//!
//! Web analytics event pipeline:
//! - HTTP gateway: website resolution, origin and quota checks, enrichment
//! - Redpanda hand-off with acknowledged, dead-lettering consumption
//! - Batched, month-partitioned ClickHouse persistence
//! - Automation triggers with webhook/email actions
//! - Asynchronous usage accounting

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use api::{router, AppState, Gateway, PlatformClient};
use automation::{ActionRunner, AutomationEngine, LogMailer};
use clickhouse_client::{ClickHouseClient, ClickHouseConfig, ClickHouseEventStore, ClickHouseExecutionStore};
use engine_core::{EventStore, ExecutionStore};
use redpanda::{ConsumeOptions, Consumer, Producer, RedpandaConfig};
use telemetry::{health, init_tracing_from_env};
use worker::{Enricher, GeoLookup, HttpGeoLookup, NoGeoLookup, Pipeline, PipelineConfig, PipelineDeps};

/// Geolocation settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct GeoConfig {
    /// Lookup service base URL; geolocation is off when unset
    #[serde(default)]
    url: Option<String>,
}

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Config {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,

    /// Platform service URL (websites, billing, automations). Required;
    /// the literal "mock" opts into in-process fakes
    #[serde(default)]
    platform_url: Option<String>,

    #[serde(default)]
    redpanda: RedpandaConfig,

    #[serde(default)]
    clickhouse: ClickHouseConfig,

    #[serde(default)]
    pipeline: PipelineConfig,

    #[serde(default)]
    geo: GeoConfig,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            platform_url: None,
            redpanda: RedpandaConfig::default(),
            clickhouse: ClickHouseConfig::default(),
            pipeline: PipelineConfig::default(),
            geo: GeoConfig::default(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // rustls 0.23+ requires explicit crypto provider selection
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install rustls crypto provider"))?;

    dotenvy::dotenv().ok();
    init_tracing_from_env();

    info!("Starting Pulse ingestion service v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config()?;
    info!(
        brokers = ?config.redpanda.brokers,
        topic = %config.redpanda.topic,
        clickhouse = %config.clickhouse.url,
        platform = ?config.platform_url,
        "Loaded configuration"
    );

    // Broker adapter first: both the gateway and the pipeline use it
    let producer = Arc::new(
        Producer::new(config.redpanda.clone())
            .await
            .context("Failed to create Redpanda producer")?,
    );

    let clickhouse =
        ClickHouseClient::new(config.clickhouse.clone()).context("Failed to create ClickHouse client")?;
    if let Err(e) =
        clickhouse_client::schema::init_schema(&clickhouse, config.clickhouse.create_database).await
    {
        // Storage may come up later; partitions are provisioned on first write
        error!("Failed to initialize ClickHouse schema: {}", e);
    }

    check_health(&config, &clickhouse).await;

    let platform = Arc::new(platform_client(&config)?);
    health().platform.set_healthy();
    if platform.is_mock() {
        warn!("Platform client in mock mode: every website is accepted");
    }

    let event_store: Arc<dyn EventStore> = Arc::new(ClickHouseEventStore::new(clickhouse.clone()));
    let execution_store: Arc<dyn ExecutionStore> =
        Arc::new(ClickHouseExecutionStore::new(clickhouse.clone()));
    let actions = ActionRunner::new(Arc::new(LogMailer)).context("Failed to create action runner")?;
    let automations = AutomationEngine::new(platform.clone(), execution_store, actions);

    let pipeline = Pipeline::start(
        config.pipeline.clone(),
        PipelineDeps {
            source: Arc::new(Consumer::new(config.redpanda.clone())),
            dead_letters: producer.clone(),
            publisher: producer.clone(),
            store: event_store,
            billing: platform.clone(),
            automations: Some(automations),
            consume: ConsumeOptions::from(&config.redpanda.consumer),
        },
    );

    let geo: Arc<dyn GeoLookup> = match &config.geo.url {
        Some(url) => Arc::new(HttpGeoLookup::new(url.clone()).context("Failed to create geo lookup")?),
        None => Arc::new(NoGeoLookup),
    };
    let gateway = Arc::new(Gateway::new(
        platform.clone(),
        platform.clone(),
        producer.clone(),
        Arc::new(Enricher::new(geo)),
        pipeline.usage(),
    ));

    let app = router(AppState::new(gateway.clone()));

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("Invalid server address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;
    info!("Listening on http://{}", addr);

    let listener_cancel = CancellationToken::new();
    let stop_listening = listener_cancel.clone().cancelled_owned();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(stop_listening)
            .await
    });

    let server_result = tokio::select! {
        _ = shutdown_signal() => None,
        result = &mut server => Some(result),
    };

    // Stop intake, drain the pipeline, then stop the listener
    info!("Shutting down...");
    gateway.close();

    let report = pipeline.shutdown().await;

    listener_cancel.cancel();
    let server_result = match server_result {
        Some(result) => result,
        None => match tokio::time::timeout(Duration::from_secs(5), server).await {
            Ok(result) => result,
            Err(_) => {
                warn!("HTTP listener did not stop in time");
                Ok(Ok(()))
            }
        },
    };
    match server_result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Server error: {}", e),
        Err(e) => error!("Server task failed: {}", e),
    }

    if report.is_clean() {
        info!("Shutdown complete");
    } else {
        warn!("Shutdown complete with undrained work");
    }
    Ok(())
}

/// Load configuration from files and environment.
fn load_config() -> Result<Config> {
    let config = config::Config::builder()
        .add_source(config::Config::try_from(&Config::default())?)
        .add_source(
            config::File::with_name("config/default")
                .required(false)
                .format(config::FileFormat::Toml),
        )
        .add_source(
            config::Environment::default()
                .separator("__")
                .prefix("INGESTION")
                .try_parsing(true),
        )
        .build()
        .context("Failed to build configuration")?;

    let mut config: Config = config
        .try_deserialize()
        .context("Failed to deserialize configuration")?;

    // Nested keys with underscores do not survive the "__" separator
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());

    Ok(config)
}

/// Flat `INGESTION_*` variables for the fields deployments set most.
fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    let list = |raw: String| raw.split(',').map(|s| s.trim().to_string()).collect::<Vec<_>>();

    if let Some(brokers) = var("INGESTION_REDPANDA_BROKERS") {
        config.redpanda.brokers = list(brokers);
    }
    config.redpanda.sasl_username =
        var("INGESTION_REDPANDA_SASL_USERNAME").or(config.redpanda.sasl_username.take());
    config.redpanda.sasl_password =
        var("INGESTION_REDPANDA_SASL_PASSWORD").or(config.redpanda.sasl_password.take());
    if let Some(topic) = var("INGESTION_REDPANDA_TOPIC") {
        config.redpanda.topic = topic;
    }
    if let Some(topic) = var("INGESTION_REDPANDA_DEAD_LETTER_TOPIC") {
        config.redpanda.dead_letter_topic = topic;
    }

    if let Some(url) = var("INGESTION_CLICKHOUSE_URL") {
        config.clickhouse.url = url;
    }
    if let Some(database) = var("INGESTION_CLICKHOUSE_DATABASE") {
        config.clickhouse.database = database;
    }
    config.clickhouse.username =
        var("INGESTION_CLICKHOUSE_USERNAME").or(config.clickhouse.username.take());
    config.clickhouse.password =
        var("INGESTION_CLICKHOUSE_PASSWORD").or(config.clickhouse.password.take());

    if let Some(platform_url) = var("INGESTION_PLATFORM_URL") {
        config.platform_url = Some(platform_url).filter(|u| !u.is_empty());
    }
    if let Some(geo_url) = var("INGESTION_GEO_URL") {
        config.geo.url = Some(geo_url).filter(|u| !u.is_empty());
    }
}

/// Builds the platform client; mock mode must be asked for by name.
fn platform_client(config: &Config) -> Result<PlatformClient> {
    let url = config
        .platform_url
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .context("platform_url is required (INGESTION_PLATFORM_URL; \"mock\" for local development)")?;

    let client = if url == "mock" {
        PlatformClient::mock()
    } else {
        PlatformClient::new(url)
    };
    client.context("Failed to create platform client")
}

/// Check component health on startup.
async fn check_health(config: &Config, clickhouse: &ClickHouseClient) {
    if redpanda::health::check_connection(&config.redpanda).await {
        health().redpanda.set_healthy();
        info!("Redpanda connection: healthy");

        let missing = redpanda::health::missing_topics(&config.redpanda).await;
        if !missing.is_empty() {
            warn!(topics = ?missing, "Redpanda topics not found");
        }
    } else {
        health().redpanda.set_unhealthy("Connection failed");
        error!("Redpanda connection: unhealthy");
    }

    match clickhouse_client::health::check_connection(clickhouse).await {
        Ok(()) => {
            health().clickhouse.set_healthy();
            info!("ClickHouse connection: healthy");
        }
        Err(e) => {
            health().clickhouse.set_unhealthy(e.to_string());
            error!(error = %e, "ClickHouse connection: unhealthy");
        }
    }
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received terminate signal");
        }
    }
}
