use anyhow::Result;
use clap::Parser;
use diesel::{Connection, PgConnection};
use diesel_async::pooled_connection::{bb8::Pool, AsyncDieselConnectionManager};
use diesel_async::AsyncPgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use metrics_exporter_prometheus::PrometheusBuilder;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use inventory_service::api::{self, AppState};
use inventory_service::config::Config;
use inventory_service::consumer::InventoryEventConsumer;
use inventory_service::engine::InventoryEngine;
use inventory_service::handlers::EventRouter;
use inventory_service::metrics::{self, ConsumerMetrics};
use inventory_service::store::PgInventoryStore;
use inventory_service::validation::ValidationChain;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let config = Config::parse();

    info!("Running database migrations...");
    let mut conn = PgConnection::establish(&config.database_url)?;
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|e| anyhow::anyhow!("Migration error: {}", e))?;
    info!("Migrations completed successfully");

    PrometheusBuilder::new()
        .with_http_listener(SocketAddr::from(([0, 0, 0, 0], config.metrics_port)))
        .install()?;
    metrics::describe();

    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(&config.database_url);
    let pool = Pool::builder().build(manager).await?;
    let store = PgInventoryStore::new(pool, config.lock_timeout(), config.statement_timeout());
    let engine = Arc::new(InventoryEngine::new(store, config.engine_config()));
    let consumer_metrics = Arc::new(ConsumerMetrics::new());

    let router = EventRouter::for_engine(Arc::clone(&engine), &config.topics());
    let event_consumer = InventoryEventConsumer::new(router, Arc::clone(&consumer_metrics))
        .with_redelivery_backoff(config.redelivery_backoff());

    let consumer: StreamConsumer = ClientConfig::new()
        .set("group.id", &config.group_id)
        .set("bootstrap.servers", &config.kafka_brokers)
        .set("enable.partition.eof", "false")
        .set("session.timeout.ms", "6000")
        .set("enable.auto.commit", "false")
        .set("auto.offset.reset", "earliest")
        .set("socket.timeout.ms", config.broker_timeout().as_millis().to_string())
        .create()?;

    // Fail closed if the broker cannot be reached within the bound.
    tokio::task::block_in_place(|| consumer.fetch_metadata(None, config.broker_timeout()))
        .map_err(|e| anyhow::anyhow!("Kafka unreachable at {}: {}", config.kafka_brokers, e))?;
    consumer.subscribe(&event_consumer.topics())?;
    info!("Subscribed to {:?}", event_consumer.topics());

    tokio::spawn(async move {
        event_consumer.run(consumer).await;
    });

    let app_state = AppState {
        engine,
        chain: Arc::new(ValidationChain::default()),
        metrics: consumer_metrics,
    };

    let app = api::create_router(app_state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;

    info!("Inventory service web server started on port {}", config.port);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down inventory service");
        })
        .await?;

    Ok(())
}
