use anyhow::Result;
use clap::Parser;
use diesel::{Connection, PgConnection};
use diesel_async::pooled_connection::{bb8::Pool, AsyncDieselConnectionManager};
use diesel_async::AsyncPgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use cart_service::api::{self, AppState};
use cart_service::cart::CartService;
use cart_service::config::Config;
use cart_service::inventory_client::HttpStockValidator;
use cart_service::outbox::{OutboxAdmin, OutboxRelay};
use cart_service::publisher::{EventPublisher, KafkaPublisher};
use cart_service::store::PgCartStore;

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

    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(&config.database_url);
    let pool = Pool::builder().build(manager).await?;
    let store = PgCartStore::new(pool);

    let publisher = Arc::new(tokio::task::block_in_place(|| {
        KafkaPublisher::connect(&config.kafka_brokers, config.broker_timeout())
    })?);
    let validator = Arc::new(HttpStockValidator::new(
        config.inventory_url.clone(),
        config.validation_timeout(),
    )?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let relay = OutboxRelay::new(store.clone(), Arc::clone(&publisher), config.relay_config());
    let relay_handle = tokio::spawn(async move {
        relay.run(shutdown_rx).await;
    });

    let app_state = AppState {
        cart: Arc::new(CartService::new(store.clone(), validator)),
        admin: Arc::new(OutboxAdmin::new(store, Arc::clone(&publisher))),
    };

    let app = api::create_router(app_state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;

    info!("Cart service web server started on port {}", config.port);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down cart service");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    if let Err(e) = relay_handle.await {
        error!("Outbox relay task failed: {}", e);
    }
    if let Err(e) = publisher.flush().await {
        error!("Failed to flush producer: {}", e);
    }

    Ok(())
}
