use anyhow::Context;
use birthdays_rs::config::{BusType, Config, StoreType};
use birthdays_rs::events::{birthday_topology, EventConsumer, EventPublisher};
use birthdays_rs::{birthdays_router, AppState, BirthdayStore, InMemoryStore, PgStore};
use event_bus::{AmqpConnector, Connector, InMemoryBroker};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env().map_err(anyhow::Error::msg)?;
    tracing::info!(
        bus_type = ?config.bus_type,
        store_type = ?config.store_type,
        "Configuration loaded"
    );

    let store: Arc<dyn BirthdayStore> = match config.store_type {
        StoreType::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL required for postgres store")?;
            Arc::new(PgStore::connect(url, 5).await.context("Failed to open birthday store")?)
        }
        StoreType::InMemory => {
            tracing::info!("Using in-memory birthday store");
            Arc::new(InMemoryStore::new())
        }
    };

    // Consumer and publisher each dial their own channel from the same connector
    let connector: Arc<dyn Connector> = match config.bus_type {
        BusType::Amqp => Arc::new(
            AmqpConnector::new(config.amqp_url.as_str()).with_prefetch(config.amqp_prefetch),
        ),
        BusType::InMemory => {
            tracing::info!("Using in-memory broker");
            Arc::new(InMemoryBroker::new())
        }
    };

    let publisher = Arc::new(EventPublisher::new(
        connector.clone(),
        config.origin(),
        config.publish_timeout,
    ));

    let consumer = EventConsumer::new(
        connector,
        birthday_topology(),
        store.clone(),
        config.consumer(),
    );
    let consumer_state = consumer.state();
    let consumer_task = consumer.spawn();

    let app = birthdays_router(AppState {
        store,
        publisher,
        consumer_state,
    })
    .layer(TraceLayer::new_for_http())
    .layer(
        CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods(tower_http::cors::Any)
            .allow_headers(tower_http::cors::Any),
    );

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("HOST/PORT do not form a socket address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!("Birthdays module listening on {}", addr);

    tokio::select! {
        served = axum::serve(listener, app) => {
            served.context("HTTP server failed")?;
        }
        consumed = consumer_task => {
            match consumed {
                Ok(Ok(())) => tracing::warn!("Event consumer exited"),
                Ok(Err(e)) => return Err(e).context("Event consumer failed"),
                Err(e) => return Err(e).context("Event consumer task panicked"),
            }
        }
    }

    Ok(())
}
