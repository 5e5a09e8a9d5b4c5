mod api;
mod app;
mod config;
mod db;
mod domain;
mod error;
mod ingest;
mod logging;
mod retrieval;
mod routes;
mod services;

use std::sync::Arc;

use anyhow::Result;

use ingest::{IngestConfig, IngestPipeline};
use retrieval::RetrievalRouter;
use services::{EmbeddingClient, PgStore, RedisCache, VisionClient};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let settings = config::Settings::from_env()?;

    // Initialize logging
    logging::init_logging(&settings.env);

    tracing::info!(
        env = ?settings.env,
        server_addr = %settings.server_addr,
        "Starting planquery backend"
    );

    // Create database pool
    let pool = db::create_pool(&settings).await?;

    // Create Redis cache
    let cache = RedisCache::new(&settings.redis_url, settings.redis_cache_ttl_seconds).await?;

    // Collaborator clients
    let vision = VisionClient::new(
        &settings.vision_service_url,
        &settings.vision_service_token,
        settings.vision_service_timeout_seconds,
    )?;
    let embeddings = EmbeddingClient::new(
        &settings.embedding_service_url,
        &settings.embedding_service_token,
        settings.embedding_service_timeout_seconds,
        settings.embedding_dims,
    )?;

    // Optionally check vision service health (non-blocking)
    tokio::spawn({
        let vision = vision.clone();
        async move {
            match vision.health_check().await {
                Ok(()) => tracing::info!("vision service is healthy"),
                Err(e) => tracing::warn!(
                    error = %e,
                    "vision service health check failed - will retry on first request"
                ),
            }
        }
    });

    // Datastore adapter, router, and ingestion pipeline
    let store = Arc::new(PgStore::new(pool.clone()));
    let router = Arc::new(RetrievalRouter::new(
        store.clone(),
        Arc::new(embeddings),
        Arc::new(vision.clone()),
    ));
    let ingest = Arc::new(IngestPipeline::new(
        Arc::new(vision.clone()),
        store.clone(),
        IngestConfig {
            batch_size: settings.ingest_batch_size,
            batch_delay: settings.ingest_batch_delay(),
        },
    ));

    // Create application state
    let state = app::AppState::new(pool, settings.clone(), cache, store, router, ingest, vision);

    // Build application
    let app = app::create_app(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&settings.server_addr).await?;
    tracing::info!("Listening on {}", settings.server_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
