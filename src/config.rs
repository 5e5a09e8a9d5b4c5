use anyhow::{Context, Result};
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Environment {
    Dev,
    Staging,
    Prod,
}

impl Environment {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "prod" | "production" => Self::Prod,
            "staging" => Self::Staging,
            _ => Self::Dev,
        }
    }

    pub fn is_dev(&self) -> bool {
        matches!(self, Self::Dev)
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub env: Environment,
    pub server_addr: String,

    // Database
    pub database_url: String,
    pub database_max_connections: u32,

    // Redis
    pub redis_url: String,
    pub redis_cache_ttl_seconds: u64,

    // CORS
    pub cors_allow_origins: Vec<String>,

    // Vision extraction service
    pub vision_service_url: String,
    pub vision_service_token: String,
    pub vision_service_timeout_seconds: u64,

    // Embedding service
    pub embedding_service_url: String,
    pub embedding_service_token: String,
    pub embedding_service_timeout_seconds: u64,
    pub embedding_dims: usize,

    // Retrieval
    pub route_step_timeout_seconds: u64,

    // Ingestion
    pub ingest_batch_size: usize,
    pub ingest_batch_delay_ms: u64,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let env = Environment::from_str(&env::var("ENV").unwrap_or_else(|_| "dev".to_string()));
        let server_addr = env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        // Database
        let database_url = env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let database_max_connections = env::var("DATABASE_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);

        // Redis
        let redis_url =
            env::var("REDIS_URL").unwrap_or_else(|_| "redis://redis:6379/0".to_string());
        let redis_cache_ttl_seconds = env::var("REDIS_CACHE_TTL_SECONDS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(900); // 15 minutes default

        // CORS
        let cors_allow_origins = env::var("CORS_ALLOW_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        // Vision extraction service
        let vision_service_url = env::var("VISION_SERVICE_URL")
            .unwrap_or_else(|_| "http://vision-service:8000".to_string());
        let vision_service_token =
            env::var("VISION_SERVICE_TOKEN").context("VISION_SERVICE_TOKEN must be set")?;
        let vision_service_timeout_seconds = env::var("VISION_SERVICE_TIMEOUT_SECONDS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(180); // drawing-page analysis is slow

        // Embedding service
        let embedding_service_url = env::var("EMBEDDING_SERVICE_URL")
            .unwrap_or_else(|_| "http://embedding-service:8000".to_string());
        let embedding_service_token =
            env::var("EMBEDDING_SERVICE_TOKEN").context("EMBEDDING_SERVICE_TOKEN must be set")?;
        let embedding_service_timeout_seconds = env::var("EMBEDDING_SERVICE_TIMEOUT_SECONDS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);
        let embedding_dims = env::var("EMBEDDING_DIMS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1536);

        // Retrieval
        let route_step_timeout_seconds = env::var("ROUTE_STEP_TIMEOUT_SECONDS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(30);

        // Ingestion
        let ingest_batch_size = env::var("INGEST_BATCH_SIZE")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(3);
        let ingest_batch_delay_ms = env::var("INGEST_BATCH_DELAY_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(2000);

        Ok(Settings {
            env,
            server_addr,
            database_url,
            database_max_connections,
            redis_url,
            redis_cache_ttl_seconds,
            cors_allow_origins,
            vision_service_url,
            vision_service_token,
            vision_service_timeout_seconds,
            embedding_service_url,
            embedding_service_token,
            embedding_service_timeout_seconds,
            embedding_dims,
            route_step_timeout_seconds,
            ingest_batch_size,
            ingest_batch_delay_ms,
        })
    }

    pub fn route_step_timeout(&self) -> Duration {
        Duration::from_secs(self.route_step_timeout_seconds)
    }

    pub fn ingest_batch_delay(&self) -> Duration {
        Duration::from_millis(self.ingest_batch_delay_ms)
    }
}
