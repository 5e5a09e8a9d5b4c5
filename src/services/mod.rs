//! Service layer modules for external integrations.
//!
//! Clients for the vision extraction and embedding services, the Postgres
//! datastore adapter, and the Redis cache.

pub mod cache;
pub mod embedding_client;
pub mod store;
pub mod vision_client;

pub use cache::RedisCache;
pub use embedding_client::EmbeddingClient;
pub use store::PgStore;
pub use vision_client::VisionClient;
