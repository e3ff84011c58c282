//! Storage backends for the edge session core: the Chunk Store (spec
//! §4.1) and the Session State Store (spec §4.2).

pub mod chunk_store;
pub mod migrations;
pub mod pool;
pub mod session_store;

pub use chunk_store::{ChunkEntry, ChunkStoreError, ChunkStoreTrait, InMemoryChunkStore, S3ChunkStore};
pub use pool::DbPool;
pub use session_store::{InMemorySessionStore, PgSessionStore, SessionStoreTrait, StoreError, UpdateFn};

use aws_sdk_s3::Client as S3Client;

/// Build the S3 client used by [`S3ChunkStore`] (spec §4.1 ambient
/// additions: bucket + key prefix from `config::StorageConfig`).
pub async fn build_s3_client() -> S3Client {
    let shared_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
    S3Client::new(&shared_config)
}
