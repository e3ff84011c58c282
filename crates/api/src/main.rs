use api::routes::AppState;
use config::{CoreConfig, LoggingConfig};
use database::{PgSessionStore, S3ChunkStore};
use inference_providers::InferenceClient;
use services::ingest::IngestGateway;
use services::orchestrator::SessionOrchestrator;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    let config = CoreConfig::load().unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {e}");
        std::process::exit(1);
    });

    init_tracing(&config.logging);
    tracing::debug!(?config, "loaded configuration");

    let config = Arc::new(config);
    let bind_address = format!("{}:{}", config.server.host, config.server.port);

    let pool = database::pool::create_pool(&config.session_store)
        .await
        .unwrap_or_else(|e| {
            tracing::error!(error = %e, "failed to connect to the session store");
            std::process::exit(1);
        });
    database::migrations::run(&pool).await.unwrap_or_else(|e| {
        tracing::error!(error = %e, "failed to run session store migrations");
        std::process::exit(1);
    });
    let store = Arc::new(PgSessionStore::new(pool));

    let s3_client = database::build_s3_client().await;
    let chunk_store = Arc::new(S3ChunkStore::new(
        s3_client,
        config.storage.chunk_bucket.clone(),
        config.storage.chunk_prefix.clone(),
    ));

    let inference = Arc::new(InferenceClient::new(config.inference.clone()));

    let orchestrator = Arc::new(SessionOrchestrator::new(
        store.clone(),
        chunk_store.clone(),
        inference.clone(),
        config.clone(),
    ));
    let ingest = Arc::new(IngestGateway::new(orchestrator.clone()));

    let state = AppState { orchestrator, ingest, config: config.clone() };
    let app = api::build_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_address).await.unwrap_or_else(|e| {
        tracing::error!(address = %bind_address, error = %e, "failed to bind listener");
        std::process::exit(1);
    });

    tracing::info!(address = %bind_address, "edge session core started");
    axum::serve(listener, app).await.unwrap();
}

fn init_tracing(logging_config: &LoggingConfig) {
    let filter = logging_config.level.clone();

    match logging_config.format.as_str() {
        "json" => {
            tracing_subscriber::fmt().json().with_env_filter(filter).init();
        }
        "compact" => {
            tracing_subscriber::fmt().compact().with_env_filter(filter).init();
        }
        _ => {
            tracing_subscriber::fmt().pretty().with_env_filter(filter).init();
        }
    }
}
