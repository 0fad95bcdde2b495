//! services/api/src/bin/api.rs

use api_lib::{
    adapters::{DbAdapter, FsBlobStore},
    config::Config,
    error::ApiError,
    web::{
        disconnect_handler, list_answers_handler,
        question_task::catalog_refresh_process,
        require_identity, rest::ApiDoc, rollback_handler,
        state::{AppState, Collaborators},
        teardown_status_handler, ws_handler,
    },
};
use axum::{
    http::{header::{ACCEPT, CONTENT_TYPE}, HeaderValue, Method},
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[tokio::main]
async fn main() -> Result<(), ApiError> {
    // --- 1. Load Configuration & Set Up Logging ---
    let config = Arc::new(Config::from_env()?);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.log_level.to_string()))
        .with(tracing_subscriber::fmt::layer())
        .init();
    info!("Configuration loaded. Starting server...");

    // --- 2. Connect to Database & Run Migrations ---
    info!("Connecting to database...");
    let db_pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await?;
    let db_adapter = Arc::new(DbAdapter::new(db_pool));
    info!("Running database migrations...");
    db_adapter.run_migrations().await?;
    info!("Database migrations complete.");

    // --- 3. Build the Shared AppState ---
    let blobs = Arc::new(FsBlobStore::new(config.content_dir.clone()));
    let ports = Collaborators {
        identities: db_adapter.clone(),
        directory: db_adapter.clone(),
        messages: db_adapter.clone(),
        catalog: db_adapter.clone(),
        answers: db_adapter,
        blobs,
    };
    let app_state = Arc::new(AppState::new(config.clone(), ports));

    // --- 4. Load the Question Catalog & Start Its Refresh Worker ---
    match app_state.questions.refresh_catalog().await {
        Ok(count) => info!("Loaded {} catalog questions.", count),
        Err(e) => warn!("Initial catalog load failed, will retry on demand: {}", e),
    }
    let shutdown = CancellationToken::new();
    let refresh_worker = tokio::spawn(catalog_refresh_process(
        app_state.questions.clone(),
        config.catalog_refresh_interval,
        shutdown.child_token(),
    ));

    // --- 5. Create the Web Router ---
    let origin = config
        .allowed_origin
        .parse::<HeaderValue>()
        .map_err(|e| ApiError::Internal(format!("Invalid ALLOWED_ORIGIN: {}", e)))?;
    let cors = CorsLayer::new()
        .allow_origin(origin)
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE, ACCEPT]);

    // Every route needs a resolved identity.
    let api_router = Router::new()
        .route("/ws", get(ws_handler))
        .route("/connection/disconnect", post(disconnect_handler))
        .route("/connection/rollback", post(rollback_handler))
        .route("/connection/teardown", get(teardown_status_handler))
        .route("/answers", get(list_answers_handler))
        .layer(axum_middleware::from_fn_with_state(
            app_state.clone(),
            require_identity,
        ))
        .layer(cors)
        .with_state(app_state);

    // Merge the API router with the Swagger UI router for a complete application.
    let app = Router::new()
        .merge(api_router)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()));

    // --- 6. Start the Server ---
    info!("Starting server on {}", config.bind_address);
    info!(
        "Swagger UI available at http://{}/swagger-ui",
        config.bind_address
    );
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutdown signal received.");
            signal.cancel();
        })
        .await?;

    shutdown.cancel();
    if let Err(e) = refresh_worker.await {
        warn!("Catalog refresh worker ended abnormally: {:?}", e);
    }
    Ok(())
}
