mod api;
mod config;
mod error;
mod geo;
mod lifecycle;
mod models;
mod store;
mod tracking;

use std::sync::Arc;

use axum::{routing::get, Router};
use sqlx::SqlitePool;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use config::Config;
use store::Store;
use tracking::TrackingManager;

#[derive(OpenApi)]
#[openapi(
    info(title = "Live Shuttle API", version = "0.1.0"),
    paths(
        api::status::health,
        api::status::organization_status,
        api::operations::list_operations,
        api::operations::driver_operations,
        api::drive::start_drive,
        api::drive::end_drive,
    ),
    components(schemas(
        api::status::HealthResponse,
        api::drive::StartDriveRequest,
        api::drive::EndDriveRequest,
        error::ErrorResponse,
        models::BusStatus,
        models::OperationSnapshot,
        models::OperationSummary,
        models::OperationStatus,
        models::BoardingAction,
        models::BoardingDetectionResult,
        models::DriverLocationSample,
    )),
    tags(
        (name = "status", description = "Live bus status and service health"),
        (name = "operations", description = "Operation queries for organization and driver apps"),
        (name = "drive", description = "Driver-initiated operation lifecycle")
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info,sqlx=warn".into()),
        )
        .init();

    // Load config
    let config = Config::load("config.yaml").expect("Failed to load config");
    tracing::info!(bind_addr = %config.bind_addr, "Loaded configuration");

    // Build CORS layer based on config
    let cors_layer = if config.cors_permissive {
        tracing::warn!("CORS: Permissive mode explicitly enabled (all origins allowed) - DO NOT USE IN PRODUCTION");
        CorsLayer::permissive()
    } else if !config.cors_origins.is_empty() {
        tracing::info!(origins = ?config.cors_origins, "CORS: Restricting to configured origins");
        let origins: Vec<_> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([
                axum::http::Method::GET,
                axum::http::Method::POST,
                axum::http::Method::OPTIONS,
            ])
            .allow_headers([axum::http::header::CONTENT_TYPE])
    } else {
        panic!("CORS configuration error: Either set 'cors_origins' with allowed origins, or set 'cors_permissive: true' for development");
    };

    // Initialize SQLite database
    let pool = SqlitePool::connect(&config.database_url)
        .await
        .expect("Failed to connect to SQLite database");

    // Run migrations
    let migrator = sqlx::migrate!("./migrations");
    migrator.run(&pool).await.expect("Failed to run migrations");
    tracing::info!("Database migrations completed");

    let store = Store::new(pool);

    // Optional fixture data for fresh installations
    if let Some(seed_file) = &config.seed_file {
        let content = std::fs::read_to_string(seed_file).expect("Failed to read seed file");
        let seed: store::SeedData =
            serde_yaml::from_str(&content).expect("Failed to parse seed file");
        store
            .seed_if_empty(&seed)
            .await
            .expect("Failed to seed database");
    }

    // Start the tracking manager and its maintenance sweeps
    let manager = Arc::new(TrackingManager::new(store, config.tracking.clone()));
    let manager_clone = manager.clone();
    tokio::spawn(async move {
        manager_clone.start().await;
    });

    // Build the app
    let app = Router::new()
        .route("/", get(root))
        .nest("/api", api::router(manager))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer);

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind server address");

    tracing::info!("Server running on http://{}", config.bind_addr);
    tracing::info!("Swagger UI: http://{}/swagger-ui", config.bind_addr);

    axum::serve(listener, app)
        .await
        .expect("Failed to start server");
}

async fn root() -> &'static str {
    "Live Shuttle API"
}
