// PlanAid API v0.1
use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

mod config;
mod errors;
mod helpers;
mod models;
mod routes;
mod services;

use config::AppConfig;
use services::cache::CacheManager;
use services::pipeline::{Pipeline, RunState, SharedRunState};
use services::sources::SourceClient;

/// PlanAid API OpenAPI specification.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "PlanAid API",
        version = "0.1.0",
        description = "Airfield suitability for T-38 cross-country planning. \
            Aggregates runway, chart supplement, contract fuel, and recent-landing \
            sources through a cycle-aware cache, merges them with a local override \
            sheet, and classifies every airport into a map marker with reasons.",
    ),
    tags(
        (name = "Health", description = "Service health check"),
        (name = "Run", description = "Published run summary"),
        (name = "Airports", description = "Classified airports"),
    ),
    paths(
        routes::health::health_check,
        routes::run::get_run,
        routes::airports::list_airports,
        routes::airports::get_airport,
    ),
    components(
        schemas(
            routes::health::HealthResponse,
            routes::run::RunSummary,
            routes::airports::AirportListResponse,
            routes::airports::AirportSummary,
            routes::airports::AirportDetail,
            routes::airports::FieldSource,
            services::pipeline::SourceStatus,
            services::cache::SourceState,
            services::overrides::OverrideRowError,
            models::SourceKind,
            models::RunwayLda,
            models::ListMembership,
            models::Verdict,
            models::Marker,
            models::ClassificationResult,
            errors::Diagnostic,
            errors::DiagnosticKind,
            errors::ErrorResponse,
        )
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "planaid_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::from_env();

    let client = SourceClient::new(
        &config.user_agent,
        config.http_timeout(),
        config.endpoints.clone(),
        config.retry_policy(),
    )
    .expect("Failed to build source HTTP client");
    let cache = CacheManager::new(config.cache_config(), config.normalize_config());
    let pipeline = Arc::new(Pipeline::new(client, cache, config.pipeline_config()));

    // Shared run state, published by the background refresher
    let run_state: SharedRunState = Arc::new(RwLock::new(RunState::new()));
    tokio::spawn(services::pipeline::run_refresher(
        pipeline,
        run_state.clone(),
        config.refresh_interval(),
        config.output_dir.clone(),
    ));

    // CORS: read-only API, restrict methods to GET; expose X-Data-Stale
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::GET])
        .allow_headers(Any)
        .expose_headers([axum::http::HeaderName::from_static("x-data-stale")]);

    let api_routes = Router::new()
        .route("/api/v1/health", get(routes::health::health_check))
        .route("/api/v1/run", get(routes::run::get_run))
        .route("/api/v1/airports", get(routes::airports::list_airports))
        .route("/api/v1/airports/:id", get(routes::airports::get_airport))
        .with_state(run_state);

    let app = Router::new()
        .merge(api_routes)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("API server listening on {}", addr);
    tracing::info!(
        "Swagger UI available at http://localhost:{}/swagger-ui/",
        config.port
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind TCP listener");
    axum::serve(listener, app)
        .await
        .expect("Server terminated unexpectedly");
}
