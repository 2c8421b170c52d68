// Server entrypoint: configuration, state wiring and the HTTP listener.
use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::middleware::{from_fn, Next};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::FutureExt;
use serde_json::json;
use sorgu_server::config::{Config, DEFAULT_CONFIG_PATH};
use sorgu_server::state::AppState;
use sorgu_server::{api, i18n, shutdown};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load(DEFAULT_CONFIG_PATH);
    init_tracing(&config);
    let state = Arc::new(AppState::new(config.clone())?);

    // Best-effort: retrieval degrades to the full-schema strategy when this
    // fails, so startup never blocks on it.
    state.schema.initialize().await;

    let app = api::build_router(state)
        .layer(build_cors(&config))
        .layer(TraceLayer::new_for_http())
        .layer(from_fn(panic_guard));

    let addr = bind_address(&config);
    let listener = tokio::net::TcpListener::bind(addr.as_str()).await?;
    info!("sorgu-server listening on http://{addr}");

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown::shutdown_signal());
    if let Err(err) = server.await {
        warn!("server exited abnormally: {err}");
    }
    Ok(())
}

fn init_tracing(config: &Config) {
    let default_level = config.observability.log_level.trim();
    let default_level = if default_level.is_empty() {
        "info".to_string()
    } else {
        default_level.to_lowercase()
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn bind_address(config: &Config) -> String {
    // Environment overrides for containerized deployments.
    let host = std::env::var("SORGU_HOST").unwrap_or_else(|_| config.server.host.clone());
    let port = std::env::var("SORGU_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(config.server.port);
    format!("{host}:{port}")
}

fn build_cors(config: &Config) -> CorsLayer {
    let origins: Vec<_> = config
        .cors
        .allow_origins
        .clone()
        .unwrap_or_default()
        .into_iter()
        .filter_map(|origin| origin.trim().parse().ok())
        .collect();
    if origins.is_empty() {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(AllowMethods::any())
            .allow_headers(AllowHeaders::any());
    }
    let layer = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(AllowMethods::list([
            Method::GET,
            Method::POST,
            Method::DELETE,
            Method::OPTIONS,
        ]))
        .allow_headers(AllowHeaders::list([header::CONTENT_TYPE]));
    if config.cors.allow_credentials.unwrap_or(false) {
        // Wildcards cannot be combined with credentials; the explicit lists
        // above keep this combination valid.
        layer.allow_credentials(true)
    } else {
        layer
    }
}

/// Last-resort guard: a panicking handler must still produce a structured
/// response instead of tearing down the connection.
async fn panic_guard(request: Request<Body>, next: Next) -> Response {
    let path = request.uri().path().to_string();
    match AssertUnwindSafe(next.run(request)).catch_unwind().await {
        Ok(response) => response,
        Err(panic) => {
            error!("handler panicked on {path}: {}", describe_panic(&panic));
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "detail": i18n::t("error.generic") })),
            )
                .into_response()
        }
    }
}

fn describe_panic(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
