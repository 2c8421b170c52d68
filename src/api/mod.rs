// API router assembly, split by domain.
pub mod chat;
pub mod execute;
pub mod upload;

use crate::i18n;
use crate::state::AppState;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(banner))
        .nest(
            "/api/v1",
            chat::router()
                .merge(upload::router())
                .merge(execute::router()),
        )
        .with_state(state)
}

async fn banner() -> Json<Value> {
    Json(json!({ "message": i18n::t("banner") }))
}
