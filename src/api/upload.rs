// Dataset upload and lifecycle endpoints.
use crate::i18n;
use crate::schemas::{DatabaseStatusResponse, UploadResponse};
use crate::state::AppState;
use axum::extract::{DefaultBodyLimit, Multipart, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

const MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/upload",
            post(upload).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/database-status", get(database_status))
        .route("/database", delete(delete_database))
}

#[derive(Debug, Deserialize)]
struct SessionQuery {
    #[serde(default)]
    session_id: Option<String>,
}

fn bad_request(detail: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "detail": detail }))).into_response()
}

async fn upload(State(state): State<Arc<AppState>>, mut multipart: Multipart) -> Response {
    let mut filename: Option<String> = None;
    let mut bytes: Option<Vec<u8>> = None;
    let mut session_id: Option<String> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => {
                warn!("multipart read failed: {err}");
                return bad_request(i18n::t("upload.parse_failed"));
            }
        };
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                filename = field.file_name().map(|name| name.to_string());
                match field.bytes().await {
                    Ok(data) => bytes = Some(data.to_vec()),
                    Err(err) => {
                        warn!("upload body read failed: {err}");
                        return bad_request(i18n::t("upload.parse_failed"));
                    }
                }
            }
            "session_id" => {
                session_id = field.text().await.ok().map(|value| value.trim().to_string());
            }
            _ => {}
        }
    }

    let Some(session_id) = session_id.filter(|value| !value.is_empty()) else {
        return bad_request(i18n::t("error.session_id_required"));
    };
    let Some(filename) = filename.filter(|value| !value.is_empty()) else {
        return bad_request(i18n::t("error.filename_missing"));
    };
    let Some(bytes) = bytes else {
        return bad_request(i18n::t("upload.empty_file"));
    };

    let datasets = state.datasets.clone();
    let outcome = tokio::task::spawn_blocking(move || {
        datasets.process_upload(&filename, &bytes, &session_id)
    })
    .await;
    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(err) => {
            warn!("upload task join failed: {err}");
            return bad_request(i18n::t("error.generic"));
        }
    };

    if !outcome.success {
        return bad_request(outcome.message);
    }
    let Some(metadata) = outcome.metadata else {
        warn!("upload reported success without metadata");
        return bad_request(i18n::t("error.generic"));
    };
    Json(UploadResponse {
        success: true,
        message: outcome.message,
        table_name: Some(metadata.table_name.clone()),
        row_count: Some(metadata.row_count),
        column_count: Some(metadata.column_count),
        columns: Some(
            metadata
                .columns
                .iter()
                .map(|column| column.name.clone())
                .collect(),
        ),
    })
    .into_response()
}

async fn database_status(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionQuery>,
) -> Response {
    let Some(session_id) = query
        .session_id
        .filter(|value| !value.trim().is_empty())
    else {
        return bad_request(i18n::t("error.session_id_required"));
    };
    let has_database = state.datasets.has_dataset(&session_id);
    let metadata = if has_database {
        state
            .datasets
            .metadata(&session_id)
            .and_then(|metadata| serde_json::to_value(metadata).ok())
    } else {
        None
    };
    Json(DatabaseStatusResponse {
        has_database,
        metadata,
    })
    .into_response()
}

async fn delete_database(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionQuery>,
) -> Response {
    let Some(session_id) = query
        .session_id
        .filter(|value| !value.trim().is_empty())
    else {
        return bad_request(i18n::t("error.session_id_required"));
    };
    if state.datasets.delete_dataset(&session_id) {
        Json(json!({ "message": i18n::t("database.deleted") })).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({ "detail": i18n::t("database.not_found") })),
        )
            .into_response()
    }
}
