// Explicit user-approved SQL execution. Block-list rejections are the one
// validation error that must surface loudly: they get a 400 naming the
// keyword. Other execution failures stay inside a 200-shaped response.
use crate::schemas::{ExecuteSqlRequest, ExecuteSqlResponse};
use crate::state::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/execute-sql", post(execute_sql))
}

async fn execute_sql(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ExecuteSqlRequest>,
) -> Response {
    match state
        .gate
        .execute(&request.sql_query, &request.session_id, true)
        .await
    {
        Err(rejection) => (
            StatusCode::BAD_REQUEST,
            Json(ExecuteSqlResponse {
                success: false,
                message: rejection.user_message(),
                row_count: None,
                chart_data: None,
                data: None,
                error: Some("statement_blocked".to_string()),
            }),
        )
            .into_response(),
        Ok(outcome) if outcome.success => Json(ExecuteSqlResponse {
            success: true,
            message: format!("{}\n{}", outcome.message, outcome.rendered),
            row_count: Some(outcome.row_count),
            chart_data: outcome.chart.map(|chart| chart.data),
            data: Some(outcome.rows),
            error: None,
        })
        .into_response(),
        Ok(outcome) => Json(ExecuteSqlResponse {
            success: false,
            message: outcome.message.clone(),
            row_count: None,
            chart_data: None,
            data: None,
            error: Some(outcome.message),
        })
        .into_response(),
    }
}
