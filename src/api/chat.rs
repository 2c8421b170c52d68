// Chat endpoint: the full session-scoped pipeline behind one POST.
// Pipeline failures never become transport errors; the response carries an
// `error` field instead.
use crate::extract::extract;
use crate::i18n;
use crate::schemas::{ChatHistoryResponse, ChatRequest, ChatResponse, StoredMessage};
use crate::state::AppState;
use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, warn};
use uuid::Uuid;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/chat", post(chat))
        .route("/chat-history", get(chat_history))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    #[serde(default)]
    session_id: Option<String>,
}

async fn chat(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatRequest>,
) -> Json<ChatResponse> {
    let session_id = request
        .session_id
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let history = match state.memory.get_messages(&session_id).await {
        Ok(messages) => messages,
        Err(err) => {
            warn!("history read failed for {session_id}: {err}");
            Vec::new()
        }
    };

    let schema_context = state
        .schema
        .describe(&request.query, &session_id, &state.datasets)
        .await;

    let result = state
        .orchestrator
        .run(
            &request.query,
            &history,
            &schema_context,
            &state.gate,
            &session_id,
        )
        .await;

    match result {
        Ok((raw_answer, steps)) => {
            // The assistant message is stored raw, chart markers included.
            persist_turn(&state, &session_id, &request.query, &raw_answer).await;
            let extraction = extract(&raw_answer, &steps, state.sql_policy);
            let (chart_data, chart_type) = match extraction.chart {
                Some(chart) => (Some(chart.data), chart.chart_type),
                None => (None, None),
            };
            Json(ChatResponse {
                answer: extraction.answer,
                session_id,
                chart_data,
                chart_type,
                sql_query: extraction.sql_query,
                requires_approval: extraction.requires_approval,
                error: None,
            })
        }
        Err(err) => {
            error!("chat pipeline failed for {session_id}: {err:?}");
            let answer = i18n::t("error.generic");
            // The failed turn is still recorded, as a degenerate assistant
            // message.
            persist_turn(&state, &session_id, &request.query, &answer).await;
            Json(ChatResponse {
                answer,
                session_id,
                chart_data: None,
                chart_type: None,
                sql_query: None,
                requires_approval: false,
                error: Some(err.to_string()),
            })
        }
    }
}

async fn persist_turn(state: &AppState, session_id: &str, query: &str, answer: &str) {
    let turn = [StoredMessage::user(query), StoredMessage::assistant(answer)];
    if let Err(err) = state.memory.add_messages(session_id, &turn).await {
        warn!("turn persist failed for {session_id}: {err}");
    }
}

async fn chat_history(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> Json<ChatHistoryResponse> {
    let session_id = query.session_id.unwrap_or_default();
    let messages = if session_id.trim().is_empty() {
        Vec::new()
    } else {
        state
            .memory
            .get_messages(&session_id)
            .await
            .unwrap_or_else(|err| {
                warn!("chat history read failed for {session_id}: {err}");
                Vec::new()
            })
    };
    let count = messages.len();
    Json(ChatHistoryResponse {
        session_id,
        messages,
        count,
    })
}
