// Reasoning loop: composes the directive, drives the completion backend and
// executes its tool calls, bounded by a fixed round budget.
use crate::llm::{ChatMessage, CompletionBackend};
use crate::schemas::StoredMessage;
use crate::sql_gate::SqlGate;
use crate::tools::{builtin_tool_specs, execute_tool, ToolContext};
use anyhow::Result;
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

/// One executed tool call, in order of execution.
#[derive(Debug, Clone)]
pub struct ToolStep {
    pub tool: String,
    pub input: Value,
    pub output: String,
}

pub struct Orchestrator {
    backend: Arc<dyn CompletionBackend>,
    max_rounds: usize,
}

impl Orchestrator {
    pub fn new(backend: Arc<dyn CompletionBackend>, max_rounds: usize) -> Self {
        Self {
            backend,
            max_rounds: max_rounds.max(1),
        }
    }

    /// Runs one orchestration cycle. Backend and tool errors propagate as a
    /// single failure; there is no internal retry. When the round budget is
    /// exhausted the partial answer is returned instead of looping on.
    pub async fn run(
        &self,
        query: &str,
        history: &[StoredMessage],
        schema_context: &str,
        gate: &SqlGate,
        session_id: &str,
    ) -> Result<(String, Vec<ToolStep>)> {
        let tools: Vec<Value> = builtin_tool_specs()
            .iter()
            .map(|spec| spec.to_wire())
            .collect();
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage::text(
            "system",
            compose_directive(schema_context),
        ));
        for message in history {
            messages.push(ChatMessage::text(&message.role, message.content.clone()));
        }
        messages.push(ChatMessage::text("user", query));

        let context = ToolContext { gate, session_id };
        let mut steps: Vec<ToolStep> = Vec::new();
        let mut last_content = String::new();

        for _round in 0..self.max_rounds {
            let response = self.backend.complete(&messages, Some(&tools)).await?;
            last_content = response.content.clone();
            let calls = parse_tool_calls(response.tool_calls.as_ref());
            if calls.is_empty() {
                return Ok((response.content, steps));
            }
            messages.push(ChatMessage::assistant_with_tool_calls(
                response.content,
                response.tool_calls.clone().unwrap_or(Value::Null),
            ));
            for call in calls {
                let output = execute_tool(&call.name, &call.arguments, &context).await;
                steps.push(ToolStep {
                    tool: call.name.clone(),
                    input: call.arguments.clone(),
                    output: output.clone(),
                });
                messages.push(ChatMessage::tool_result(call.id, output));
            }
        }

        warn!(
            "orchestration round budget ({}) exhausted for session {session_id}",
            self.max_rounds
        );
        Ok((last_content, steps))
    }
}

/// The single directive sent as the system message: analyst role, the
/// narrowed schema context and the behavioral rules.
pub fn compose_directive(schema_context: &str) -> String {
    format!(
        "You are a careful data analyst answering questions over a SQL \
         database. Work step by step and ground every claim in query \
         results.\n\n{schema_context}\n\nRules:\n\
         - Always fetch the data with the execute_sql tool before answering; \
         never guess values.\n\
         - The database is SQLite: use strftime() and date() for date \
         arithmetic, no vendor extensions.\n\
         - Double-quote identifiers containing non-ASCII or special \
         characters.\n\
         - When the user asks for a visualization, or the result is a \
         numeric or tabular series, call the format_chart tool with the \
         fetched data and include its output verbatim in your final answer.\n\
         - Answer in the user's language."
    )
}

struct ParsedCall {
    id: Option<String>,
    name: String,
    arguments: Value,
}

fn parse_tool_calls(raw: Option<&Value>) -> Vec<ParsedCall> {
    let Some(Value::Array(items)) = raw else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let function = item.get("function")?;
            let name = function.get("name").and_then(Value::as_str)?.to_string();
            if name.trim().is_empty() {
                return None;
            }
            let arguments = match function.get("arguments") {
                Some(Value::String(raw_args)) => serde_json::from_str::<Value>(raw_args)
                    .unwrap_or_else(|_| Value::String(raw_args.clone())),
                Some(other) => other.clone(),
                None => Value::Null,
            };
            Some(ParsedCall {
                id: item
                    .get("id")
                    .and_then(Value::as_str)
                    .map(|id| id.to_string()),
                name,
                arguments,
            })
        })
        .collect()
}
