// OpenAI-compatible Chat Completions and Embeddings adapter.
use crate::config::LlmModelConfig;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::warn;

const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/openai";
const DEFAULT_OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";
const DEFAULT_OLLAMA_BASE_URL: &str = "http://127.0.0.1:11434/v1";

const DEFAULT_TIMEOUT_S: u64 = 120;
/// SQL generation wants precision, not variation.
const DEFAULT_TEMPERATURE: f32 = 0.0;

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn text(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: Value::String(content.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant_with_tool_calls(content: String, tool_calls: Value) -> Self {
        Self {
            role: "assistant".to_string(),
            content: Value::String(content),
            tool_calls: Some(tool_calls),
            tool_call_id: None,
        }
    }

    pub fn tool_result(tool_call_id: Option<String>, content: String) -> Self {
        Self {
            role: "tool".to_string(),
            content: Value::String(content),
            tool_calls: None,
            tool_call_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub tool_calls: Option<Value>,
}

/// Capability interface over the hosted completion service; the orchestrator
/// only sees this trait so tests can script the backend.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[Value]>,
    ) -> Result<LlmResponse>;
}

#[derive(Clone)]
pub struct LlmClient {
    http: Client,
    config: LlmModelConfig,
}

impl LlmClient {
    pub fn new(http: Client, config: LlmModelConfig) -> Self {
        Self { http, config }
    }

    fn endpoint(&self) -> String {
        let base = resolve_base_url(&self.config)
            .unwrap_or_else(|| DEFAULT_OLLAMA_BASE_URL.to_string());
        let base = base.trim_end_matches('/');
        if base.ends_with("/v1") || base.ends_with("/openai") {
            format!("{base}/chat/completions")
        } else {
            format!("{base}/v1/chat/completions")
        }
    }

    fn headers(&self) -> reqwest::header::HeaderMap {
        build_headers(self.config.api_key.as_deref().unwrap_or(""))
    }

    fn build_payload(&self, messages: &[ChatMessage], tools: Option<&[Value]>) -> Value {
        let temperature = self.config.temperature.unwrap_or(DEFAULT_TEMPERATURE);
        let mut payload = json!({
            "model": self.config.model.clone().unwrap_or_default(),
            "messages": messages,
            "temperature": temperature,
            "stream": false,
        });
        if let Some(tool_defs) = tools {
            if !tool_defs.is_empty() {
                payload["tools"] = Value::Array(tool_defs.to_vec());
                payload["tool_choice"] = json!("auto");
            }
        }
        payload
    }
}

#[async_trait]
impl CompletionBackend for LlmClient {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[Value]>,
    ) -> Result<LlmResponse> {
        let response = self
            .http
            .post(self.endpoint())
            .headers(self.headers())
            .timeout(Duration::from_secs(
                self.config.timeout_s.unwrap_or(DEFAULT_TIMEOUT_S),
            ))
            .json(&self.build_payload(messages, tools))
            .send()
            .await?;
        let status = response.status();
        let body_text = response.text().await.context("read llm response body")?;
        let body = match serde_json::from_str::<Value>(&body_text) {
            Ok(value) => value,
            Err(err) => {
                warn!(
                    "LLM response json parse failed: {err}, body={}",
                    truncate_text(&body_text, 2048)
                );
                Value::Null
            }
        };
        if !status.is_success() {
            let detail = if body == Value::Null {
                json!({ "raw": truncate_text(&body_text, 2048) })
            } else {
                body
            };
            return Err(anyhow!("LLM request failed: {status} {detail}"));
        }
        if body == Value::Null {
            return Err(anyhow!(
                "LLM response parse failed: {}",
                truncate_text(&body_text, 2048)
            ));
        }
        let message = body
            .get("choices")
            .and_then(|value| value.get(0))
            .and_then(|value| value.get("message"))
            .cloned()
            .unwrap_or(Value::Null);
        let content = flatten_content(message.get("content").unwrap_or(&Value::Null));
        let tool_calls = extract_tool_calls(&message);
        Ok(LlmResponse {
            content,
            tool_calls,
        })
    }
}

/// Joins text-bearing fragments in order. Some backends return the message
/// content as an array of typed parts instead of one string.
pub fn flatten_content(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Array(items) => {
            let mut output = String::new();
            for item in items {
                let fragment = match item {
                    Value::String(text) => text.as_str(),
                    Value::Object(map) => map.get("text").and_then(Value::as_str).unwrap_or(""),
                    _ => "",
                };
                if fragment.is_empty() {
                    continue;
                }
                if !output.is_empty() {
                    output.push(' ');
                }
                output.push_str(fragment);
            }
            output.trim().to_string()
        }
        _ => String::new(),
    }
}

fn extract_tool_calls(message: &Value) -> Option<Value> {
    let Value::Object(map) = message else {
        return None;
    };
    let calls = map
        .get("tool_calls")
        .or_else(|| map.get("tool_call"))
        .cloned()?;
    match &calls {
        Value::Array(items) if items.is_empty() => None,
        Value::Null => None,
        _ => Some(calls),
    }
}

pub fn resolve_base_url(config: &LlmModelConfig) -> Option<String> {
    if let Some(base_url) = &config.base_url {
        let cleaned = base_url.trim();
        if !cleaned.is_empty() {
            return Some(cleaned.trim_end_matches('/').to_string());
        }
    }
    let provider = config.provider.as_deref().unwrap_or("").trim().to_lowercase();
    let url = match provider.as_str() {
        "openai" => DEFAULT_OPENAI_BASE_URL,
        "gemini" | "google" => DEFAULT_GEMINI_BASE_URL,
        "openrouter" => DEFAULT_OPENROUTER_BASE_URL,
        "ollama" => DEFAULT_OLLAMA_BASE_URL,
        _ => return None,
    };
    Some(url.to_string())
}

pub fn is_llm_configured(config: &LlmModelConfig) -> bool {
    resolve_base_url(config).is_some()
        && config
            .model
            .as_ref()
            .map(|value| !value.trim().is_empty())
            .unwrap_or(false)
}

fn build_headers(api_key: &str) -> reqwest::header::HeaderMap {
    let mut headers = reqwest::header::HeaderMap::new();
    if !api_key.is_empty() {
        let value = format!("Bearer {api_key}");
        if let Ok(header_value) = value.parse() {
            headers.insert(reqwest::header::AUTHORIZATION, header_value);
        }
    }
    headers
}

/// Embeds a batch of texts through the `/v1/embeddings` endpoint.
pub async fn embed_texts(config: &LlmModelConfig, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
    if inputs.is_empty() {
        return Ok(Vec::new());
    }
    let base_url =
        resolve_base_url(config).ok_or_else(|| anyhow!("embedding base_url is required"))?;
    let model = config
        .model
        .as_ref()
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| anyhow!("embedding model is required"))?;
    let base = base_url.trim_end_matches('/');
    let endpoint = if base.ends_with("/v1") || base.ends_with("/openai") {
        format!("{base}/embeddings")
    } else {
        format!("{base}/v1/embeddings")
    };
    let timeout = Duration::from_secs(config.timeout_s.unwrap_or(DEFAULT_TIMEOUT_S).max(5));
    let client = Client::builder().timeout(timeout).build()?;
    let payload = json!({
        "model": model,
        "input": inputs,
    });
    let response = client
        .post(endpoint)
        .headers(build_headers(config.api_key.as_deref().unwrap_or("")))
        .json(&payload)
        .send()
        .await?;
    let status = response.status();
    let body_text = response
        .text()
        .await
        .context("read embedding response body")?;
    if !status.is_success() {
        return Err(anyhow!(
            "embedding request failed: {status} {}",
            truncate_text(&body_text, 2048)
        ));
    }
    let body: Value = serde_json::from_str(&body_text)
        .with_context(|| format!("embedding response parse failed: {}", truncate_text(&body_text, 512)))?;
    let data = body
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("embedding response missing data"))?;
    let mut vectors = Vec::with_capacity(data.len());
    for item in data {
        let embedding = item
            .get("embedding")
            .and_then(Value::as_array)
            .ok_or_else(|| anyhow!("embedding entry missing vector"))?;
        let vector: Vec<f32> = embedding
            .iter()
            .filter_map(Value::as_f64)
            .map(|value| value as f32)
            .collect();
        vectors.push(vector);
    }
    if vectors.len() != inputs.len() {
        return Err(anyhow!("embedding count mismatch"));
    }
    Ok(vectors)
}

fn truncate_text(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    let mut output = text[..end].to_string();
    output.push_str("...");
    output
}
