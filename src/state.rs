// Process-wide state: every service is built once at startup and handed to
// request handlers by reference, no module-level globals.
use crate::config::{Config, LlmModelConfig};
use crate::dataset::DatasetService;
use crate::extract::SqlPolicy;
use crate::i18n;
use crate::llm::{is_llm_configured, CompletionBackend, LlmClient};
use crate::memory::{build_memory_backend, ChatMemory};
use crate::orchestrator::Orchestrator;
use crate::schema_rag::SchemaContext;
use crate::sql_gate::SqlGate;
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::warn;

pub struct AppState {
    pub config: Config,
    pub memory: Arc<dyn ChatMemory>,
    pub datasets: Arc<DatasetService>,
    pub schema: Arc<SchemaContext>,
    pub gate: Arc<SqlGate>,
    pub orchestrator: Arc<Orchestrator>,
    pub sql_policy: SqlPolicy,
}

impl AppState {
    pub fn new(config: Config) -> Result<Self> {
        let http = reqwest::Client::new();
        let chat_model = resolve_chat_model(&config);
        let backend = Arc::new(LlmClient::new(http, chat_model));
        Self::with_backend(config, backend)
    }

    /// Wires every service around an explicit completion backend; tests
    /// inject scripted backends through this.
    pub fn with_backend(config: Config, backend: Arc<dyn CompletionBackend>) -> Result<Self> {
        i18n::configure_i18n(&config.i18n.default_language);

        let memory = build_memory_backend(&config.memory);
        let datasets = Arc::new(
            DatasetService::new(config.datasets.dir.clone())
                .context("dataset directory init failed")?,
        );
        let schema = Arc::new(SchemaContext::new(
            &config.schema,
            config.embedding_model().cloned(),
        ));
        let gate = Arc::new(SqlGate::new(
            config.sql.default_db_path.clone(),
            datasets.clone(),
            memory.clone(),
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            backend,
            config.orchestrator.max_rounds,
        ));
        let sql_policy = SqlPolicy::from_config(&config.sql.policy);

        Ok(Self {
            config,
            memory,
            datasets,
            schema,
            gate,
            orchestrator,
            sql_policy,
        })
    }
}

/// Resolves the configured chat model; a missing or unusable entry degrades
/// to a local Ollama default instead of aborting the process.
fn resolve_chat_model(config: &Config) -> LlmModelConfig {
    if let Some(model) = config.chat_model() {
        if is_llm_configured(model) {
            return model.clone();
        }
        warn!(
            "chat model '{}' is not fully configured, using local default",
            config.llm.default
        );
    } else if !config.llm.default.trim().is_empty() {
        warn!(
            "chat model '{}' not found in llm.models, using local default",
            config.llm.default
        );
    } else {
        warn!("no chat model configured, using local default");
    }
    LlmModelConfig {
        provider: Some("ollama".to_string()),
        model: Some("llama3.1:8b".to_string()),
        temperature: Some(0.0),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_builds_from_defaults_in_tempdir() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.memory.db_path = dir
            .path()
            .join("history.db")
            .to_string_lossy()
            .to_string();
        config.datasets.dir = dir.path().join("datasets").to_string_lossy().to_string();
        config.schema.metadata_path = dir
            .path()
            .join("missing_schema.json")
            .to_string_lossy()
            .to_string();
        config.schema.index_dir = dir.path().join("index").to_string_lossy().to_string();
        config.sql.default_db_path = dir.path().join("app.db").to_string_lossy().to_string();

        let state = AppState::new(config).unwrap();
        assert_eq!(state.sql_policy, SqlPolicy::Approval);
        assert_eq!(state.schema.document_count(), 0);
    }

    #[test]
    fn unknown_chat_model_degrades_to_default() {
        let mut config = Config::default();
        config.llm.default = "missing-model".to_string();
        let model = resolve_chat_model(&config);
        assert_eq!(model.provider.as_deref(), Some("ollama"));
        assert_eq!(model.temperature, Some(0.0));
    }
}
