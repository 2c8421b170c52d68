// YAML configuration with per-section defaults; a missing file yields defaults.
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::warn;

pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub cors: CorsConfig,
    #[serde(default)]
    pub i18n: I18nConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub datasets: DatasetConfig,
    #[serde(default)]
    pub schema: SchemaConfig,
    #[serde(default)]
    pub sql: SqlConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CorsConfig {
    pub allow_origins: Option<Vec<String>>,
    pub allow_credentials: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct I18nConfig {
    pub default_language: String,
}

impl Default for I18nConfig {
    fn default() -> Self {
        Self {
            default_language: "tr-TR".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LlmConfig {
    /// Name of the chat model entry in `models` used for reasoning.
    #[serde(default)]
    pub default: String,
    /// Name of the embedding model entry used by schema retrieval.
    #[serde(default)]
    pub embedding: String,
    #[serde(default)]
    pub models: HashMap<String, LlmModelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LlmModelConfig {
    pub provider: Option<String>,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub timeout_s: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// "sqlite" for the durable backend, "in-memory" for the volatile one.
    pub backend: String,
    pub db_path: String,
    /// Fixed session TTL in seconds, refreshed on every write.
    pub ttl_s: i64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            backend: "sqlite".to_string(),
            db_path: "./data/chat_history.db".to_string(),
            ttl_s: 86_400,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub dir: String,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            dir: "./data/user_databases".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaConfig {
    pub metadata_path: String,
    pub index_dir: String,
    pub top_k: usize,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            metadata_path: "./data/schema_metadata.json".to_string(),
            index_dir: "./data/schema_index".to_string(),
            top_k: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlConfig {
    /// "approval" defers extracted SQL to the explicit /execute-sql step;
    /// "auto" surfaces the SQL the orchestration loop already executed.
    pub policy: String,
    pub default_db_path: String,
}

impl Default for SqlConfig {
    fn default() -> Self {
        Self {
            policy: "approval".to_string(),
            default_db_path: "./data/app.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub max_rounds: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self { max_rounds: 12 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Self {
        if !Path::new(path).exists() {
            return Self::default();
        }
        match std::fs::read_to_string(path) {
            Ok(raw) => match serde_yaml::from_str::<Config>(&raw) {
                Ok(config) => config,
                Err(err) => {
                    warn!("config parse failed, using defaults: {err}");
                    Self::default()
                }
            },
            Err(err) => {
                warn!("config read failed, using defaults: {err}");
                Self::default()
            }
        }
    }

    pub fn chat_model(&self) -> Option<&LlmModelConfig> {
        resolve_model(&self.llm, &self.llm.default)
    }

    pub fn embedding_model(&self) -> Option<&LlmModelConfig> {
        resolve_model(&self.llm, &self.llm.embedding)
    }
}

fn resolve_model<'a>(llm: &'a LlmConfig, name: &str) -> Option<&'a LlmModelConfig> {
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    llm.models.get(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_file() {
        let config = Config::load("/nonexistent/sorgu-config.yaml");
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.memory.backend, "sqlite");
        assert_eq!(config.sql.policy, "approval");
        assert_eq!(config.schema.top_k, 5);
        assert_eq!(config.orchestrator.max_rounds, 12);
    }

    #[test]
    fn parses_partial_yaml() {
        let raw = "server:\n  host: 127.0.0.1\n  port: 9001\nsql:\n  policy: auto\n  default_db_path: ./x.db\n";
        let config: Config = serde_yaml::from_str(raw).unwrap();
        assert_eq!(config.server.port, 9001);
        assert_eq!(config.sql.policy, "auto");
        assert_eq!(config.memory.ttl_s, 86_400);
    }
}
