// Schema context strategies: a session dataset bypasses everything, the
// similarity index narrows the static descriptor, and the full render is the
// fallback that must always be available.
use crate::config::{LlmModelConfig, SchemaConfig};
use crate::dataset::DatasetService;
use crate::llm::embed_texts;
use anyhow::{anyhow, Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{info, warn};

const DOC_TYPE_TABLE: &str = "table";
const DOC_TYPE_RELATIONSHIPS: &str = "relationships";
const DOC_TYPE_JOIN_PATTERN: &str = "join_pattern";

const INDEX_FILE: &str = "documents.json";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SchemaMetadata {
    #[serde(default)]
    pub database_description: String,
    #[serde(default)]
    pub tables: BTreeMap<String, TableInfo>,
    #[serde(default)]
    pub common_join_patterns: Vec<JoinPattern>,
    #[serde(default)]
    pub visualization_hints: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TableInfo {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub columns: BTreeMap<String, String>,
    #[serde(default)]
    pub relationships: Vec<String>,
    #[serde(default)]
    pub business_rules: Vec<String>,
    #[serde(default)]
    pub example_queries: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct JoinPattern {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub query: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexDocument {
    doc_type: String,
    #[serde(default)]
    table_name: Option<String>,
    content: String,
    embedding: Vec<f32>,
}

pub struct SchemaContext {
    metadata: Option<SchemaMetadata>,
    index_path: PathBuf,
    top_k: usize,
    embedding: Option<LlmModelConfig>,
    documents: RwLock<Vec<IndexDocument>>,
}

impl SchemaContext {
    pub fn new(config: &SchemaConfig, embedding: Option<LlmModelConfig>) -> Self {
        let metadata = load_metadata(&config.metadata_path);
        if metadata.is_none() {
            warn!(
                "schema metadata not found at {}, full-schema context will be minimal",
                config.metadata_path
            );
        }
        Self {
            metadata,
            index_path: PathBuf::from(&config.index_dir).join(INDEX_FILE),
            top_k: config.top_k.max(1),
            embedding,
            documents: RwLock::new(Vec::new()),
        }
    }

    pub fn document_count(&self) -> usize {
        self.documents.read().len()
    }

    /// Builds or loads the similarity index. Idempotent by document count: a
    /// non-empty persisted collection short-circuits re-initialization.
    /// Failures leave retrieval disabled and the full-schema fallback in
    /// charge; they never propagate.
    pub async fn initialize(&self) {
        if self.embedding.is_none() {
            info!("no embedding model configured, schema retrieval disabled");
            return;
        }
        if self.document_count() > 0 {
            return;
        }
        match self.load_persisted_documents() {
            Ok(Some(documents)) => {
                info!("schema index already initialized with {} documents", documents.len());
                *self.documents.write() = documents;
                return;
            }
            Ok(None) => {}
            Err(err) => {
                warn!("schema index load failed, rebuilding: {err}");
            }
        }
        match self.build_index().await {
            Ok(documents) => {
                info!("schema index built with {} documents", documents.len());
                *self.documents.write() = documents;
            }
            Err(err) => {
                warn!("schema index build failed, falling back to full schema: {err}");
            }
        }
    }

    fn load_persisted_documents(&self) -> Result<Option<Vec<IndexDocument>>> {
        if !self.index_path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&self.index_path)
            .with_context(|| format!("read {}", self.index_path.display()))?;
        let documents: Vec<IndexDocument> = serde_json::from_str(&raw)?;
        if documents.is_empty() {
            return Ok(None);
        }
        Ok(Some(documents))
    }

    async fn build_index(&self) -> Result<Vec<IndexDocument>> {
        let metadata = self
            .metadata
            .as_ref()
            .ok_or_else(|| anyhow!("schema metadata missing"))?;
        let embedding = self
            .embedding
            .as_ref()
            .ok_or_else(|| anyhow!("embedding model missing"))?;

        let mut drafts: Vec<(String, Option<String>, String)> = Vec::new();
        for (table_name, table) in &metadata.tables {
            drafts.push((
                DOC_TYPE_TABLE.to_string(),
                Some(table_name.clone()),
                format_table_document(table_name, table, &metadata.database_description),
            ));
            if !table.relationships.is_empty() {
                let mut content = format!("Table: {table_name}\nRelationships:\n");
                for relationship in &table.relationships {
                    content.push_str(&format!("- {relationship}\n"));
                }
                drafts.push((
                    DOC_TYPE_RELATIONSHIPS.to_string(),
                    Some(table_name.clone()),
                    content,
                ));
            }
        }
        for pattern in &metadata.common_join_patterns {
            drafts.push((
                DOC_TYPE_JOIN_PATTERN.to_string(),
                None,
                format!(
                    "Common Join Pattern: {}\nExample Query: {}",
                    pattern.description, pattern.query
                ),
            ));
        }
        if drafts.is_empty() {
            return Err(anyhow!("schema metadata has no tables"));
        }

        let inputs: Vec<String> = drafts.iter().map(|(_, _, content)| content.clone()).collect();
        let vectors = embed_texts(embedding, &inputs).await?;
        let documents: Vec<IndexDocument> = drafts
            .into_iter()
            .zip(vectors)
            .map(|((doc_type, table_name, content), embedding)| IndexDocument {
                doc_type,
                table_name,
                content,
                embedding,
            })
            .collect();

        if let Some(parent) = self.index_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create index dir {}", parent.display()))?;
        }
        std::fs::write(&self.index_path, serde_json::to_string(&documents)?)
            .with_context(|| format!("write {}", self.index_path.display()))?;
        Ok(documents)
    }

    /// Returns schema context for one query. The orchestrator must always
    /// receive some text; every strategy failure falls through to the next.
    pub async fn describe(
        &self,
        query: &str,
        session_id: &str,
        datasets: &DatasetService,
    ) -> String {
        if let Some(description) = datasets.generate_schema_description(session_id) {
            return description;
        }
        if self.embedding.is_some() && self.document_count() > 0 {
            match self.relevant_schema(query).await {
                Ok(text) if !text.trim().is_empty() => return text,
                Ok(_) => {}
                Err(err) => {
                    warn!("schema retrieval failed, using full schema: {err}");
                }
            }
        }
        self.full_schema_description()
    }

    async fn relevant_schema(&self, query: &str) -> Result<String> {
        let embedding = self
            .embedding
            .as_ref()
            .ok_or_else(|| anyhow!("embedding model missing"))?;
        let vectors = embed_texts(embedding, &[query.to_string()]).await?;
        let query_vector = vectors
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("empty query embedding"))?;

        let documents = self.documents.read();
        let mut scored: Vec<(f64, &IndexDocument)> = documents
            .iter()
            .map(|document| (cosine_similarity(&query_vector, &document.embedding), document))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        let mut seen_tables: Vec<&str> = Vec::new();
        let mut table_sections: Vec<String> = Vec::new();
        let mut join_patterns: Vec<&str> = Vec::new();
        for (_, document) in scored.iter().take(self.top_k) {
            match document.doc_type.as_str() {
                DOC_TYPE_TABLE => {
                    let Some(table_name) = document.table_name.as_deref() else {
                        continue;
                    };
                    if seen_tables.contains(&table_name) {
                        continue;
                    }
                    seen_tables.push(table_name);
                    table_sections
                        .push(format!("\n### {table_name}\n{}", document.content));
                }
                DOC_TYPE_JOIN_PATTERN => join_patterns.push(document.content.as_str()),
                _ => {}
            }
        }
        if table_sections.is_empty() {
            return Ok(String::new());
        }

        let mut output = String::from("## RELEVANT DATABASE SCHEMA:\n");
        for section in table_sections {
            output.push_str(&section);
            output.push('\n');
        }
        if !join_patterns.is_empty() {
            output.push_str("\n## RELEVANT JOIN PATTERNS:\n");
            for pattern in join_patterns {
                output.push_str(pattern);
                output.push('\n');
            }
        }
        Ok(output)
    }

    /// Deterministic render of the entire static descriptor. Always
    /// available; the retrieval strategy degrades to this.
    pub fn full_schema_description(&self) -> String {
        let Some(metadata) = &self.metadata else {
            return "No schema metadata is available. Answer from the user's \
                    uploaded data or ask for more context."
                .to_string();
        };
        let mut output = format!("## DATABASE SCHEMA\n\n{}\n", metadata.database_description);
        for (table_name, table) in &metadata.tables {
            output.push_str(&format!(
                "\n### {table_name}\n{}\n",
                format_table_document(table_name, table, &metadata.database_description)
            ));
        }
        if !metadata.common_join_patterns.is_empty() {
            output.push_str("\n## COMMON JOIN PATTERNS:\n");
            for pattern in &metadata.common_join_patterns {
                output.push_str(&format!("- {}\n  {}\n", pattern.description, pattern.query));
            }
        }
        if !metadata.visualization_hints.is_empty() {
            output.push_str("\n## VISUALIZATION HINTS:\n");
            for hint in &metadata.visualization_hints {
                output.push_str(&format!("- {hint}\n"));
            }
        }
        output
    }
}

fn load_metadata(path: &str) -> Option<SchemaMetadata> {
    let raw = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&raw) {
        Ok(metadata) => Some(metadata),
        Err(err) => {
            warn!("schema metadata parse failed: {err}");
            None
        }
    }
}

fn format_table_document(table_name: &str, table: &TableInfo, db_description: &str) -> String {
    let mut content = format!(
        "Database: {db_description}\n\nTable Name: {table_name}\nDescription: {}\n\nColumns:\n",
        if table.description.is_empty() {
            "No description"
        } else {
            &table.description
        }
    );
    for (column_name, column_description) in &table.columns {
        content.push_str(&format!("  - {column_name}: {column_description}\n"));
    }
    if !table.relationships.is_empty() {
        content.push_str("\nRelationships:\n");
        for relationship in &table.relationships {
            content.push_str(&format!("  - {relationship}\n"));
        }
    }
    if !table.business_rules.is_empty() {
        content.push_str("\nBusiness Rules:\n");
        for rule in &table.business_rules {
            content.push_str(&format!("  - {rule}\n"));
        }
    }
    if !table.example_queries.is_empty() {
        content.push_str("\nExample Use Cases:\n");
        for query in &table.example_queries {
            content.push_str(&format!("  - {query}\n"));
        }
    }
    content
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        dot += (*x as f64) * (*y as f64);
        norm_a += (*x as f64) * (*x as f64);
        norm_b += (*y as f64) * (*y as f64);
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}
