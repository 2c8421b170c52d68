// Single enforcement point for SQL execution: destructive statements are
// rejected here and nowhere else.
use crate::dataset::DatasetService;
use crate::i18n;
use crate::memory::ChatMemory;
use crate::schemas::{ChartPayload, ChartPoint, StoredMessage};
use anyhow::{Context, Result};
use regex::Regex;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use serde_json::{Map, Number, Value};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use tracing::warn;

const MAX_DISPLAY_ROWS: usize = 10;
const MAX_CHART_ROWS: usize = 10;

const BLOCKED_KEYWORDS: [&str; 9] = [
    "DROP", "DELETE", "UPDATE", "INSERT", "ALTER", "CREATE", "TRUNCATE", "GRANT", "REVOKE",
];

#[derive(Debug, Clone, PartialEq)]
pub enum GateRejection {
    NotSelect,
    Blocked(String),
}

impl GateRejection {
    pub fn user_message(&self) -> String {
        match self {
            GateRejection::NotSelect => i18n::t("sql.not_select"),
            GateRejection::Blocked(keyword) => {
                i18n::t("sql.blocked_keyword").replace("{keyword}", keyword)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct GateOutcome {
    pub success: bool,
    pub message: String,
    pub row_count: i64,
    pub rendered: String,
    pub rows: Vec<Value>,
    pub chart: Option<ChartPayload>,
}

/// Inspects a statement before execution. The scan upper-cases the trimmed
/// text and matches block-listed keywords on word boundaries, so compound
/// statements hiding a destructive tail are rejected too.
pub fn validate_statement(sql: &str) -> Result<(), GateRejection> {
    let inspect = sql.trim().to_uppercase();
    if let Some(found) = blocked_keyword_regex().find(&inspect) {
        return Err(GateRejection::Blocked(found.as_str().to_string()));
    }
    if !inspect.starts_with("SELECT") {
        return Err(GateRejection::NotSelect);
    }
    Ok(())
}

fn blocked_keyword_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        let pattern = format!(r"\b(?:{})\b", BLOCKED_KEYWORDS.join("|"));
        Regex::new(&pattern).expect("block-list pattern is static")
    })
}

pub struct SqlGate {
    default_db_path: PathBuf,
    datasets: Arc<DatasetService>,
    memory: Arc<dyn ChatMemory>,
}

impl SqlGate {
    pub fn new(
        default_db_path: impl Into<PathBuf>,
        datasets: Arc<DatasetService>,
        memory: Arc<dyn ChatMemory>,
    ) -> Self {
        Self {
            default_db_path: default_db_path.into(),
            datasets,
            memory,
        }
    }

    /// Validates and executes a statement against the session's dataset
    /// database when one exists, else the default database. `persist`
    /// controls whether the execution is appended as its own conversation
    /// turn (the explicit approval endpoint persists; the orchestrator's
    /// internal tool call leaves turn recording to the chat handler).
    pub async fn execute(
        &self,
        sql: &str,
        session_id: &str,
        persist: bool,
    ) -> Result<GateOutcome, GateRejection> {
        validate_statement(sql)?;

        let db_path = self
            .datasets
            .dataset_path(session_id)
            .unwrap_or_else(|| self.default_db_path.clone());
        let sql_owned = sql.trim().to_string();
        let query = tokio::task::spawn_blocking(move || run_query(&db_path, &sql_owned))
            .await
            .unwrap_or_else(|err| Err(anyhow::anyhow!("query task join failed: {err}")));

        let outcome = match query {
            Ok(result) => {
                let rendered = render_table(&result.columns, &result.rows);
                let chart = auto_chart(&result.columns, &result.rows);
                let rows = rows_to_objects(&result.columns, &result.rows);
                GateOutcome {
                    success: true,
                    message: i18n::t("sql.success"),
                    row_count: result.rows.len() as i64,
                    rendered,
                    rows,
                    chart,
                }
            }
            Err(err) => GateOutcome {
                success: false,
                message: i18n::t("sql.failed").replace("{error}", &err.to_string()),
                row_count: 0,
                rendered: String::new(),
                rows: Vec::new(),
                chart: None,
            },
        };

        if persist {
            let summary = if outcome.success {
                format!("{}\n{}", outcome.message, outcome.rendered)
            } else {
                outcome.message.clone()
            };
            let turn = [
                StoredMessage::user(sql.trim()),
                StoredMessage::assistant(summary),
            ];
            if let Err(err) = self.memory.add_messages(session_id, &turn).await {
                warn!("sql gate turn persist failed for {session_id}: {err}");
            }
        }
        Ok(outcome)
    }

    /// Tool-call entry used by the orchestration loop. Failures come back as
    /// observation text for the model, never as errors.
    pub async fn run_for_tool(&self, sql: &str, session_id: &str) -> String {
        match self.execute(sql, session_id, false).await {
            Ok(outcome) if outcome.success => {
                format!(
                    "{} ({} rows)\n{}",
                    outcome.message, outcome.row_count, outcome.rendered
                )
            }
            Ok(outcome) => outcome.message,
            Err(rejection) => rejection.user_message(),
        }
    }
}

struct QueryResult {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

fn run_query(db_path: &PathBuf, sql: &str) -> Result<QueryResult> {
    // The gate only ever reads; opening read-only keeps even a missed
    // validation from touching the file.
    let conn = Connection::open_with_flags(
        db_path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .with_context(|| format!("open database {}", db_path.display()))?;
    let mut statement = conn.prepare(sql)?;
    let columns: Vec<String> = statement
        .column_names()
        .into_iter()
        .map(|name| name.to_string())
        .collect();
    let column_count = columns.len();
    let mut query_rows = statement.query([])?;
    let mut rows = Vec::new();
    while let Some(row) = query_rows.next()? {
        let mut values = Vec::with_capacity(column_count);
        for index in 0..column_count {
            values.push(value_ref_to_json(row.get_ref(index)?));
        }
        rows.push(values);
    }
    Ok(QueryResult { columns, rows })
}

fn value_ref_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(number) => Value::Number(number.into()),
        ValueRef::Real(number) => Number::from_f64(number)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(text) => Value::String(String::from_utf8_lossy(text).to_string()),
        ValueRef::Blob(blob) => Value::String(format!("<{} bytes>", blob.len())),
    }
}

fn value_to_display(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn render_table(columns: &[String], rows: &[Vec<Value>]) -> String {
    if rows.is_empty() {
        return i18n::t("sql.no_rows");
    }
    let mut lines = Vec::with_capacity(rows.len().min(MAX_DISPLAY_ROWS) + 2);
    lines.push(columns.join(" | "));
    lines.push(columns.iter().map(|_| "---").collect::<Vec<_>>().join(" | "));
    for row in rows.iter().take(MAX_DISPLAY_ROWS) {
        lines.push(
            row.iter()
                .map(value_to_display)
                .collect::<Vec<_>>()
                .join(" | "),
        );
    }
    if rows.len() > MAX_DISPLAY_ROWS {
        let remaining = rows.len() - MAX_DISPLAY_ROWS;
        lines.push(i18n::t("sql.more_rows").replace("{count}", &remaining.to_string()));
    }
    lines.join("\n")
}

/// Two-column results with a numeric second column become a chart payload,
/// best-effort: anything unexpected simply yields no chart.
fn auto_chart(columns: &[String], rows: &[Vec<Value>]) -> Option<ChartPayload> {
    if columns.len() != 2 || rows.is_empty() {
        return None;
    }
    if !rows[0].get(1).is_some_and(Value::is_number) {
        return None;
    }
    let mut data = Vec::new();
    for row in rows.iter().take(MAX_CHART_ROWS) {
        let value = row.get(1)?;
        if !value.is_number() {
            return None;
        }
        data.push(ChartPoint {
            name: value_to_display(row.first()?),
            value: value.clone(),
        });
    }
    Some(ChartPayload {
        chart_type: Some("bar".to_string()),
        title: None,
        data,
    })
}

fn rows_to_objects(columns: &[String], rows: &[Vec<Value>]) -> Vec<Value> {
    rows.iter()
        .map(|row| {
            let mut object = Map::new();
            for (name, value) in columns.iter().zip(row) {
                object.insert(name.clone(), value.clone());
            }
            Value::Object(object)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryChatMemory;

    fn seeded_gate(dir: &std::path::Path, rows: usize) -> SqlGate {
        let db_path = dir.join("app.db");
        let conn = Connection::open(&db_path).unwrap();
        conn.execute_batch("CREATE TABLE sales (name TEXT, value INTEGER);")
            .unwrap();
        for index in 0..rows {
            conn.execute(
                "INSERT INTO sales VALUES (?1, ?2)",
                rusqlite::params![format!("item{index}"), index as i64],
            )
            .unwrap();
        }
        let datasets = Arc::new(DatasetService::new(dir.join("datasets")).unwrap());
        SqlGate::new(db_path, datasets, Arc::new(InMemoryChatMemory::new()))
    }

    #[test]
    fn validation_accepts_select_only() {
        assert!(validate_statement("SELECT * FROM x").is_ok());
        assert!(validate_statement("  select name from t  ").is_ok());
        assert_eq!(
            validate_statement("DROP TABLE x"),
            Err(GateRejection::Blocked("DROP".to_string()))
        );
        assert_eq!(
            validate_statement("select * from x; DELETE FROM y"),
            Err(GateRejection::Blocked("DELETE".to_string()))
        );
        assert_eq!(
            validate_statement("UPDATE x SET a=1"),
            Err(GateRejection::Blocked("UPDATE".to_string()))
        );
        assert_eq!(validate_statement("PRAGMA table_info(x)"), Err(GateRejection::NotSelect));
    }

    #[test]
    fn keyword_scan_respects_word_boundaries() {
        // Column names that merely contain a keyword must pass.
        assert!(validate_statement("SELECT last_update, created_at FROM t").is_ok());
        assert!(validate_statement("SELECT deleted FROM t").is_ok());
        assert_eq!(
            validate_statement("SELECT * FROM t WHERE x = 1 OR delete FROM y"),
            Err(GateRejection::Blocked("DELETE".to_string()))
        );
    }

    #[tokio::test]
    async fn executes_and_renders_with_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let gate = seeded_gate(dir.path(), 15);
        let outcome = gate
            .execute("SELECT name, value FROM sales ORDER BY value", "s1", false)
            .await
            .unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.row_count, 15);
        assert!(outcome.rendered.contains("5 satır daha"));
        // Two columns, numeric second column: a chart payload appears.
        let chart = outcome.chart.unwrap();
        assert_eq!(chart.data.len(), 10);
        assert_eq!(chart.data[0].name, "item0");
    }

    #[tokio::test]
    async fn execution_error_is_not_a_rejection() {
        let dir = tempfile::tempdir().unwrap();
        let gate = seeded_gate(dir.path(), 1);
        let outcome = gate
            .execute("SELECT * FROM missing_table", "s1", false)
            .await
            .unwrap();
        assert!(!outcome.success);
        assert!(outcome.message.contains("hata"));
    }

    #[tokio::test]
    async fn persisted_execution_appends_one_turn() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("app.db");
        let conn = Connection::open(&db_path).unwrap();
        conn.execute_batch("CREATE TABLE t (a INTEGER); INSERT INTO t VALUES (1);")
            .unwrap();
        let datasets = Arc::new(DatasetService::new(dir.path().join("datasets")).unwrap());
        let memory: Arc<InMemoryChatMemory> = Arc::new(InMemoryChatMemory::new());
        let gate = SqlGate::new(db_path, datasets, memory.clone());
        gate.execute("SELECT a FROM t", "s1", true).await.unwrap();
        let messages = memory.get_messages("s1").await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "SELECT a FROM t");
    }

    #[tokio::test]
    async fn non_numeric_second_column_disables_chart() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("app.db");
        let conn = Connection::open(&db_path).unwrap();
        conn.execute_batch(
            "CREATE TABLE t (a TEXT, b TEXT); INSERT INTO t VALUES ('x', 'y');",
        )
        .unwrap();
        let datasets = Arc::new(DatasetService::new(dir.path().join("datasets")).unwrap());
        let gate = SqlGate::new(db_path, datasets, Arc::new(InMemoryChatMemory::new()));
        let outcome = gate.execute("SELECT a, b FROM t", "s1", false).await.unwrap();
        assert!(outcome.success);
        assert!(outcome.chart.is_none());
    }
}
