// Best-effort extraction of SQL and chart sub-payloads from model text.
// Parsing failures always mean "absent", never an error.
use crate::i18n;
use crate::orchestrator::ToolStep;
use crate::schemas::{ChartPayload, ChartPoint};
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

/// Which SQL surfaces in the chat response. The two modes are mutually
/// exclusive per deployment; they are never combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlPolicy {
    /// Surface a fenced SQL block from the answer text and defer execution
    /// to the explicit approval endpoint.
    Approval,
    /// Surface the SQL the orchestration loop already executed.
    Auto,
}

impl SqlPolicy {
    pub fn from_config(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "auto" | "executed" => SqlPolicy::Auto,
            _ => SqlPolicy::Approval,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Extraction {
    pub answer: String,
    pub sql_query: Option<String>,
    pub chart: Option<ChartPayload>,
    pub requires_approval: bool,
}

fn chart_block_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)CHART_JSON_START(.*?)CHART_JSON_END").expect("chart pattern is static")
    })
}

fn sql_fence_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)```sql\s+(.*?)```").expect("sql fence pattern is static"))
}

pub fn extract(raw_answer: &str, steps: &[ToolStep], policy: SqlPolicy) -> Extraction {
    let (answer, chart) = extract_chart(raw_answer);
    let (sql_query, requires_approval) = match policy {
        SqlPolicy::Approval => {
            let sql = sql_fence_regex()
                .captures(&answer)
                .and_then(|captures| captures.get(1))
                .map(|found| found.as_str().trim().to_string())
                .filter(|sql| !sql.is_empty());
            let requires_approval = sql.is_some();
            (sql, requires_approval)
        }
        SqlPolicy::Auto => {
            let sql = steps
                .iter()
                .rev()
                .find(|step| step.tool == "execute_sql")
                .and_then(|step| step.input.get("sql"))
                .and_then(Value::as_str)
                .map(|sql| sql.trim().to_string())
                .filter(|sql| !sql.is_empty());
            (sql, false)
        }
    };
    Extraction {
        answer,
        sql_query,
        chart,
        requires_approval,
    }
}

/// Looks for the first delimited chart region. The delimiter text is always
/// removed from the visible answer; the payload only survives when it parses
/// as JSON and carries a `data` field.
fn extract_chart(raw: &str) -> (String, Option<ChartPayload>) {
    let Some(captures) = chart_block_regex().captures(raw) else {
        return (raw.trim().to_string(), None);
    };
    let whole = captures.get(0).expect("regex match has group 0");
    let body = captures.get(1).map(|group| group.as_str()).unwrap_or("");
    let mut answer = format!(
        "{}{}",
        &raw[..whole.start()],
        &raw[whole.end()..]
    )
    .trim()
    .to_string();

    let Ok(parsed) = serde_json::from_str::<Value>(body.trim()) else {
        return (answer, None);
    };
    let Some(data) = parsed.get("data").and_then(Value::as_array) else {
        return (answer, None);
    };
    let points: Vec<ChartPoint> = data.iter().filter_map(chart_point).collect();
    let title = parsed
        .get("title")
        .and_then(Value::as_str)
        .map(|title| title.to_string());
    let chart = ChartPayload {
        chart_type: parsed
            .get("chart_type")
            .and_then(Value::as_str)
            .map(|kind| kind.to_string()),
        title: title.clone(),
        data: points,
    };
    let trailer = i18n::t("chart.trailer").replace(
        "{title}",
        title.as_deref().unwrap_or(&i18n::t("chart.default_title")),
    );
    answer.push_str("\n\n");
    answer.push_str(&trailer);
    (answer, Some(chart))
}

fn chart_point(entry: &Value) -> Option<ChartPoint> {
    let object = entry.as_object()?;
    let name = match object.get("name") {
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
        None => return None,
    };
    Some(ChartPoint {
        name,
        value: object.get("value").cloned().unwrap_or(Value::Null),
    })
}
