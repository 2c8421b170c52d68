// Built-in tool definitions and the execution entry point. Tool names are
// part of the completion-backend protocol; keep them stable.
use crate::i18n;
use crate::sql_gate::SqlGate;
use serde_json::{json, Value};

pub const TOOL_EXECUTE_SQL: &str = "execute_sql";
pub const TOOL_FORMAT_CHART: &str = "format_chart";

pub const CHART_MARKER_START: &str = "CHART_JSON_START";
pub const CHART_MARKER_END: &str = "CHART_JSON_END";

#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

impl ToolSpec {
    /// OpenAI-compatible function-tool wire shape.
    pub fn to_wire(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.input_schema,
            }
        })
    }
}

pub fn builtin_tool_specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: TOOL_EXECUTE_SQL.to_string(),
            description: "Execute a read-only SQL SELECT statement against the \
                          database and return the rendered result rows. Always \
                          fetch data with this tool before answering."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "sql": {
                        "type": "string",
                        "description": "A single SELECT statement. Destructive statements are rejected."
                    }
                },
                "required": ["sql"]
            }),
        },
        ToolSpec {
            name: TOOL_FORMAT_CHART.to_string(),
            description: "Format tabular data for visualization. Does not draw \
                          anything; it wraps the data so the frontend can render \
                          it. Use after fetching data whenever the user asks for \
                          a chart or the result is a numeric series."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "chart_type": {
                        "type": "string",
                        "enum": ["bar", "line", "pie", "scatter"]
                    },
                    "title": { "type": "string" },
                    "data": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "name": { "type": "string" },
                                "value": { "type": "number" }
                            },
                            "required": ["name", "value"]
                        }
                    }
                },
                "required": ["data"]
            }),
        },
    ]
}

pub struct ToolContext<'a> {
    pub gate: &'a SqlGate,
    pub session_id: &'a str,
}

/// Runs one tool call and returns the observation text fed back to the
/// model. Tool failures are reported as text, never as errors; the loop
/// must keep going regardless of what the model asked for.
pub async fn execute_tool(name: &str, arguments: &Value, context: &ToolContext<'_>) -> String {
    match name {
        TOOL_EXECUTE_SQL => {
            let sql = arguments.get("sql").and_then(Value::as_str).unwrap_or("");
            if sql.trim().is_empty() {
                return i18n::t("sql.failed").replace("{error}", "empty statement");
            }
            context.gate.run_for_tool(sql, context.session_id).await
        }
        TOOL_FORMAT_CHART => format_chart(arguments),
        other => format!("unknown tool: {other}"),
    }
}

/// Wraps chart data in the delimiter pair the response extractor looks for.
/// The model sometimes sends the payload as a JSON string; both shapes are
/// accepted.
fn format_chart(arguments: &Value) -> String {
    let payload = match arguments {
        Value::String(raw) => {
            let cleaned = raw.replace("```json", "").replace("```", "");
            match serde_json::from_str::<Value>(cleaned.trim()) {
                Ok(value) => value,
                Err(err) => {
                    return i18n::t("chart.tool_error").replace("{error}", &err.to_string());
                }
            }
        }
        other => other.clone(),
    };
    if payload.get("data").and_then(Value::as_array).is_none() {
        return i18n::t("chart.tool_error").replace("{error}", "missing data field");
    }
    match serde_json::to_string(&payload) {
        Ok(serialized) => format!("{CHART_MARKER_START}{serialized}{CHART_MARKER_END}"),
        Err(err) => i18n::t("chart.tool_error").replace("{error}", &err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chart_tool_wraps_payload_in_markers() {
        let arguments = json!({
            "chart_type": "bar",
            "title": "Satışlar",
            "data": [{ "name": "A", "value": 10 }]
        });
        let output = format_chart(&arguments);
        assert!(output.starts_with(CHART_MARKER_START));
        assert!(output.ends_with(CHART_MARKER_END));
        assert!(output.contains("Satışlar"));
    }

    #[test]
    fn chart_tool_accepts_stringified_json() {
        let arguments = Value::String(
            "```json\n{\"data\":[{\"name\":\"A\",\"value\":1}]}\n```".to_string(),
        );
        let output = format_chart(&arguments);
        assert!(output.starts_with(CHART_MARKER_START));
    }

    #[test]
    fn chart_tool_reports_bad_input_as_text() {
        let output = format_chart(&json!({ "title": "no data here" }));
        assert!(output.contains("hata"));
        assert!(!output.contains(CHART_MARKER_START));
    }

    #[test]
    fn wire_shape_is_function_tool() {
        let specs = builtin_tool_specs();
        assert_eq!(specs.len(), 2);
        let wire = specs[0].to_wire();
        assert_eq!(wire["type"], "function");
        assert_eq!(wire["function"]["name"], TOOL_EXECUTE_SQL);
    }
}
