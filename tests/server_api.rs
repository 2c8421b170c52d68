// End-to-end API tests against a real listener with a scripted completion
// backend and tempdir-scoped state.
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use sorgu_server::api::build_router;
use sorgu_server::config::Config;
use sorgu_server::llm::{ChatMessage, CompletionBackend, LlmResponse};
use sorgu_server::state::AppState;
use std::sync::Arc;
use tempfile::TempDir;

/// Pops one canned reply per completion round; `Err` entries simulate a
/// backend outage.
struct StubBackend {
    script: Mutex<Vec<Result<LlmResponse, String>>>,
}

impl StubBackend {
    fn new(mut script: Vec<Result<LlmResponse, String>>) -> Arc<Self> {
        script.reverse();
        Arc::new(Self {
            script: Mutex::new(script),
        })
    }

    fn text(content: &str) -> Result<LlmResponse, String> {
        Ok(LlmResponse {
            content: content.to_string(),
            tool_calls: None,
        })
    }

    fn tool_call(name: &str, arguments: Value) -> Result<LlmResponse, String> {
        Ok(LlmResponse {
            content: String::new(),
            tool_calls: Some(json!([{
                "id": "call_1",
                "function": {
                    "name": name,
                    "arguments": arguments.to_string(),
                }
            }])),
        })
    }
}

#[async_trait]
impl CompletionBackend for StubBackend {
    async fn complete(
        &self,
        _messages: &[ChatMessage],
        _tools: Option<&[Value]>,
    ) -> Result<LlmResponse> {
        match self.script.lock().pop() {
            Some(Ok(response)) => Ok(response),
            Some(Err(message)) => Err(anyhow::anyhow!(message)),
            None => Ok(LlmResponse {
                content: "bitti".to_string(),
                tool_calls: None,
            }),
        }
    }
}

struct TestServer {
    base_url: String,
    client: reqwest::Client,
    // Keeps the scratch dir alive for the server's lifetime.
    _dir: TempDir,
}

async fn spawn_server(backend: Arc<dyn CompletionBackend>) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.memory.db_path = dir.path().join("history.db").to_string_lossy().to_string();
    config.datasets.dir = dir.path().join("datasets").to_string_lossy().to_string();
    config.schema.metadata_path = dir
        .path()
        .join("schema_metadata.json")
        .to_string_lossy()
        .to_string();
    config.schema.index_dir = dir.path().join("index").to_string_lossy().to_string();
    config.sql.default_db_path = dir.path().join("app.db").to_string_lossy().to_string();
    std::fs::write(
        &config.schema.metadata_path,
        json!({
            "database_description": "Test database",
            "tables": {
                "artists": {
                    "description": "Music artists",
                    "columns": { "name": "artist name" }
                }
            }
        })
        .to_string(),
    )
    .unwrap();

    let state = Arc::new(AppState::with_backend(config, backend).unwrap());
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    TestServer {
        base_url: format!("http://{addr}/api/v1"),
        client: reqwest::Client::new(),
        _dir: dir,
    }
}

async fn upload_csv(server: &TestServer, session_id: &str, filename: &str, body: &str) -> reqwest::Response {
    let form = reqwest::multipart::Form::new()
        .part(
            "file",
            reqwest::multipart::Part::bytes(body.as_bytes().to_vec()).file_name(filename.to_string()),
        )
        .text("session_id", session_id.to_string());
    server
        .client
        .post(format!("{}/upload", server.base_url))
        .multipart(form)
        .send()
        .await
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn chat_pipeline_with_tool_call_chart_and_approval_sql() {
    let answer = "En çok satan sanatçıyı buldum.\n\
                  ```sql\nSELECT name FROM artists LIMIT 1\n```\n\
                  CHART_JSON_START{\"title\":\"Sanatçılar\",\"data\":[{\"name\":\"A\",\"value\":3}]}CHART_JSON_END";
    let backend = StubBackend::new(vec![
        StubBackend::tool_call("execute_sql", json!({ "sql": "SELECT name, 3 FROM artists" })),
        StubBackend::text(answer),
    ]);
    let server = spawn_server(backend).await;

    // Seed the default database so the tool call has something to read.
    {
        let db_path = server._dir.path().join("app.db");
        let conn = rusqlite::Connection::open(db_path).unwrap();
        conn.execute_batch("CREATE TABLE artists (name TEXT); INSERT INTO artists VALUES ('A');")
            .unwrap();
    }

    let response = server
        .client
        .post(format!("{}/chat", server.base_url))
        .json(&json!({ "query": "en çok satan sanatçı kim?", "session_id": "turlar" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();

    // Chart block extracted, markers stripped, Turkish trailer appended.
    assert!(!body["answer"].as_str().unwrap().contains("CHART_JSON"));
    assert!(body["answer"].as_str().unwrap().contains("Sanatçılar"));
    assert_eq!(body["chart_data"][0]["name"], "A");
    assert_eq!(body["chart_data"][0]["value"], 3);
    // Approval policy: fenced SQL surfaces but is not executed.
    assert_eq!(body["sql_query"], "SELECT name FROM artists LIMIT 1");
    assert_eq!(body["requires_approval"], true);
    assert!(body.get("error").is_none() || body["error"].is_null());

    // One turn -> two stored messages, raw assistant text with markers.
    let history: Value = server
        .client
        .get(format!(
            "{}/chat-history?session_id=turlar",
            server.base_url
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(history["count"], 2);
    assert_eq!(history["messages"][0]["role"], "user");
    assert!(history["messages"][1]["content"]
        .as_str()
        .unwrap()
        .contains("CHART_JSON_START"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_turns_are_still_recorded() {
    let backend = StubBackend::new(vec![
        StubBackend::text("ilk cevap"),
        Err("backend down".to_string()),
    ]);
    let server = spawn_server(backend).await;

    for query in ["ilk soru", "ikinci soru"] {
        let response = server
            .client
            .post(format!("{}/chat", server.base_url))
            .json(&json!({ "query": query, "session_id": "hata-testi" }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }

    // The second turn failed but both turns are in the log: 2N messages.
    let history: Value = server
        .client
        .get(format!(
            "{}/chat-history?session_id=hata-testi",
            server.base_url
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(history["count"], 4);
    assert_eq!(history["messages"][3]["content"], "Bir hata oluştu.");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn chat_failure_returns_structured_error_not_transport_error() {
    let backend = StubBackend::new(vec![Err("LLM unreachable".to_string())]);
    let server = spawn_server(backend).await;
    let response = server
        .client
        .post(format!("{}/chat", server.base_url))
        .json(&json!({ "query": "soru" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["answer"], "Bir hata oluştu.");
    assert!(body["error"].as_str().unwrap().contains("LLM unreachable"));
    // A generated session id comes back so the client can continue.
    assert!(!body["session_id"].as_str().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn upload_status_query_delete_lifecycle() {
    let server = spawn_server(StubBackend::new(Vec::new())).await;

    let response = upload_csv(&server, "yukleme", "2024 Sales!.csv", "name,value\nA,1\nB,2\n").await;
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["row_count"], 2);
    assert_eq!(body["column_count"], 2);
    assert_eq!(body["table_name"], "t_2024_sales_");
    assert_eq!(body["columns"], json!(["name", "value"]));

    let status: Value = server
        .client
        .get(format!(
            "{}/database-status?session_id=yukleme",
            server.base_url
        ))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["has_database"], true);
    assert_eq!(status["metadata"]["row_count"], 2);

    // The uploaded dataset is queryable through the gate.
    let executed: Value = server
        .client
        .post(format!("{}/execute-sql", server.base_url))
        .json(&json!({
            "sql_query": "SELECT name, value FROM t_2024_sales_ ORDER BY value",
            "session_id": "yukleme"
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(executed["success"], true);
    assert_eq!(executed["row_count"], 2);
    assert_eq!(executed["data"][0]["name"], "A");
    assert_eq!(executed["chart_data"][1]["value"], 2);

    let response = server
        .client
        .delete(format!("{}/database?session_id=yukleme", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let response = server
        .client
        .delete(format!("{}/database?session_id=yukleme", server.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn upload_validation_failures_are_400() {
    let server = spawn_server(StubBackend::new(Vec::new())).await;

    // Missing session id.
    let form = reqwest::multipart::Form::new().part(
        "file",
        reqwest::multipart::Part::bytes(b"a,b\n1,2\n".to_vec()).file_name("x.csv"),
    );
    let response = server
        .client
        .post(format!("{}/upload", server.base_url))
        .multipart(form)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["detail"], "session_id gerekli");

    // Unsupported extension.
    let response = upload_csv(&server, "s1", "notes.txt", "whatever").await;
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert!(body["detail"].as_str().unwrap().contains("Desteklenmeyen"));

    // Empty table.
    let response = upload_csv(&server, "s1", "empty.csv", "").await;
    assert_eq!(response.status(), 400);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn destructive_sql_is_rejected_with_400_naming_the_keyword() {
    let server = spawn_server(StubBackend::new(Vec::new())).await;
    let cases = [
        ("DROP TABLE x", "DROP"),
        ("select * from x; DELETE FROM y", "DELETE"),
        ("UPDATE x SET a=1", "UPDATE"),
    ];
    for (sql, keyword) in cases {
        let response = server
            .client
            .post(format!("{}/execute-sql", server.base_url))
            .json(&json!({ "sql_query": sql, "session_id": "guvenlik" }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400, "{sql}");
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["success"], false);
        assert!(
            body["message"].as_str().unwrap().contains(keyword),
            "message should name {keyword}: {}",
            body["message"]
        );
    }

    // Non-SELECT without a blocked keyword is also a 400.
    let response = server
        .client
        .post(format!("{}/execute-sql", server.base_url))
        .json(&json!({ "sql_query": "PRAGMA table_list", "session_id": "guvenlik" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_select_stays_inside_a_200() {
    let server = spawn_server(StubBackend::new(Vec::new())).await;
    let response = server
        .client
        .post(format!("{}/execute-sql", server.base_url))
        .json(&json!({ "sql_query": "SELECT * FROM yok", "session_id": "s1" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn approved_execution_is_persisted_as_its_own_turn() {
    let server = spawn_server(StubBackend::new(Vec::new())).await;
    upload_csv(&server, "onay", "veri.csv", "ad,adet\nX,5\n").await;

    let response = server
        .client
        .post(format!("{}/execute-sql", server.base_url))
        .json(&json!({ "sql_query": "SELECT ad, adet FROM veri", "session_id": "onay" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let history: Value = server
        .client
        .get(format!("{}/chat-history?session_id=onay", server.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(history["count"], 2);
    assert_eq!(history["messages"][0]["content"], "SELECT ad, adet FROM veri");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn chat_history_is_empty_for_unknown_session() {
    let server = spawn_server(StubBackend::new(Vec::new())).await;
    let history: Value = server
        .client
        .get(format!("{}/chat-history?session_id=yok", server.base_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(history["count"], 0);
    assert_eq!(history["messages"], json!([]));
}
