// Per-session dataset ingestion: CSV/Excel uploads materialized as SQLite
// tables with a JSON metadata sidecar.
use crate::i18n;
use anyhow::{anyhow, Context, Result};
use calamine::{open_workbook_auto_from_rs, Data, Reader};
use chrono::{NaiveDate, NaiveDateTime, Utc};
use rusqlite::{params_from_iter, Connection};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tracing::warn;

const MAX_TABLE_NAME_LEN: usize = 50;
const SAMPLE_VALUE_COUNT: usize = 3;

const DATETIME_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d.%m.%Y", "%d/%m/%Y"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnMeta {
    pub name: String,
    pub sql_type: String,
    pub sample_values: Vec<String>,
    pub null_count: i64,
    pub unique_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetMetadata {
    pub original_filename: String,
    pub table_name: String,
    pub row_count: i64,
    pub column_count: i64,
    pub columns: Vec<ColumnMeta>,
    pub upload_timestamp: String,
}

/// Parsed tabular content before materialization. Cells are `None` when the
/// source value was empty or unreadable.
struct ParsedTable {
    headers: Vec<String>,
    rows: Vec<Vec<Option<String>>>,
}

pub struct UploadOutcome {
    pub success: bool,
    pub message: String,
    pub metadata: Option<DatasetMetadata>,
}

pub struct DatasetService {
    dir: PathBuf,
}

impl DatasetService {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create dataset dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn db_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}.db"))
    }

    fn metadata_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}_metadata.json"))
    }

    /// Processes an uploaded file into the session's dataset. Any prior
    /// dataset for the session is fully replaced. Errors surface as a
    /// declined upload, never as a propagated failure.
    pub fn process_upload(&self, filename: &str, bytes: &[u8], session_id: &str) -> UploadOutcome {
        if !is_safe_session_id(session_id) {
            return declined(i18n::t("error.session_id_required"));
        }
        let lowered = filename.to_lowercase();
        let table = if lowered.ends_with(".csv") {
            parse_csv(bytes)
        } else if lowered.ends_with(".xlsx") || lowered.ends_with(".xls") {
            parse_excel(bytes)
        } else {
            return declined(i18n::t("upload.unsupported_format"));
        };
        let table = match table {
            Ok(table) => table,
            Err(err) => {
                warn!("upload parse failed for session {session_id}: {err}");
                return declined(i18n::t("upload.parse_failed"));
            }
        };
        if table.headers.is_empty() || table.rows.is_empty() {
            return declined(i18n::t("upload.empty_file"));
        }

        let table_name = sanitize_table_name(filename);
        let metadata = build_metadata(&table, &table_name, filename);
        match self.materialize(session_id, &table, &metadata) {
            Ok(()) => UploadOutcome {
                success: true,
                message: i18n::t("upload.success").replace("{table}", &table_name),
                metadata: Some(metadata),
            },
            Err(err) => {
                warn!("dataset materialization failed for session {session_id}: {err}");
                declined(i18n::t("upload.process_failed").replace("{error}", &err.to_string()))
            }
        }
    }

    fn materialize(
        &self,
        session_id: &str,
        table: &ParsedTable,
        metadata: &DatasetMetadata,
    ) -> Result<()> {
        let db_path = self.db_path(session_id);
        let metadata_path = self.metadata_path(session_id);
        // Replace, never merge: drop the previous pair first.
        remove_if_exists(&db_path)?;
        remove_if_exists(&metadata_path)?;

        let mut conn = Connection::open(&db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        let column_defs: Vec<String> = metadata
            .columns
            .iter()
            .map(|column| format!("{} {}", quote_ident(&column.name), column.sql_type))
            .collect();
        conn.execute_batch(&format!(
            "CREATE TABLE {} ({});",
            quote_ident(&metadata.table_name),
            column_defs.join(", ")
        ))?;

        let placeholders: Vec<String> = (1..=metadata.columns.len())
            .map(|index| format!("?{index}"))
            .collect();
        let insert_sql = format!(
            "INSERT INTO {} VALUES ({})",
            quote_ident(&metadata.table_name),
            placeholders.join(", ")
        );
        let tx = conn.transaction()?;
        {
            let mut statement = tx.prepare(&insert_sql)?;
            for row in &table.rows {
                let values: Vec<rusqlite::types::Value> = row
                    .iter()
                    .zip(&metadata.columns)
                    .map(|(cell, column)| to_sql_value(cell.as_deref(), &column.sql_type))
                    .collect();
                statement.execute(params_from_iter(values))?;
            }
        }
        tx.commit()?;

        // Data file then sidecar; a crash between the two leaves an
        // inconsistent pair (known gap, mirrors upstream behavior).
        let raw = serde_json::to_string_pretty(metadata)?;
        std::fs::write(&metadata_path, raw)
            .with_context(|| format!("write metadata {}", metadata_path.display()))?;
        Ok(())
    }

    pub fn has_dataset(&self, session_id: &str) -> bool {
        is_safe_session_id(session_id) && self.db_path(session_id).exists()
    }

    pub fn dataset_path(&self, session_id: &str) -> Option<PathBuf> {
        if !is_safe_session_id(session_id) {
            return None;
        }
        let path = self.db_path(session_id);
        path.exists().then_some(path)
    }

    pub fn metadata(&self, session_id: &str) -> Option<DatasetMetadata> {
        if !is_safe_session_id(session_id) {
            return None;
        }
        let raw = std::fs::read_to_string(self.metadata_path(session_id)).ok()?;
        serde_json::from_str(&raw).ok()
    }

    /// Schema context synthesized from the uploaded dataset; replaces the
    /// static descriptor entirely for sessions that carry one.
    pub fn generate_schema_description(&self, session_id: &str) -> Option<String> {
        let metadata = self.metadata(session_id)?;
        let mut description = format!(
            "## USER UPLOADED DATABASE\n\n\
             **Original File:** {}\n\
             **Table Name:** {}\n\
             **Records:** {} rows\n\
             **Columns:** {} columns\n\n\
             ### Table: {}\n\n\
             **Columns:**\n",
            metadata.original_filename,
            metadata.table_name,
            metadata.row_count,
            metadata.column_count,
            metadata.table_name,
        );
        for column in &metadata.columns {
            description.push_str(&format!("\n- **{}** ({})", column.name, column.sql_type));
            description.push_str(&format!("\n  - Unique Values: {}", column.unique_count));
            description.push_str(&format!("\n  - Null Count: {}", column.null_count));
            if !column.sample_values.is_empty() {
                description.push_str(&format!(
                    "\n  - Sample Values: {}",
                    column.sample_values.join(", ")
                ));
            }
        }
        description.push_str(
            "\n\n**Important:** This is user-uploaded data. \
             Always use the exact table and column names shown above.",
        );
        Some(description)
    }

    pub fn delete_dataset(&self, session_id: &str) -> bool {
        if !is_safe_session_id(session_id) {
            return false;
        }
        let mut deleted = false;
        for path in [self.db_path(session_id), self.metadata_path(session_id)] {
            if path.exists() {
                match std::fs::remove_file(&path) {
                    Ok(()) => deleted = true,
                    Err(err) => warn!("dataset delete failed for {}: {err}", path.display()),
                }
            }
        }
        deleted
    }
}

fn declined(message: String) -> UploadOutcome {
    UploadOutcome {
        success: false,
        message,
        metadata: None,
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("remove previous {}", path.display()))?;
    }
    Ok(())
}

/// Session ids name files on disk; only a conservative character set is
/// accepted.
fn is_safe_session_id(session_id: &str) -> bool {
    !session_id.is_empty()
        && session_id.len() <= 64
        && session_id
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-')
}

/// Derives a valid SQL table name from the uploaded filename:
/// non-alphanumeric characters become underscores, a non-letter start gets a
/// `t_` prefix, the result is lower-cased and capped.
pub fn sanitize_table_name(filename: &str) -> String {
    let stem = match filename.rfind('.') {
        Some(index) if index > 0 => &filename[..index],
        _ => filename,
    };
    let mut name: String = stem
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() {
                ch.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    if name.is_empty() {
        name = "t_table".to_string();
    }
    if !name.chars().next().is_some_and(|ch| ch.is_ascii_alphabetic()) {
        name = format!("t_{name}");
    }
    name.truncate(MAX_TABLE_NAME_LEN);
    name
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn parse_excel(bytes: &[u8]) -> Result<ParsedTable> {
    let cursor = Cursor::new(bytes.to_vec());
    let mut workbook = open_workbook_auto_from_rs(cursor).context("open workbook")?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| anyhow!("workbook has no sheets"))?
        .context("read first sheet")?;
    let mut row_iter = range.rows();
    let headers: Vec<String> = row_iter
        .next()
        .map(|row| row.iter().map(cell_to_header).collect())
        .unwrap_or_default();
    let mut rows = Vec::new();
    for row in row_iter {
        let mut cells: Vec<Option<String>> = row.iter().map(cell_to_string).collect();
        cells.resize(headers.len(), None);
        if cells.iter().any(Option::is_some) {
            rows.push(cells);
        }
    }
    Ok(ParsedTable { headers, rows })
}

fn cell_to_header(cell: &Data) -> String {
    cell_to_string(cell).unwrap_or_default()
}

fn cell_to_string(cell: &Data) -> Option<String> {
    match cell {
        Data::Empty | Data::Error(_) => None,
        Data::String(text) => {
            let trimmed = text.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Data::Int(value) => Some(value.to_string()),
        Data::Float(value) => Some(format_number(*value)),
        Data::Bool(value) => Some(value.to_string()),
        Data::DateTimeIso(text) | Data::DurationIso(text) => Some(text.clone()),
        Data::DateTime(value) => Some(format_number(value.as_f64())),
    }
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

/// Minimal RFC-4180 reader: quoted fields, doubled-quote escapes, CR/LF row
/// endings, optional UTF-8 BOM. No crate in the stack covers plain CSV.
fn parse_csv(bytes: &[u8]) -> Result<ParsedTable> {
    let text = String::from_utf8_lossy(bytes);
    let text = text.strip_prefix('\u{feff}').unwrap_or(&text);
    let mut records: Vec<Vec<String>> = Vec::new();
    let mut record: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();
    while let Some(ch) = chars.next() {
        if in_quotes {
            match ch {
                '"' => {
                    if chars.peek() == Some(&'"') {
                        chars.next();
                        field.push('"');
                    } else {
                        in_quotes = false;
                    }
                }
                _ => field.push(ch),
            }
            continue;
        }
        match ch {
            '"' => in_quotes = true,
            ',' => {
                record.push(std::mem::take(&mut field));
            }
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                record.push(std::mem::take(&mut field));
                records.push(std::mem::take(&mut record));
            }
            '\n' => {
                record.push(std::mem::take(&mut field));
                records.push(std::mem::take(&mut record));
            }
            _ => field.push(ch),
        }
    }
    if in_quotes {
        return Err(anyhow!("unterminated quoted field"));
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        records.push(record);
    }
    // Drop fully empty records (trailing newlines produce them).
    records.retain(|row| row.iter().any(|cell| !cell.trim().is_empty()));

    let mut iter = records.into_iter();
    let headers: Vec<String> = iter
        .next()
        .map(|row| row.into_iter().map(|cell| cell.trim().to_string()).collect())
        .unwrap_or_default();
    let rows: Vec<Vec<Option<String>>> = iter
        .map(|row| {
            let mut cells: Vec<Option<String>> = row
                .into_iter()
                .map(|cell| {
                    let trimmed = cell.trim().to_string();
                    (!trimmed.is_empty()).then_some(trimmed)
                })
                .collect();
            cells.resize(headers.len(), None);
            cells
        })
        .collect();
    Ok(ParsedTable { headers, rows })
}

fn build_metadata(table: &ParsedTable, table_name: &str, filename: &str) -> DatasetMetadata {
    let columns = table
        .headers
        .iter()
        .enumerate()
        .map(|(index, header)| {
            let values: Vec<Option<&str>> = table
                .rows
                .iter()
                .map(|row| row.get(index).and_then(|cell| cell.as_deref()))
                .collect();
            column_meta(header, &values)
        })
        .collect();
    DatasetMetadata {
        original_filename: filename.to_string(),
        table_name: table_name.to_string(),
        row_count: table.rows.len() as i64,
        column_count: table.headers.len() as i64,
        columns,
        upload_timestamp: Utc::now().to_rfc3339(),
    }
}

fn column_meta(name: &str, values: &[Option<&str>]) -> ColumnMeta {
    let present: Vec<&str> = values.iter().flatten().copied().collect();
    let null_count = (values.len() - present.len()) as i64;
    let unique_count = present.iter().collect::<HashSet<_>>().len() as i64;
    let sample_values = present
        .iter()
        .take(SAMPLE_VALUE_COUNT)
        .map(|value| value.to_string())
        .collect();
    ColumnMeta {
        name: name.to_string(),
        sql_type: infer_sql_type(&present).to_string(),
        sample_values,
        null_count,
        unique_count,
    }
}

fn infer_sql_type(values: &[&str]) -> &'static str {
    if values.is_empty() {
        return "TEXT";
    }
    if values.iter().all(|value| is_integer(value)) {
        return "INTEGER";
    }
    if values.iter().all(|value| is_real(value)) {
        return "REAL";
    }
    if values.iter().all(|value| is_datetime(value)) {
        return "DATETIME";
    }
    "TEXT"
}

fn is_integer(value: &str) -> bool {
    value.trim().parse::<i64>().is_ok()
}

fn is_real(value: &str) -> bool {
    let trimmed = value.trim();
    if trimmed.chars().any(|ch| ch.is_ascii_alphabetic() && !matches!(ch, 'e' | 'E')) {
        return false;
    }
    trimmed.parse::<f64>().map(f64::is_finite).unwrap_or(false)
}

fn is_datetime(value: &str) -> bool {
    let trimmed = value.trim();
    DATETIME_FORMATS
        .iter()
        .any(|format| NaiveDateTime::parse_from_str(trimmed, format).is_ok())
        || DATE_FORMATS
            .iter()
            .any(|format| NaiveDate::parse_from_str(trimmed, format).is_ok())
}

fn to_sql_value(cell: Option<&str>, sql_type: &str) -> rusqlite::types::Value {
    use rusqlite::types::Value as SqlValue;
    let Some(text) = cell else {
        return SqlValue::Null;
    };
    match sql_type {
        "INTEGER" => text
            .trim()
            .parse::<i64>()
            .map(SqlValue::Integer)
            .unwrap_or_else(|_| SqlValue::Text(text.to_string())),
        "REAL" => text
            .trim()
            .parse::<f64>()
            .map(SqlValue::Real)
            .unwrap_or_else(|_| SqlValue::Text(text.to_string())),
        _ => SqlValue::Text(text.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_name_sanitization() {
        let name = sanitize_table_name("2024 Sales!.csv");
        assert_eq!(name, "t_2024_sales_");
        assert!(name.len() <= MAX_TABLE_NAME_LEN);
        assert!(name
            .chars()
            .next()
            .is_some_and(|ch| ch.is_ascii_alphabetic() || ch == '_'));

        assert_eq!(sanitize_table_name("Müşteri Listesi.xlsx"), "m__teri_listesi");
        assert_eq!(sanitize_table_name("orders.csv"), "orders");
        let long = format!("{}.csv", "a".repeat(80));
        assert_eq!(sanitize_table_name(&long).len(), MAX_TABLE_NAME_LEN);
    }

    #[test]
    fn csv_parsing_handles_quotes_and_nulls() {
        let raw = "name,note,value\n\"Ali, Veli\",\"said \"\"hi\"\"\",3\nAyşe,,4\n";
        let table = parse_csv(raw.as_bytes()).unwrap();
        assert_eq!(table.headers, vec!["name", "note", "value"]);
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[0][0].as_deref(), Some("Ali, Veli"));
        assert_eq!(table.rows[0][1].as_deref(), Some("said \"hi\""));
        assert_eq!(table.rows[1][1], None);
    }

    #[test]
    fn type_inference() {
        assert_eq!(infer_sql_type(&["1", "2", "-3"]), "INTEGER");
        assert_eq!(infer_sql_type(&["1.5", "2", "3.25"]), "REAL");
        assert_eq!(infer_sql_type(&["2024-01-05", "2024-02-06"]), "DATETIME");
        assert_eq!(infer_sql_type(&["05.01.2024 ", "06.02.2024"]), "DATETIME");
        assert_eq!(infer_sql_type(&["abc", "1"]), "TEXT");
        assert_eq!(infer_sql_type(&[]), "TEXT");
        assert_eq!(infer_sql_type(&["inf", "1.0"]), "TEXT");
    }

    #[test]
    fn upload_roundtrip_and_replacement() {
        let dir = tempfile::tempdir().unwrap();
        let service = DatasetService::new(dir.path()).unwrap();
        let outcome =
            service.process_upload("sales.csv", b"name,value\nA,1\nB,2\n", "session-1");
        assert!(outcome.success, "{}", outcome.message);
        let metadata = outcome.metadata.unwrap();
        assert_eq!(metadata.row_count, 2);
        assert_eq!(metadata.column_count, 2);
        assert_eq!(metadata.table_name, "sales");
        assert_eq!(metadata.columns[1].sql_type, "INTEGER");

        let description = service.generate_schema_description("session-1").unwrap();
        assert!(description.contains("name"));
        assert!(description.contains("value"));

        // A second upload replaces the first dataset entirely.
        let outcome =
            service.process_upload("fiyatlar.csv", b"urun,fiyat\nX,9.5\n", "session-1");
        assert!(outcome.success);
        let metadata = service.metadata("session-1").unwrap();
        assert_eq!(metadata.table_name, "fiyatlar");
        assert_eq!(metadata.row_count, 1);

        assert!(service.delete_dataset("session-1"));
        assert!(!service.has_dataset("session-1"));
        assert!(!service.delete_dataset("session-1"));
    }

    #[test]
    fn rejects_unsupported_and_empty_uploads() {
        let dir = tempfile::tempdir().unwrap();
        let service = DatasetService::new(dir.path()).unwrap();
        let outcome = service.process_upload("notes.txt", b"whatever", "session-1");
        assert!(!outcome.success);
        assert!(outcome.message.contains("Desteklenmeyen"));

        let outcome = service.process_upload("empty.csv", b"", "session-1");
        assert!(!outcome.success);
        assert!(outcome.metadata.is_none());

        let outcome = service.process_upload("header_only.csv", b"a,b\n", "session-1");
        assert!(!outcome.success);
    }

    #[test]
    fn rejects_unsafe_session_ids() {
        let dir = tempfile::tempdir().unwrap();
        let service = DatasetService::new(dir.path()).unwrap();
        let outcome = service.process_upload("x.csv", b"a\n1\n", "../escape");
        assert!(!outcome.success);
        assert!(!service.has_dataset("../escape"));
    }
}
