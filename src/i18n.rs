// User-facing message catalog; the product speaks Turkish by default.
use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

const TR_TR: &[(&str, &str)] = &[
    ("banner", "AI SQL Agent API çalışıyor."),
    ("error.generic", "Bir hata oluştu."),
    ("error.session_id_required", "session_id gerekli"),
    ("error.filename_missing", "Dosya adı bulunamadı"),
    (
        "upload.unsupported_format",
        "Desteklenmeyen dosya formatı. Lütfen CSV veya Excel dosyası yükleyin.",
    ),
    ("upload.empty_file", "Dosya boş veya okunamadı."),
    ("upload.parse_failed", "Dosya boş veya hatalı formatta."),
    (
        "upload.process_failed",
        "Dosya işlenirken hata oluştu: {error}",
    ),
    (
        "upload.success",
        "Dosya başarıyla yüklendi. Tablo adı: {table}",
    ),
    ("database.deleted", "Veritabanı başarıyla silindi"),
    ("database.not_found", "Veritabanı bulunamadı"),
    (
        "sql.not_select",
        "Güvenlik nedeniyle reddedildi: yalnızca SELECT sorgularına izin verilir.",
    ),
    (
        "sql.blocked_keyword",
        "Güvenlik nedeniyle reddedildi: sorgu yasaklı '{keyword}' anahtar kelimesini içeriyor.",
    ),
    ("sql.success", "Sorgu başarıyla çalıştırıldı."),
    ("sql.failed", "Sorgu çalıştırılırken hata oluştu: {error}"),
    ("sql.no_rows", "Sorgu sonuç döndürmedi."),
    ("sql.more_rows", "... ({count} satır daha)"),
    (
        "chart.trailer",
        "(Aşağıda {title} grafiği görüntülenmektedir)",
    ),
    ("chart.default_title", "Grafik"),
    ("chart.tool_error", "Chart verisi oluşturulurken hata: {error}"),
];

const EN_US: &[(&str, &str)] = &[
    ("banner", "AI SQL Agent API is running."),
    ("error.generic", "An error occurred."),
    ("error.session_id_required", "session_id is required"),
    ("error.filename_missing", "File name not found"),
    (
        "upload.unsupported_format",
        "Unsupported file format. Please upload a CSV or Excel file.",
    ),
    ("upload.empty_file", "The file is empty or unreadable."),
    ("upload.parse_failed", "The file is empty or malformed."),
    (
        "upload.process_failed",
        "An error occurred while processing the file: {error}",
    ),
    ("upload.success", "File uploaded successfully. Table name: {table}"),
    ("database.deleted", "Database deleted successfully"),
    ("database.not_found", "Database not found"),
    (
        "sql.not_select",
        "Rejected for security reasons: only SELECT queries are allowed.",
    ),
    (
        "sql.blocked_keyword",
        "Rejected for security reasons: the query contains the forbidden keyword '{keyword}'.",
    ),
    ("sql.success", "Query executed successfully."),
    ("sql.failed", "An error occurred while executing the query: {error}"),
    ("sql.no_rows", "The query returned no results."),
    ("sql.more_rows", "... ({count} more rows)"),
    ("chart.trailer", "(The {title} chart is displayed below)"),
    ("chart.default_title", "Chart"),
    (
        "chart.tool_error",
        "An error occurred while building chart data: {error}",
    ),
];

struct I18nState {
    default_language: String,
    messages: HashMap<String, HashMap<String, String>>,
}

impl I18nState {
    fn new() -> Self {
        let mut messages = HashMap::new();
        messages.insert("tr-TR".to_string(), to_map(TR_TR));
        messages.insert("en-US".to_string(), to_map(EN_US));
        Self {
            default_language: "tr-TR".to_string(),
            messages,
        }
    }
}

fn to_map(entries: &[(&str, &str)]) -> HashMap<String, String> {
    entries
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect()
}

static I18N_STATE: OnceLock<RwLock<I18nState>> = OnceLock::new();

fn state() -> &'static RwLock<I18nState> {
    I18N_STATE.get_or_init(|| RwLock::new(I18nState::new()))
}

/// Aligns the default language with the configuration file.
pub fn configure_i18n(default_language: &str) {
    let cleaned = normalize_language(default_language);
    if cleaned.is_empty() {
        return;
    }
    let mut guard = state().write().expect("i18n state poisoned");
    if guard.messages.contains_key(&cleaned) {
        guard.default_language = cleaned;
    }
}

/// Looks up a message key in the default language, falling back to
/// English and then to the key itself.
pub fn t(key: &str) -> String {
    let guard = state().read().expect("i18n state poisoned");
    if let Some(table) = guard.messages.get(&guard.default_language) {
        if let Some(value) = table.get(key) {
            return value.clone();
        }
    }
    if let Some(table) = guard.messages.get("en-US") {
        if let Some(value) = table.get(key) {
            return value.clone();
        }
    }
    key.to_string()
}

fn normalize_language(raw: &str) -> String {
    match raw.trim().to_lowercase().as_str() {
        "tr" | "tr-tr" => "tr-TR".to_string(),
        "en" | "en-us" => "en-US".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_language_is_turkish() {
        assert_eq!(t("error.generic"), "Bir hata oluştu.");
    }

    #[test]
    fn unknown_key_passes_through() {
        assert_eq!(t("no.such.key"), "no.such.key");
    }

    #[test]
    fn catalogs_cover_the_same_keys() {
        let tr: std::collections::HashSet<_> = TR_TR.iter().map(|(k, _)| *k).collect();
        let en: std::collections::HashSet<_> = EN_US.iter().map(|(k, _)| *k).collect();
        assert_eq!(tr, en);
    }
}
