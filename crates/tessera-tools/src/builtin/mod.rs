pub mod create_file;
pub mod extract_url_text;
pub mod fetch_url;
pub mod read_file;

use tessera_core::error::{Result, TesseraError};

pub use create_file::CreateFileTool;
pub use extract_url_text::ExtractUrlTextTool;
pub use fetch_url::FetchUrlTool;
pub use read_file::ReadFileTool;

/// Cut `text` to at most `max_chars` characters, noting the cut.
pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => format!("{}\n\n[truncated at {} chars]", &text[..end], max_chars),
        None => text.to_string(),
    }
}

/// Per-node `maxChars` option, falling back to the configured limit.
pub(crate) fn max_chars_option(options: &serde_json::Value, default: usize) -> usize {
    options
        .get("maxChars")
        .and_then(|v| v.as_u64())
        .map(|v| v as usize)
        .unwrap_or(default)
}

pub(crate) fn http_client(tool: &str, timeout_secs: u64) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .user_agent(concat!("Tessera/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| TesseraError::ToolExecution {
            tool: tool.to_string(),
            message: format!("Failed to create HTTP client: {}", e),
        })
}
