use futures::future::BoxFuture;
use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use tessera_core::error::{Result, TesseraError};
use tessera_core::traits::Tool;
use tessera_core::types::{ToolContext, ToolResult};

use super::{http_client, max_chars_option, truncate_chars};

/// Fetches a URL and returns its readable text.
pub struct ExtractUrlTextTool {
    timeout_secs: u64,
    max_chars: usize,
}

impl ExtractUrlTextTool {
    pub fn new(timeout_secs: u64, max_chars: usize) -> Self {
        Self {
            timeout_secs,
            max_chars,
        }
    }
}

#[derive(Deserialize)]
struct ExtractUrlTextInput {
    url: String,
}

impl Tool for ExtractUrlTextTool {
    fn name(&self) -> &str {
        "extractUrlText"
    }

    fn timeout_secs(&self) -> u64 {
        self.timeout_secs + 30
    }

    fn description(&self) -> &str {
        "Fetch a web page and return its text with HTML tags, scripts and styles removed."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "The URL of the page"
                }
            },
            "required": ["url"]
        })
    }

    fn execute(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let params: ExtractUrlTextInput = serde_json::from_value(input)
                .map_err(|e| TesseraError::ToolValidation(e.to_string()))?;

            debug!(url = %params.url, "Extracting URL text");

            let client = http_client("extractUrlText", self.timeout_secs)?;
            let resp = client
                .get(&params.url)
                .send()
                .await
                .map_err(|e| TesseraError::ToolExecution {
                    tool: "extractUrlText".to_string(),
                    message: format!("Request failed: {}", e),
                })?;

            let status = resp.status();
            if !status.is_success() {
                return Ok(ToolResult::error(format!(
                    "HTTP {} {}",
                    status.as_u16(),
                    status.canonical_reason().unwrap_or("Unknown")
                )));
            }

            let content_type = resp
                .headers()
                .get("content-type")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();

            let body = resp.text().await.map_err(|e| TesseraError::ToolExecution {
                tool: "extractUrlText".to_string(),
                message: format!("Failed to read response body: {}", e),
            })?;

            let text = if content_type.contains("html") {
                strip_html_tags(&body)?
            } else {
                body
            };

            let max_chars = max_chars_option(&ctx.options, self.max_chars);
            Ok(ToolResult::success(truncate_chars(&text, max_chars)))
        })
    }
}

fn pattern(re: &str) -> Result<Regex> {
    Regex::new(re).map_err(|e| TesseraError::ToolExecution {
        tool: "extractUrlText".to_string(),
        message: e.to_string(),
    })
}

/// Basic HTML tag stripping using regex.
pub(crate) fn strip_html_tags(html: &str) -> Result<String> {
    // Remove script and style blocks entirely
    let cleaned = pattern(r"(?is)<script[^>]*>.*?</script>")?.replace_all(html, "");
    let cleaned = pattern(r"(?is)<style[^>]*>.*?</style>")?.replace_all(&cleaned, "");

    let text = pattern(r"<[^>]+>")?.replace_all(&cleaned, "");

    let text = text
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&#39;", "'")
        .replace("&nbsp;", " ");

    let text = pattern(r"\n{3,}")?.replace_all(&text, "\n\n");
    Ok(text.trim().to_string())
}
