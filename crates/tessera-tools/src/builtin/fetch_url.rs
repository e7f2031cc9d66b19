use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::debug;

use tessera_core::error::{Result, TesseraError};
use tessera_core::traits::Tool;
use tessera_core::types::{FileKind, NewFile, ToolContext, ToolResult};

use super::{http_client, max_chars_option, truncate_chars};

/// Downloads a URL into the run's files and returns a preview of the body.
pub struct FetchUrlTool {
    timeout_secs: u64,
    max_chars: usize,
}

impl FetchUrlTool {
    pub fn new(timeout_secs: u64, max_chars: usize) -> Self {
        Self {
            timeout_secs,
            max_chars,
        }
    }
}

#[derive(Deserialize)]
struct FetchUrlInput {
    url: String,
}

impl Tool for FetchUrlTool {
    fn name(&self) -> &str {
        "fetchUrl"
    }

    fn timeout_secs(&self) -> u64 {
        self.timeout_secs + 30
    }

    fn description(&self) -> &str {
        "Fetch a URL and keep the response body as a file of this run. Returns the file id and a preview of the content."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "url": {
                    "type": "string",
                    "description": "The URL to fetch"
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
            let params: FetchUrlInput = serde_json::from_value(input)
                .map_err(|e| TesseraError::ToolValidation(e.to_string()))?;

            debug!(url = %params.url, "Fetching URL");

            let client = http_client("fetchUrl", self.timeout_secs)?;
            let resp = client
                .get(&params.url)
                .send()
                .await
                .map_err(|e| TesseraError::ToolExecution {
                    tool: "fetchUrl".to_string(),
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

            let media_type = resp
                .headers()
                .get("content-type")
                .and_then(|v| v.to_str().ok())
                .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());

            let body = resp.bytes().await.map_err(|e| TesseraError::ToolExecution {
                tool: "fetchUrl".to_string(),
                message: format!("Failed to read response body: {}", e),
            })?;

            let is_text = media_type
                .as_deref()
                .map(is_textual)
                .unwrap_or(false);
            let preview = if is_text {
                let text = String::from_utf8_lossy(&body);
                truncate_chars(&text, max_chars_option(&ctx.options, self.max_chars))
            } else {
                String::new()
            };

            let file = ctx
                .store
                .put(NewFile {
                    run_id: ctx.run_id.clone(),
                    node_id: Some(ctx.node_id.clone()),
                    kind: FileKind::External,
                    filename: filename_from_url(&params.url),
                    media_type,
                    data: body.to_vec(),
                    metadata: Some(serde_json::json!({ "url": params.url })),
                })
                .await?;

            let summary = serde_json::json!({
                "fileId": file.id,
                "mediaType": file.media_type,
                "bytes": file.bytes,
                "preview": preview,
            });
            Ok(ToolResult::success(summary.to_string()).with_files(vec![file]))
        })
    }
}

fn is_textual(media_type: &str) -> bool {
    media_type.starts_with("text/")
        || media_type.ends_with("json")
        || media_type.ends_with("xml")
        || media_type == "application/javascript"
}

/// Last non-empty path segment of the URL, without query or fragment.
fn filename_from_url(url: &str) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let path = without_query
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(without_query);
    match path.split_once('/') {
        Some((_, segments)) => segments
            .rsplit('/')
            .find(|s| !s.is_empty())
            .unwrap_or("index.html")
            .to_string(),
        None => "index.html".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filename_from_url() {
        assert_eq!(filename_from_url("https://example.com/a/report.pdf?x=1"), "report.pdf");
        assert_eq!(filename_from_url("https://example.com/docs/"), "docs");
        assert_eq!(filename_from_url("https://example.com"), "index.html");
        assert_eq!(filename_from_url("https://example.com/"), "index.html");
    }

    #[test]
    fn test_is_textual() {
        assert!(is_textual("text/html"));
        assert!(is_textual("application/json"));
        assert!(!is_textual("image/png"));
    }
}
