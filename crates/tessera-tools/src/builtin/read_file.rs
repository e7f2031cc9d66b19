use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::debug;

use tessera_core::error::{Result, TesseraError};
use tessera_core::traits::Tool;
use tessera_core::types::{ToolContext, ToolResult};

use super::{max_chars_option, truncate_chars};

/// Reads a file of the run by id.
pub struct ReadFileTool {
    max_chars: usize,
}

impl ReadFileTool {
    pub fn new(max_chars: usize) -> Self {
        Self { max_chars }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadFileInput {
    file_id: String,
}

impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "readFile"
    }

    fn description(&self) -> &str {
        "Read the text content of a file produced earlier in this run, by file id."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "fileId": {
                    "type": "string",
                    "description": "Id of the file to read"
                }
            },
            "required": ["fileId"]
        })
    }

    fn execute(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let params: ReadFileInput = serde_json::from_value(input)
                .map_err(|e| TesseraError::ToolValidation(e.to_string()))?;

            let Some(file) = ctx.files.get(&params.file_id) else {
                return Ok(ToolResult::error(format!(
                    "No file with id {} in this run",
                    params.file_id
                )));
            };
            debug!(file_id = %file.id, filename = %file.filename, "Reading file");

            let data = ctx.store.read(file).await.map_err(|e| TesseraError::ToolExecution {
                tool: "readFile".to_string(),
                message: format!("{}: {}", file.filename, e),
            })?;

            let text = String::from_utf8_lossy(&data);
            let max_chars = max_chars_option(&ctx.options, self.max_chars);
            Ok(ToolResult::success(truncate_chars(&text, max_chars)))
        })
    }
}
