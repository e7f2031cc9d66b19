use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::debug;

use tessera_core::error::{Result, TesseraError};
use tessera_core::traits::Tool;
use tessera_core::types::{FileKind, NewFile, ToolContext, ToolResult};

/// Stores generated content as a file of the run.
///
/// Runs inside the model step so large payloads are not sent back through
/// a separate tool call.
pub struct CreateFileTool;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateFileInput {
    filename: String,
    content: String,
    #[serde(default)]
    media_type: Option<String>,
}

impl Tool for CreateFileTool {
    fn name(&self) -> &str {
        "createFile"
    }

    fn description(&self) -> &str {
        "Create a file with the given content. Returns the id of the new file."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "filename": {
                    "type": "string",
                    "description": "Name of the file, including its extension"
                },
                "content": {
                    "type": "string",
                    "description": "Text content of the file"
                },
                "mediaType": {
                    "type": "string",
                    "description": "Media type; guessed from the filename when omitted"
                }
            },
            "required": ["filename", "content"]
        })
    }

    fn auto_resolve(&self) -> bool {
        true
    }

    fn execute(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let params: CreateFileInput = serde_json::from_value(input)
                .map_err(|e| TesseraError::ToolValidation(e.to_string()))?;

            debug!(filename = %params.filename, node_id = %ctx.node_id, "Creating file");

            let file = ctx
                .store
                .put(NewFile {
                    run_id: ctx.run_id.clone(),
                    node_id: Some(ctx.node_id.clone()),
                    kind: FileKind::Generated,
                    filename: params.filename,
                    media_type: params.media_type,
                    data: params.content.into_bytes(),
                    metadata: None,
                })
                .await
                .map_err(|e| TesseraError::ToolExecution {
                    tool: "createFile".to_string(),
                    message: e.to_string(),
                })?;

            let summary = serde_json::json!({
                "fileId": file.id,
                "filename": file.filename,
                "mediaType": file.media_type,
                "bytes": file.bytes,
            });
            Ok(ToolResult::success(summary.to_string()).with_files(vec![file]))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::context;

    #[tokio::test]
    async fn test_create_file() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let result = CreateFileTool
            .execute(
                serde_json::json!({"filename": "poem.txt", "content": "roses"}),
                ctx,
            )
            .await
            .unwrap();

        assert!(!result.is_error);
        assert_eq!(result.files.len(), 1);
        let file = &result.files[0];
        assert_eq!(file.node_id.as_deref(), Some("writer"));
        assert_eq!(file.kind, FileKind::Generated);

        let summary: serde_json::Value = serde_json::from_str(&result.content).unwrap();
        assert_eq!(summary["fileId"], serde_json::json!(file.id));
    }

    #[tokio::test]
    async fn test_create_file_rejects_bad_input() {
        let dir = tempfile::tempdir().unwrap();
        let result = CreateFileTool
            .execute(serde_json::json!({"filename": "x.txt"}), context(dir.path()))
            .await;
        assert!(matches!(result, Err(TesseraError::ToolValidation(_))));
    }
}
