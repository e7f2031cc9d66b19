use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::StreamExt;
use tracing::{debug, info};

use tessera_core::config::AppConfig;
use tessera_core::error::{Result, TesseraError};
use tessera_core::graph::{Node, RoutingMode};
use tessera_core::traits::{FileStore, LlmClient};
use tessera_core::types::*;
use tessera_tools::{ToolKind, ToolRegistry};

/// A tool declared on a node, resolved to its kind.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeTool {
    pub kind: ToolKind,
    /// Options from the node's tool config (`Null` for bare names).
    pub options: serde_json::Value,
}

/// Input of a model step.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub run_id: RunId,
    pub node: Node,
    /// Targets the node may route to.
    pub route_options: Vec<NodeId>,
    pub tools: Vec<NodeTool>,
    /// The node's transcript so far.
    pub messages: Vec<ChatMessage>,
    pub files: BTreeMap<FileId, FileRef>,
    pub step: usize,
}

/// Why a model step ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    ToolCalls,
}

/// Output of a model step.
#[derive(Debug, Clone)]
pub struct StepResult {
    pub finish_reason: FinishReason,
    /// Messages produced by the step: the assistant turn, followed by a tool
    /// message when some calls were resolved inside the step.
    pub messages: Vec<ChatMessage>,
    pub files: Vec<FileRef>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub input: serde_json::Value,
}

/// Input of a standalone tool call.
#[derive(Debug, Clone)]
pub struct ToolCallContext {
    pub run_id: RunId,
    pub node_id: NodeId,
    pub call: ToolCall,
    pub options: serde_json::Value,
    pub files: BTreeMap<FileId, FileRef>,
}

#[derive(Debug, Clone)]
pub struct ToolCallResult {
    /// A `ContentBlock::ToolResult` answering the call.
    pub tool_result: ContentBlock,
    pub files: Vec<FileRef>,
}

/// Side-effecting work invoked by the node executor.
///
/// Each call is awaited with a timeout and never retried.
pub trait Activities: Send + Sync + 'static {
    fn take_first_step(&self, ctx: StepContext) -> BoxFuture<'_, Result<StepResult>>;

    fn take_followup_step(&self, ctx: StepContext) -> BoxFuture<'_, Result<StepResult>>;

    fn make_tool_call(&self, ctx: ToolCallContext) -> BoxFuture<'_, Result<ToolCallResult>>;
}

/// The `resolveOutput` tool as offered to the model for this node.
pub fn resolve_output_definition(node: &Node, route_options: &[NodeId]) -> ToolDefinition {
    let data_schema = node
        .output_schema
        .clone()
        .unwrap_or_else(|| serde_json::json!({"type": "object"}));

    let mut properties = serde_json::Map::new();
    properties.insert("data".to_string(), data_schema);
    let mut required = vec![serde_json::json!("data")];

    if let Some(routing) = node.effective_routing() {
        if routing.mode == RoutingMode::LlmSwitch && !route_options.is_empty() {
            let described: Vec<String> = route_options
                .iter()
                .map(|to| {
                    let description = routing
                        .routes
                        .iter()
                        .find(|r| &r.to == to)
                        .and_then(|r| r.description.as_deref());
                    match description {
                        Some(d) => format!("{}: {}", to, d),
                        None => to.clone(),
                    }
                })
                .collect();
            let choice = serde_json::json!({"type": "string", "enum": route_options});
            let (key, schema) = if routing.allow_multiple {
                (
                    "routes",
                    serde_json::json!({
                        "type": "array",
                        "items": choice,
                        "description": format!("Next steps to take. Options: {}", described.join("; ")),
                    }),
                )
            } else {
                let mut choice = choice;
                choice["description"] = serde_json::json!(format!(
                    "Next step to take. Options: {}",
                    described.join("; ")
                ));
                ("route", choice)
            };
            properties.insert(key.to_string(), schema);
            if routing.required {
                required.push(serde_json::json!(key));
            }
        }
    }

    ToolDefinition {
        name: ToolKind::ResolveOutput.name().to_string(),
        description: "Finish this step by submitting its result. Call exactly once.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": required,
        }),
    }
}

/// The `collectUserInput` tool definition.
pub fn collect_user_input_definition() -> ToolDefinition {
    ToolDefinition {
        name: ToolKind::CollectUserInput.name().to_string(),
        description: "Ask the user for a piece of information and wait for the answer."
            .to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "name": {
                    "type": "string",
                    "description": "Short identifier of the requested value"
                },
                "prompt": {
                    "type": "string",
                    "description": "Question shown to the user"
                },
                "default": {
                    "description": "Suggested answer"
                }
            },
            "required": ["name", "prompt"]
        }),
    }
}

/// Accumulator for streaming tool call deltas.
#[derive(Debug, Default)]
struct ToolCallAccumulator {
    id: String,
    name: String,
    input_json: String,
}

/// Activities executed in-process against an [`LlmClient`] and the tool
/// registry.
pub struct LocalActivities {
    config: Arc<AppConfig>,
    llm: Arc<dyn LlmClient>,
    tools: Arc<ToolRegistry>,
    store: Arc<dyn FileStore>,
}

impl LocalActivities {
    pub fn new(
        config: Arc<AppConfig>,
        llm: Arc<dyn LlmClient>,
        tools: Arc<ToolRegistry>,
        store: Arc<dyn FileStore>,
    ) -> Self {
        Self {
            config,
            llm,
            tools,
            store,
        }
    }

    fn tool_definitions(&self, ctx: &StepContext) -> Result<Vec<ToolDefinition>> {
        let mut defs = vec![resolve_output_definition(&ctx.node, &ctx.route_options)];
        for tool in &ctx.tools {
            match tool.kind {
                ToolKind::ResolveOutput => {}
                ToolKind::CollectUserInput => defs.push(collect_user_input_definition()),
                kind => defs.push(self.tools.resolve(kind)?.definition()),
            }
        }
        Ok(defs)
    }

    fn tool_context(
        &self,
        run_id: &RunId,
        node_id: &str,
        options: serde_json::Value,
        files: &BTreeMap<FileId, FileRef>,
    ) -> ToolContext {
        ToolContext {
            run_id: run_id.clone(),
            node_id: node_id.to_string(),
            options,
            store: self.store.clone(),
            files: files.clone(),
        }
    }

    async fn step(&self, ctx: StepContext) -> Result<StepResult> {
        let model = self.config.resolve_model(ctx.node.model.as_deref())?;
        let tools = self.tool_definitions(&ctx)?;

        debug!(node_id = %ctx.node.id, step = ctx.step, model = %model.model_id, "Taking model step");

        let request = ChatRequest {
            messages: ctx.messages.clone(),
            tools,
            tool_choice: ToolChoice::Required,
            node_id: Some(ctx.node.id.clone()),
        };
        let mut stream = self.llm.chat_stream(model, request).await?;

        let mut text_content = String::new();
        let mut tool_calls: Vec<ToolCallAccumulator> = Vec::new();
        while let Some(delta) = stream.next().await {
            match delta? {
                StreamDelta::TextDelta(text) => text_content.push_str(&text),
                StreamDelta::ToolUseStart { index, id, name } => {
                    while tool_calls.len() <= index {
                        tool_calls.push(ToolCallAccumulator::default());
                    }
                    tool_calls[index].id = id;
                    tool_calls[index].name = name;
                }
                StreamDelta::ToolInputDelta { index, delta } => {
                    if let Some(tc) = tool_calls.get_mut(index) {
                        tc.input_json.push_str(&delta);
                    }
                }
                StreamDelta::Usage {
                    input_tokens,
                    output_tokens,
                } => {
                    debug!(node_id = %ctx.node.id, input_tokens, output_tokens, "Model usage");
                }
                StreamDelta::Stop(_) => {}
            }
        }
        drop(stream);

        let mut calls = Vec::with_capacity(tool_calls.len());
        for tc in tool_calls {
            let input = if tc.input_json.trim().is_empty() {
                serde_json::json!({})
            } else {
                serde_json::from_str(&tc.input_json).map_err(|e| {
                    TesseraError::LlmParse(format!("tool input for {}: {}", tc.name, e))
                })?
            };
            calls.push(ToolCall {
                id: tc.id,
                name: tc.name,
                input,
            });
        }

        let mut content = Vec::new();
        if !text_content.is_empty() {
            content.push(ContentBlock::Text { text: text_content });
        }
        for call in &calls {
            content.push(ContentBlock::ToolUse {
                id: call.id.clone(),
                name: call.name.clone(),
                input: call.input.clone(),
            });
        }
        let assistant = ChatMessage {
            role: Role::Assistant,
            content,
            timestamp: Some(chrono::Utc::now()),
        };

        if calls.is_empty() {
            return Ok(StepResult {
                finish_reason: FinishReason::Stop,
                messages: vec![assistant],
                files: Vec::new(),
            });
        }

        // Tools that resolve inside the step run here, in call order.
        let mut results = Vec::new();
        let mut files = Vec::new();
        for call in &calls {
            let Some(declared) = ctx.tools.iter().find(|t| t.kind.name() == call.name) else {
                continue;
            };
            if declared.kind.is_intrinsic() {
                continue;
            }
            let tool = self.tools.resolve(declared.kind)?;
            if !tool.auto_resolve() {
                continue;
            }
            info!(node_id = %ctx.node.id, tool = %call.name, "Resolving tool call in step");
            let tool_ctx = self.tool_context(
                &ctx.run_id,
                &ctx.node.id,
                declared.options.clone(),
                &ctx.files,
            );
            let result = self
                .tools
                .execute(&call.name, call.input.clone(), tool_ctx)
                .await?;
            results.push(ContentBlock::ToolResult {
                tool_use_id: call.id.clone(),
                content: result.content,
                is_error: result.is_error,
            });
            files.extend(result.files);
        }

        let mut messages = vec![assistant];
        if !results.is_empty() {
            messages.push(ChatMessage::tool_results(results));
        }
        Ok(StepResult {
            finish_reason: FinishReason::ToolCalls,
            messages,
            files,
        })
    }
}

impl Activities for LocalActivities {
    fn take_first_step(&self, ctx: StepContext) -> BoxFuture<'_, Result<StepResult>> {
        Box::pin(self.step(ctx))
    }

    fn take_followup_step(&self, ctx: StepContext) -> BoxFuture<'_, Result<StepResult>> {
        Box::pin(self.step(ctx))
    }

    fn make_tool_call(&self, ctx: ToolCallContext) -> BoxFuture<'_, Result<ToolCallResult>> {
        Box::pin(async move {
            info!(node_id = %ctx.node_id, tool = %ctx.call.name, "Making tool call");
            let tool_ctx = self.tool_context(&ctx.run_id, &ctx.node_id, ctx.options, &ctx.files);
            let result = self
                .tools
                .execute(&ctx.call.name, ctx.call.input, tool_ctx)
                .await?;
            Ok(ToolCallResult {
                tool_result: ContentBlock::ToolResult {
                    tool_use_id: ctx.call.id,
                    content: result.content,
                    is_error: result.is_error,
                },
                files: result.files,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tessera_core::graph::{NodeKind, Route, Routing};

    #[test]
    fn test_resolve_output_without_routing() {
        let node = Node::new("n", NodeKind::Llm, "n")
            .with_output_schema(json!({"type": "object", "properties": {"x": {"type": "number"}}}));
        let def = resolve_output_definition(&node, &["next".to_string()]);
        assert_eq!(def.name, "resolveOutput");
        assert_eq!(def.input_schema["required"], json!(["data"]));
        assert_eq!(def.input_schema["properties"]["data"]["properties"]["x"]["type"], "number");
        assert!(def.input_schema["properties"].get("route").is_none());
    }

    #[test]
    fn test_resolve_output_single_route() {
        let node = Node::new("r", NodeKind::Router, "r");
        let options = vec!["even".to_string(), "odd".to_string()];
        let def = resolve_output_definition(&node, &options);
        assert_eq!(def.input_schema["properties"]["route"]["enum"], json!(["even", "odd"]));
        assert_eq!(def.input_schema["required"], json!(["data", "route"]));
    }

    #[test]
    fn test_resolve_output_multiple_optional_routes() {
        let node = Node::new("r", NodeKind::Llm, "r").with_routing(Routing {
            allow_multiple: true,
            required: false,
            routes: vec![Route {
                to: "a".into(),
                description: Some("first".into()),
            }],
            ..Default::default()
        });
        let def = resolve_output_definition(&node, &["a".to_string()]);
        let routes = &def.input_schema["properties"]["routes"];
        assert_eq!(routes["type"], "array");
        assert!(routes["description"].as_str().unwrap().contains("a: first"));
        assert_eq!(def.input_schema["required"], json!(["data"]));
    }

    #[test]
    fn test_broadcast_has_no_route_field() {
        let node = Node::new("b", NodeKind::Llm, "b").with_routing(Routing {
            mode: RoutingMode::Broadcast,
            ..Default::default()
        });
        let def = resolve_output_definition(&node, &["x".to_string()]);
        assert!(def.input_schema["properties"].get("route").is_none());
    }
}
