use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{try_join_all, BoxFuture};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use tessera_core::config::EngineConfig;
use tessera_core::error::{Result, TesseraError};
use tessera_core::graph::{route_skips, Edge, Node, NodeKind, RoutingMode};
use tessera_core::state::NeededInput;
use tessera_core::types::*;
use tessera_tools::ToolKind;

use crate::activities::{
    Activities, FinishReason, NodeTool, StepContext, ToolCall, ToolCallContext, ToolCallResult,
};
use crate::template;

/// Instructions used when a node declares none.
const DEFAULT_INSTRUCTIONS: [&str; 3] = [
    "You are ${node.name}, one step in a larger workflow.${node.intent ? ' Your goal: ' + node.intent : ''} Call resolveOutput exactly once with your result.",
    "${prompt ?? ''}",
    "${inputs.length ? 'Inputs from previous steps: ' + inputs : ''}",
];

/// Everything a node needs to run, captured at dispatch.
#[derive(Debug, Clone)]
pub struct NodeTask {
    pub run_id: RunId,
    pub node: Node,
    /// Outputs of the direct predecessors in edge order; `Null` for skipped ones.
    pub inputs: Vec<Value>,
    pub outgoing: Vec<Edge>,
    pub prompt: Option<String>,
    pub files: BTreeMap<FileId, FileRef>,
}

/// Result of a finished node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeOutcome {
    pub output: Value,
    /// Outgoing targets the node routed away from.
    pub skip: Vec<NodeId>,
}

/// What a running node reports back to its scheduler.
#[derive(Debug)]
pub enum NodeEvent {
    Transcript {
        node_id: NodeId,
        messages: Vec<ChatMessage>,
    },
    Files(Vec<FileRef>),
    NeedInput {
        request: NeededInput,
        reply: oneshot::Sender<Value>,
    },
}

/// A node's handle for reporting to its scheduler.
#[derive(Debug, Clone)]
pub struct NodeEvents {
    node_id: NodeId,
    tx: mpsc::UnboundedSender<NodeEvent>,
}

impl NodeEvents {
    pub fn new(node_id: impl Into<NodeId>, tx: mpsc::UnboundedSender<NodeEvent>) -> Self {
        Self {
            node_id: node_id.into(),
            tx,
        }
    }

    pub fn transcript(&self, messages: Vec<ChatMessage>) {
        if messages.is_empty() {
            return;
        }
        // A closed channel means the run is over and nobody reads the transcript.
        let _ = self.tx.send(NodeEvent::Transcript {
            node_id: self.node_id.clone(),
            messages,
        });
    }

    pub fn files(&self, files: Vec<FileRef>) {
        if !files.is_empty() {
            let _ = self.tx.send(NodeEvent::Files(files));
        }
    }

    /// Ask for human input and wait for the answer.
    pub async fn need_input(
        &self,
        name: impl Into<String>,
        prompt: impl Into<String>,
        default: Option<Value>,
    ) -> Result<Value> {
        let request = NeededInput {
            name: name.into(),
            prompt: prompt.into(),
            default,
            node_id: self.node_id.clone(),
        };
        let name = request.name.clone();
        let (reply, answer) = oneshot::channel();
        self.tx
            .send(NodeEvent::NeedInput { request, reply })
            .map_err(|_| TesseraError::ExecutionTerminated(self.node_id.clone()))?;
        answer.await.map_err(|_| {
            TesseraError::ExecutionTerminated(format!(
                "input {} for node {} was abandoned",
                name, self.node_id
            ))
        })
    }
}

#[derive(Deserialize)]
struct CollectUserInput {
    name: String,
    prompt: String,
    #[serde(default)]
    default: Option<Value>,
}

/// Runs one node: a bounded loop of model steps and tool calls that ends
/// when the model resolves an output.
pub struct NodeExecutor {
    activities: Arc<dyn Activities>,
    max_steps: usize,
    activity_timeout: Duration,
}

impl NodeExecutor {
    pub fn new(activities: Arc<dyn Activities>, config: &EngineConfig) -> Self {
        Self {
            activities,
            max_steps: config.max_steps,
            activity_timeout: Duration::from_secs(config.activity_timeout_secs),
        }
    }

    pub async fn run(&self, task: NodeTask, events: NodeEvents) -> Result<NodeOutcome> {
        info!(node_id = %task.node.id, kind = ?task.node.kind, "Running node");
        if task.node.kind == NodeKind::Input {
            return run_input(&task, &events).await;
        }

        let tools = declared_tools(&task.node)?;
        let outgoing: Vec<&Edge> = task.outgoing.iter().collect();
        let route_options = task.node.route_options(&outgoing);
        let mut files = task.files.clone();

        let mut messages = initial_messages(&task)?;
        events.transcript(messages.clone());

        for step in 0..self.max_steps {
            let ctx = StepContext {
                run_id: task.run_id.clone(),
                node: task.node.clone(),
                route_options: route_options.clone(),
                tools: tools.clone(),
                messages: messages.clone(),
                files: files.clone(),
                step,
            };
            let result = if step == 0 {
                self.timed("takeFirstStep", self.activities.take_first_step(ctx))
                    .await?
            } else {
                self.timed("takeFollowupStep", self.activities.take_followup_step(ctx))
                    .await?
            };
            debug!(node_id = %task.node.id, step, finish = ?result.finish_reason, "Step finished");

            messages.extend(result.messages.iter().cloned());
            events.transcript(result.messages.clone());
            record_files(&mut files, &events, result.files);

            if result.finish_reason == FinishReason::Stop {
                let text = result
                    .messages
                    .last()
                    .map(|m| m.text())
                    .unwrap_or_default();
                info!(node_id = %task.node.id, step, "Node finished without resolving");
                return Ok(NodeOutcome {
                    output: Value::String(text),
                    skip: Vec::new(),
                });
            }

            let calls = open_calls(&result.messages);

            if let Some(call) = calls
                .iter()
                .find(|c| c.name == ToolKind::ResolveOutput.name())
            {
                return resolve_output(&task, &route_options, &call.input);
            }
            if calls.is_empty() {
                continue;
            }

            let results = try_join_all(
                calls
                    .iter()
                    .map(|call| self.handle_call(&task, &tools, &files, &events, call)),
            )
            .await?;

            let mut blocks = Vec::with_capacity(results.len());
            let mut created = Vec::new();
            for result in results {
                blocks.push(result.tool_result);
                created.extend(result.files);
            }
            let message = ChatMessage::tool_results(blocks);
            events.transcript(vec![message.clone()]);
            messages.push(message);
            record_files(&mut files, &events, created);
        }

        Err(TesseraError::MaxStepsExceeded(self.max_steps))
    }

    async fn handle_call(
        &self,
        task: &NodeTask,
        tools: &[NodeTool],
        files: &BTreeMap<FileId, FileRef>,
        events: &NodeEvents,
        call: &ToolCall,
    ) -> Result<ToolCallResult> {
        let declared = tools
            .iter()
            .find(|t| t.kind.name() == call.name)
            .ok_or_else(|| TesseraError::ToolNotFound(call.name.clone()))?;

        match declared.kind {
            ToolKind::CollectUserInput => {
                let request: CollectUserInput = serde_json::from_value(call.input.clone())
                    .map_err(|e| TesseraError::ToolValidation(e.to_string()))?;
                let value = events
                    .need_input(request.name, request.prompt, request.default)
                    .await?;
                Ok(ToolCallResult {
                    tool_result: ContentBlock::ToolResult {
                        tool_use_id: call.id.clone(),
                        content: template::stringify(&value),
                        is_error: false,
                    },
                    files: Vec::new(),
                })
            }
            _ => {
                let ctx = ToolCallContext {
                    run_id: task.run_id.clone(),
                    node_id: task.node.id.clone(),
                    call: call.clone(),
                    options: declared.options.clone(),
                    files: files.clone(),
                };
                self.timed("makeToolCall", self.activities.make_tool_call(ctx))
                    .await
            }
        }
    }

    async fn timed<T>(&self, activity: &str, fut: BoxFuture<'_, Result<T>>) -> Result<T> {
        tokio::time::timeout(self.activity_timeout, fut)
            .await
            .map_err(|_| TesseraError::ActivityTimeout {
                activity: activity.to_string(),
                timeout_secs: self.activity_timeout.as_secs(),
            })?
    }
}

/// Input nodes take the run prompt, or ask for one.
async fn run_input(task: &NodeTask, events: &NodeEvents) -> Result<NodeOutcome> {
    let prompt = match task.prompt.as_deref().filter(|p| !p.is_empty()) {
        Some(prompt) => Value::String(prompt.to_string()),
        None => {
            let question = task
                .node
                .intent
                .clone()
                .unwrap_or_else(|| task.node.name.clone());
            events.need_input("prompt", question, None).await?
        }
    };
    Ok(NodeOutcome {
        output: serde_json::json!({ "prompt": prompt }),
        skip: Vec::new(),
    })
}

fn declared_tools(node: &Node) -> Result<Vec<NodeTool>> {
    let mut tools: Vec<NodeTool> = Vec::new();
    for spec in &node.tools {
        let kind = ToolKind::parse(spec.name())?;
        if kind == ToolKind::ResolveOutput || tools.iter().any(|t| t.kind == kind) {
            continue;
        }
        tools.push(NodeTool {
            kind,
            options: spec.options(),
        });
    }
    Ok(tools)
}

/// System message from the first instruction, one user part per remaining
/// non-empty instruction.
fn initial_messages(task: &NodeTask) -> Result<Vec<ChatMessage>> {
    let ctx = serde_json::json!({
        "node": serde_json::to_value(&task.node)?,
        "inputs": task.inputs,
        "prompt": task.prompt,
        "files": task.files.values().collect::<Vec<_>>(),
        "transcript": [],
    });

    let templates: Vec<&str> = if task.node.instructions.is_empty() {
        DEFAULT_INSTRUCTIONS.to_vec()
    } else {
        task.node.instructions.iter().map(String::as_str).collect()
    };

    let mut rendered = templates
        .into_iter()
        .map(|t| template::render(t, &ctx))
        .collect::<Result<Vec<String>>>()?
        .into_iter();

    let mut messages = vec![ChatMessage::system(rendered.next().unwrap_or_default())];
    let parts: Vec<String> = rendered.filter(|p| !p.trim().is_empty()).collect();
    if !parts.is_empty() {
        messages.push(ChatMessage::user_parts(parts));
    }
    Ok(messages)
}

/// Tool calls of the step's assistant turn that the step did not answer.
fn open_calls(messages: &[ChatMessage]) -> Vec<ToolCall> {
    let answered: HashSet<&str> = messages
        .iter()
        .flat_map(|m| m.tool_result_ids())
        .collect();
    messages
        .iter()
        .filter(|m| m.role == Role::Assistant)
        .flat_map(|m| m.tool_uses())
        .filter(|(id, _, _)| !answered.contains(id))
        .map(|(id, name, input)| ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            input: input.clone(),
        })
        .collect()
}

fn record_files(
    files: &mut BTreeMap<FileId, FileRef>,
    events: &NodeEvents,
    created: Vec<FileRef>,
) {
    for file in &created {
        files.insert(file.id.clone(), file.clone());
    }
    events.files(created);
}

fn resolve_output(task: &NodeTask, route_options: &[NodeId], input: &Value) -> Result<NodeOutcome> {
    let data = input.get("data").cloned().unwrap_or(Value::Null);
    if let Some(schema) = &task.node.output_schema {
        validate_output(schema, &data)?;
    }
    check_routes(&task.node, route_options, input)?;

    let outgoing: Vec<&Edge> = task.outgoing.iter().collect();
    let skip = route_skips(&task.node, input, &outgoing);
    info!(node_id = %task.node.id, skipped = ?skip, "Node resolved output");
    Ok(NodeOutcome {
        output: input.clone(),
        skip,
    })
}

fn validate_output(schema: &Value, data: &Value) -> Result<()> {
    let compiled = jsonschema::JSONSchema::compile(schema)
        .map_err(|e| TesseraError::SchemaValidation(format!("invalid output schema: {}", e)))?;
    if let Err(errors) = compiled.validate(data) {
        let messages: Vec<String> = errors.map(|e| e.to_string()).collect();
        return Err(TesseraError::SchemaValidation(messages.join("; ")));
    }
    Ok(())
}

/// Selected routes must be among the options, and present when required.
fn check_routes(node: &Node, route_options: &[NodeId], input: &Value) -> Result<()> {
    let Some(routing) = node.effective_routing() else {
        return Ok(());
    };
    if routing.mode != RoutingMode::LlmSwitch || route_options.is_empty() {
        return Ok(());
    }

    let mut selected: Vec<&str> = Vec::new();
    if let Some(route) = input.get("route").and_then(|v| v.as_str()) {
        selected.push(route);
    }
    if let Some(routes) = input.get("routes").and_then(|v| v.as_array()) {
        selected.extend(routes.iter().filter_map(|v| v.as_str()));
    }

    if let Some(unknown) = selected
        .iter()
        .find(|r| !route_options.iter().any(|o| o == *r))
    {
        return Err(TesseraError::SchemaValidation(format!(
            "unknown route {}; options are {}",
            unknown,
            route_options.join(", ")
        )));
    }
    if routing.required && selected.is_empty() {
        return Err(TesseraError::SchemaValidation(format!(
            "node {} must select a route",
            node.id
        )));
    }
    Ok(())
}
