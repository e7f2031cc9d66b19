//! Scripted model client.
//!
//! Plays back a fixed sequence of turns per node, which makes runs
//! reproducible without a model provider. Script format:
//!
//! ```json
//! {
//!   "classify": [
//!     {"tool_calls": [{"name": "resolveOutput", "input": {"data": {}, "route": "even"}}]}
//!   ],
//!   "summarize": [
//!     {"text": "thinking", "tool_calls": [{"name": "readFile", "input": {"fileId": "f1"}}]},
//!     {"tool_calls": [{"name": "resolveOutput", "input": {"data": {"summary": "ok"}}}]}
//!   ]
//! }
//! ```

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Mutex;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};

use tessera_core::config::ModelConfig;
use tessera_core::error::{Result, TesseraError};
use tessera_core::traits::LlmClient;
use tessera_core::types::{ChatRequest, StopReason, StreamDelta};

/// One scripted model turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScriptedTurn {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ScriptedCall>,
    /// Fail the turn with this message instead of answering.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptedCall {
    pub name: String,
    #[serde(default)]
    pub input: serde_json::Value,
}

impl ScriptedTurn {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn call(name: impl Into<String>, input: serde_json::Value) -> Self {
        Self::default().and_call(name, input)
    }

    /// Shorthand for a `resolveOutput` call.
    pub fn resolve(input: serde_json::Value) -> Self {
        Self::call("resolveOutput", input)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn and_call(mut self, name: impl Into<String>, input: serde_json::Value) -> Self {
        self.tool_calls.push(ScriptedCall {
            name: name.into(),
            input,
        });
        self
    }
}

#[derive(Default)]
struct Script {
    turns: HashMap<String, VecDeque<ScriptedTurn>>,
    calls_made: HashMap<String, usize>,
    requests: Vec<ChatRequest>,
}

/// An [`LlmClient`] that answers from a script keyed by node id.
#[derive(Default)]
pub struct ReplayClient {
    script: Mutex<Script>,
}

impl ReplayClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a turn for a node.
    pub fn turn(self, node_id: impl Into<String>, turn: ScriptedTurn) -> Self {
        self.lock()
            .turns
            .entry(node_id.into())
            .or_default()
            .push_back(turn);
        self
    }

    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        let turns: HashMap<String, Vec<ScriptedTurn>> = serde_json::from_value(value)?;
        let client = Self::new();
        client.lock().turns = turns
            .into_iter()
            .map(|(node, turns)| (node, turns.into_iter().collect()))
            .collect();
        Ok(client)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(serde_json::from_str(&content)?)
    }

    /// Requests received so far, oldest first.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.lock().requests.clone()
    }

    /// Turns not yet played, per node.
    pub fn remaining(&self) -> HashMap<String, usize> {
        self.lock()
            .turns
            .iter()
            .filter(|(_, turns)| !turns.is_empty())
            .map(|(node, turns)| (node.clone(), turns.len()))
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn next_turn(&self, request: ChatRequest) -> Result<Vec<StreamDelta>> {
        let node = request.node_id.clone().unwrap_or_default();
        let mut script = self.lock();
        script.requests.push(request);

        let turn = script
            .turns
            .get_mut(&node)
            .and_then(|turns| turns.pop_front())
            .ok_or_else(|| {
                TesseraError::LlmRequest(format!("replay script has no turn left for node {}", node))
            })?;
        if let Some(message) = turn.error {
            return Err(TesseraError::LlmRequest(message));
        }

        let mut deltas = Vec::new();
        if let Some(text) = turn.text {
            deltas.push(StreamDelta::TextDelta(text));
        }
        let has_calls = !turn.tool_calls.is_empty();
        for (index, call) in turn.tool_calls.into_iter().enumerate() {
            let counter = script.calls_made.entry(node.clone()).or_insert(0);
            *counter += 1;
            deltas.push(StreamDelta::ToolUseStart {
                index,
                id: format!("call_{}_{}", node, counter),
                name: call.name,
            });
            deltas.push(StreamDelta::ToolInputDelta {
                index,
                delta: call.input.to_string(),
            });
        }
        deltas.push(StreamDelta::Stop(if has_calls {
            StopReason::ToolUse
        } else {
            StopReason::EndTurn
        }));
        Ok(deltas)
    }
}

impl LlmClient for ReplayClient {
    fn chat_stream(
        &self,
        _config: &ModelConfig,
        request: ChatRequest,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<StreamDelta>>>> {
        let deltas = self.next_turn(request);
        Box::pin(async move {
            let deltas = deltas?;
            Ok(stream::iter(deltas.into_iter().map(Ok)).boxed())
        })
    }
}
