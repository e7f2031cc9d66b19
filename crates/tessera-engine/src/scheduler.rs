use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use tessera_core::error::{Result, TesseraError};
use tessera_core::graph::{is_skipped, Graph};
use tessera_core::state::{
    NeededInput, NodeStatus, ProvidedInput, RunState, TranscriptEntry,
};
use tessera_core::types::{FileId, FileRef, NodeId};

use crate::broker::InputBroker;
use crate::executor::{NodeEvent, NodeEvents, NodeExecutor, NodeOutcome, NodeTask};
use crate::template;

/// Overall state of an execution as seen by its host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
}

/// Signals and queries accepted by a running scheduler.
#[derive(Debug)]
pub enum Command {
    ReceiveInput(Vec<ProvidedInput>),
    NeededInput(oneshot::Sender<Vec<NeededInput>>),
    NodeStatuses(oneshot::Sender<BTreeMap<NodeId, NodeStatus>>),
    NodeOutput(NodeId, oneshot::Sender<Option<Value>>),
    Transcripts(usize, oneshot::Sender<Vec<TranscriptEntry>>),
    Files(oneshot::Sender<BTreeMap<FileId, FileRef>>),
    State(oneshot::Sender<RunState>),
}

type InFlight = FuturesUnordered<BoxFuture<'static, (NodeId, Result<NodeOutcome>)>>;

/// Drives one run.
///
/// The scheduler task is the only writer of the run state. Nodes execute
/// concurrently and report through an event channel; signals and queries
/// arrive on a command channel and are served from the same loop.
pub struct Scheduler {
    graph: Arc<Graph>,
    executor: Arc<NodeExecutor>,
    state: RunState,
    broker: InputBroker,
    dispatched: HashSet<NodeId>,
    events_tx: mpsc::UnboundedSender<NodeEvent>,
    events_rx: mpsc::UnboundedReceiver<NodeEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    status: watch::Sender<ExecutionStatus>,
}

impl Scheduler {
    pub fn new(
        graph: Arc<Graph>,
        executor: Arc<NodeExecutor>,
        state: RunState,
    ) -> (
        Self,
        mpsc::UnboundedSender<Command>,
        watch::Receiver<ExecutionStatus>,
    ) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (status, status_rx) = watch::channel(ExecutionStatus::Running);
        let scheduler = Self {
            graph,
            executor,
            state,
            broker: InputBroker::new(),
            dispatched: HashSet::new(),
            events_tx,
            events_rx,
            commands,
            status,
        };
        (scheduler, commands_tx, status_rx)
    }

    /// Run to completion, then keep answering queries until every handle is
    /// dropped.
    pub async fn run(mut self) {
        info!(run_id = %self.state.run_id, nodes = self.graph.nodes.len(), "Run started");

        let status = match self.drive().await {
            Ok(()) => {
                info!(run_id = %self.state.run_id, "Run completed");
                ExecutionStatus::Completed
            }
            Err(e) => {
                error!(run_id = %self.state.run_id, error = %e, "Run failed");
                self.state.error = Some(e.to_string());
                ExecutionStatus::Failed
            }
        };
        self.broker.clear();
        let _ = self.status.send(status);

        while let Some(command) = self.commands.recv().await {
            self.handle_command(command);
        }
        debug!(run_id = %self.state.run_id, "Scheduler stopped");
    }

    async fn drive(&mut self) -> Result<()> {
        let mut in_flight: InFlight = FuturesUnordered::new();

        loop {
            self.dispatch_ready(&mut in_flight);

            if self.state.all_terminal() {
                return Ok(());
            }
            if in_flight.is_empty() {
                let waiting: Vec<&NodeId> = self
                    .state
                    .status
                    .iter()
                    .filter(|(_, s)| !s.is_terminal())
                    .map(|(id, _)| id)
                    .collect();
                return Err(TesseraError::Stalled(format!(
                    "nothing runnable; unfinished nodes: {:?}",
                    waiting
                )));
            }

            // Events first: a node's reports must land before its completion.
            tokio::select! {
                biased;
                Some(event) = self.events_rx.recv() => self.apply_event(event),
                Some(command) = self.commands.recv() => self.handle_command(command),
                Some((id, result)) = in_flight.next() => self.complete(id, result)?,
            }
        }
    }

    fn dispatch_ready(&mut self, in_flight: &mut InFlight) {
        while !self.state.ready.is_empty() {
            let id = self.state.ready.remove(0);
            if !self.dispatched.insert(id.clone()) {
                continue;
            }

            if is_skipped(&id, &self.state.status, &self.graph.edges) {
                info!(node_id = %id, "Skipping node");
                self.state.status.insert(id.clone(), NodeStatus::Skipped);
                self.release(&id);
                continue;
            }

            let Some(node) = self.graph.node(&id).cloned() else {
                warn!(node_id = %id, "Ready node missing from graph");
                continue;
            };
            let inputs = self
                .graph
                .incoming(&id)
                .into_iter()
                .map(|e| self.state.outputs.get(&e.from).cloned().unwrap_or(Value::Null))
                .collect();
            let task = NodeTask {
                run_id: self.state.run_id.clone(),
                node,
                inputs,
                outgoing: self.graph.outgoing(&id).into_iter().cloned().collect(),
                prompt: self.state.prompt.clone(),
                files: self.state.files.clone(),
            };

            debug!(node_id = %id, "Dispatching node");
            self.state.status.insert(id.clone(), NodeStatus::Running);
            let executor = self.executor.clone();
            let events = NodeEvents::new(id.clone(), self.events_tx.clone());
            in_flight.push(Box::pin(async move {
                let result = executor.run(task, events).await;
                (id, result)
            }));
        }
    }

    fn complete(&mut self, id: NodeId, result: Result<NodeOutcome>) -> Result<()> {
        match result {
            Ok(outcome) if !template::is_truthy(&outcome.output) => {
                let e = TesseraError::MissingOutput(id.clone());
                self.fail_node(&id, &e);
                Err(e)
            }
            Ok(outcome) => {
                info!(node_id = %id, "Node done");
                self.state.outputs.insert(id.clone(), outcome.output);
                self.state.status.insert(id.clone(), NodeStatus::Done);
                for target in outcome.skip {
                    if self.state.status.get(&target) == Some(&NodeStatus::Pending) {
                        debug!(node_id = %target, from = %id, "Route not taken");
                        self.state.status.insert(target, NodeStatus::Skipped);
                    }
                }
                self.release(&id);
                Ok(())
            }
            Err(e) => {
                self.fail_node(&id, &e);
                Err(e)
            }
        }
    }

    fn fail_node(&mut self, id: &str, e: &TesseraError) {
        error!(node_id = %id, error = %e, "Node failed");
        self.state.status.insert(id.to_string(), NodeStatus::Error);
        self.state
            .outputs
            .insert(id.to_string(), serde_json::json!({ "error": e.to_string() }));
        self.broker.clear();
    }

    /// Resolve the outgoing edges of a finished or skipped node.
    fn release(&mut self, id: &str) {
        let mut unblocked = Vec::new();
        for edge in self.graph.outgoing(id) {
            let Some(remaining) = self.state.pending_in.get_mut(&edge.to) else {
                continue;
            };
            *remaining = remaining.saturating_sub(1);
            let eligible = matches!(
                self.state.status.get(&edge.to),
                Some(NodeStatus::Pending) | Some(NodeStatus::Skipped)
            );
            if *remaining == 0 && eligible && !self.dispatched.contains(&edge.to) {
                unblocked.push(edge.to.clone());
            }
        }
        self.state.push_ready(unblocked);
    }

    fn apply_event(&mut self, event: NodeEvent) {
        match event {
            NodeEvent::Transcript { node_id, messages } => {
                self.state.transcripts.push(TranscriptEntry(node_id, messages));
            }
            NodeEvent::Files(files) => {
                for file in files {
                    self.state.files.insert(file.id.clone(), file);
                }
            }
            NodeEvent::NeedInput { request, reply } => {
                let node_id = request.node_id.clone();
                if self
                    .state
                    .status
                    .get(&node_id)
                    .is_some_and(|s| s.is_active())
                {
                    self.broker.request(request, reply);
                    self.state.status.insert(node_id, NodeStatus::Awaiting);
                } else {
                    // Dropping the reply ends the asking node.
                    warn!(node_id = %node_id, "Input requested by inactive node");
                }
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::ReceiveInput(inputs) => {
                for node_id in self.broker.provide(inputs) {
                    let awaiting = self.state.status.get(&node_id) == Some(&NodeStatus::Awaiting);
                    if awaiting && !self.broker.has_pending_for(&node_id) {
                        self.state.status.insert(node_id, NodeStatus::Running);
                    }
                }
            }
            Command::NeededInput(reply) => {
                let _ = reply.send(self.broker.pending());
            }
            Command::NodeStatuses(reply) => {
                let _ = reply.send(self.state.status.clone());
            }
            Command::NodeOutput(id, reply) => {
                let _ = reply.send(self.state.outputs.get(&id).cloned());
            }
            Command::Transcripts(offset, reply) => {
                let _ = reply.send(self.state.transcripts_from(offset));
            }
            Command::Files(reply) => {
                let _ = reply.send(self.state.files.clone());
            }
            Command::State(reply) => {
                let _ = reply.send(self.state.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tessera_core::config::EngineConfig;
    use tessera_core::graph::{Edge, Node, NodeKind};
    use tessera_core::types::{ChatMessage, ContentBlock, RunId, Role};

    use crate::activities::{
        Activities, FinishReason, StepContext, StepResult, ToolCallContext, ToolCallResult,
    };
    use crate::init::init_run_state;

    /// Resolves every node on its first step with its own id, failing nodes
    /// named `boom`.
    struct Echo;

    impl Activities for Echo {
        fn take_first_step(&self, ctx: StepContext) -> BoxFuture<'_, Result<StepResult>> {
            Box::pin(async move {
                if ctx.node.id == "boom" {
                    return Err(TesseraError::LlmRequest("provider down".into()));
                }
                let call = ContentBlock::ToolUse {
                    id: format!("call_{}", ctx.node.id),
                    name: "resolveOutput".into(),
                    input: json!({"data": {"node": ctx.node.id}}),
                };
                Ok(StepResult {
                    finish_reason: FinishReason::ToolCalls,
                    messages: vec![ChatMessage {
                        role: Role::Assistant,
                        content: vec![call],
                        timestamp: None,
                    }],
                    files: vec![],
                })
            })
        }

        fn take_followup_step(&self, ctx: StepContext) -> BoxFuture<'_, Result<StepResult>> {
            self.take_first_step(ctx)
        }

        fn make_tool_call(&self, ctx: ToolCallContext) -> BoxFuture<'_, Result<ToolCallResult>> {
            Box::pin(async move { Err(TesseraError::ToolNotFound(ctx.call.name)) })
        }
    }

    fn llm(id: &str) -> Node {
        Node::new(id, NodeKind::Llm, id)
    }

    async fn run(graph: Graph) -> (ExecutionStatus, RunState) {
        let state = init_run_state(RunId::from_string("run-1"), &graph, None, None, None).unwrap();
        let executor = Arc::new(NodeExecutor::new(Arc::new(Echo), &EngineConfig::default()));
        let (scheduler, commands, mut status) = Scheduler::new(Arc::new(graph), executor, state);
        tokio::spawn(scheduler.run());

        let final_status = *status
            .wait_for(|s| *s != ExecutionStatus::Running)
            .await
            .unwrap();
        let (tx, rx) = oneshot::channel();
        commands.send(Command::State(tx)).unwrap();
        (final_status, rx.await.unwrap())
    }

    #[tokio::test]
    async fn test_diamond_runs_in_dependency_order() {
        let graph = Graph::new(
            vec![llm("a"), llm("b"), llm("c"), llm("d")],
            vec![
                Edge::new("a", "b"),
                Edge::new("a", "c"),
                Edge::new("b", "d"),
                Edge::new("c", "d"),
            ],
        );
        let (status, state) = run(graph).await;
        assert_eq!(status, ExecutionStatus::Completed);
        assert!(state.status.values().all(|s| *s == NodeStatus::Done));
        assert_eq!(state.outputs["d"]["data"]["node"], "d");
        assert!(state.ready.is_empty());
        assert!(state.pending_in.values().all(|n| *n == 0));

        let order: Vec<&str> = state.transcripts.iter().map(|t| t.node_id()).collect();
        assert_eq!(order.first(), Some(&"a"));
        assert_eq!(order.last(), Some(&"d"));
    }

    #[tokio::test]
    async fn test_failure_freezes_progress() {
        let graph = Graph::new(
            vec![llm("a"), llm("boom"), llm("after")],
            vec![Edge::new("a", "boom"), Edge::new("boom", "after")],
        );
        let (status, state) = run(graph).await;
        assert_eq!(status, ExecutionStatus::Failed);
        assert_eq!(state.status["a"], NodeStatus::Done);
        assert_eq!(state.status["boom"], NodeStatus::Error);
        assert_eq!(state.status["after"], NodeStatus::Pending);
        assert!(state.outputs["boom"]["error"]
            .as_str()
            .unwrap()
            .contains("provider down"));
        assert!(state.error.is_some());
    }

    #[tokio::test]
    async fn test_cycle_stalls() {
        let graph = Graph::new(
            vec![llm("a"), llm("b")],
            vec![Edge::new("a", "b"), Edge::new("b", "a")],
        );
        let (status, state) = run(graph).await;
        assert_eq!(status, ExecutionStatus::Failed);
        assert!(state.error.unwrap().contains("nothing runnable"));
    }

    #[tokio::test]
    async fn test_empty_graph_completes() {
        let (status, state) = run(Graph::default()).await;
        assert_eq!(status, ExecutionStatus::Completed);
        assert!(state.outputs.is_empty());
    }
}
