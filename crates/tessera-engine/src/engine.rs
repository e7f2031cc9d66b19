use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::info;

use tessera_core::config::AppConfig;
use tessera_core::error::{Result, TesseraError};
use tessera_core::graph::Graph;
use tessera_core::state::{NeededInput, NodeStatus, ProvidedInput, RunState, TranscriptEntry};
use tessera_core::traits::LlmClient;
use tessera_core::types::{FileId, FileRef, NodeId, RunId};
use tessera_tools::{LocalFileStore, ToolRegistry};

use crate::activities::{Activities, LocalActivities};
use crate::executor::NodeExecutor;
use crate::init::init_run_state;
use crate::scheduler::{Command, ExecutionStatus, Scheduler};

/// What to run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub run_id: Option<RunId>,
    pub graph: Graph,
    pub prompt: Option<String>,
    /// Rerun this node and its downstream closure, reusing `prior_state`.
    pub from_node: Option<NodeId>,
    pub prior_state: Option<RunState>,
}

impl RunRequest {
    pub fn new(graph: Graph) -> Self {
        Self {
            run_id: None,
            graph,
            prompt: None,
            from_node: None,
            prior_state: None,
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    pub fn with_run_id(mut self, run_id: RunId) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn resume_from(mut self, node_id: impl Into<NodeId>, prior: RunState) -> Self {
        self.from_node = Some(node_id.into());
        self.prior_state = Some(prior);
        self
    }
}

/// Signals and queries for one execution.
///
/// Cheap to clone. Queries keep working after the run finishes, for as long
/// as any handle is alive.
#[derive(Debug, Clone)]
pub struct ExecutionHandle {
    run_id: RunId,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ExecutionStatus>,
}

impl ExecutionHandle {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Deliver answers to pending input requests. Unmatched inputs are ignored.
    pub fn receive_input(&self, inputs: Vec<ProvidedInput>) -> Result<()> {
        self.commands
            .send(Command::ReceiveInput(inputs))
            .map_err(|_| self.terminated())
    }

    pub async fn needed_input(&self) -> Result<Vec<NeededInput>> {
        self.query(Command::NeededInput).await
    }

    pub async fn node_statuses(&self) -> Result<BTreeMap<NodeId, NodeStatus>> {
        self.query(Command::NodeStatuses).await
    }

    pub async fn node_output(&self, node_id: &str) -> Result<Option<Value>> {
        let node_id = node_id.to_string();
        self.query(|reply| Command::NodeOutput(node_id, reply)).await
    }

    /// Transcript entries from `offset` on.
    pub async fn transcripts(&self, offset: usize) -> Result<Vec<TranscriptEntry>> {
        self.query(|reply| Command::Transcripts(offset, reply)).await
    }

    pub async fn files(&self) -> Result<BTreeMap<FileId, FileRef>> {
        self.query(Command::Files).await
    }

    pub async fn state(&self) -> Result<RunState> {
        self.query(Command::State).await
    }

    pub fn status(&self) -> ExecutionStatus {
        *self.status.borrow()
    }

    /// Wait for the run to finish and return its final state.
    pub async fn result(&self) -> Result<RunState> {
        let mut status = self.status.clone();
        status
            .wait_for(|s| *s != ExecutionStatus::Running)
            .await
            .map_err(|_| self.terminated())?;
        self.state().await
    }

    async fn query<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, answer) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| self.terminated())?;
        answer.await.map_err(|_| self.terminated())
    }

    fn terminated(&self) -> TesseraError {
        TesseraError::ExecutionTerminated(self.run_id.to_string())
    }
}

/// Hosts executions and keeps their handles addressable by run id.
pub struct Engine {
    config: Arc<AppConfig>,
    executor: Arc<NodeExecutor>,
    runs: Mutex<HashMap<RunId, ExecutionHandle>>,
}

impl Engine {
    pub fn new(config: Arc<AppConfig>, activities: Arc<dyn Activities>) -> Self {
        let executor = Arc::new(NodeExecutor::new(activities, &config.engine));
        Self {
            config,
            executor,
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// An engine running activities in-process against `llm`, with the
    /// built-in tools and a file store under the configured directory.
    pub fn local(config: AppConfig, llm: Arc<dyn LlmClient>) -> Self {
        let config = Arc::new(config);
        let store = Arc::new(LocalFileStore::new(config.files_dir()));
        let tools = Arc::new(ToolRegistry::with_builtins(&config.tools));
        let activities = LocalActivities::new(config.clone(), llm, tools, store);
        Self::new(config, Arc::new(activities))
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Initialize the run state and start scheduling.
    ///
    /// Initialization errors are returned here, before any node runs.
    pub fn start(&self, request: RunRequest) -> Result<ExecutionHandle> {
        let run_id = request.run_id.unwrap_or_default();
        if self.lock().contains_key(&run_id) {
            return Err(TesseraError::InvalidInput(format!(
                "run {} already exists",
                run_id
            )));
        }

        let state = init_run_state(
            run_id.clone(),
            &request.graph,
            request.prompt,
            request.from_node.as_deref(),
            request.prior_state.as_ref(),
        )?;

        let (scheduler, commands, status) =
            Scheduler::new(Arc::new(request.graph), self.executor.clone(), state);
        tokio::spawn(scheduler.run());

        let handle = ExecutionHandle {
            run_id: run_id.clone(),
            commands,
            status,
        };
        info!(run_id = %run_id, from = ?request.from_node, "Execution started");
        self.lock().insert(run_id, handle.clone());
        Ok(handle)
    }

    pub fn handle(&self, run_id: &RunId) -> Result<ExecutionHandle> {
        self.lock()
            .get(run_id)
            .cloned()
            .ok_or_else(|| TesseraError::ExecutionNotFound(run_id.to_string()))
    }

    /// Drop the engine's handle. The scheduler stops once no handle remains.
    pub fn forget(&self, run_id: &RunId) -> bool {
        self.lock().remove(run_id).is_some()
    }

    pub fn runs(&self) -> Vec<RunId> {
        self.lock().keys().cloned().collect()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RunId, ExecutionHandle>> {
        self.runs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
