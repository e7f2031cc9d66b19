use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use tessera_core::config::ClientConfig;
use tessera_core::error::Result;
use tessera_core::state::{NeededInput, NodeStatus, RunState, TranscriptEntry};
use tessera_core::types::{FileId, FileRef, NodeId};
use tessera_engine::{ExecutionHandle, ExecutionStatus};

use crate::event::ProjectedEvent;

/// The read-only queries the projector polls.
pub trait RunQueries: Send + Sync + 'static {
    fn status(&self) -> ExecutionStatus;

    fn state(&self) -> BoxFuture<'_, Result<RunState>>;

    fn node_statuses(&self) -> BoxFuture<'_, Result<BTreeMap<NodeId, NodeStatus>>>;

    fn node_output<'a>(&'a self, node_id: &'a str) -> BoxFuture<'a, Result<Option<Value>>>;

    fn needed_input(&self) -> BoxFuture<'_, Result<Vec<NeededInput>>>;

    fn transcripts(&self, offset: usize) -> BoxFuture<'_, Result<Vec<TranscriptEntry>>>;

    fn files(&self) -> BoxFuture<'_, Result<BTreeMap<FileId, FileRef>>>;
}

impl RunQueries for ExecutionHandle {
    fn status(&self) -> ExecutionStatus {
        ExecutionHandle::status(self)
    }

    fn state(&self) -> BoxFuture<'_, Result<RunState>> {
        Box::pin(ExecutionHandle::state(self))
    }

    fn node_statuses(&self) -> BoxFuture<'_, Result<BTreeMap<NodeId, NodeStatus>>> {
        Box::pin(ExecutionHandle::node_statuses(self))
    }

    fn node_output<'a>(&'a self, node_id: &'a str) -> BoxFuture<'a, Result<Option<Value>>> {
        Box::pin(ExecutionHandle::node_output(self, node_id))
    }

    fn needed_input(&self) -> BoxFuture<'_, Result<Vec<NeededInput>>> {
        Box::pin(ExecutionHandle::needed_input(self))
    }

    fn transcripts(&self, offset: usize) -> BoxFuture<'_, Result<Vec<TranscriptEntry>>> {
        Box::pin(ExecutionHandle::transcripts(self, offset))
    }

    fn files(&self) -> BoxFuture<'_, Result<BTreeMap<FileId, FileRef>>> {
        Box::pin(ExecutionHandle::files(self))
    }
}

/// Polling cadence and overall limit of a projection.
#[derive(Debug, Clone, Copy)]
pub struct ProjectorOptions {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl From<&ClientConfig> for ProjectorOptions {
    fn from(config: &ClientConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

impl Default for ProjectorOptions {
    fn default() -> Self {
        Self::from(&ClientConfig::default())
    }
}

/// Follow a run as a stream of events.
///
/// The stream opens with a `run` event, then emits only what changed
/// between polls. It ends after `run` + `done` when the run completes, with
/// `error` when the run fails or the timeout passes, and silently when the
/// execution is gone or had already failed before the first poll.
pub fn project<Q: RunQueries>(queries: Q, options: ProjectorOptions) -> BoxStream<'static, ProjectedEvent> {
    let projector = Projector::new(queries, options);
    stream::unfold(projector, |mut projector| async move {
        projector.next_event().await.map(|event| (event, projector))
    })
    .boxed()
}

struct Projector<Q> {
    queries: Q,
    options: ProjectorOptions,
    deadline: Instant,
    started: bool,
    finished: bool,
    statuses: BTreeMap<NodeId, NodeStatus>,
    needed_nodes: Vec<NodeId>,
    was_awaiting: bool,
    transcript_offset: usize,
    file_count: usize,
    queue: VecDeque<ProjectedEvent>,
}

impl<Q: RunQueries> Projector<Q> {
    fn new(queries: Q, options: ProjectorOptions) -> Self {
        Self {
            queries,
            options,
            deadline: Instant::now() + options.timeout,
            started: false,
            finished: false,
            statuses: BTreeMap::new(),
            needed_nodes: Vec::new(),
            was_awaiting: false,
            transcript_offset: 0,
            file_count: 0,
            queue: VecDeque::new(),
        }
    }

    async fn next_event(&mut self) -> Option<ProjectedEvent> {
        loop {
            if let Some(event) = self.queue.pop_front() {
                return Some(event);
            }
            if self.finished {
                return None;
            }

            if self.started {
                if Instant::now() >= self.deadline {
                    warn!(timeout = ?self.options.timeout, "Event stream timed out");
                    self.queue.push_back(ProjectedEvent::Error(format!(
                        "timed out after {}s",
                        self.options.timeout.as_secs()
                    )));
                    self.finished = true;
                    continue;
                }
                tokio::time::sleep(self.options.poll_interval).await;
            }

            if let Err(e) = self.poll().await {
                self.finished = true;
                if e.is_host_error() {
                    debug!(error = %e, "Execution gone, ending event stream");
                } else {
                    self.queue.push_back(ProjectedEvent::Error(e.to_string()));
                }
            }
        }
    }

    async fn poll(&mut self) -> Result<()> {
        // Read the terminal status first so every query below sees the final state.
        let status = self.queries.status();

        if !self.started {
            if status == ExecutionStatus::Failed {
                debug!("Execution already failed, ending event stream");
                self.finished = true;
                return Ok(());
            }
            let state = self.queries.state().await?;
            self.queue.push_back(ProjectedEvent::Run(state.masked()));
            self.started = true;
        }

        let statuses = self.queries.node_statuses().await?;
        let changed = statuses != self.statuses;
        if changed {
            self.queue.push_back(ProjectedEvent::Status(statuses.clone()));
        }

        for (id, node_status) in &statuses {
            let settled = matches!(node_status, NodeStatus::Done | NodeStatus::Error);
            if settled && self.statuses.get(id) != Some(node_status) {
                if let Some(output) = self.queries.node_output(id).await? {
                    self.queue.push_back(ProjectedEvent::Output {
                        node_id: id.clone(),
                        output,
                    });
                }
            }
        }

        let awaiting = statuses.values().any(|s| *s == NodeStatus::Awaiting);
        if awaiting || self.was_awaiting {
            let needed = self.queries.needed_input().await?;
            let nodes: Vec<NodeId> = needed.iter().map(|n| n.node_id.clone()).collect();
            if nodes != self.needed_nodes {
                self.needed_nodes = nodes;
                self.queue.push_back(ProjectedEvent::Needed(needed));
            }
        }
        self.was_awaiting = awaiting;

        let running = statuses.values().any(|s| *s == NodeStatus::Running);
        if running || changed {
            let entries = self.queries.transcripts(self.transcript_offset).await?;
            if !entries.is_empty() {
                let offset = self.transcript_offset;
                self.transcript_offset += entries.len();
                self.queue
                    .push_back(ProjectedEvent::Transcript { offset, entries });
            }
        }

        let files = self.queries.files().await?;
        if files.len() > self.file_count {
            self.file_count = files.len();
            self.queue.push_back(ProjectedEvent::Files(files));
        }

        self.statuses = statuses;

        match status {
            ExecutionStatus::Running => {}
            ExecutionStatus::Completed => {
                info!("Run completed, closing event stream");
                let state = self.queries.state().await?;
                self.queue.push_back(ProjectedEvent::Run(state));
                self.queue.push_back(ProjectedEvent::Done);
                self.finished = true;
            }
            ExecutionStatus::Failed => {
                let state = self.queries.state().await?;
                let message = state.error.unwrap_or_else(|| "run failed".to_string());
                info!(error = %message, "Run failed, closing event stream");
                self.queue.push_back(ProjectedEvent::Error(message));
                self.finished = true;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use serde_json::json;
    use tessera_core::error::TesseraError;

    /// A run that changes according to a fixed script of status maps, one per poll.
    struct ScriptedRun {
        polls: AtomicUsize,
        frames: Vec<BTreeMap<NodeId, NodeStatus>>,
        transcripts: Mutex<Vec<TranscriptEntry>>,
        end: ExecutionStatus,
        missing: bool,
    }

    impl ScriptedRun {
        fn new(frames: Vec<Vec<(&str, NodeStatus)>>, end: ExecutionStatus) -> Self {
            Self {
                polls: AtomicUsize::new(0),
                frames: frames
                    .into_iter()
                    .map(|f| f.into_iter().map(|(id, s)| (id.to_string(), s)).collect())
                    .collect(),
                transcripts: Mutex::new(Vec::new()),
                end,
                missing: false,
            }
        }

        fn frame(&self) -> usize {
            self.polls.load(Ordering::SeqCst).min(self.frames.len() - 1)
        }

        fn last_frame(&self) -> bool {
            self.polls.load(Ordering::SeqCst) + 1 >= self.frames.len()
        }
    }

    impl RunQueries for ScriptedRun {
        fn status(&self) -> ExecutionStatus {
            if self.last_frame() {
                self.end
            } else {
                ExecutionStatus::Running
            }
        }

        fn state(&self) -> BoxFuture<'_, Result<RunState>> {
            Box::pin(async move {
                if self.missing {
                    return Err(TesseraError::ExecutionNotFound("r".into()));
                }
                Ok(RunState {
                    status: self.frames[self.frame()].clone(),
                    transcripts: self.transcripts.lock().unwrap().clone(),
                    error: (self.end == ExecutionStatus::Failed).then(|| "node b failed".into()),
                    ..Default::default()
                })
            })
        }

        fn node_statuses(&self) -> BoxFuture<'_, Result<BTreeMap<NodeId, NodeStatus>>> {
            Box::pin(async move {
                let frame = self.frames[self.frame()].clone();
                // Every running node says something each poll.
                let mut transcripts = self.transcripts.lock().unwrap();
                for (id, status) in &frame {
                    if *status == NodeStatus::Running {
                        transcripts.push(TranscriptEntry(id.clone(), vec![]));
                    }
                }
                Ok(frame)
            })
        }

        fn node_output<'a>(&'a self, node_id: &'a str) -> BoxFuture<'a, Result<Option<Value>>> {
            Box::pin(async move { Ok(Some(json!({"node": node_id}))) })
        }

        fn needed_input(&self) -> BoxFuture<'_, Result<Vec<NeededInput>>> {
            Box::pin(async move {
                let frame = &self.frames[self.frame()];
                Ok(frame
                    .iter()
                    .filter(|(_, s)| **s == NodeStatus::Awaiting)
                    .map(|(id, _)| NeededInput {
                        name: "answer".into(),
                        prompt: "?".into(),
                        default: None,
                        node_id: id.clone(),
                    })
                    .collect())
            })
        }

        fn transcripts(&self, offset: usize) -> BoxFuture<'_, Result<Vec<TranscriptEntry>>> {
            Box::pin(async move {
                let entries = self.transcripts.lock().unwrap().iter().skip(offset).cloned().collect();
                Ok(entries)
            })
        }

        fn files(&self) -> BoxFuture<'_, Result<BTreeMap<FileId, FileRef>>> {
            Box::pin(async move {
                // Files are queried last, so this closes one poll.
                self.polls.fetch_add(1, Ordering::SeqCst);
                Ok(BTreeMap::new())
            })
        }
    }

    fn options() -> ProjectorOptions {
        ProjectorOptions {
            poll_interval: Duration::from_millis(10),
            timeout: Duration::from_secs(60),
        }
    }

    async fn collect(run: ScriptedRun, options: ProjectorOptions) -> Vec<ProjectedEvent> {
        project(run, options).collect().await
    }

    #[tokio::test(start_paused = true)]
    async fn test_emits_only_changes() {
        use NodeStatus::*;
        let run = ScriptedRun::new(
            vec![
                vec![("a", Running), ("b", Pending)],
                vec![("a", Running), ("b", Pending)],
                vec![("a", Done), ("b", Running)],
                vec![("a", Done), ("b", Done)],
            ],
            ExecutionStatus::Completed,
        );
        let events = collect(run, options()).await;
        let names: Vec<&str> = events.iter().map(|e| e.name()).collect();

        assert_eq!(names.first(), Some(&"run"));
        assert_eq!(&names[names.len() - 2..], &["run", "done"]);
        assert_eq!(names.iter().filter(|n| **n == "status").count(), 3);

        let outputs: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                ProjectedEvent::Output { node_id, .. } => Some(node_id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(outputs, vec!["a", "b"]);

        // Offsets advance by exactly what was emitted before.
        let mut expected = 0;
        for event in &events {
            if let ProjectedEvent::Transcript { offset, entries } = event {
                assert_eq!(*offset, expected);
                expected += entries.len();
            }
        }
        assert_eq!(expected, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_needed_tracks_node_sequence() {
        use NodeStatus::*;
        let run = ScriptedRun::new(
            vec![
                vec![("ask", Awaiting)],
                vec![("ask", Awaiting)],
                vec![("ask", Running)],
                vec![("ask", Done)],
            ],
            ExecutionStatus::Completed,
        );
        let events = collect(run, options()).await;
        let needed: Vec<usize> = events
            .iter()
            .filter_map(|e| match e {
                ProjectedEvent::Needed(n) => Some(n.len()),
                _ => None,
            })
            .collect();
        // Raised once, cleared once.
        assert_eq!(needed, vec![1, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_ends_with_error() {
        use NodeStatus::*;
        let run = ScriptedRun::new(
            vec![
                vec![("a", Running), ("b", Pending)],
                vec![("a", Done), ("b", Error)],
            ],
            ExecutionStatus::Failed,
        );
        let events = collect(run, options()).await;
        assert_eq!(
            events.last(),
            Some(&ProjectedEvent::Error("node b failed".into()))
        );
        assert!(events
            .iter()
            .any(|e| matches!(e, ProjectedEvent::Output { node_id, .. } if node_id == "b")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_failed_ends_silently() {
        let run = ScriptedRun::new(vec![vec![("a", NodeStatus::Error)]], ExecutionStatus::Failed);
        assert!(collect(run, options()).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_execution_ends_silently() {
        let mut run = ScriptedRun::new(vec![vec![("a", NodeStatus::Running)]; 2], ExecutionStatus::Completed);
        run.missing = true;
        assert!(collect(run, options()).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_ends_with_error() {
        let run = ScriptedRun::new(
            vec![vec![("a", NodeStatus::Awaiting)]; 1000],
            ExecutionStatus::Completed,
        );
        let events = collect(
            run,
            ProjectorOptions {
                poll_interval: Duration::from_millis(10),
                timeout: Duration::from_millis(50),
            },
        )
        .await;
        assert!(matches!(events.last(), Some(ProjectedEvent::Error(m)) if m.contains("timed out")));
    }
}
