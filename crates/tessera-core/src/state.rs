use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::graph::Graph;
use crate::types::{ChatMessage, FileId, FileRef, NodeId, RunId};

/// Lifecycle status of a node within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Awaiting,
    Running,
    Done,
    Error,
    Skipped,
}

impl NodeStatus {
    /// Done, error or skipped.
    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeStatus::Done | NodeStatus::Error | NodeStatus::Skipped)
    }

    /// Running or awaiting input.
    pub fn is_active(&self) -> bool {
        matches!(self, NodeStatus::Running | NodeStatus::Awaiting)
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Awaiting => "awaiting",
            NodeStatus::Running => "running",
            NodeStatus::Done => "done",
            NodeStatus::Error => "error",
            NodeStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Messages appended by one node at one point of the run.
///
/// Serialized as a `[node_id, messages]` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry(pub NodeId, pub Vec<ChatMessage>);

impl TranscriptEntry {
    pub fn node_id(&self) -> &str {
        &self.0
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.1
    }
}

/// The mutable snapshot of one execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: RunId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    pub status: BTreeMap<NodeId, NodeStatus>,
    /// Remaining unresolved incoming edges per node.
    pub pending_in: BTreeMap<NodeId, usize>,
    /// Nodes eligible for dispatch, kept sorted.
    pub ready: Vec<NodeId>,
    pub outputs: BTreeMap<NodeId, serde_json::Value>,
    /// Append-only; offsets into it are stable.
    pub transcripts: Vec<TranscriptEntry>,
    pub files: BTreeMap<FileId, FileRef>,
    /// Run-level failure, distinct from a single node's error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunState {
    /// Whether every node reached done, error or skipped.
    pub fn all_terminal(&self) -> bool {
        self.status.values().all(|s| s.is_terminal())
    }

    /// Add nodes to the ready queue, keeping it sorted and free of duplicates.
    pub fn push_ready(&mut self, ids: impl IntoIterator<Item = NodeId>) {
        for id in ids {
            if !self.ready.contains(&id) {
                self.ready.push(id);
            }
        }
        self.ready.sort();
    }

    /// Transcript entries from `offset` on.
    pub fn transcripts_from(&self, offset: usize) -> Vec<TranscriptEntry> {
        self.transcripts.iter().skip(offset).cloned().collect()
    }

    /// A copy without the heavy fields, for streaming while the run is live.
    pub fn masked(&self) -> RunState {
        RunState {
            transcripts: Vec::new(),
            files: BTreeMap::new(),
            ..self.clone()
        }
    }
}

/// A human-answerable request raised by a running node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeededInput {
    pub name: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    pub node_id: NodeId,
}

impl NeededInput {
    /// Whether a provided answer is meant for this request.
    pub fn matches(&self, provided: &ProvidedInput) -> bool {
        self.name == provided.name && self.node_id == provided.node_id
    }
}

/// An external answer to a [`NeededInput`], matched by `(name, node_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvidedInput {
    pub name: String,
    pub node_id: NodeId,
    pub value: serde_json::Value,
}

impl ProvidedInput {
    pub fn answer(needed: &NeededInput, value: serde_json::Value) -> Self {
        Self {
            name: needed.name.clone(),
            node_id: needed.node_id.clone(),
            value,
        }
    }
}

/// Outcome of a run as stored outside the execution host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunRecordStatus {
    Running,
    Completed,
    Failed,
}

/// The persisted form of a run.
///
/// Written once at start and once at the end so a run stays queryable
/// after the execution is gone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: RunId,
    pub workflow_id: String,
    pub graph_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    pub graph: Graph,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    pub status: RunRecordStatus,
    pub outputs: BTreeMap<NodeId, serde_json::Value>,
    pub transcripts: Vec<TranscriptEntry>,
    pub statuses: BTreeMap<NodeId, NodeStatus>,
    pub files: BTreeMap<FileId, FileRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl RunRecord {
    /// Record for a run that is starting.
    pub fn started(graph_id: impl Into<String>, graph: Graph, state: &RunState) -> Self {
        Self {
            id: state.run_id.clone(),
            workflow_id: format!("run-{}", state.run_id),
            graph_id: graph_id.into(),
            owner_id: None,
            graph,
            prompt: state.prompt.clone(),
            status: RunRecordStatus::Running,
            outputs: state.outputs.clone(),
            transcripts: state.transcripts.clone(),
            statuses: state.status.clone(),
            files: state.files.clone(),
            error: state.error.clone(),
            created_at: Utc::now(),
        }
    }

    /// Fold the final state of the run into the record.
    pub fn finish(&mut self, state: &RunState) {
        self.status = if state.error.is_some()
            || state.status.values().any(|s| *s == NodeStatus::Error)
        {
            RunRecordStatus::Failed
        } else {
            RunRecordStatus::Completed
        };
        self.outputs = state.outputs.clone();
        self.transcripts = state.transcripts.clone();
        self.statuses = state.status.clone();
        self.files = state.files.clone();
        self.error = state.error.clone();
    }

    /// Rebuild a run state from the record, for resuming.
    pub fn to_state(&self) -> RunState {
        RunState {
            run_id: self.id.clone(),
            prompt: self.prompt.clone(),
            status: self.statuses.clone(),
            pending_in: BTreeMap::new(),
            ready: Vec::new(),
            outputs: self.outputs.clone(),
            transcripts: self.transcripts.clone(),
            files: self.files.clone(),
            error: self.error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serialization() {
        assert_eq!(serde_json::to_string(&NodeStatus::Awaiting).unwrap(), "\"awaiting\"");
        let parsed: NodeStatus = serde_json::from_str("\"skipped\"").unwrap();
        assert_eq!(parsed, NodeStatus::Skipped);
        assert!(parsed.is_terminal());
        assert!(!NodeStatus::Running.is_terminal());
        assert!(NodeStatus::Awaiting.is_active());
    }

    #[test]
    fn test_push_ready_sorts_and_dedups() {
        let mut state = RunState::default();
        state.push_ready(vec!["c".to_string(), "a".to_string()]);
        state.push_ready(vec!["b".to_string(), "a".to_string()]);
        assert_eq!(state.ready, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_transcript_entry_is_a_pair() {
        let entry = TranscriptEntry("n1".into(), vec![]);
        assert_eq!(serde_json::to_value(&entry).unwrap(), serde_json::json!(["n1", []]));
    }

    #[test]
    fn test_masked_drops_heavy_fields() {
        let mut state = RunState::default();
        state
            .transcripts
            .push(TranscriptEntry("n1".into(), vec![ChatMessage::user("hi")]));
        state.outputs.insert("n1".into(), serde_json::json!({"ok": true}));
        let masked = state.masked();
        assert!(masked.transcripts.is_empty());
        assert_eq!(masked.outputs.len(), 1);
    }

    #[test]
    fn test_needed_input_matching() {
        let needed = NeededInput {
            name: "city".into(),
            prompt: "Which city?".into(),
            default: None,
            node_id: "ask".into(),
        };
        assert!(needed.matches(&ProvidedInput::answer(&needed, serde_json::json!("Oslo"))));
        let other = ProvidedInput {
            name: "city".into(),
            node_id: "elsewhere".into(),
            value: serde_json::json!("Oslo"),
        };
        assert!(!needed.matches(&other));
    }

    #[test]
    fn test_record_finish_marks_failure() {
        let mut state = RunState::default();
        state.status.insert("a".into(), NodeStatus::Done);
        let mut record = RunRecord::started("g", Graph::default(), &state);
        assert_eq!(record.status, RunRecordStatus::Running);

        state.status.insert("b".into(), NodeStatus::Error);
        record.finish(&state);
        assert_eq!(record.status, RunRecordStatus::Failed);
        assert_eq!(record.to_state().status.len(), 2);
    }

    #[test]
    fn test_record_keeps_prompt() {
        let state = RunState {
            prompt: Some("triage ticket 42".into()),
            ..Default::default()
        };
        let record = RunRecord::started("g", Graph::default(), &state);
        let json = serde_json::to_string(&record).unwrap();
        let reloaded: RunRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(reloaded.to_state().prompt.as_deref(), Some("triage ticket 42"));
    }
}
