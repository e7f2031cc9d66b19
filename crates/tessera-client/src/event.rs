use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use tessera_core::state::{NeededInput, NodeStatus, RunState, TranscriptEntry};
use tessera_core::types::{FileId, FileRef, NodeId};

/// One named event of a projected run stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "lowercase")]
pub enum ProjectedEvent {
    /// The run state; heavy fields are masked while the run is live.
    Run(RunState),
    Status(BTreeMap<NodeId, NodeStatus>),
    Output { node_id: NodeId, output: Value },
    Needed(Vec<NeededInput>),
    Transcript {
        offset: usize,
        entries: Vec<TranscriptEntry>,
    },
    Files(BTreeMap<FileId, FileRef>),
    Error(String),
    Done,
}

impl ProjectedEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ProjectedEvent::Run(_) => "run",
            ProjectedEvent::Status(_) => "status",
            ProjectedEvent::Output { .. } => "output",
            ProjectedEvent::Needed(_) => "needed",
            ProjectedEvent::Transcript { .. } => "transcript",
            ProjectedEvent::Files(_) => "files",
            ProjectedEvent::Error(_) => "error",
            ProjectedEvent::Done => "done",
        }
    }

    /// The JSON payload carried by the event.
    pub fn data(&self) -> Value {
        let data = match self {
            ProjectedEvent::Run(state) => serde_json::to_value(state),
            ProjectedEvent::Status(statuses) => serde_json::to_value(statuses),
            ProjectedEvent::Output { node_id, output } => {
                Ok(serde_json::json!({ "node_id": node_id, "output": output }))
            }
            ProjectedEvent::Needed(needed) => serde_json::to_value(needed),
            ProjectedEvent::Transcript { offset, entries } => {
                serde_json::to_value(entries).map(|entries| {
                    serde_json::json!({ "offset": offset, "entries": entries })
                })
            }
            ProjectedEvent::Files(files) => serde_json::to_value(files),
            ProjectedEvent::Error(message) => Ok(Value::String(message.clone())),
            ProjectedEvent::Done => Ok(Value::Null),
        };
        // Every payload is plain data with string keys.
        data.unwrap_or(Value::Null)
    }

    /// Server-sent-events framing: `event: <name>\ndata: <json>\n\n`.
    pub fn to_sse(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.name(), self.data())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ProjectedEvent::Done | ProjectedEvent::Error(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sse_framing() {
        let event = ProjectedEvent::Status(BTreeMap::from([
            ("a".to_string(), NodeStatus::Done),
            ("b".to_string(), NodeStatus::Running),
        ]));
        assert_eq!(
            event.to_sse(),
            "event: status\ndata: {\"a\":\"done\",\"b\":\"running\"}\n\n"
        );
        assert_eq!(ProjectedEvent::Done.to_sse(), "event: done\ndata: null\n\n");
    }

    #[test]
    fn test_payloads() {
        let output = ProjectedEvent::Output {
            node_id: "n".into(),
            output: json!({"data": 1}),
        };
        assert_eq!(output.data(), json!({"node_id": "n", "output": {"data": 1}}));

        let transcript = ProjectedEvent::Transcript {
            offset: 3,
            entries: vec![TranscriptEntry("n".into(), vec![])],
        };
        assert_eq!(transcript.data(), json!({"offset": 3, "entries": [["n", []]]}));
        assert_eq!(ProjectedEvent::Error("boom".into()).data(), json!("boom"));
        assert!(ProjectedEvent::Error("boom".into()).is_terminal());
    }
}
