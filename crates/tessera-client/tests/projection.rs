use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::StreamExt;
use serde_json::json;
use tempfile::TempDir;

use tessera_client::{run_to_completion, Client, InputCollector, ProjectedEvent, ProjectorOptions};
use tessera_core::config::AppConfig;
use tessera_core::error::Result;
use tessera_core::graph::{Edge, Graph, Node, NodeKind, ToolSpec};
use tessera_core::state::{NeededInput, NodeStatus, ProvidedInput};
use tessera_core::types::RunId;
use tessera_engine::{Engine, ReplayClient, RunRequest, ScriptedTurn};

fn client(llm: ReplayClient) -> (Client, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = AppConfig::default();
    config.tools.files_dir = dir.path().display().to_string();
    let engine = Arc::new(Engine::local(config, Arc::new(llm)));
    let client = Client::new(engine).with_options(ProjectorOptions {
        poll_interval: Duration::from_millis(5),
        timeout: Duration::from_secs(30),
    });
    (client, dir)
}

fn ask_graph() -> Graph {
    Graph::new(
        vec![Node::new("ask", NodeKind::Llm, "ask")
            .with_tools(vec![ToolSpec::Name("collectUserInput".into())])],
        vec![],
    )
}

fn ask_script() -> ReplayClient {
    ReplayClient::new()
        .turn(
            "ask",
            ScriptedTurn::call("collectUserInput", json!({"name": "city", "prompt": "Which city?"})),
        )
        .turn("ask", ScriptedTurn::resolve(json!({"data": {"city": "Oslo"}})))
}

struct Answer {
    calls: AtomicUsize,
}

impl InputCollector for Answer {
    fn collect(&self, needed: Vec<NeededInput>) -> BoxFuture<'_, Result<Vec<ProvidedInput>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            Ok(needed
                .iter()
                .map(|n| ProvidedInput::answer(n, json!("Oslo")))
                .collect())
        })
    }
}

#[tokio::test]
async fn test_run_collects_input() {
    let (client, _dir) = client(ask_script());
    let collector = Answer {
        calls: AtomicUsize::new(0),
    };
    let state = client.run(RunRequest::new(ask_graph()), &collector).await.unwrap();
    assert_eq!(state.status["ask"], NodeStatus::Done);
    assert_eq!(state.outputs["ask"]["data"]["city"], "Oslo");
    assert_eq!(collector.calls.load(Ordering::SeqCst), 1);
}

/// Answers every request under a name nobody asked for.
struct WrongName {
    calls: AtomicUsize,
}

impl InputCollector for WrongName {
    fn collect(&self, needed: Vec<NeededInput>) -> BoxFuture<'_, Result<Vec<ProvidedInput>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            Ok(needed
                .iter()
                .map(|n| ProvidedInput {
                    name: "typo".into(),
                    node_id: n.node_id.clone(),
                    value: json!("Oslo"),
                })
                .collect())
        })
    }
}

#[tokio::test]
async fn test_unmatched_answers_are_retried_at_poll_rate() {
    let (client, _dir) = client(ask_script());
    let handle = client.start(RunRequest::new(ask_graph())).unwrap();
    let collector = WrongName {
        calls: AtomicUsize::new(0),
    };

    let outcome = tokio::time::timeout(
        Duration::from_millis(200),
        run_to_completion(&handle, &collector, Duration::from_millis(50)),
    )
    .await;

    assert!(outcome.is_err(), "run should still be waiting for input");
    let calls = collector.calls.load(Ordering::SeqCst);
    assert!((1..=6).contains(&calls), "collector called {} times", calls);
    assert_eq!(handle.node_statuses().await.unwrap()["ask"], NodeStatus::Awaiting);
    assert_eq!(handle.needed_input().await.unwrap()[0].name, "city");
}

#[tokio::test]
async fn test_events_of_completed_run() {
    let (client, _dir) = client(
        ReplayClient::new()
            .turn("a", ScriptedTurn::resolve(json!({"data": {"n": 1}})))
            .turn("b", ScriptedTurn::resolve(json!({"data": {"n": 2}}))),
    );
    let graph = Graph::new(
        vec![Node::new("a", NodeKind::Llm, "a"), Node::new("b", NodeKind::Llm, "b")],
        vec![Edge::new("a", "b")],
    );
    let handle = client.start(RunRequest::new(graph)).unwrap();
    let events: Vec<ProjectedEvent> = client.events(handle.run_id()).collect().await;

    assert!(matches!(events.first(), Some(ProjectedEvent::Run(_))));
    assert_eq!(events.last(), Some(&ProjectedEvent::Done));
    let ProjectedEvent::Run(last) = &events[events.len() - 2] else {
        panic!("expected the final run state");
    };
    assert!(last.status.values().all(|s| *s == NodeStatus::Done));

    let mut emitted = 0;
    for event in &events {
        if let ProjectedEvent::Transcript { offset, entries } = event {
            assert_eq!(*offset, emitted);
            emitted += entries.len();
        }
    }
    assert_eq!(emitted, last.transcripts.len());

    let statuses: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            ProjectedEvent::Status(s) => Some(s),
            _ => None,
        })
        .collect();
    assert!(statuses.windows(2).all(|w| w[0] != w[1]));
}

#[tokio::test]
async fn test_events_report_needed_input() {
    let (client, _dir) = client(ask_script());
    let handle = client.start(RunRequest::new(ask_graph())).unwrap();
    let events = tokio::spawn(client.events(handle.run_id()).collect::<Vec<_>>());

    let needed = loop {
        let needed = handle.needed_input().await.unwrap();
        if !needed.is_empty() {
            break needed;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };
    // Give the projector a poll while the node is awaiting.
    tokio::time::sleep(Duration::from_millis(50)).await;
    handle
        .receive_input(vec![ProvidedInput::answer(&needed[0], json!("Oslo"))])
        .unwrap();

    let events = events.await.unwrap();
    assert!(events.iter().any(|e| matches!(
        e,
        ProjectedEvent::Needed(n) if n.len() == 1 && n[0].node_id == "ask"
    )));
    assert_eq!(events.last(), Some(&ProjectedEvent::Done));
}

#[tokio::test]
async fn test_unknown_run_has_no_events() {
    let (client, _dir) = client(ReplayClient::new());
    let events: Vec<_> = client.events(&RunId::from_string("missing")).collect().await;
    assert!(events.is_empty());
}
