use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, info};

use tessera_core::error::{Result, TesseraError};
use tessera_core::graph::{route_skips, Graph};
use tessera_core::state::{NodeStatus, RunState};
use tessera_core::types::{NodeId, RunId};

/// Build the starting state of a run.
///
/// Without `from_node` every node starts pending. With it, results of the
/// nodes outside `from_node`'s downstream closure are reused from `prior`
/// and only the closure is recomputed.
pub fn init_run_state(
    run_id: RunId,
    graph: &Graph,
    prompt: Option<String>,
    from_node: Option<&str>,
    prior: Option<&RunState>,
) -> Result<RunState> {
    validate_graph(graph)?;

    let state = match from_node {
        None => fresh(run_id, graph, prompt),
        Some(from) => {
            let prior = prior.ok_or_else(|| {
                TesseraError::InvalidInput(format!(
                    "resuming from {} requires the prior run state",
                    from
                ))
            })?;
            resume(run_id, graph, prompt, from, prior)?
        }
    };

    debug!(run_id = %state.run_id, ready = ?state.ready, "Initialized run state");
    Ok(state)
}

fn validate_graph(graph: &Graph) -> Result<()> {
    let mut seen = BTreeSet::new();
    for node in &graph.nodes {
        if !seen.insert(node.id.as_str()) {
            return Err(TesseraError::InvalidInput(format!(
                "duplicate node id {}",
                node.id
            )));
        }
    }
    for edge in &graph.edges {
        for end in [&edge.from, &edge.to] {
            if !seen.contains(end.as_str()) {
                return Err(TesseraError::InvalidInput(format!(
                    "edge {} -> {} references unknown node {}",
                    edge.from, edge.to, end
                )));
            }
        }
    }
    Ok(())
}

fn fresh(run_id: RunId, graph: &Graph, prompt: Option<String>) -> RunState {
    let pending_in = graph.in_degrees();
    let mut state = RunState {
        run_id,
        prompt,
        status: graph
            .nodes
            .iter()
            .map(|n| (n.id.clone(), NodeStatus::Pending))
            .collect(),
        ready: Vec::new(),
        pending_in,
        ..Default::default()
    };
    let ready: Vec<NodeId> = state
        .pending_in
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(id, _)| id.clone())
        .collect();
    state.push_ready(ready);
    state
}

fn resume(
    run_id: RunId,
    graph: &Graph,
    prompt: Option<String>,
    from: &str,
    prior: &RunState,
) -> Result<RunState> {
    if !graph.contains(from) {
        return Err(TesseraError::InvalidInput(format!(
            "unknown node {} to resume from",
            from
        )));
    }

    let upstream = graph.upstream(from);
    let downstream = graph.downstream(from);

    for id in &upstream {
        if prior.status.get(id) != Some(&NodeStatus::Done) {
            return Err(TesseraError::InvalidInput(format!(
                "upstream node {} of {} is not done",
                id, from
            )));
        }
        if prior.outputs.get(id).map_or(true, |v| v.is_null()) {
            return Err(TesseraError::InvalidInput(format!(
                "upstream node {} of {} has no output",
                id, from
            )));
        }
    }

    // Nodes outside the downstream closure whose results are reused.
    let kept: BTreeSet<&NodeId> = graph
        .nodes
        .iter()
        .map(|n| &n.id)
        .filter(|id| !downstream.contains(*id))
        .filter(|id| prior.status.get(*id) == Some(&NodeStatus::Done))
        .collect();

    let mut state = RunState {
        run_id,
        prompt: prompt.or_else(|| prior.prompt.clone()),
        ..Default::default()
    };

    for node in &graph.nodes {
        let status = if kept.contains(&node.id) {
            if let Some(output) = prior.outputs.get(&node.id) {
                state.outputs.insert(node.id.clone(), output.clone());
            }
            NodeStatus::Done
        } else {
            NodeStatus::Pending
        };
        state.status.insert(node.id.clone(), status);
    }

    state.files = prior
        .files
        .iter()
        .filter(|(_, file)| match &file.node_id {
            Some(node_id) => kept.contains(node_id),
            None => true,
        })
        .map(|(id, file)| (id.clone(), file.clone()))
        .collect();

    state.transcripts = prior
        .transcripts
        .iter()
        .filter(|entry| kept.contains(&entry.0))
        .cloned()
        .collect();

    // Routing decisions of reused nodes still hold.
    for id in &kept {
        let (Some(node), Some(output)) = (graph.node(id), state.outputs.get(*id)) else {
            continue;
        };
        for target in route_skips(node, output, &graph.outgoing(id)) {
            if state.status.get(&target) == Some(&NodeStatus::Pending) {
                state.status.insert(target, NodeStatus::Skipped);
            }
        }
    }

    let mut pending_in: BTreeMap<NodeId, usize> =
        graph.nodes.iter().map(|n| (n.id.clone(), 0)).collect();
    for edge in &graph.edges {
        if state.status.get(&edge.from) != Some(&NodeStatus::Done) {
            *pending_in.entry(edge.to.clone()).or_insert(0) += 1;
        }
    }
    state.pending_in = pending_in;

    let ready: Vec<NodeId> = state
        .pending_in
        .iter()
        .filter(|(id, count)| {
            **count == 0
                && matches!(
                    state.status.get(*id),
                    Some(NodeStatus::Pending) | Some(NodeStatus::Skipped)
                )
        })
        .map(|(id, _)| id.clone())
        .collect();
    state.push_ready(ready);

    info!(
        from = %from,
        reused = kept.len(),
        rerun = downstream.len(),
        "Resuming run"
    );
    Ok(state)
}
