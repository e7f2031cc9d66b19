//! Immutable graph model: nodes, edges, routing.
//!
//! A graph is assumed acyclic; nothing here validates that. Traversal helpers
//! keep edge-declaration order wherever order is observable.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::state::NodeStatus;
use crate::types::NodeId;

/// A directed acyclic graph of nodes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

/// Kind of work a node performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Input,
    Llm,
    Router,
}

/// A unit of work in the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    /// Prompt templates: the first becomes the system message, the rest the
    /// parts of the user message.
    #[serde(default)]
    pub instructions: Vec<String>,
    /// JSON Schema of the resolved output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<serde_json::Value>,
    #[serde(default)]
    pub tools: Vec<ToolSpec>,
    /// Named model from config; the default model when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing: Option<Routing>,
}

/// A tool declared on a node: a bare name or a name plus options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolSpec {
    Name(String),
    Config {
        name: String,
        #[serde(flatten)]
        options: serde_json::Map<String, serde_json::Value>,
    },
}

impl ToolSpec {
    pub fn name(&self) -> &str {
        match self {
            ToolSpec::Name(name) => name,
            ToolSpec::Config { name, .. } => name,
        }
    }

    /// Options as a JSON value (`Null` for bare names).
    pub fn options(&self) -> serde_json::Value {
        match self {
            ToolSpec::Name(_) => serde_json::Value::Null,
            ToolSpec::Config { options, .. } => serde_json::Value::Object(options.clone()),
        }
    }
}

/// How a node's completion affects its outgoing edges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingMode {
    /// Every outgoing edge is followed.
    Broadcast,
    /// The model picks the routes; edges not picked are skipped.
    #[default]
    LlmSwitch,
}

/// A route the model may pick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    pub to: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Routing configuration of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Routing {
    pub mode: RoutingMode,
    /// Route options; the outgoing edge targets when empty.
    pub routes: Vec<Route>,
    #[serde(rename = "allowMultiple", alias = "allow_multiple")]
    pub allow_multiple: bool,
    pub required: bool,
}

impl Default for Routing {
    fn default() -> Self {
        Self {
            mode: RoutingMode::LlmSwitch,
            routes: Vec::new(),
            allow_multiple: false,
            required: true,
        }
    }
}

/// An edge connecting two nodes in the graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    /// Source node id.
    pub from: NodeId,
    /// Target node id.
    pub to: NodeId,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

impl Node {
    /// Create a node with minimal configuration.
    pub fn new(id: impl Into<String>, kind: NodeKind, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            name: name.into(),
            intent: None,
            instructions: vec![],
            output_schema: None,
            tools: vec![],
            model: None,
            routing: None,
        }
    }

    pub fn with_intent(mut self, intent: impl Into<String>) -> Self {
        self.intent = Some(intent.into());
        self
    }

    pub fn with_instructions(mut self, instructions: Vec<String>) -> Self {
        self.instructions = instructions;
        self
    }

    pub fn with_output_schema(mut self, schema: serde_json::Value) -> Self {
        self.output_schema = Some(schema);
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_routing(mut self, routing: Routing) -> Self {
        self.routing = Some(routing);
        self
    }

    /// The routing in effect: router nodes default to a single required switch.
    pub fn effective_routing(&self) -> Option<Routing> {
        match (&self.routing, self.kind) {
            (Some(routing), _) => Some(routing.clone()),
            (None, NodeKind::Router) => Some(Routing::default()),
            (None, _) => None,
        }
    }

    /// Route option ids given the node's outgoing edges.
    pub fn route_options(&self, outgoing: &[&Edge]) -> Vec<NodeId> {
        match self.effective_routing() {
            Some(routing) if !routing.routes.is_empty() => {
                routing.routes.iter().map(|r| r.to.clone()).collect()
            }
            _ => outgoing.iter().map(|e| e.to.clone()).collect(),
        }
    }
}

impl Graph {
    pub fn new(nodes: Vec<Node>, edges: Vec<Edge>) -> Self {
        Self { nodes, edges }
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.node(id).is_some()
    }

    /// Incoming edges of a node, in declaration order.
    pub fn incoming(&self, id: &str) -> Vec<&Edge> {
        self.edges.iter().filter(|e| e.to == id).collect()
    }

    /// Outgoing edges of a node, in declaration order.
    pub fn outgoing(&self, id: &str) -> Vec<&Edge> {
        self.edges.iter().filter(|e| e.from == id).collect()
    }

    /// Number of incoming edges per node.
    pub fn in_degrees(&self) -> BTreeMap<NodeId, usize> {
        let mut degrees: BTreeMap<NodeId, usize> =
            self.nodes.iter().map(|n| (n.id.clone(), 0)).collect();
        for edge in &self.edges {
            *degrees.entry(edge.to.clone()).or_insert(0) += 1;
        }
        degrees
    }

    /// Transitive predecessors of a node, excluding the node itself.
    pub fn upstream(&self, id: &str) -> BTreeSet<NodeId> {
        self.closure(id, true)
    }

    /// The node plus its transitive successors.
    pub fn downstream(&self, id: &str) -> BTreeSet<NodeId> {
        let mut set = self.closure(id, false);
        set.insert(id.to_string());
        set
    }

    fn closure(&self, id: &str, backwards: bool) -> BTreeSet<NodeId> {
        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([id.to_string()]);
        while let Some(current) = queue.pop_front() {
            for edge in &self.edges {
                let (here, next) = if backwards {
                    (&edge.to, &edge.from)
                } else {
                    (&edge.from, &edge.to)
                };
                if *here == current && seen.insert(next.clone()) {
                    queue.push_back(next.clone());
                }
            }
        }
        seen.remove(id);
        seen
    }
}

/// Whether a node should be skipped instead of dispatched.
///
/// A node is skipped when it was already marked skipped, or when it has
/// incoming edges and every one of them comes from a skipped node.
pub fn is_skipped(id: &str, statuses: &BTreeMap<NodeId, NodeStatus>, edges: &[Edge]) -> bool {
    if statuses.get(id) == Some(&NodeStatus::Skipped) {
        return true;
    }
    let mut incoming = edges.iter().filter(|e| e.to == id).peekable();
    if incoming.peek().is_none() {
        return false;
    }
    incoming.all(|e| statuses.get(&e.from) == Some(&NodeStatus::Skipped))
}

/// Outgoing targets a switch node did not select.
///
/// `output` is the resolved output carrying `route` or `routes`. Broadcast
/// nodes and outputs without a selection skip nothing.
pub fn route_skips(node: &Node, output: &serde_json::Value, outgoing: &[&Edge]) -> Vec<NodeId> {
    let Some(routing) = node.effective_routing() else {
        return Vec::new();
    };
    if routing.mode != RoutingMode::LlmSwitch {
        return Vec::new();
    }

    let mut selected: BTreeSet<&str> = BTreeSet::new();
    if let Some(route) = output.get("route").and_then(|v| v.as_str()) {
        selected.insert(route);
    }
    if let Some(routes) = output.get("routes").and_then(|v| v.as_array()) {
        selected.extend(routes.iter().filter_map(|v| v.as_str()));
    }
    if selected.is_empty() {
        return Vec::new();
    }

    let mut skipped: Vec<NodeId> = Vec::new();
    for edge in outgoing {
        if !selected.contains(edge.to.as_str()) && !skipped.contains(&edge.to) {
            skipped.push(edge.to.clone());
        }
    }
    skipped
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diamond() -> Graph {
        Graph::new(
            vec![
                Node::new("A", NodeKind::Llm, "a"),
                Node::new("B", NodeKind::Llm, "b"),
                Node::new("C", NodeKind::Llm, "c"),
                Node::new("D", NodeKind::Llm, "d"),
            ],
            vec![
                Edge::new("A", "B"),
                Edge::new("A", "C"),
                Edge::new("B", "D"),
                Edge::new("C", "D"),
            ],
        )
    }

    #[test]
    fn test_in_degrees() {
        let degrees = diamond().in_degrees();
        assert_eq!(degrees["A"], 0);
        assert_eq!(degrees["B"], 1);
        assert_eq!(degrees["C"], 1);
        assert_eq!(degrees["D"], 2);
    }

    #[test]
    fn test_upstream_and_downstream() {
        let g = diamond();
        let up: Vec<_> = g.upstream("D").into_iter().collect();
        assert_eq!(up, vec!["A", "B", "C"]);
        let down: Vec<_> = g.downstream("B").into_iter().collect();
        assert_eq!(down, vec!["B", "D"]);
        assert!(g.upstream("A").is_empty());
    }

    #[test]
    fn test_is_skipped_requires_all_predecessors_skipped() {
        let g = diamond();
        let mut statuses = BTreeMap::new();
        statuses.insert("A".to_string(), NodeStatus::Done);
        statuses.insert("B".to_string(), NodeStatus::Skipped);
        statuses.insert("C".to_string(), NodeStatus::Done);
        statuses.insert("D".to_string(), NodeStatus::Pending);
        assert!(!is_skipped("D", &statuses, &g.edges));

        statuses.insert("C".to_string(), NodeStatus::Skipped);
        assert!(is_skipped("D", &statuses, &g.edges));
        // Roots are never skipped by propagation.
        assert!(!is_skipped("A", &statuses, &g.edges));
    }

    #[test]
    fn test_route_skips_single_choice() {
        let router = Node::new("router", NodeKind::Router, "route");
        let edges = vec![
            Edge::new("router", "even"),
            Edge::new("router", "odd"),
            Edge::new("router", "other"),
        ];
        let outgoing: Vec<&Edge> = edges.iter().collect();
        let skips = route_skips(&router, &serde_json::json!({"data": {}, "route": "even"}), &outgoing);
        assert_eq!(skips, vec!["odd", "other"]);
    }

    #[test]
    fn test_route_skips_broadcast_and_no_selection() {
        let node = Node::new("n", NodeKind::Llm, "n").with_routing(Routing {
            mode: RoutingMode::Broadcast,
            ..Routing::default()
        });
        let edges = vec![Edge::new("n", "x")];
        let outgoing: Vec<&Edge> = edges.iter().collect();
        assert!(route_skips(&node, &serde_json::json!({"route": "y"}), &outgoing).is_empty());

        let router = Node::new("r", NodeKind::Router, "r");
        assert!(route_skips(&router, &serde_json::json!({"data": 1}), &outgoing).is_empty());
    }

    #[test]
    fn test_route_skips_multiple() {
        let node = Node::new("n", NodeKind::Llm, "n").with_routing(Routing {
            allow_multiple: true,
            ..Routing::default()
        });
        let edges = vec![Edge::new("n", "a"), Edge::new("n", "b"), Edge::new("n", "c")];
        let outgoing: Vec<&Edge> = edges.iter().collect();
        let skips = route_skips(&node, &serde_json::json!({"routes": ["a", "c"]}), &outgoing);
        assert_eq!(skips, vec!["b"]);
    }

    #[test]
    fn test_parse_node_json() {
        let node: Node = serde_json::from_value(serde_json::json!({
            "id": "pick",
            "type": "router",
            "name": "Pick a branch",
            "tools": ["readFile", {"name": "fetchUrl", "maxChars": 100}],
            "routing": {"mode": "llm-switch", "allowMultiple": true}
        }))
        .unwrap();
        assert_eq!(node.kind, NodeKind::Router);
        assert_eq!(node.tools[0].name(), "readFile");
        assert_eq!(node.tools[1].options()["maxChars"], 100);
        let routing = node.routing.unwrap();
        assert!(routing.allow_multiple);
        assert!(routing.required);
    }
}
