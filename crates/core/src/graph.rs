//! Wire-level node graph in ComfyUI's "API format".
//!
//! A [`Workflow`] is an insertion-ordered map of node id -> [`GraphNode`].
//! Inputs are either literal JSON values or [`Link`]s to another node's
//! output slot, serialized as `["<node id>", <slot>]`.
//!
//! Graphs produced by the builder are acyclic by construction. Graphs
//! parsed from stored templates go through [`Workflow::validate`].

use std::collections::HashMap;

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::GraphError;

// ---------------------------------------------------------------------------
// Output node detection
// ---------------------------------------------------------------------------

/// Class types that persist or emit the final artifact of a workflow.
pub const OUTPUT_CLASS_TYPES: &[&str] = &[
    "SaveImage",
    "SaveAnimatedWEBP",
    "SaveAnimatedPNG",
    "SaveVideo",
    "VHS_VideoCombine",
    "PreviewImage",
];

/// Whether a class type is a terminal output node.
pub fn is_output_class(class_type: &str) -> bool {
    OUTPUT_CLASS_TYPES.contains(&class_type) || class_type.starts_with("Save")
}

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// Reference to output slot `slot` of node `node`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Link {
    pub node: String,
    pub slot: u32,
}

impl Link {
    pub fn new(node: impl Into<String>, slot: u32) -> Self {
        Self {
            node: node.into(),
            slot,
        }
    }
}

/// A single node input: a literal value or a link to another node.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeInput {
    Link(Link),
    Value(Value),
}

impl NodeInput {
    /// Interpret a raw JSON input value.
    ///
    /// A two-element array of `[string, non-negative integer]` is a link;
    /// anything else is a literal.
    pub fn from_value(value: Value) -> Self {
        if let Value::Array(items) = &value {
            if let [Value::String(node), Value::Number(slot)] = items.as_slice() {
                if let Some(slot) = slot.as_u64().and_then(|s| u32::try_from(s).ok()) {
                    return NodeInput::Link(Link::new(node.clone(), slot));
                }
            }
        }
        NodeInput::Value(value)
    }

    /// Render as the wire JSON value.
    pub fn to_value(&self) -> Value {
        match self {
            NodeInput::Link(link) => Value::Array(vec![
                Value::String(link.node.clone()),
                Value::from(link.slot),
            ]),
            NodeInput::Value(value) => value.clone(),
        }
    }

    pub fn as_link(&self) -> Option<&Link> {
        match self {
            NodeInput::Link(link) => Some(link),
            NodeInput::Value(_) => None,
        }
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            NodeInput::Link(_) => None,
            NodeInput::Value(value) => Some(value),
        }
    }
}

impl From<Link> for NodeInput {
    fn from(link: Link) -> Self {
        NodeInput::Link(link)
    }
}

impl Serialize for NodeInput {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for NodeInput {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(NodeInput::from_value)
    }
}

// ---------------------------------------------------------------------------
// GraphNode
// ---------------------------------------------------------------------------

/// One node of a workflow: its ComfyUI class and keyed inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub class_type: String,
    #[serde(default)]
    pub inputs: IndexMap<String, NodeInput>,
    /// Editor metadata (e.g. `{"title": ...}`), carried through untouched.
    #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl GraphNode {
    pub fn new(class_type: impl Into<String>) -> Self {
        Self {
            class_type: class_type.into(),
            inputs: IndexMap::new(),
            meta: None,
        }
    }

    /// Builder-style helper to add an input.
    pub fn input(mut self, name: &str, value: impl Into<NodeInput>) -> Self {
        self.inputs.insert(name.to_string(), value.into());
        self
    }

    /// Builder-style helper to add a literal input.
    pub fn literal(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.inputs
            .insert(name.to_string(), NodeInput::Value(value.into()));
        self
    }

    /// Look up a link input by name.
    pub fn link(&self, name: &str) -> Option<&Link> {
        self.inputs.get(name).and_then(NodeInput::as_link)
    }

    /// Look up a literal input by name.
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.inputs.get(name).and_then(NodeInput::as_value)
    }

    /// All links out of this node's inputs, with their input names.
    pub fn links(&self) -> impl Iterator<Item = (&str, &Link)> {
        self.inputs
            .iter()
            .filter_map(|(name, input)| input.as_link().map(|link| (name.as_str(), link)))
    }

    fn to_value(&self) -> Value {
        let inputs: Map<String, Value> = self
            .inputs
            .iter()
            .map(|(name, input)| (name.clone(), input.to_value()))
            .collect();

        let mut node = Map::new();
        node.insert("class_type".into(), Value::String(self.class_type.clone()));
        node.insert("inputs".into(), Value::Object(inputs));
        if let Some(meta) = &self.meta {
            node.insert("_meta".into(), meta.clone());
        }
        Value::Object(node)
    }
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// A complete node graph ready for submission.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Workflow {
    nodes: IndexMap<String, GraphNode>,
    output_node: Option<String>,
}

impl Workflow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a workflow from its wire JSON and validate it.
    ///
    /// The terminal output node is the last node whose class type is a
    /// known save/preview class.
    pub fn from_value(value: &Value) -> Result<Self, GraphError> {
        let object = value.as_object().ok_or(GraphError::NotAnObject)?;

        let mut workflow = Workflow::new();
        for (node_id, raw) in object {
            let node: GraphNode =
                serde_json::from_value(raw.clone()).map_err(|e| GraphError::MalformedNode {
                    node_id: node_id.clone(),
                    reason: e.to_string(),
                })?;
            if is_output_class(&node.class_type) {
                workflow.output_node = Some(node_id.clone());
            }
            workflow.nodes.insert(node_id.clone(), node);
        }

        workflow.validate()?;
        Ok(workflow)
    }

    /// Render the workflow as the JSON object ComfyUI expects under
    /// the `prompt` key of a submission.
    pub fn to_value(&self) -> Value {
        let nodes: Map<String, Value> = self
            .nodes
            .iter()
            .map(|(id, node)| (id.clone(), node.to_value()))
            .collect();
        Value::Object(nodes)
    }

    /// Append a node. Replaces any node with the same id.
    pub fn insert(&mut self, id: impl Into<String>, node: GraphNode) {
        let id = id.into();
        if is_output_class(&node.class_type) {
            self.output_node = Some(id.clone());
        }
        self.nodes.insert(id, node);
    }

    pub fn get(&self, id: &str) -> Option<&GraphNode> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (&str, &GraphNode)> {
        self.nodes.iter().map(|(id, node)| (id.as_str(), node))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Id of the terminal save/output node, if the graph has one.
    pub fn output_node(&self) -> Option<&str> {
        self.output_node.as_deref()
    }

    /// Ids of all nodes with the given class type, in insertion order.
    pub fn nodes_of_class<'a>(&'a self, class_type: &'a str) -> Vec<&'a str> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.class_type == class_type)
            .map(|(id, _)| id.as_str())
            .collect()
    }

    pub fn count_class(&self, class_type: &str) -> usize {
        self.nodes
            .values()
            .filter(|node| node.class_type == class_type)
            .count()
    }

    /// Number of terminal output nodes in the graph.
    pub fn output_count(&self) -> usize {
        self.nodes
            .values()
            .filter(|node| is_output_class(&node.class_type))
            .count()
    }

    /// Check that every link targets an existing node and that the
    /// link relation is acyclic.
    pub fn validate(&self) -> Result<(), GraphError> {
        if self.nodes.is_empty() {
            return Err(GraphError::Empty);
        }

        for (id, node) in &self.nodes {
            for (input, link) in node.links() {
                if !self.nodes.contains_key(&link.node) {
                    return Err(GraphError::DanglingLink {
                        node_id: id.clone(),
                        input: input.to_string(),
                        target: link.node.clone(),
                    });
                }
            }
        }

        self.check_acyclic()
    }

    /// Iterative three-colour DFS over the link relation.
    fn check_acyclic(&self) -> Result<(), GraphError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        let mut marks: HashMap<&str, Mark> = HashMap::with_capacity(self.nodes.len());

        for start in self.nodes.keys() {
            if marks.contains_key(start.as_str()) {
                continue;
            }

            // Stack of (node id, whether its children were pushed).
            let mut stack: Vec<(&str, bool)> = vec![(start.as_str(), false)];
            while let Some((id, expanded)) = stack.pop() {
                if expanded {
                    marks.insert(id, Mark::Done);
                    continue;
                }
                match marks.get(id) {
                    Some(Mark::Done) => continue,
                    Some(Mark::Visiting) => continue,
                    None => {}
                }
                marks.insert(id, Mark::Visiting);
                stack.push((id, true));

                let Some(node) = self.nodes.get(id) else {
                    continue;
                };
                for (_, link) in node.links() {
                    match marks.get(link.node.as_str()) {
                        Some(Mark::Visiting) => return Err(GraphError::Cycle(link.node.clone())),
                        Some(Mark::Done) => {}
                        None => stack.push((link.node.as_str(), false)),
                    }
                }
            }
        }

        Ok(())
    }
}

impl Serialize for Workflow {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.nodes.serialize(serializer)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
