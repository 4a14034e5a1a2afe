/// A generation request that cannot be turned into a graph.
///
/// Raised before any network call is made.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Model reference must not be empty")]
    MissingModel,

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("No text encoder convention for model family '{family}'; set text_encoders explicitly")]
    UnknownTextEncoder { family: String },

    #[error("No VAE convention for model family '{family}'; set vae explicitly")]
    UnknownVae { family: String },

    #[error("Template error: {0}")]
    Template(#[from] TemplateError),
}

/// Structural problems in a node graph.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("Workflow JSON must be an object keyed by node id")]
    NotAnObject,

    #[error("Node {node_id} is malformed: {reason}")]
    MalformedNode { node_id: String, reason: String },

    #[error("Node {node_id} input '{input}' references missing node {target}")]
    DanglingLink {
        node_id: String,
        input: String,
        target: String,
    },

    #[error("Workflow contains a reference cycle through node {0}")]
    Cycle(String),

    #[error("Workflow has no nodes")]
    Empty,
}

/// Failures while filling a stored workflow template.
#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("Filled template is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Filled template is not a valid workflow: {0}")]
    InvalidGraph(#[from] GraphError),
}
