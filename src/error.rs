use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("duplicate node name '{0}'")]
    DuplicateNode(String),
    #[error("node '{0}' not found")]
    UnknownNode(String),
    #[error("node '{node}' references missing node '{missing}'")]
    DanglingReference { node: String, missing: String },
    #[error("malformed tensor name '{0}'")]
    MalformedTensorName(String),
    #[error("cycle detected through data edges")]
    Cycle,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ShapeError {
    #[error("rank mismatch: {0} vs {1}")]
    RankMismatch(usize, usize),
    #[error("dimension {axis} conflicts: {left} vs {right}")]
    DimConflict { axis: usize, left: usize, right: usize },
    #[error("shapes {0} and {1} cannot be broadcast")]
    Broadcast(String, String),
    #[error("invalid argument for {op}: {message}")]
    InvalidArgument { op: String, message: String },
    #[error("node '{node}': {source}")]
    AtNode {
        node: String,
        #[source]
        source: Box<ShapeError>,
    },
}

impl ShapeError {
    pub fn invalid(op: &str, message: impl Into<String>) -> Self {
        ShapeError::InvalidArgument { op: op.to_string(), message: message.into() }
    }

    pub fn at_node(self, node: &str) -> Self {
        ShapeError::AtNode { node: node.to_string(), source: Box::new(self) }
    }
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("failed to decode graph: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("unknown dtype enum {0}")]
    UnknownDType(i32),
    #[error("node '{node}': attribute '{key}' is missing or malformed")]
    BadAttr { node: String, key: String },
    #[error(transparent)]
    Graph(#[from] GraphError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("the following subgraphs failed to compile: {segments:?}")]
    Uncompiled { segments: Vec<String> },
}
