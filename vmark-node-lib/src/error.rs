use thiserror::Error;

/// Errors surfaced by the node's control plane.
#[derive(Error, Debug)]
pub enum NodeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("datapath error: {0}")]
    Datapath(#[from] vmark_node_datapath::DatapathError),

    /// Bad parameter from the operator or controller. No side effect occurred.
    #[error("{0}")]
    Validation(String),

    /// Duplicate rule name/match tuple, or a session already active.
    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    NotFound(String),

    /// A required subsystem cannot serve the request (maps to HTTP 501).
    #[error("{0}")]
    Unavailable(String),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),
}

impl NodeError {
    /// Whether the caller supplied bad input (vs. the node failing).
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            NodeError::Validation(_) | NodeError::Conflict(_) | NodeError::NotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, NodeError>;
