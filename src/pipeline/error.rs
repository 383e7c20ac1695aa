//! Pipeline-specific error types.

use crate::error::NodeError;
use crate::pipeline::id::NodeId;
use thiserror::Error;

/// Errors that can occur while building or driving a pipeline.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Node {node_id:?} error: {source}")]
    Node {
        node_id: NodeId,
        #[source]
        source: NodeError,
    },

    #[error("Invalid edge: {0}")]
    InvalidEdge(String),

    #[error("Cycle detected in pipeline graph")]
    CycleDetected,

    #[error("Port mismatch: {0}")]
    PortMismatch(String),

    #[error("Unknown node '{0}'")]
    UnknownNode(String),

    #[error("Request {0} is not known to the pipeline")]
    UnknownRequest(u64),

    #[error("Timed out waiting for request {0}")]
    Timeout(u64),

    #[error(transparent)]
    Config(#[from] NodeError),

    #[error("Pipeline not finalized")]
    NotFinalized,
}

impl PipelineError {
    pub fn node(node_id: NodeId, source: NodeError) -> Self {
        PipelineError::Node { node_id, source }
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
