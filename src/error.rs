//! Error handling for camnode
//!
//! This module defines the error taxonomy shared by every node operation
//! and a Result alias used throughout the crate.

use thiserror::Error;

/// Main error type for node operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    /// Allocation of ports, buffers or per-request tables failed
    #[error("Out of memory: {0}")]
    NoMemory(String),

    /// A pooled resource (image buffer, fence slot, ring slot) is exhausted
    #[error("Resource unavailable: {0}")]
    Resource(String),

    /// Malformed argument or negotiation data
    #[error("Invalid argument: {0}")]
    InvalidArg(String),

    /// A collaborator that must exist is missing
    #[error("Invalid pointer: {0}")]
    InvalidPointer(String),

    /// Operation is not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The request was cancelled (flush path)
    #[error("Request {0} cancelled")]
    CancelledRequest(u64),

    /// Generic failure reported by a derived node or the hardware
    #[error("Operation failed: {0}")]
    Failed(String),

    /// Errors reported by the fence primitive
    #[error("Fence error: {0}")]
    Fence(String),

    /// Errors related to configuration loading/saving
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<NodeError>,
    },
}

impl NodeError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        NodeError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Innermost error, skipping context wrappers
    pub fn root(&self) -> &NodeError {
        match self {
            NodeError::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    /// Cancellation is logged at info level and never counted as a failure
    pub fn is_cancellation(&self) -> bool {
        matches!(self.root(), NodeError::CancelledRequest(_))
    }

    /// Resource exhaustion while acquiring buffers for a single request may be
    /// retried by the pipeline later
    pub fn is_retryable(&self) -> bool {
        matches!(self.root(), NodeError::Resource(_))
    }
}

/// Result type alias for node operations
pub type Result<T> = std::result::Result<T, NodeError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}
