//! # camnode: per-node request orchestration for camera pipelines
//!
//! Each node of a camera processing graph drives its requests through
//! setup, processing, fence completion and cleanup. The crate owns the
//! bookkeeping around that: ports and links, buffer negotiation, image
//! buffer managers, reference counted fences shared between outputs,
//! a per-request slot ring with exactly-once completion latches, and flush.
//!
//! ## Architecture
//!
//! - **Pipeline**: builds the graph from a TOML config, admits requests and
//!   schedules node processing on a job pool
//! - **Node**: per-node state machine; node types plug in through
//!   [`pipeline::NodePlugin`]
//! - **Fences**: [`fence::FenceProvider`] with an in-process implementation
//! - **Backend**: job pool, command buffer pools and a simulated device
//!
//! ## Example
//!
//! ```ignore
//! use camnode::{config::PipelineConfig, pipeline::PipelineBuilder, types::CaptureRequest};
//! use std::time::Duration;
//!
//! let config = PipelineConfig::load("configs/sim.toml")?;
//! let pipeline = PipelineBuilder::new(config).build()?;
//! pipeline.submit_request(CaptureRequest::new(0, 0b1))?;
//! let outcome = pipeline.wait_request(0, Duration::from_secs(1))?;
//! assert!(!outcome.failed);
//! ```

pub mod backend;
pub mod buffer;
pub mod config;
pub mod error;
pub mod fence;
pub mod metadata;
pub mod pipeline;
pub mod sync;
pub mod types;

// Re-export commonly used types
pub use config::{NodeSettings, PipelineConfig};
pub use error::{NodeError, Result, ResultExt};
pub use pipeline::{Node, Pipeline, PipelineBuilder, PipelineError};
pub use types::CaptureRequest;
