//! Node-based camera processing pipeline.
//!
//! Requests flow through a graph of nodes. Every node claims a ring slot
//! per request, acquires image buffers and fences for its outputs, waits on
//! its inputs, runs its plugin and completes when its output fences are
//! signalled and processed.
//!
//! # Architecture
//!
//! ```text
//!            setup_request (topological order)
//! [sensor] ───────────────► [ife] ───────────────► [stream 0]
//!    │  output fence ──────► │  output fence ──────► client
//!    └──── release ◄─────────┘
//! ```
//!
//! # Design
//!
//! - **Per-node locks only** - nodes never hold a lock while calling a peer,
//!   the pipeline or a plugin.
//! - **Latched completion** - partial metadata, metadata and request done
//!   each fire exactly once per request.
//! - **Reference counted fences** - a fence shared by several outputs is
//!   released once, by whoever drops the last reference.
//! - **Weak upward links** - nodes reach the pipeline through
//!   `Weak<dyn PipelineHost>`.

pub mod builder;
pub mod error;
pub mod executor;
pub mod fence_handler;
pub mod host;
pub mod id;
pub mod negotiation;
pub mod node;
pub mod nodes;
pub mod plugin;
pub mod port;
pub mod request;

pub use builder::PipelineBuilder;
pub use error::{PipelineError, PipelineResult};
pub use executor::{Edge, Pipeline, PipelineDump, PipelineEvent, RequestOutcome};
pub use host::{HostEvent, PipelineHost, RequestLedger, StandaloneHost};
pub use id::{EdgeId, NodeId};
pub use negotiation::BufferRequirement;
pub use node::{Node, NodeCreateInfo, NodeEnvironment, NodeFlags, NodeStateDump};
pub use nodes::{HardwareNode, SoftwareNode};
pub use plugin::{ExecuteProcessRequestData, NodeCapabilities, NodeInitContext, NodePlugin};
pub use request::PerRequestNodeStatus;
