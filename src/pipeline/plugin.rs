//! Hooks implemented by concrete node types.
//!
//! The [`Node`] orchestrator owns the request state machine and the buffer
//! and fence bookkeeping. Everything that differs between node types (how
//! work is submitted, how input requirements are derived, what is published)
//! lives behind [`NodePlugin`].

use crate::backend::cmd_buffer::CmdBufferManagerConfig;
use crate::buffer::image_buffer::ImageBuffer;
use crate::config::NodeSettings;
use crate::error::Result;
use crate::fence::{FenceHandle, FenceResult};
use crate::pipeline::id::NodeId;
use crate::pipeline::negotiation::{default_finalize, BufferNegotiationData};
use crate::pipeline::node::{Node, NodeFlags};
use crate::pipeline::request::InputBinding;
use crate::types::CaptureRequest;
use std::sync::Arc;

/// What a plugin sees at initialization.
#[derive(Debug, Clone)]
pub struct NodeInitContext {
    pub node_id: NodeId,
    pub node_name: String,
    pub type_id: u32,
    pub instance_id: u32,
    pub flags: NodeFlags,
    pub input_count: usize,
    pub output_count: usize,
    pub settings: Arc<NodeSettings>,
}

/// Resources a plugin asks for at initialization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeCapabilities {
    pub cmd_buffer_managers: Vec<CmdBufferManagerConfig>,
    /// Let requests run through `execute_process_request` concurrently
    pub parallel_process_requests: bool,
}

/// One output of the request being executed.
#[derive(Debug, Clone)]
pub struct OutputPortRequest {
    pub output_index: usize,
    pub port_id: u32,
    pub fence: FenceHandle,
    pub delayed_fence: Option<FenceHandle>,
    pub buffers: Vec<Arc<ImageBuffer>>,
}

/// Input of [`NodePlugin::execute_process_request`].
#[derive(Debug, Clone)]
pub struct ExecuteProcessRequestData {
    pub request_id: u64,
    pub sequence_id: u32,
    pub request: Arc<CaptureRequest>,
    pub inputs: Vec<InputBinding>,
    pub outputs: Vec<OutputPortRequest>,
}

/// A fence of this node was signalled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FenceSignal {
    pub request_id: u64,
    pub output_index: usize,
    pub port_id: u32,
    pub fence: FenceHandle,
    pub result: FenceResult,
    pub is_delayed: bool,
}

#[cfg_attr(test, mockall::automock)]
pub trait NodePlugin: Send + Sync {
    fn initialize(&self, ctx: &NodeInitContext) -> Result<NodeCapabilities>;

    /// Submit the work for one request. Outputs complete when their fences
    /// are signalled, by the device or by the plugin itself.
    fn execute_process_request(&self, node: &Node, data: &ExecuteProcessRequestData) -> Result<()>;

    /// Fill in the final output requirements and the requirement of every
    /// input
    fn finalize_input_requirement(&self, data: &mut BufferNegotiationData) -> Result<()> {
        default_finalize(data)
    }

    fn fence_callback(&self, _signal: &FenceSignal) {}

    /// Drop any outstanding work for the request
    fn cancel_request(&self, _request_id: u64) {}

    /// Metadata tags published when the node completes a request
    fn query_metadata_publish_list(&self) -> Vec<u32> {
        Vec::new()
    }
}
