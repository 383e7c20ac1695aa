//! SoftwareNode - node that completes its outputs on the calling thread.

use crate::error::Result;
use crate::fence::FenceResult;
use crate::pipeline::node::Node;
use crate::pipeline::plugin::{ExecuteProcessRequestData, NodeCapabilities, NodeInitContext, NodePlugin};

/// Signals every output fence as soon as the request is executed.
///
/// A bypassable software node first picks its delayed output buffers,
/// either its own or, with [`SoftwareNode::bypassing`], the buffers it
/// reads on one input.
#[derive(Debug, Clone, Default)]
pub struct SoftwareNode {
    bypass_input: Option<usize>,
    publish_tags: Vec<u32>,
}

impl SoftwareNode {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pass the buffers of `input_index` through to the outputs
    pub fn bypassing(input_index: usize) -> Self {
        Self {
            bypass_input: Some(input_index),
            ..Self::default()
        }
    }

    pub fn with_publish_tags(mut self, tags: Vec<u32>) -> Self {
        self.publish_tags = tags;
        self
    }
}

impl NodePlugin for SoftwareNode {
    fn initialize(&self, _ctx: &NodeInitContext) -> Result<NodeCapabilities> {
        Ok(NodeCapabilities::default())
    }

    fn execute_process_request(&self, node: &Node, data: &ExecuteProcessRequestData) -> Result<()> {
        if node.is_bypassable() {
            for output in &data.outputs {
                node.set_delayed_output_buffers(data.request_id, output.output_index, self.bypass_input)?;
            }
        }
        node.signal_output_fences(data.request_id, FenceResult::Success)
    }

    fn query_metadata_publish_list(&self) -> Vec<u32> {
        self.publish_tags.clone()
    }
}
