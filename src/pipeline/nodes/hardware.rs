//! HardwareNode - device-backed processing node.
//!
//! Every request is packed into a [`DevicePacket`] holding a command buffer
//! and the fences the device signals on completion.

use crate::backend::cmd_buffer::CmdBufferManagerConfig;
use crate::backend::device::{DeviceChannel, DevicePacket};
use crate::error::Result;
use crate::fence::FenceHandle;
use crate::pipeline::node::Node;
use crate::pipeline::plugin::{ExecuteProcessRequestData, NodeCapabilities, NodeInitContext, NodePlugin};
use std::sync::Arc;

const DEFAULT_CMD_BUFFER_SIZE: usize = 4096;

pub struct HardwareNode {
    device: Arc<dyn DeviceChannel>,
    cmd_buffer_size: usize,
}

impl HardwareNode {
    pub fn new(device: Arc<dyn DeviceChannel>) -> Self {
        Self {
            device,
            cmd_buffer_size: DEFAULT_CMD_BUFFER_SIZE,
        }
    }

    pub fn with_cmd_buffer_size(mut self, size: usize) -> Self {
        self.cmd_buffer_size = size;
        self
    }
}

impl NodePlugin for HardwareNode {
    fn initialize(&self, ctx: &NodeInitContext) -> Result<NodeCapabilities> {
        Ok(NodeCapabilities {
            cmd_buffer_managers: vec![CmdBufferManagerConfig::new(
                format!("{}_cmd", ctx.node_name),
                self.cmd_buffer_size,
                ctx.settings.max_request_queue_depth as u32,
            )],
            parallel_process_requests: false,
        })
    }

    fn execute_process_request(&self, node: &Node, data: &ExecuteProcessRequestData) -> Result<()> {
        let cmd_buffer = node.acquire_cmd_buffer(0, data.request_id)?;

        let mut fences: Vec<FenceHandle> = Vec::with_capacity(data.outputs.len());
        for output in &data.outputs {
            for fence in std::iter::once(output.fence).chain(output.delayed_fence) {
                if fence.is_valid() && !fences.contains(&fence) {
                    fences.push(fence);
                }
            }
        }

        tracing::trace!(
            "{} submitting request {} with {} fences",
            node.name(),
            data.request_id,
            fences.len()
        );
        self.device.submit(DevicePacket {
            node: node.name().to_string(),
            request_id: data.request_id,
            fences,
            cmd_buffer: Some(cmd_buffer),
        })
    }

    fn cancel_request(&self, request_id: u64) {
        self.device.cancel(request_id);
    }
}
