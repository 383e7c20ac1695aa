//! Port model for the node system.
//!
//! A node owns its input and output ports. Links between nodes are recorded
//! as plain [`NodeId`]s and indices: an input port names its parent node and
//! the parent output it reads, an output port lists the inputs it feeds.
//! Nodes never own each other; the pipeline arena does.

use crate::buffer::format::{BufferProperties, Format, ImageFormat};
use crate::buffer::manager::ImageBufferManager;
use crate::config::{InputPortConfig, OutputPortConfig};
use crate::error::{NodeError, Result};
use crate::pipeline::id::NodeId;
use crate::pipeline::negotiation::BufferRequirement;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// Static output port properties.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutputPortFlags {
    pub is_sink: bool,
    pub is_sink_no_buffer: bool,
    pub is_loopback: bool,
    pub is_non_sink_hal_output: bool,
    pub is_shared_sink: bool,
    pub is_batch_mode: bool,
}

/// One input fed by an output port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Destination {
    pub node: NodeId,
    pub input_index: usize,
}

#[derive(Debug)]
pub struct InputPort {
    pub index: usize,
    pub port_id: u32,
    pub format: Format,
    /// Expected client buffer size for source ports
    pub default_size: (u32, u32),
    pub parent: Option<NodeId>,
    pub parent_output_index: usize,
    pub buffer_delta: u32,
    pub is_loopback: bool,
    /// Fed by the client rather than another node
    pub is_source: bool,
    /// Per-request toggle, see `Node::disable_input_output_link`
    pub port_disabled: AtomicBool,
    /// Negotiated requirement, kept for source ports
    pub requirement: Option<BufferRequirement>,
    /// Wraps client buffers imported into a source port
    pub source_manager: Option<Arc<ImageBufferManager>>,
}

impl InputPort {
    fn from_config(index: usize, config: &InputPortConfig) -> Self {
        Self {
            index,
            port_id: config.id,
            format: config.format,
            default_size: (config.width, config.height),
            parent: None,
            parent_output_index: 0,
            buffer_delta: config.buffer_delta,
            is_loopback: false,
            is_source: config.is_source(),
            port_disabled: AtomicBool::new(false),
            requirement: None,
            source_manager: None,
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.port_disabled.load(Ordering::Acquire)
    }

    pub fn is_linked(&self) -> bool {
        !self.is_source && self.parent.is_some()
    }

    pub fn default_format(&self) -> ImageFormat {
        ImageFormat::new(self.format, self.default_size.0, self.default_size.1)
    }
}

#[derive(Debug)]
pub struct OutputPort {
    pub index: usize,
    pub port_id: u32,
    /// Largest image the port produces; the stream size for sinks
    pub capability: ImageFormat,
    pub flags: OutputPortFlags,
    pub max_image_buffers: u32,
    pub immediate_alloc_count: u32,
    /// Zero means the port has its own fence
    pub composite_group: u32,
    pub stream_id: Option<u32>,
    pub enabled_in_stream_mask: u64,
    pub destinations: Vec<Destination>,
    pub num_input_ports_connected: u32,
    /// Consumers of a bypassable child that may read this port's buffer
    pub num_input_ports_connected_in_bypass: u32,
    pub num_input_ports_disabled: AtomicU32,
    pub device_indices: Vec<u32>,
    pub properties: Option<BufferProperties>,
    pub manager: Option<Arc<ImageBufferManager>>,
}

impl OutputPort {
    fn from_config(index: usize, config: &OutputPortConfig) -> Self {
        let enabled_in_stream_mask = match (config.sink, config.stream_id) {
            (true, Some(stream)) => 1u64 << (stream % 64),
            _ if config.sink_no_buffer => u64::MAX,
            _ => 0,
        };
        Self {
            index,
            port_id: config.id,
            capability: config.image_format(),
            flags: OutputPortFlags {
                is_sink: config.sink,
                is_sink_no_buffer: config.sink_no_buffer,
                is_loopback: false,
                is_non_sink_hal_output: config.non_sink_hal_output,
                is_shared_sink: config.shared_sink,
                is_batch_mode: false,
            },
            max_image_buffers: if config.sink_no_buffer {
                0
            } else {
                config.max_image_buffers
            },
            immediate_alloc_count: config.immediate_alloc_count,
            composite_group: config.composite_group,
            stream_id: config.stream_id,
            enabled_in_stream_mask,
            destinations: Vec::new(),
            num_input_ports_connected: 0,
            num_input_ports_connected_in_bypass: 0,
            num_input_ports_disabled: AtomicU32::new(0),
            device_indices: Vec::new(),
            properties: None,
            manager: None,
        }
    }

    /// Sink and sink-no-buffer ports have no intra-pipeline owner reference
    pub fn is_sink_like(&self) -> bool {
        self.flags.is_sink || self.flags.is_sink_no_buffer
    }

    pub fn has_buffers(&self) -> bool {
        !self.flags.is_sink_no_buffer && self.max_image_buffers > 0
    }

    /// Whether the port takes part in per-request setup at all
    pub fn needs_fence(&self) -> bool {
        self.has_buffers() || self.flags.is_sink_no_buffer
    }

    /// Consumers expected to release this port for a request
    pub fn consumer_count(&self) -> u32 {
        (self.num_input_ports_connected + self.num_input_ports_connected_in_bypass)
            .saturating_sub(self.num_input_ports_disabled.load(Ordering::Acquire))
    }

    /// Composite fence references contributed by this port
    pub fn fence_seed(&self) -> u32 {
        let own = if self.is_sink_like() { 0 } else { 1 };
        own + self.consumer_count()
    }

    /// References each image buffer starts with
    pub fn buffer_seed(&self) -> u32 {
        1 + self.consumer_count()
    }

    /// Number of fence handlers kept for this port
    pub fn handler_capacity(&self, ring_depth: usize) -> usize {
        if self.max_image_buffers > 0 {
            self.max_image_buffers as usize
        } else {
            ring_depth.max(1)
        }
    }

    pub fn handler_index(&self, request_id: u64, ring_depth: usize) -> usize {
        (request_id % self.handler_capacity(ring_depth) as u64) as usize
    }

    pub fn is_enabled_for(&self, active_streams: u64) -> bool {
        self.flags.is_loopback
            || self.flags.is_sink_no_buffer
            || (self.enabled_in_stream_mask & active_streams) != 0
    }
}

/// All ports of one node.
#[derive(Debug, Default)]
pub struct PortTable {
    pub inputs: Vec<InputPort>,
    pub outputs: Vec<OutputPort>,
}

impl PortTable {
    pub fn new(inputs: &[InputPortConfig], outputs: &[OutputPortConfig]) -> Result<Self> {
        let mut seen = HashSet::new();
        for port in outputs {
            if !seen.insert(port.id) {
                return Err(NodeError::InvalidArg(format!("duplicate output port {}", port.id)));
            }
        }
        seen.clear();
        for port in inputs {
            if !seen.insert(port.id) {
                return Err(NodeError::InvalidArg(format!("duplicate input port {}", port.id)));
            }
        }

        Ok(Self {
            inputs: inputs
                .iter()
                .enumerate()
                .map(|(i, c)| InputPort::from_config(i, c))
                .collect(),
            outputs: outputs
                .iter()
                .enumerate()
                .map(|(i, c)| OutputPort::from_config(i, c))
                .collect(),
        })
    }

    pub fn output_index(&self, port_id: u32) -> Option<usize> {
        self.outputs.iter().position(|p| p.port_id == port_id)
    }

    pub fn input_index(&self, port_id: u32) -> Option<usize> {
        self.inputs.iter().position(|p| p.port_id == port_id)
    }

    pub fn output(&self, index: usize) -> Result<&OutputPort> {
        self.outputs
            .get(index)
            .ok_or_else(|| NodeError::InvalidArg(format!("no output port at index {}", index)))
    }

    pub fn input(&self, index: usize) -> Result<&InputPort> {
        self.inputs
            .get(index)
            .ok_or_else(|| NodeError::InvalidArg(format!("no input port at index {}", index)))
    }

    /// Consumers fed through this node when it is bypassed
    pub fn bypass_consumer_count(&self) -> u32 {
        self.outputs
            .iter()
            .filter(|p| !p.flags.is_loopback)
            .map(|p| p.num_input_ports_connected)
            .sum()
    }
}
