//! Configuration module for camnode
//!
//! This module handles:
//! - Node settings injected into every node at construction ([`NodeSettings`])
//! - Pipeline topology files describing nodes, ports and links
//! - Simulated device parameters used by the `camnode-sim` binary
//!
//! # File format
//!
//! Pipelines are described in TOML:
//!
//! ```toml
//! name = "preview"
//!
//! [settings]
//! max_request_queue_depth = 8
//!
//! [device]
//! latency_ms = 2
//!
//! [[nodes]]
//! name = "sensor"
//! kind = "software"
//!
//! [[nodes.outputs]]
//! id = 0
//! format = "raw10"
//! width = 4000
//! height = 3000
//! max_image_buffers = 8
//!
//! [[nodes]]
//! name = "ife"
//! kind = "hardware"
//!
//! [[nodes.inputs]]
//! id = 0
//! parent = "sensor"
//! parent_port = 0
//!
//! [[nodes.outputs]]
//! id = 0
//! sink = true
//! stream_id = 0
//! format = "nv12"
//! width = 1920
//! height = 1080
//! max_image_buffers = 8
//! ```

pub mod settings;

pub use settings::*;

use crate::buffer::format::{Format, ImageFormat};
use crate::error::{NodeError, Result};
use crate::types::{CaptureRequest, ExternalBuffer, StreamBuffer};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Default number of buffers per output port
pub const DEFAULT_MAX_IMAGE_BUFFERS: u32 = 8;

/// Parameters of the simulated device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Time between receiving a packet and signalling its fences
    pub latency_ms: u64,
    /// Requests whose fences are signalled with `Failed`
    pub failing_requests: Vec<u64>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            latency_ms: 1,
            failing_requests: Vec::new(),
        }
    }
}

/// Strategy implementing a node's processing hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Submits work to the device and waits for its fences
    Hardware,
    /// Completes inline on the submitting thread
    #[default]
    Software,
}

/// Output port description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputPortConfig {
    pub id: u32,
    pub format: Format,
    /// For sink ports the stream size, otherwise the largest size the port
    /// can produce
    pub width: u32,
    pub height: u32,
    pub max_image_buffers: u32,
    pub immediate_alloc_count: u32,
    /// Client-visible stream output
    pub sink: bool,
    /// Output with no buffer (statistics, metadata only)
    pub sink_no_buffer: bool,
    /// Client buffer that is also consumed inside the pipeline
    pub non_sink_hal_output: bool,
    pub shared_sink: bool,
    /// Ports with the same non-zero group share one fence
    pub composite_group: u32,
    /// Client stream fed by a sink port
    pub stream_id: Option<u32>,
}

impl Default for OutputPortConfig {
    fn default() -> Self {
        Self {
            id: 0,
            format: Format::Nv12,
            width: 1920,
            height: 1080,
            max_image_buffers: DEFAULT_MAX_IMAGE_BUFFERS,
            immediate_alloc_count: 0,
            sink: false,
            sink_no_buffer: false,
            non_sink_hal_output: false,
            shared_sink: false,
            composite_group: 0,
            stream_id: None,
        }
    }
}

impl OutputPortConfig {
    pub fn image_format(&self) -> ImageFormat {
        ImageFormat::new(self.format, self.width, self.height)
    }
}

/// Input port description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputPortConfig {
    pub id: u32,
    /// Node feeding this port; `None` for source ports fed by the client
    pub parent: Option<String>,
    pub parent_port: u32,
    /// How many requests behind the parent this port reads
    pub buffer_delta: u32,
    pub format: Format,
    /// Source ports only: expected client buffer size
    pub width: u32,
    pub height: u32,
}

impl Default for InputPortConfig {
    fn default() -> Self {
        Self {
            id: 0,
            parent: None,
            parent_port: 0,
            buffer_delta: 0,
            format: Format::Nv12,
            width: 1920,
            height: 1080,
        }
    }
}

impl InputPortConfig {
    pub fn is_source(&self) -> bool {
        self.parent.is_none()
    }
}

/// Node description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub name: String,
    pub kind: NodeKind,
    pub type_id: u32,
    pub instance_id: u32,
    pub inplace: bool,
    pub bypassable: bool,
    pub realtime: bool,
    pub secure_mode: bool,
    pub deferred_init: bool,
    pub device_indices: Vec<u32>,
    /// Metadata tags the node publishes on completion
    pub publish_tags: Vec<u32>,
    pub inputs: Vec<InputPortConfig>,
    pub outputs: Vec<OutputPortConfig>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            kind: NodeKind::Software,
            type_id: 0,
            instance_id: 0,
            inplace: false,
            bypassable: false,
            realtime: false,
            secure_mode: false,
            deferred_init: false,
            device_indices: Vec::new(),
            publish_tags: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }
}

/// Complete pipeline description.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub name: String,
    pub settings: NodeSettings,
    pub device: DeviceConfig,
    pub nodes: Vec<NodeConfig>,
}

impl PipelineConfig {
    /// Parse a TOML document and validate it
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: PipelineConfig = toml::from_str(content)
            .map_err(|e| NodeError::Config(format!("Failed to parse pipeline config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a pipeline file from disk
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            NodeError::Config(format!("Failed to read pipeline config {:?}: {}", path, e))
        })?;
        Self::from_toml_str(&content).map_err(|e| e.with_context(format!("{:?}", path)))
    }

    /// Save the pipeline as TOML
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)
            .map_err(|e| NodeError::Config(format!("Failed to serialize pipeline config: {}", e)))?;
        std::fs::write(path, content).map_err(|e| {
            NodeError::Config(format!("Failed to write pipeline config {:?}: {}", path, e))
        })
    }

    pub fn node(&self, name: &str) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Bitmask with every configured client stream set
    pub fn all_streams_mask(&self) -> u64 {
        self.nodes
            .iter()
            .flat_map(|n| n.outputs.iter())
            .filter_map(|p| p.stream_id)
            .fold(0u64, |mask, id| mask | (1u64 << (id % 64)))
    }

    /// Request with a client buffer for every sink and source port, all
    /// configured streams active. Handles are unique per request.
    pub fn capture_request(&self, request_id: u64) -> CaptureRequest {
        let mut request = CaptureRequest::new(request_id, self.all_streams_mask());
        let mut next_handle = request_id.wrapping_mul(1024);
        for node in &self.nodes {
            for port in node.outputs.iter().filter(|p| p.sink) {
                next_handle += 1;
                let format = port.image_format();
                request = request.with_output(StreamBuffer::new(
                    port.id,
                    format,
                    ExternalBuffer::new(next_handle, format.size_bytes()),
                ));
            }
            for port in node.inputs.iter().filter(|p| p.is_source()) {
                next_handle += 1;
                let format = ImageFormat::new(port.format, port.width, port.height);
                request = request.with_input(StreamBuffer::new(
                    port.id,
                    format,
                    ExternalBuffer::new(next_handle, format.size_bytes()),
                ));
            }
        }
        request
    }

    /// Structural checks that do not need a built pipeline
    pub fn validate(&self) -> Result<()> {
        self.settings.validate()?;

        let mut names = HashSet::new();
        for node in &self.nodes {
            if node.name.is_empty() {
                return Err(NodeError::Config("node without a name".to_string()));
            }
            if !names.insert(node.name.as_str()) {
                return Err(NodeError::Config(format!("duplicate node name '{}'", node.name)));
            }

            let mut output_ids = HashSet::new();
            for port in &node.outputs {
                if !output_ids.insert(port.id) {
                    return Err(NodeError::Config(format!(
                        "node '{}' declares output port {} twice",
                        node.name, port.id
                    )));
                }
                if port.sink && port.stream_id.is_none() {
                    return Err(NodeError::Config(format!(
                        "sink port {} of '{}' needs a stream_id",
                        port.id, node.name
                    )));
                }
            }

            let mut input_ids = HashSet::new();
            for port in &node.inputs {
                if !input_ids.insert(port.id) {
                    return Err(NodeError::Config(format!(
                        "node '{}' declares input port {} twice",
                        node.name, port.id
                    )));
                }
            }
        }

        let mut client_ports = HashSet::new();
        for node in &self.nodes {
            let sinks = node.outputs.iter().filter(|p| p.sink).map(|p| ("sink", p.id));
            let sources = node.inputs.iter().filter(|p| p.is_source()).map(|p| ("source", p.id));
            for (kind, id) in sinks.chain(sources) {
                if !client_ports.insert((kind, id)) {
                    return Err(NodeError::Config(format!(
                        "{} port id {} of '{}' is already used by another node",
                        kind, id, node.name
                    )));
                }
            }
        }

        for node in &self.nodes {
            for port in &node.inputs {
                let Some(parent) = port.parent.as_deref() else {
                    continue;
                };
                let Some(parent_node) = self.node(parent) else {
                    return Err(NodeError::Config(format!(
                        "input {} of '{}' links to unknown node '{}'",
                        port.id, node.name, parent
                    )));
                };
                if !parent_node.outputs.iter().any(|o| o.id == port.parent_port) {
                    return Err(NodeError::Config(format!(
                        "input {} of '{}' links to missing port {} on '{}'",
                        port.id, node.name, port.parent_port, parent
                    )));
                }
                if port.buffer_delta as usize >= self.settings.max_request_queue_depth {
                    return Err(NodeError::Config(format!(
                        "buffer_delta {} of '{}' input {} exceeds the request ring",
                        port.buffer_delta, node.name, port.id
                    )));
                }
            }
        }
        Ok(())
    }
}
