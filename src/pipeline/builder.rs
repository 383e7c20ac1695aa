//! Builds a [`Pipeline`] from a [`PipelineConfig`].

use crate::backend::device::{DeviceChannel, SimulatedDevice};
use crate::backend::job_pool::JobPool;
use crate::config::{NodeConfig, NodeKind, PipelineConfig};
use crate::error::NodeError;
use crate::fence::{FenceProvider, SoftwareFences};
use crate::metadata::InMemoryMetadataPool;
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::executor::{execution_order, Edge, Pipeline, PipelineParts};
use crate::pipeline::id::{EdgeId, NodeId};
use crate::pipeline::node::{Node, NodeCreateInfo, NodeEnvironment};
use crate::pipeline::nodes::{HardwareNode, SoftwareNode};
use crate::pipeline::plugin::NodePlugin;
use std::collections::HashMap;
use std::sync::Arc;

/// Builder for a pipeline described by a config file.
///
/// Nodes get a [`HardwareNode`] or [`SoftwareNode`] strategy according to
/// their `kind` unless a plugin is registered for them by name.
///
/// ```text
/// sensor ──► ife ──► [stream 0]
/// ```
pub struct PipelineBuilder {
    config: PipelineConfig,
    plugins: HashMap<String, Arc<dyn NodePlugin>>,
}

impl PipelineBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            plugins: HashMap::new(),
        }
    }

    /// Use `plugin` for the node called `node`
    pub fn with_plugin(mut self, node: impl Into<String>, plugin: Arc<dyn NodePlugin>) -> Self {
        self.plugins.insert(node.into(), plugin);
        self
    }

    /// Create, link and finalize every node.
    pub fn build(mut self) -> PipelineResult<Arc<Pipeline>> {
        self.config.validate()?;
        if let Some(name) = self.plugins.keys().find(|n| self.config.node(n).is_none()) {
            return Err(PipelineError::UnknownNode(name.clone()));
        }

        let settings = Arc::new(self.config.settings.clone());
        let job_pool = Arc::new(JobPool::new("camnode-jobs", settings.job_pool_threads));
        let fences = Arc::new(SoftwareFences::with_job_pool(Arc::clone(&job_pool)));
        let metadata = Arc::new(InMemoryMetadataPool::new(settings.max_request_queue_depth));
        let fence_provider: Arc<dyn FenceProvider> = fences.clone();

        let device = if self.config.nodes.iter().any(|n| n.kind == NodeKind::Hardware) {
            Some(Arc::new(SimulatedDevice::new(
                self.config.device.clone(),
                Arc::clone(&fence_provider),
            )?))
        } else {
            None
        };

        let env = NodeEnvironment {
            fences: fence_provider,
            metadata: metadata.clone(),
        };

        let mut nodes: Vec<Arc<Node>> = Vec::with_capacity(self.config.nodes.len());
        for (index, node_config) in self.config.nodes.iter().enumerate() {
            let id = NodeId(index as u32);
            let plugin = match self.plugins.remove(&node_config.name) {
                Some(plugin) => plugin,
                None => default_plugin(node_config, device.as_ref())?,
            };
            let info = NodeCreateInfo::from_config(id, node_config, Arc::clone(&settings));
            match Node::create(info, plugin, env.clone()) {
                Ok(node) => nodes.push(node),
                Err(e) => {
                    for node in &nodes {
                        node.destroy();
                    }
                    return Err(PipelineError::node(id, e));
                }
            }
        }

        let edges = collect_edges(&self.config)?;
        let order = execution_order(nodes.len(), &edges)?;

        let pipeline = Pipeline::new(PipelineParts {
            name: self.config.name.clone(),
            settings,
            nodes,
            edges,
            execution_order: order,
            fences,
            metadata,
            job_pool,
            device,
        });

        link_nodes(&pipeline, &self.config)?;
        for node in pipeline.nodes() {
            node.set_up_loopback_ports()
                .map_err(|e| PipelineError::node(node.id(), e))?;
        }
        propagate_stream_masks(&pipeline, &self.config)?;
        pipeline.finalize()?;
        Ok(pipeline)
    }
}

fn default_plugin(
    config: &NodeConfig,
    device: Option<&Arc<SimulatedDevice>>,
) -> PipelineResult<Arc<dyn NodePlugin>> {
    match config.kind {
        NodeKind::Hardware => {
            let device = device.ok_or_else(|| {
                NodeError::InvalidState(format!("hardware node '{}' has no device", config.name))
            })?;
            let channel: Arc<dyn DeviceChannel> = device.clone();
            Ok(Arc::new(HardwareNode::new(channel)))
        }
        NodeKind::Software if config.bypassable && !config.inputs.is_empty() => {
            Ok(Arc::new(SoftwareNode::bypassing(0)))
        }
        NodeKind::Software => Ok(Arc::new(SoftwareNode::new())),
    }
}

fn collect_edges(config: &PipelineConfig) -> PipelineResult<Vec<Edge>> {
    let ids: HashMap<&str, NodeId> = config
        .nodes
        .iter()
        .enumerate()
        .map(|(i, n)| (n.name.as_str(), NodeId(i as u32)))
        .collect();

    let mut edges = Vec::new();
    for (index, node) in config.nodes.iter().enumerate() {
        for (input_index, port) in node.inputs.iter().enumerate() {
            let Some(parent) = port.parent.as_deref() else {
                continue;
            };
            let from_node = *ids
                .get(parent)
                .ok_or_else(|| PipelineError::UnknownNode(parent.to_string()))?;
            edges.push(Edge {
                id: EdgeId(edges.len() as u32),
                from_node,
                from_port: port.parent_port,
                to_node: NodeId(index as u32),
                to_input: input_index,
            });
        }
    }
    Ok(edges)
}

/// Parents are linked before their children so a bypassable parent already
/// knows its own parents when a child links to it.
fn link_nodes(pipeline: &Pipeline, config: &PipelineConfig) -> PipelineResult<()> {
    for &index in pipeline.execution_order() {
        let node = &pipeline.nodes()[index];
        for edge in pipeline.edges().iter().filter(|e| e.to_node == node.id()) {
            let parent = &pipeline.nodes()[edge.from_node.index()];
            node.set_input_link(edge.to_input, parent, edge.from_port)
                .map_err(|e| PipelineError::node(node.id(), e))?;
        }
    }
    tracing::debug!(
        "Linked {} edges of pipeline '{}'",
        pipeline.edges().len(),
        config.name
    );
    Ok(())
}

/// An output is needed by every stream its consumers are needed by.
/// Children are visited first.
fn propagate_stream_masks(pipeline: &Pipeline, config: &PipelineConfig) -> PipelineResult<()> {
    for &index in pipeline.execution_order().iter().rev() {
        let node = &pipeline.nodes()[index];
        let node_config = &config.nodes[index];
        for (output_index, port) in node_config.outputs.iter().enumerate() {
            if port.sink || port.sink_no_buffer {
                continue;
            }
            let own = port.stream_id.map_or(0, |s| 1u64 << (s % 64));
            let mask = node
                .output_destinations(output_index)
                .iter()
                .filter(|d| d.node != node.id())
                .filter_map(|d| pipeline.nodes().get(d.node.index()))
                .fold(own, |mask, child| mask | child.stream_mask());
            node.set_output_stream_mask(output_index, mask)
                .map_err(|e| PipelineError::node(node.id(), e))?;
        }
    }
    Ok(())
}
