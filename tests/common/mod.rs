//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;
pub mod mock_helpers;

use camnode::config::{NodeConfig, NodeSettings, PipelineConfig};
use camnode::fence::SoftwareFences;
use camnode::metadata::InMemoryMetadataPool;
use camnode::pipeline::{
    Node, NodeCreateInfo, NodeEnvironment, NodeId, NodePlugin, PipelineHost, SoftwareNode,
    StandaloneHost,
};
use camnode::types::CaptureRequest;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Create a test timeout duration
pub fn test_timeout() -> Duration {
    Duration::from_secs(2)
}

/// Small ring and short buffer waits so exhaustion shows up quickly
pub fn test_settings() -> NodeSettings {
    NodeSettings {
        max_request_queue_depth: 8,
        image_buffer_wait_time_ms: 10,
        max_image_buffer_timeout_count: 2,
        job_pool_threads: 2,
        ..NodeSettings::default()
    }
}

/// Request carrying client buffers for every sink and source port of `nodes`
pub fn capture_request(nodes: &[NodeConfig], request_id: u64) -> CaptureRequest {
    PipelineConfig {
        nodes: nodes.to_vec(),
        ..PipelineConfig::default()
    }
    .capture_request(request_id)
}

/// Nodes wired to a [`StandaloneHost`] with inline fences, so every fence
/// callback runs on the thread that signals it.
pub struct Harness {
    pub host: Arc<StandaloneHost>,
    pub fences: Arc<SoftwareFences>,
    pub metadata: Arc<InMemoryMetadataPool>,
    pub settings: Arc<NodeSettings>,
    next_id: AtomicU32,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(test_settings())
    }

    pub fn with_settings(settings: NodeSettings) -> Self {
        let depth = settings.max_request_queue_depth;
        Self {
            host: StandaloneHost::new(),
            fences: Arc::new(SoftwareFences::inline()),
            metadata: Arc::new(InMemoryMetadataPool::new(depth)),
            settings: Arc::new(settings),
            next_id: AtomicU32::new(0),
        }
    }

    pub fn env(&self) -> NodeEnvironment {
        NodeEnvironment {
            fences: self.fences.clone(),
            metadata: self.metadata.clone(),
        }
    }

    /// Create a node backed by a [`SoftwareNode`]
    pub fn node(&self, config: &NodeConfig) -> Arc<Node> {
        let plugin = if config.bypassable && !config.inputs.is_empty() {
            SoftwareNode::bypassing(0)
        } else {
            SoftwareNode::new()
        };
        self.node_with(config, Arc::new(plugin))
            .expect("node creation should succeed")
    }

    /// Create a node with `plugin` and attach it to the host
    pub fn node_with(
        &self,
        config: &NodeConfig,
        plugin: Arc<dyn NodePlugin>,
    ) -> camnode::Result<Arc<Node>> {
        let id = NodeId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let info = NodeCreateInfo::from_config(id, config, Arc::clone(&self.settings));
        let node = Node::create(info, plugin, self.env())?;
        let host: Arc<dyn PipelineHost> = self.host.clone();
        let weak: Weak<dyn PipelineHost> = Arc::downgrade(&host);
        node.attach_host(weak)?;
        self.host.add_node(Arc::clone(&node));
        Ok(node)
    }

    /// Connect `child`'s input to output `port_id` of `parent`
    pub fn link(&self, child: &Arc<Node>, input_index: usize, parent: &Arc<Node>, port_id: u32) {
        child
            .set_input_link(input_index, parent, port_id)
            .expect("link should succeed");
    }

    /// Negotiate, create buffer managers and activate. `nodes` must be in
    /// topological order.
    pub fn finalize(&self, nodes: &[&Arc<Node>]) {
        for node in nodes {
            node.set_up_loopback_ports().expect("loopback setup");
        }
        for node in nodes.iter().rev() {
            node.trigger_buffer_negotiation().expect("negotiation");
        }
        for node in nodes {
            assert!(node.is_negotiation_complete(), "{} did not negotiate", node.name());
            node.finalize_buffer_properties().expect("buffer properties");
            node.activate_image_buffers().expect("activation");
        }
    }

    /// Register a request with the host
    pub fn submit(&self, request: CaptureRequest) {
        self.host.add_request(request);
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.host.clear();
    }
}
