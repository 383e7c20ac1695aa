//! The node orchestrator.
//!
//! A [`Node`] is one vertex of the pipeline graph. It owns its ports, the
//! per-request slot ring, the fence handlers of its outputs and the image
//! buffer managers behind them, and drives every request through
//! setup, processing, fence completion and cleanup. Node-type specific work
//! is delegated to a [`NodePlugin`].
//!
//! The implementation is split by concern:
//!
//! - `topology` - links, loopback ports, per-request enable/disable
//! - `negotiation` - buffer requirement exchange and buffer managers
//! - `setup` - per-request input/output setup
//! - `process` - `process_request`
//! - `completion` - fence callbacks, reference release and done latches
//! - `flush` - cancellation
//!
//! # Locking
//!
//! Each node has a few narrow locks (fence table, buffer release, buffer
//! request, process request, command buffer list, negotiation). None of them
//! is held while calling into another node, the host or the plugin.

mod completion;
mod flush;
mod negotiation;
mod process;
mod setup;
mod topology;

pub use setup::OutputPortInfo;
pub use topology::ActivePorts;

use crate::backend::cmd_buffer::{CmdBuffer, CmdBufferManager};
use crate::buffer::manager::ImageBufferManagerStats;
use crate::config::{InputPortConfig, NodeConfig, NodeSettings, OutputPortConfig};
use crate::error::{NodeError, Result};
use crate::fence::{FenceHandle, FenceProvider};
use crate::metadata::MetadataPool;
use crate::pipeline::fence_handler::{FenceErrorRecord, FenceErrorRing, FenceTable, GroupKey};
use crate::pipeline::host::PipelineHost;
use crate::pipeline::id::NodeId;
use crate::pipeline::plugin::{NodeInitContext, NodePlugin};
use crate::pipeline::port::PortTable;
use crate::pipeline::request::{
    Latch, NodeStage, PerRequestNodeStatus, RequestRing, RequestSlot,
};
use crate::sync::{lock, read};
use negotiation::NegotiationState;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};
use std::thread::JoinHandle;

/// Static node properties.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NodeFlags {
    pub inplace: bool,
    pub bypassable: bool,
    pub realtime: bool,
    pub secure_mode: bool,
    pub deferred_init: bool,
}

/// Everything needed to create a node.
#[derive(Debug, Clone)]
pub struct NodeCreateInfo {
    pub id: NodeId,
    pub name: String,
    pub type_id: u32,
    pub instance_id: u32,
    pub flags: NodeFlags,
    pub inputs: Vec<InputPortConfig>,
    pub outputs: Vec<OutputPortConfig>,
    pub device_indices: Vec<u32>,
    pub publish_tags: Vec<u32>,
    pub settings: Arc<NodeSettings>,
}

impl NodeCreateInfo {
    pub fn from_config(id: NodeId, config: &NodeConfig, settings: Arc<NodeSettings>) -> Self {
        Self {
            id,
            name: config.name.clone(),
            type_id: config.type_id,
            instance_id: config.instance_id,
            flags: NodeFlags {
                inplace: config.inplace,
                bypassable: config.bypassable,
                realtime: config.realtime,
                secure_mode: config.secure_mode,
                deferred_init: config.deferred_init,
            },
            inputs: config.inputs.clone(),
            outputs: config.outputs.clone(),
            device_indices: config.device_indices.clone(),
            publish_tags: config.publish_tags.clone(),
            settings,
        }
    }
}

/// Shared collaborators handed to every node.
#[derive(Clone)]
pub struct NodeEnvironment {
    pub fences: Arc<dyn FenceProvider>,
    pub metadata: Arc<dyn MetadataPool>,
}

pub struct Node {
    id: NodeId,
    name: String,
    type_id: u32,
    instance_id: u32,
    flags: NodeFlags,
    settings: Arc<NodeSettings>,
    env: NodeEnvironment,
    plugin: Arc<dyn NodePlugin>,
    host: OnceLock<Weak<dyn PipelineHost>>,
    weak_self: Weak<Node>,
    device_indices: Vec<u32>,
    publish_tags: Mutex<Vec<u32>>,

    ports: RwLock<PortTable>,
    ring: RequestRing,
    /// Fence-create/release lock
    fence_table: Mutex<FenceTable>,
    buffer_release_lock: Mutex<()>,
    buffer_request_lock: Mutex<()>,
    process_request_lock: Mutex<()>,
    cmd_buffer_managers: Mutex<Vec<Arc<CmdBufferManager>>>,

    negotiation: Mutex<NegotiationState>,
    negotiation_started: Latch,
    negotiation_gate: Latch,

    fence_errors: Mutex<FenceErrorRing>,
    parallel_process_requests: AtomicBool,
    deferred_init: Mutex<Option<JoinHandle<Result<()>>>>,
    destroyed: AtomicBool,
}

impl Node {
    /// Create and initialize a node. If initialization fails the partially
    /// built node is destroyed and the error returned.
    pub fn create(
        info: NodeCreateInfo,
        plugin: Arc<dyn NodePlugin>,
        env: NodeEnvironment,
    ) -> Result<Arc<Node>> {
        if info.name.is_empty() {
            return Err(NodeError::InvalidArg("node name is empty".to_string()));
        }
        info.settings.validate()?;

        let ports = PortTable::new(&info.inputs, &info.outputs)
            .map_err(|e| e.with_context(format!("node {}", info.name)))?;
        let depth = info.settings.max_request_queue_depth;
        let capacities: Vec<usize> = ports
            .outputs
            .iter()
            .map(|p| p.handler_capacity(depth))
            .collect();
        let negotiation_state = NegotiationState::new(&ports);

        let node = Arc::new_cyclic(|weak_self| Node {
            id: info.id,
            name: info.name,
            type_id: info.type_id,
            instance_id: info.instance_id,
            flags: info.flags,
            env,
            plugin,
            host: OnceLock::new(),
            weak_self: weak_self.clone(),
            device_indices: info.device_indices,
            publish_tags: Mutex::new(info.publish_tags),
            ports: RwLock::new(ports),
            ring: RequestRing::new(depth),
            fence_table: Mutex::new(FenceTable::new(&capacities)),
            buffer_release_lock: Mutex::new(()),
            buffer_request_lock: Mutex::new(()),
            process_request_lock: Mutex::new(()),
            cmd_buffer_managers: Mutex::new(Vec::new()),
            negotiation: Mutex::new(negotiation_state),
            negotiation_started: Latch::new(),
            negotiation_gate: Latch::new(),
            fence_errors: Mutex::new(FenceErrorRing::new(info.settings.max_fence_error_buffer_depth)),
            parallel_process_requests: AtomicBool::new(info.settings.parallel_process_requests),
            deferred_init: Mutex::new(None),
            destroyed: AtomicBool::new(false),
            settings: info.settings,
        });

        if node.flags.deferred_init {
            let weak = Arc::downgrade(&node);
            let handle = std::thread::Builder::new()
                .name(format!("{}-init", node.name))
                .spawn(move || match weak.upgrade() {
                    Some(node) => node.initialize(),
                    None => Err(NodeError::InvalidPointer("node dropped before init".to_string())),
                })
                .map_err(|e| NodeError::NoMemory(format!("failed to spawn init thread: {}", e)))?;
            *lock(&node.deferred_init) = Some(handle);
        } else if let Err(e) = node.initialize() {
            tracing::error!("Failed to initialize node {}: {}", node.name, e);
            node.destroy();
            return Err(e.with_context(format!("node {}", node.name)));
        }

        tracing::info!(
            "Created node {} ({:?}, type {}, instance {})",
            node.name,
            node.id,
            node.type_id,
            node.instance_id
        );
        Ok(node)
    }

    fn init_context(&self) -> NodeInitContext {
        let ports = read(&self.ports);
        NodeInitContext {
            node_id: self.id,
            node_name: self.name.clone(),
            type_id: self.type_id,
            instance_id: self.instance_id,
            flags: self.flags,
            input_count: ports.inputs.len(),
            output_count: ports.outputs.len(),
            settings: Arc::clone(&self.settings),
        }
    }

    fn initialize(&self) -> Result<()> {
        let capabilities = self.plugin.initialize(&self.init_context())?;

        {
            let mut managers = lock(&self.cmd_buffer_managers);
            for config in capabilities.cmd_buffer_managers {
                tracing::debug!(
                    "Node {} created command buffer manager {}",
                    self.name,
                    config.name
                );
                managers.push(Arc::new(CmdBufferManager::new(config)));
            }
        }

        if capabilities.parallel_process_requests {
            self.parallel_process_requests.store(true, Ordering::Release);
        }

        let extra = self.plugin.query_metadata_publish_list();
        let mut tags = lock(&self.publish_tags);
        for tag in extra {
            if !tags.contains(&tag) {
                tags.push(tag);
            }
        }
        Ok(())
    }

    /// Wait for deferred initialization to finish
    pub fn finalize_initialization(&self) -> Result<()> {
        let handle = lock(&self.deferred_init).take();
        match handle {
            Some(handle) => handle
                .join()
                .map_err(|_| NodeError::Failed(format!("init thread of {} panicked", self.name)))?
                .map_err(|e| e.with_context(format!("deferred init of {}", self.name))),
            None => Ok(()),
        }
    }

    /// Tear the node down: join deferred init, release every fence still
    /// held and drop the buffer managers. Safe to call more than once.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.finalize_initialization() {
            tracing::warn!("Destroying {} after failed init: {}", self.name, e);
        }

        {
            let mut table = lock(&self.fence_table);
            for info in table.drain() {
                for member in &info.members {
                    member.invalidate_fence();
                }
                if info.owns_fence && info.fence.is_valid() {
                    if let Err(e) = self.env.fences.release(info.fence) {
                        tracing::debug!("Node {} could not release {}: {}", self.name, info.fence, e);
                    }
                }
            }
        }

        let managers = self.image_buffer_managers();
        for manager in managers {
            manager.destroy();
        }
        lock(&self.cmd_buffer_managers).clear();
        tracing::info!("Destroyed node {}", self.name);
    }

    // ── Accessors ──

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_id(&self) -> u32 {
        self.type_id
    }

    pub fn instance_id(&self) -> u32 {
        self.instance_id
    }

    pub fn flags(&self) -> NodeFlags {
        self.flags
    }

    pub fn is_bypassable(&self) -> bool {
        self.flags.bypassable
    }

    pub fn is_realtime(&self) -> bool {
        self.flags.realtime
    }

    pub fn settings(&self) -> &NodeSettings {
        &self.settings
    }

    pub fn device_indices(&self) -> &[u32] {
        &self.device_indices
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub fn input_count(&self) -> usize {
        read(&self.ports).inputs.len()
    }

    pub fn output_count(&self) -> usize {
        read(&self.ports).outputs.len()
    }

    pub fn output_port_id(&self, output_index: usize) -> Option<u32> {
        read(&self.ports).outputs.get(output_index).map(|p| p.port_id)
    }

    pub fn output_index(&self, port_id: u32) -> Option<usize> {
        read(&self.ports).output_index(port_id)
    }

    pub fn input_index(&self, port_id: u32) -> Option<usize> {
        read(&self.ports).input_index(port_id)
    }

    /// Attach the owning pipeline. Only the first call has an effect.
    pub fn attach_host(&self, host: Weak<dyn PipelineHost>) -> Result<()> {
        self.host
            .set(host)
            .map_err(|_| NodeError::InvalidState(format!("node {} already has a host", self.name)))
    }

    pub(crate) fn host(&self) -> Result<Arc<dyn PipelineHost>> {
        self.host
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| NodeError::InvalidPointer(format!("node {} has no pipeline", self.name)))
    }

    /// Resolve another node of the pipeline (or this one)
    pub(crate) fn peer(&self, id: NodeId) -> Result<Arc<Node>> {
        if id == self.id {
            return self
                .weak_self
                .upgrade()
                .ok_or_else(|| NodeError::InvalidPointer(format!("node {} dropped", self.name)));
        }
        self.host()?
            .node(id)
            .ok_or_else(|| NodeError::InvalidPointer(format!("unknown node {:?}", id)))
    }

    pub(crate) fn fences(&self) -> &Arc<dyn FenceProvider> {
        &self.env.fences
    }

    pub(crate) fn metadata(&self) -> &Arc<dyn MetadataPool> {
        &self.env.metadata
    }

    /// Check out a command buffer for `request_id`
    pub fn acquire_cmd_buffer(&self, manager_index: usize, request_id: u64) -> Result<CmdBuffer> {
        let manager = lock(&self.cmd_buffer_managers)
            .get(manager_index)
            .cloned()
            .ok_or_else(|| {
                NodeError::InvalidArg(format!(
                    "node {} has no command buffer manager {}",
                    self.name, manager_index
                ))
            })?;
        manager.get_buffer(request_id)
    }

    fn handler_index(&self, output_index: usize, request_id: u64) -> Option<usize> {
        read(&self.ports)
            .outputs
            .get(output_index)
            .map(|port| port.handler_index(request_id, self.ring.depth()))
    }

    /// Whether `request_id` can be set up without colliding with a request
    /// that still holds its ring slot or a live fence handler.
    pub fn is_slot_available(&self, request_id: u64) -> bool {
        let slot = self.ring.slot_at(request_id);
        if slot.request_id().is_some() && !slot.request_complete.is_done() {
            return false;
        }
        let depth = self.ring.depth() as u64;
        let indices: Vec<(usize, usize)> = read(&self.ports)
            .outputs
            .iter()
            .map(|port| (port.index, port.handler_index(request_id, self.ring.depth())))
            .collect();
        let table = lock(&self.fence_table);
        indices.into_iter().all(|(output_index, index)| {
            table.handler_at(output_index, index).map_or(true, |h| {
                // Entries sharing the ring slot are reclaimed by setup
                h.request_id == request_id
                    || !h.fence().is_valid()
                    || h.request_id % depth == request_id % depth
            })
        })
    }

    pub fn cmd_buffer_manager_count(&self) -> usize {
        lock(&self.cmd_buffer_managers).len()
    }

    fn recycle_cmd_buffers(&self, request_id: u64) {
        let managers: Vec<Arc<CmdBufferManager>> = lock(&self.cmd_buffer_managers).clone();
        for manager in managers {
            let recycled = manager.recycle(request_id);
            if recycled > 0 {
                tracing::trace!(
                    "Node {} recycled {} command buffers of {} up to request {}",
                    self.name,
                    recycled,
                    manager.name(),
                    request_id
                );
            }
        }
    }

    fn record_fence_error(&self, record: FenceErrorRecord) {
        lock(&self.fence_errors).push(record);
    }

    // ── Introspection ──

    pub fn request_status(&self, request_id: u64) -> Option<PerRequestNodeStatus> {
        self.ring.lookup(request_id).map(RequestSlot::status)
    }

    pub fn is_request_complete(&self, request_id: u64) -> bool {
        self.ring
            .lookup(request_id)
            .is_some_and(|slot| slot.request_complete.is_done())
    }

    pub fn is_metadata_complete(&self, request_id: u64) -> bool {
        self.ring
            .lookup(request_id)
            .is_some_and(|slot| slot.metadata_complete.is_done())
    }

    /// Fence of an output for a request, while it is live
    pub fn output_fence(&self, output_index: usize, request_id: u64) -> Option<FenceHandle> {
        let index = self.handler_index(output_index, request_id)?;
        lock(&self.fence_table)
            .handler(output_index, index, request_id)
            .map(|h| h.fence())
            .filter(|f| f.is_valid())
    }

    /// Outstanding references on the fence of an output for a request
    pub fn fence_reference_count(&self, output_index: usize, request_id: u64) -> Option<u32> {
        let key = self.group_key(output_index);
        lock(&self.fence_table).ref_count(request_id, key)
    }

    pub fn delayed_fence_reference_count(&self, output_index: usize, request_id: u64) -> Option<u32> {
        lock(&self.fence_table).ref_count(request_id, GroupKey::Delayed(output_index))
    }

    /// Valid fences the inputs of a request wait on, deduplicated
    pub fn input_fences(&self, request_id: u64) -> Vec<FenceHandle> {
        let Some(slot) = self.ring.lookup(request_id) else {
            return Vec::new();
        };
        let mut fences: Vec<FenceHandle> = Vec::new();
        for binding in &slot.state().inputs {
            if binding.fence.is_valid() && !fences.contains(&binding.fence) {
                fences.push(binding.fence);
            }
        }
        fences
    }

    /// Whether the node takes part in a request it has set up
    pub fn is_enabled_for_request(&self, request_id: u64) -> bool {
        self.ring
            .lookup(request_id)
            .is_some_and(|slot| slot.state().node_enabled)
    }

    pub fn unresolved_requests(&self) -> Vec<u64> {
        self.ring.unresolved()
    }

    pub fn fence_errors(&self) -> Vec<FenceErrorRecord> {
        lock(&self.fence_errors).records()
    }

    /// Outstanding (unprocessed) fence count of a request
    pub fn unprocessed_fences(&self, request_id: u64) -> Option<u32> {
        self.ring.lookup(request_id).map(RequestSlot::num_unprocessed_fences)
    }

    /// Time from process start to completion of the first sequence
    pub fn processing_time(&self, request_id: u64) -> Option<chrono::Duration> {
        let slot = self.ring.lookup(request_id)?;
        let state = slot.state();
        let start = state.stage_time(0, NodeStage::Start)?;
        let end = state
            .stage_time(0, NodeStage::End)
            .or_else(|| state.stage_time(0, NodeStage::EPReqEnd))?;
        Some(end - start)
    }

    pub fn dump_state(&self) -> NodeStateDump {
        let slots = self
            .ring
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                slot.request_id().map(|request_id| SlotDump {
                    index,
                    request_id,
                    generation: slot.generation(),
                    status: slot.status(),
                    unsignaled_fences: slot.num_unsignaled_fences(),
                    unprocessed_fences: slot.num_unprocessed_fences(),
                    partial_metadata_complete: slot.partial_metadata_complete.is_done(),
                    metadata_complete: slot.metadata_complete.is_done(),
                    request_complete: slot.request_complete.is_done(),
                })
            })
            .collect();

        let managers = {
            let ports = read(&self.ports);
            ports
                .outputs
                .iter()
                .filter_map(|p| p.manager.as_ref())
                .chain(ports.inputs.iter().filter_map(|p| p.source_manager.as_ref()))
                .map(|m| ManagerDump {
                    name: m.name().to_string(),
                    stats: m.stats(),
                })
                .collect()
        };

        NodeStateDump {
            id: self.id,
            name: self.name.clone(),
            type_id: self.type_id,
            instance_id: self.instance_id,
            flags: self.flags,
            negotiation_complete: self.is_negotiation_complete(),
            slots,
            fence_errors: self.fence_errors(),
            outstanding_fence_groups: lock(&self.fence_table).outstanding_groups(),
            managers,
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("flags", &self.flags)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SlotDump {
    pub index: usize,
    pub request_id: u64,
    pub generation: u64,
    pub status: PerRequestNodeStatus,
    pub unsignaled_fences: u32,
    pub unprocessed_fences: u32,
    pub partial_metadata_complete: bool,
    pub metadata_complete: bool,
    pub request_complete: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagerDump {
    pub name: String,
    pub stats: ImageBufferManagerStats,
}

/// Postmortem snapshot of a node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStateDump {
    pub id: NodeId,
    pub name: String,
    pub type_id: u32,
    pub instance_id: u32,
    pub flags: NodeFlags,
    pub negotiation_complete: bool,
    pub slots: Vec<SlotDump>,
    pub fence_errors: Vec<FenceErrorRecord>,
    pub outstanding_fence_groups: usize,
    pub managers: Vec<ManagerDump>,
}
