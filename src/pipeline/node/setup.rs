//! Per-request setup of input and output ports.

use super::topology::request_id_offset_from_last_flush;
use super::Node;
use crate::buffer::image_buffer::ImageBuffer;
use crate::buffer::manager::ImageBufferManager;
use crate::error::{NodeError, Result};
use crate::fence::{FenceHandle, FenceResult};
use crate::pipeline::fence_handler::{
    FenceHandlerBufferInfo, FenceHandlerInit, GroupKey, NodeFenceHandlerData,
};
use crate::pipeline::host::PipelineHost;
use crate::pipeline::id::NodeId;
use crate::pipeline::negotiation::BufferRequirement;
use crate::pipeline::port::{Destination, OutputPortFlags};
use crate::pipeline::request::{InputBinding, ParentRelease, PerRequestNodeStatus, RequestSlot};
use crate::sync::{lock, read};
use crate::types::CaptureRequest;
use std::sync::Arc;

/// What a consumer reads from an output for one request.
#[derive(Debug, Clone)]
pub struct OutputPortInfo {
    pub fence: FenceHandle,
    /// Signalled once a bypassable node picked its output buffers
    pub delayed_fence: Option<FenceHandle>,
    pub buffers: Vec<Arc<ImageBuffer>>,
}

struct InputSnapshot {
    index: usize,
    port_id: u32,
    format: crate::buffer::format::Format,
    parent: Option<NodeId>,
    parent_output_index: usize,
    buffer_delta: u32,
    is_loopback: bool,
    is_source: bool,
    requirement: Option<BufferRequirement>,
    source_manager: Option<Arc<ImageBufferManager>>,
}

struct OutputSnapshot {
    index: usize,
    port_id: u32,
    flags: OutputPortFlags,
    enabled_in_stream_mask: u64,
    group: GroupKey,
    handler_index: usize,
    fence_seed: u32,
    buffer_seed: u32,
    consumer_count: u32,
    manager: Option<Arc<ImageBufferManager>>,
}

impl Node {
    /// Claim the request slot and acquire the buffers and fences of every
    /// port taking part in the request.
    pub fn setup_request(&self, request_id: u64) -> Result<()> {
        let host = self.host()?;
        let request = host.get_request(request_id).ok_or_else(|| {
            NodeError::InvalidArg(format!("request {} is unknown to the pipeline", request_id))
        })?;
        let slot = self
            .ring
            .begin(request_id)
            .map_err(|e| e.with_context(format!("node {} setup of request {}", self.name, request_id)))?;
        let generation = slot.generation();
        self.reclaim_stale_fences(request_id);

        let active = self.new_active_streams_setup(request.active_streams);
        {
            let mut state = slot.state();
            state.node_enabled = active.node_enabled;
            state.active_inputs = active.inputs.clone();
            state.active_outputs = active.outputs.clone();
        }

        if !active.node_enabled {
            tracing::debug!("Node {} disabled for request {}", self.name, request_id);
            self.setup_disabled_request(slot, request_id, host.as_ref());
            return Ok(());
        }

        let mut pending = Vec::new();
        let result = self
            .setup_request_input_ports(slot, &request, &active.inputs, host.as_ref())
            .and_then(|_| {
                self.setup_request_output_ports(slot, &request, generation, &active.outputs, &mut pending)
            });

        self.arm_fence_handlers(pending, host.as_ref());

        if let Err(e) = result {
            tracing::error!("Node {} failed to set up request {}: {}", self.name, request_id, e);
            slot.set_status(PerRequestNodeStatus::Error);
            if let Err(flush_err) = self.flush(request_id) {
                tracing::warn!("Flush after failed setup of {} failed: {}", request_id, flush_err);
            }
            return Err(e.with_context(format!("node {} setup of request {}", self.name, request_id)));
        }

        tracing::trace!("Node {} set up request {}", self.name, request_id);
        Ok(())
    }

    /// Drop fence groups left behind by earlier occupants of the slot.
    fn reclaim_stale_fences(&self, request_id: u64) {
        let stale = lock(&self.fence_table).reclaim_stale(request_id, self.ring.depth());
        for (stale_request, info) in stale {
            tracing::warn!(
                "Node {} reclaimed fence {} of request {} with {} references outstanding",
                self.name,
                info.fence,
                stale_request,
                info.ref_count
            );
            for member in &info.members {
                member.invalidate_fence();
            }
            if info.owns_fence && info.fence.is_valid() {
                if let Err(e) = self.fences().release(info.fence) {
                    tracing::debug!("Stale fence {} already gone: {}", info.fence, e);
                }
            }
        }
    }

    /// A disabled node completes the request without touching any buffer,
    /// but still releases what it would have read and turns off the links
    /// to its children.
    fn setup_disabled_request(&self, slot: &RequestSlot, request_id: u64, host: &dyn PipelineHost) {
        let (linked, children): (Vec<InputSnapshot>, Vec<Destination>) = {
            let ports = read(&self.ports);
            let linked = ports
                .inputs
                .iter()
                .filter(|p| p.is_linked() && !p.is_disabled())
                .map(|p| InputSnapshot {
                    index: p.index,
                    port_id: p.port_id,
                    format: p.format,
                    parent: p.parent,
                    parent_output_index: p.parent_output_index,
                    buffer_delta: p.buffer_delta,
                    is_loopback: p.is_loopback,
                    is_source: false,
                    requirement: None,
                    source_manager: None,
                })
                .collect();
            let children = ports
                .outputs
                .iter()
                .flat_map(|p| p.destinations.iter().copied())
                .collect();
            (linked, children)
        };

        let last_flushed = host.last_flushed_request_id();
        {
            let mut state = slot.state();
            for input in &linked {
                let (Some(parent), Some(parent_request)) = (
                    input.parent,
                    request_id_offset_from_last_flush(
                        request_id,
                        input.buffer_delta,
                        self.ring.depth(),
                        last_flushed,
                    ),
                ) else {
                    continue;
                };
                state.parent_releases.push(ParentRelease::Linked {
                    parent,
                    output_index: input.parent_output_index,
                    request_id: parent_request,
                });
            }
        }

        for child in children {
            let result = self
                .peer(child.node)
                .and_then(|node| node.disable_input_output_link(child.input_index));
            if let Err(e) = result {
                tracing::warn!("Node {} could not disable link to {:?}: {}", self.name, child.node, e);
            }
        }

        self.process_partial_metadata_done(request_id);
        self.process_metadata_done(request_id);
        self.process_request_id_done(request_id);
    }

    fn setup_request_input_ports(
        &self,
        slot: &RequestSlot,
        request: &CaptureRequest,
        active_inputs: &[usize],
        host: &dyn PipelineHost,
    ) -> Result<()> {
        let (inputs, bypass_consumers): (Vec<InputSnapshot>, u32) = {
            let ports = read(&self.ports);
            let inputs = active_inputs
                .iter()
                .filter_map(|i| ports.inputs.get(*i))
                .map(|p| InputSnapshot {
                    index: p.index,
                    port_id: p.port_id,
                    format: p.format,
                    parent: p.parent,
                    parent_output_index: p.parent_output_index,
                    buffer_delta: p.buffer_delta,
                    is_loopback: p.is_loopback,
                    is_source: p.is_source,
                    requirement: p.requirement,
                    source_manager: p.source_manager.clone(),
                })
                .collect();
            (inputs, ports.bypass_consumer_count())
        };

        let request_id = request.request_id;
        let last_flushed = host.last_flushed_request_id();

        for input in inputs {
            if input.is_source {
                self.setup_source_input(slot, request, &input)?;
                continue;
            }
            let Some(parent_id) = input.parent else {
                tracing::debug!("Input {} of {} is not connected", input.port_id, self.name);
                continue;
            };

            let Some(parent_request) = request_id_offset_from_last_flush(
                request_id,
                input.buffer_delta,
                self.ring.depth(),
                last_flushed,
            ) else {
                tracing::debug!(
                    "Node {} input {} has nothing to read {} requests behind {}",
                    self.name,
                    input.port_id,
                    input.buffer_delta,
                    request_id
                );
                continue;
            };

            let parent = self.peer(parent_id)?;
            let Some(info) = parent.get_output_port_info(input.parent_output_index, parent_request) else {
                if input.buffer_delta > 0 {
                    tracing::debug!(
                        "Node {} input {}: request {} of {} is gone",
                        self.name,
                        input.port_id,
                        parent_request,
                        parent.name()
                    );
                    continue;
                }
                return Err(NodeError::InvalidState(format!(
                    "{} has no output {} for request {}",
                    parent.name(),
                    input.parent_output_index,
                    parent_request
                )));
            };

            let releases = if self.flags.bypassable && !input.is_loopback {
                1 + bypass_consumers
            } else {
                1
            };

            let mut state = slot.state();
            state.inputs.push(InputBinding {
                input_index: input.index,
                port_id: input.port_id,
                fence: info.delayed_fence.unwrap_or(info.fence),
                buffers: info.buffers,
                is_loopback: input.is_loopback,
                is_source: false,
                parent_request_id: parent_request,
            });
            for _ in 0..releases {
                state.parent_releases.push(ParentRelease::Linked {
                    parent: parent_id,
                    output_index: input.parent_output_index,
                    request_id: parent_request,
                });
            }
        }
        Ok(())
    }

    fn setup_source_input(&self, slot: &RequestSlot, request: &CaptureRequest, input: &InputSnapshot) -> Result<()> {
        let stream = request
            .input_buffers
            .iter()
            .find(|b| {
                b.matches(input.port_id, input.format)
                    && input
                        .requirement
                        .map_or(true, |r| r.contains(b.format.width, b.format.height))
            })
            .ok_or_else(|| {
                NodeError::InvalidArg(format!(
                    "request {} has no {} buffer for source port {} of {}",
                    request.request_id, input.format, input.port_id, self.name
                ))
            })?;

        let manager = input.source_manager.as_ref().ok_or_else(|| {
            NodeError::InvalidState(format!(
                "source port {} of {} has no buffer manager",
                input.port_id, self.name
            ))
        })?;

        let buffer = {
            let _guard = lock(&self.buffer_request_lock);
            let buffer = manager.get_image_buffer().ok_or_else(|| {
                NodeError::Resource(format!("no buffer left in {}", manager.name()))
            })?;
            if let Err(e) = buffer.import(&stream.buffer) {
                buffer.release_reference();
                return Err(e);
            }
            buffer
        };

        let (fence, private_fence) = match stream.acquire_fence {
            Some(fence) => (fence, false),
            None => {
                let name = format!("{}_in{}_{}", self.name, input.port_id, request.request_id);
                let fence = match self.fences().create_private_fence(&name) {
                    Ok(fence) => fence,
                    Err(e) => {
                        buffer.release_reference();
                        return Err(e);
                    }
                };
                self.fences().signal(fence, FenceResult::Success)?;
                (fence, true)
            }
        };

        let node_name = self.name.clone();
        let port_id = input.port_id;
        let request_id = request.request_id;
        self.fences().async_wait(
            fence,
            Box::new(move |fence, result| {
                tracing::trace!(
                    "Source fence {} of {} port {} for request {} signalled: {:?}",
                    fence,
                    node_name,
                    port_id,
                    request_id,
                    result
                );
            }),
        )?;

        let mut state = slot.state();
        state.inputs.push(InputBinding {
            input_index: input.index,
            port_id: input.port_id,
            fence,
            buffers: vec![Arc::clone(&buffer)],
            is_loopback: false,
            is_source: true,
            parent_request_id: request.request_id,
        });
        state.parent_releases.push(ParentRelease::Source {
            input_index: input.index,
            port_id: input.port_id,
            buffer,
            fence,
            private_fence,
        });
        Ok(())
    }

    fn setup_request_output_ports(
        &self,
        slot: &RequestSlot,
        request: &CaptureRequest,
        generation: u64,
        active_outputs: &[usize],
        pending: &mut Vec<Arc<NodeFenceHandlerData>>,
    ) -> Result<()> {
        let request_id = request.request_id;

        let links: Vec<(bool, Vec<Destination>)> = {
            let ports = read(&self.ports);
            ports
                .outputs
                .iter()
                .map(|p| (active_outputs.contains(&p.index), p.destinations.clone()))
                .collect()
        };
        for (enabled, destinations) in links {
            for destination in destinations {
                let child = self.peer(destination.node)?;
                if enabled {
                    child.enable_input_output_link(destination.input_index)?;
                } else {
                    child.disable_input_output_link(destination.input_index)?;
                }
            }
        }

        let outputs: Vec<OutputSnapshot> = {
            let ports = read(&self.ports);
            active_outputs
                .iter()
                .filter_map(|i| ports.outputs.get(*i))
                .filter(|p| p.needs_fence())
                .map(|p| OutputSnapshot {
                    index: p.index,
                    port_id: p.port_id,
                    flags: p.flags,
                    enabled_in_stream_mask: p.enabled_in_stream_mask,
                    group: GroupKey::for_port(p.index, p.composite_group),
                    handler_index: p.handler_index(request_id, self.ring.depth()),
                    fence_seed: p.fence_seed(),
                    buffer_seed: p.buffer_seed(),
                    consumer_count: p.consumer_count(),
                    manager: p.manager.clone(),
                })
                .collect()
        };

        for output in outputs {
            let batch_indices: Vec<u32> = if output.flags.is_sink {
                (0..request.batch_size.max(1))
                    .filter(|b| output.enabled_in_stream_mask & request.batch_mask(*b) != 0)
                    .collect()
            } else {
                vec![0]
            };
            let chi_fence = if output.flags.is_sink {
                batch_indices
                    .first()
                    .and_then(|b| request.output_buffer(output.port_id, *b))
                    .and_then(|b| b.release_fence)
            } else {
                None
            };

            let Some(handler) = self.setup_request_output_port_fence(
                slot,
                request_id,
                generation,
                &output,
                chi_fence,
                pending,
            )?
            else {
                continue;
            };

            if output.flags.is_non_sink_hal_output {
                slot.state().held_outputs.push(output.index);
            }
            if output.flags.is_sink_no_buffer {
                continue;
            }

            let manager = output.manager.as_ref().ok_or_else(|| {
                NodeError::InvalidState(format!(
                    "output {} of {} has no buffer manager",
                    output.port_id, self.name
                ))
            })?;

            for batch_index in batch_indices {
                let external = if output.flags.is_sink {
                    let stream = request.output_buffer(output.port_id, batch_index).ok_or_else(|| {
                        NodeError::InvalidArg(format!(
                            "request {} has no buffer for sink port {} of {} (batch {})",
                            request_id, output.port_id, self.name, batch_index
                        ))
                    })?;
                    Some(stream.buffer)
                } else {
                    None
                };

                let buffer = {
                    let _guard = lock(&self.buffer_request_lock);
                    let buffer = manager.get_image_buffer().ok_or_else(|| {
                        NodeError::Resource(format!("no buffer left in {}", manager.name()))
                    })?;
                    if let Some(external) = &external {
                        if let Err(e) = buffer.import(external) {
                            buffer.release_reference();
                            return Err(e);
                        }
                    }
                    if output.buffer_seed > 1 {
                        buffer.add_references(output.buffer_seed - 1);
                    }
                    buffer
                };

                handler.push_buffer(FenceHandlerBufferInfo {
                    buffer: Some(buffer),
                    sequence_id: batch_index,
                    external,
                });
            }
        }
        Ok(())
    }

    /// Create the fence handler of an output for a request, or return
    /// `None` if it already exists.
    fn setup_request_output_port_fence(
        &self,
        slot: &RequestSlot,
        request_id: u64,
        generation: u64,
        output: &OutputSnapshot,
        chi_fence: Option<FenceHandle>,
        pending: &mut Vec<Arc<NodeFenceHandlerData>>,
    ) -> Result<Option<Arc<NodeFenceHandlerData>>> {
        let mut table = lock(&self.fence_table);

        if let Some(existing) = table.handler_at(output.index, output.handler_index) {
            if existing.request_id == request_id && existing.generation == generation {
                return Ok(None);
            }
            if existing.fence().is_valid() {
                return Err(NodeError::Resource(format!(
                    "output {} of {} still holds request {} in handler {}",
                    output.port_id, self.name, existing.request_id, output.handler_index
                )));
            }
        }

        let (fence, owns_fence, is_chi_fence) = if let Some(fence) = table.group_fence(request_id, output.group) {
            (fence, false, false)
        } else if let Some(fence) = chi_fence {
            (fence, false, true)
        } else {
            let name = format!("{}_out{}_{}", self.name, output.port_id, request_id);
            (self.fences().create_private_fence(&name)?, true, false)
        };

        let handler = Arc::new(NodeFenceHandlerData::new(FenceHandlerInit {
            fence,
            request_id,
            output_index: output.index,
            port_id: output.port_id,
            primary_fence: owns_fence,
            is_chi_fence,
            is_delayed: false,
            is_sink: output.flags.is_sink || output.flags.is_sink_no_buffer,
            is_held: output.flags.is_non_sink_hal_output,
            group: output.group,
            generation,
        }));
        table.add_reference(
            request_id,
            output.group,
            fence,
            owns_fence,
            output.fence_seed,
            Arc::clone(&handler),
        );
        table.install(output.handler_index, Arc::clone(&handler));
        slot.add_fence();
        slot.state().fence_count += 1;
        pending.push(Arc::clone(&handler));

        if self.flags.bypassable {
            let name = format!("{}_out{}_{}_delayed", self.name, output.port_id, request_id);
            let delayed_fence = self.fences().create_private_fence(&name)?;
            let delayed = Arc::new(NodeFenceHandlerData::new(FenceHandlerInit {
                fence: delayed_fence,
                request_id,
                output_index: output.index,
                port_id: output.port_id,
                primary_fence: true,
                is_chi_fence: false,
                is_delayed: true,
                is_sink: false,
                is_held: false,
                group: GroupKey::Delayed(output.index),
                generation,
            }));
            // Consumers wait on the delayed fence, so it lives until they release
            table.add_reference(
                request_id,
                GroupKey::Delayed(output.index),
                delayed_fence,
                true,
                1 + output.consumer_count,
                Arc::clone(&delayed),
            );
            table.install(output.handler_index, Arc::clone(&delayed));
            slot.add_fence();
            slot.state().fence_count += 1;
            pending.push(delayed);
        }

        Ok(Some(handler))
    }

    /// Register the new fences with the pipeline and wait for them
    fn arm_fence_handlers(&self, handlers: Vec<Arc<NodeFenceHandlerData>>, host: &dyn PipelineHost) {
        for handler in handlers {
            let fence = handler.fence();
            host.register_request_fence(fence, handler.request_id);

            let weak = self.weak_self.clone();
            let waiter = Arc::clone(&handler);
            let armed = self.fences().async_wait(
                fence,
                Box::new(move |_fence, result| {
                    if let Some(node) = weak.upgrade() {
                        node.process_fence_callback(&waiter, result);
                    }
                }),
            );
            if let Err(e) = armed {
                tracing::error!(
                    "Node {} cannot wait on fence {} of request {}: {}",
                    self.name,
                    fence,
                    handler.request_id,
                    e
                );
                self.process_fence_callback(&handler, FenceResult::Failed);
            }
        }
    }

    /// Current fence and buffers of an output for a request
    pub fn get_output_port_info(&self, output_index: usize, request_id: u64) -> Option<OutputPortInfo> {
        let index = self.handler_index(output_index, request_id)?;
        let table = lock(&self.fence_table);
        let handler = table.handler(output_index, index, request_id)?;
        let fence = handler.fence();
        let delayed = table.delayed_handler(output_index, index, request_id);
        let delayed_fence = delayed.map(|d| d.fence()).filter(|f| f.is_valid());
        // A passed-through output outlives the node's own fence
        if !fence.is_valid() && delayed_fence.is_none() {
            return None;
        }
        let buffers = delayed
            .and_then(|d| d.delayed_info())
            .map(|info| info.buffers)
            .unwrap_or_else(|| handler.live_buffers());
        Some(OutputPortInfo {
            fence,
            delayed_fence,
            buffers,
        })
    }
}
