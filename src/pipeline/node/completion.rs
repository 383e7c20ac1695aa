//! Fence completion, reference release and the request done latches.
//!
//! Every fence handler is completed exactly once, by whoever wins
//! [`NodeFenceHandlerData::try_mark_signaled`]: the fence callback or a
//! flush. Completion decrements the slot counters, drops this node's own
//! buffer and fence references and reports to the pipeline. Consumers drop
//! theirs through [`Node::release_output_reference`].

use super::Node;
use crate::error::{NodeError, Result};
use crate::fence::{FenceHandle, FenceResult};
use crate::metadata::node_complete_tag;
use crate::pipeline::fence_handler::{
    DelayedOutputBufferInfo, FenceErrorRecord, GroupKey, NodeFenceHandlerData, ReleaseOutcome,
};
use crate::pipeline::plugin::FenceSignal;
use crate::pipeline::request::{NodeStage, ParentRelease, PerRequestNodeStatus};
use crate::sync::{lock, read};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;

impl Node {
    /// Handle a signalled output fence.
    pub fn process_fence_callback(&self, handler: &Arc<NodeFenceHandlerData>, result: FenceResult) {
        if !handler.try_mark_signaled(result) {
            tracing::trace!(
                "Node {} fence of request {} port {} already handled",
                self.name,
                handler.request_id,
                handler.port_id
            );
            return;
        }

        let request_id = handler.request_id;
        let Some(slot) = self
            .ring
            .lookup(request_id)
            .filter(|slot| slot.generation() == handler.generation)
        else {
            tracing::warn!(
                "Node {} dropping stale fence callback for request {} port {}",
                self.name,
                request_id,
                handler.port_id
            );
            return;
        };

        let fence = handler.fence();
        let host = self.host().ok();
        if let Some(host) = &host {
            host.remove_request_fence(fence, request_id);
        }

        self.plugin.fence_callback(&FenceSignal {
            request_id,
            output_index: handler.output_index,
            port_id: handler.port_id,
            fence,
            result,
            is_delayed: handler.is_delayed,
        });

        match result {
            FenceResult::Success => {}
            FenceResult::Failed => {
                tracing::error!(
                    "Node {} fence {} failed for request {} port {}",
                    self.name,
                    fence,
                    request_id,
                    handler.port_id
                );
                self.record_fence_error(FenceErrorRecord {
                    fence,
                    request_id,
                    port_id: handler.port_id,
                    result,
                    timestamp: Utc::now(),
                });
                slot.set_status(PerRequestNodeStatus::Error);
                if self.flags.realtime {
                    if let Some(host) = &host {
                        host.send_recovery_error(self.id, request_id);
                    }
                }
            }
            FenceResult::Canceled => {
                tracing::info!(
                    "Node {} fence {} cancelled for request {} port {}",
                    self.name,
                    fence,
                    request_id,
                    handler.port_id
                );
            }
        }

        slot.decrement_unsignaled();
        if slot.decrement_unprocessed() == Some(0) {
            // Completion first so late bound consumers see the buffers free up
            self.process_partial_metadata_done(request_id);
            self.process_metadata_done(request_id);
            self.process_request_id_done(request_id);
        }

        if handler.is_delayed {
            // Consumers may still wait on it; only the node's own reference goes
            self.release_delayed_reference(handler.output_index, request_id);
            return;
        }

        if !handler.is_held {
            self.release_handler_buffers(handler);
        }
        if handler.is_sink {
            self.settle_fence(request_id, handler.group, handler.output_index);
        } else {
            self.notify_and_release_fence(handler.output_index, request_id);
        }

        if let Some(host) = &host {
            let is_buffer_sink = read(&self.ports)
                .outputs
                .get(handler.output_index)
                .is_some_and(|p| p.flags.is_sink);
            if is_buffer_sink {
                let mut sequence_ids = handler.sequence_ids();
                if sequence_ids.is_empty() {
                    sequence_ids.push(0);
                }
                for sequence_id in sequence_ids {
                    if result.is_success() {
                        host.sink_port_fence_signaled(self.id, handler.port_id, request_id, sequence_id);
                    } else {
                        host.sink_port_fence_error_signaled(
                            self.id,
                            handler.port_id,
                            request_id,
                            sequence_id,
                            result,
                        );
                    }
                }
            } else if result.is_success() {
                host.non_sink_port_fence_signaled(self.id, handler.port_id, request_id);
            } else {
                host.non_sink_port_fence_error_signaled(self.id, handler.port_id, request_id, result);
            }
        }

        if slot.num_unprocessed_fences() == 0 {
            self.process_partial_metadata_done(request_id);
            self.process_metadata_done(request_id);
            self.process_request_id_done(request_id);
        }
    }

    /// Drop one reference on every buffer behind a handler. The caller that
    /// takes a buffer to zero clears it from the handler.
    fn release_handler_buffers(&self, handler: &NodeFenceHandlerData) {
        let _guard = lock(&self.buffer_release_lock);
        for info in handler.buffers().iter_mut() {
            let Some(buffer) = &info.buffer else {
                continue;
            };
            if buffer.release_reference() == 0 {
                info.buffer = None;
            }
        }
    }

    pub(super) fn group_key(&self, output_index: usize) -> GroupKey {
        read(&self.ports)
            .outputs
            .get(output_index)
            .map(|p| GroupKey::for_port(output_index, p.composite_group))
            .unwrap_or(GroupKey::Port(output_index))
    }

    /// Drop one reference on the fence of an output for a request and
    /// release the fence when it was the last one.
    pub fn notify_and_release_fence(&self, output_index: usize, request_id: u64) {
        let key = self.group_key(output_index);
        let outcome = lock(&self.fence_table).release_reference(request_id, key);
        self.finish_fence_release(outcome, output_index, request_id);
    }

    fn settle_fence(&self, request_id: u64, key: GroupKey, output_index: usize) {
        let outcome = lock(&self.fence_table).settle(request_id, key);
        self.finish_fence_release(outcome, output_index, request_id);
    }

    /// Drop one reference on the delayed fence of a bypassable output.
    fn release_delayed_reference(&self, output_index: usize, request_id: u64) {
        let outcome = lock(&self.fence_table).release_reference(request_id, GroupKey::Delayed(output_index));
        self.finish_fence_release(outcome, output_index, request_id);
    }

    fn finish_fence_release(&self, outcome: ReleaseOutcome, output_index: usize, request_id: u64) {
        match outcome {
            ReleaseOutcome::Pending(_) => {}
            ReleaseOutcome::Released { fence, owns_fence } => {
                tracing::trace!(
                    "Node {} released fence {} of request {}",
                    self.name,
                    fence,
                    request_id
                );
                if owns_fence {
                    if let Err(e) = self.fences().release(fence) {
                        tracing::error!("Node {} failed to release fence {}: {}", self.name, fence, e);
                    }
                }
            }
            ReleaseOutcome::Unknown => {
                tracing::warn!(
                    "Node {} has no fence for output {} of request {}",
                    self.name,
                    output_index,
                    request_id
                );
            }
        }
    }

    /// A consumer is done with an output of `request_id`.
    pub fn release_output_reference(&self, output_index: usize, request_id: u64) {
        let Some(index) = self.handler_index(output_index, request_id) else {
            tracing::warn!("Node {} has no output {}", self.name, output_index);
            return;
        };
        let (handler, delayed) = {
            let table = lock(&self.fence_table);
            (
                table.handler(output_index, index, request_id).cloned(),
                table.delayed_handler(output_index, index, request_id).cloned(),
            )
        };

        if delayed.is_some() {
            self.release_delayed_reference(output_index, request_id);
        }
        let forwarded = delayed
            .and_then(|d| d.delayed_info())
            .filter(|info| info.is_parent_input_buffer)
            .and_then(|info| info.parent);
        if let Some((parent, parent_output, parent_request)) = forwarded {
            match self.peer(parent) {
                Ok(parent) => parent.release_output_reference(parent_output, parent_request),
                Err(e) => tracing::warn!("Node {} cannot forward release: {}", self.name, e),
            }
            return;
        }

        match handler {
            Some(handler) => self.release_handler_buffers(&handler),
            None => tracing::warn!(
                "Node {} output {} of request {} released after its handler was reused",
                self.name,
                output_index,
                request_id
            ),
        }
        self.notify_and_release_fence(output_index, request_id);
    }

    /// Pick the buffers a bypassable node's output carries for a request and
    /// signal its delayed fence. With `parent_input` set the output passes
    /// through the buffers read on that input.
    pub fn set_delayed_output_buffers(
        &self,
        request_id: u64,
        output_index: usize,
        parent_input: Option<usize>,
    ) -> Result<()> {
        let slot = self.ring.lookup(request_id).ok_or_else(|| {
            NodeError::InvalidState(format!("{} has no request {}", self.name, request_id))
        })?;
        let index = self.handler_index(output_index, request_id).ok_or_else(|| {
            NodeError::InvalidArg(format!("{} has no output {}", self.name, output_index))
        })?;
        let (handler, delayed) = {
            let table = lock(&self.fence_table);
            (
                table.handler(output_index, index, request_id).cloned(),
                table.delayed_handler(output_index, index, request_id).cloned(),
            )
        };
        let delayed = delayed.ok_or_else(|| {
            NodeError::InvalidState(format!(
                "{} output {} has no delayed fence for request {}",
                self.name, output_index, request_id
            ))
        })?;
        let fence = delayed.fence();

        let info = match parent_input {
            Some(input_index) => {
                let binding = slot
                    .state()
                    .inputs
                    .iter()
                    .find(|b| b.input_index == input_index)
                    .cloned()
                    .ok_or_else(|| {
                        NodeError::InvalidArg(format!(
                            "{} input {} is not bound for request {}",
                            self.name, input_index, request_id
                        ))
                    })?;
                let parent = {
                    let ports = read(&self.ports);
                    let port = ports.input(input_index)?;
                    port.parent
                        .map(|parent| (parent, port.parent_output_index, binding.parent_request_id))
                };
                DelayedOutputBufferInfo {
                    fence,
                    buffers: binding.buffers,
                    is_parent_input_buffer: true,
                    parent_input_index: Some(input_index),
                    parent,
                }
            }
            None => DelayedOutputBufferInfo {
                fence,
                buffers: handler.as_ref().map(|h| h.live_buffers()).unwrap_or_default(),
                is_parent_input_buffer: false,
                parent_input_index: None,
                parent: None,
            },
        };

        let parent = info.parent;
        delayed.set_delayed_info(info);

        if let Some((parent_id, parent_output, parent_request)) = parent {
            // Consumers now release the parent directly
            let consumers = read(&self.ports).output(output_index)?.consumer_count();
            {
                let mut state = slot.state();
                let mut remaining = consumers;
                state.parent_releases.retain(|release| match release {
                    ParentRelease::Linked {
                        parent,
                        output_index,
                        request_id,
                    } if remaining > 0
                        && *parent == parent_id
                        && *output_index == parent_output
                        && *request_id == parent_request =>
                    {
                        remaining -= 1;
                        false
                    }
                    _ => true,
                });
            }
            for _ in 0..consumers {
                if let Some(handler) = &handler {
                    self.release_handler_buffers(handler);
                }
                self.notify_and_release_fence(output_index, request_id);
            }
        }

        self.fences()
            .signal(fence, FenceResult::Success)
            .map_err(|e| e.with_context(format!("{} delayed fence of request {}", self.name, request_id)))
    }

    /// Signal the output fences of a request. Fences shared by a composite
    /// group are signalled once.
    pub fn signal_output_fences(&self, request_id: u64, result: FenceResult) -> Result<()> {
        let fences: Vec<FenceHandle> = {
            let table = lock(&self.fence_table);
            let mut seen = HashSet::new();
            table
                .handlers_for_request(request_id)
                .into_iter()
                .filter(|h| !h.is_delayed && !h.is_signaled())
                .map(|h| h.fence())
                .filter(|f| f.is_valid() && seen.insert(*f))
                .collect()
        };

        let mut first_error = None;
        for fence in fences {
            if let Err(e) = self.fences().signal(fence, result) {
                tracing::warn!("Node {} could not signal {}: {}", self.name, fence, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn process_partial_metadata_done(&self, request_id: u64) {
        let Some(slot) = self.ring.lookup(request_id) else {
            return;
        };
        if slot.partial_metadata_complete.fire() {
            if let Ok(host) = self.host() {
                host.notify_node_partial_metadata_done(self.id, request_id);
            }
        }
    }

    /// Publish the node's tags and report metadata done, once.
    pub fn process_metadata_done(&self, request_id: u64) {
        let Some(slot) = self.ring.lookup(request_id) else {
            return;
        };
        if !slot.metadata_complete.fire() {
            return;
        }
        self.process_partial_metadata_done(request_id);

        let slot_index = self.ring.slot_index(request_id);
        let tags = lock(&self.publish_tags).clone();
        for tag in tags {
            self.metadata().publish(slot_index, tag);
        }
        self.metadata().publish(slot_index, node_complete_tag(self.id));

        if let Ok(host) = self.host() {
            host.notify_node_metadata_done(self.id, request_id);
        }
    }

    /// Drop every parent reference held for the request and report it done.
    pub fn process_request_id_done(&self, request_id: u64) {
        let Some(slot) = self.ring.lookup(request_id) else {
            return;
        };
        if slot.request_complete.is_done() {
            return;
        }
        let (releases, held) = {
            let mut state = slot.state();
            if state.completing {
                return;
            }
            state.completing = true;
            (
                std::mem::take(&mut state.parent_releases),
                std::mem::take(&mut state.held_outputs),
            )
        };

        self.recycle_cmd_buffers(request_id);
        let host = self.host().ok();

        for release in releases {
            match release {
                ParentRelease::Linked {
                    parent,
                    output_index,
                    request_id: parent_request,
                } => match self.peer(parent) {
                    Ok(parent) => parent.release_output_reference(output_index, parent_request),
                    Err(e) => tracing::warn!("Node {} cannot release parent: {}", self.name, e),
                },
                ParentRelease::Source {
                    port_id,
                    buffer,
                    fence,
                    private_fence,
                    ..
                } => {
                    {
                        let _guard = lock(&self.buffer_release_lock);
                        buffer.release_reference();
                    }
                    if private_fence && fence.is_valid() {
                        if let Err(e) = self.fences().release(fence) {
                            tracing::warn!("Node {} source fence {}: {}", self.name, fence, e);
                        }
                    }
                    if let Some(host) = &host {
                        host.release_source_input_reference(self.id, port_id, request_id);
                    }
                }
            }
        }

        for output_index in held {
            let handler = self.handler_index(output_index, request_id).and_then(|index| {
                lock(&self.fence_table)
                    .handler(output_index, index, request_id)
                    .cloned()
            });
            if let Some(handler) = handler {
                self.release_handler_buffers(&handler);
            }
        }

        slot.record_stage(0, NodeStage::End, self.settings.max_process_sequence_id_for_timing);
        slot.mark_success();
        if slot.request_complete.fire() {
            tracing::debug!(
                "Node {} done with request {} ({})",
                self.name,
                request_id,
                slot.status()
            );
            if let Some(host) = &host {
                host.notify_node_request_id_done(self.id, request_id);
            }
        }
    }
}
