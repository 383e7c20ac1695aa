use super::Node;
use crate::error::{NodeError, Result};
use crate::pipeline::host::PipelineHost;
use crate::pipeline::plugin::{ExecuteProcessRequestData, OutputPortRequest};
use crate::pipeline::request::{NodeStage, PerRequestNodeStatus, RequestSlot};
use crate::sync::{lock, read};
use std::sync::atomic::Ordering;

impl Node {
    /// Run the node's work for a request whose inputs are ready.
    pub fn process_request(&self, request_id: u64, sequence_id: u32) -> Result<()> {
        // Snapshot so lock and unlock always agree
        let parallel = self.parallel_process_requests.load(Ordering::Acquire);
        let guard = if parallel {
            None
        } else {
            Some(lock(&self.process_request_lock))
        };

        let host = self.host()?;
        let slot = self.ring.lookup(request_id).ok_or_else(|| {
            NodeError::InvalidState(format!(
                "{} processing request {} that was never set up",
                self.name, request_id
            ))
        })?;

        if host.flush_status() {
            drop(guard);
            tracing::info!("Node {} dropping request {} during flush", self.name, request_id);
            return self.flush(request_id);
        }

        let status = slot.status();
        if status.is_failed() || host.request_in_error_state(request_id) {
            tracing::debug!(
                "Node {} skipping request {} in state {}",
                self.name,
                request_id,
                status
            );
            return Ok(());
        }
        if !slot.state().node_enabled {
            return Ok(());
        }

        let max_sequence = self.settings.max_process_sequence_id_for_timing;
        slot.record_stage(sequence_id, NodeStage::Start, max_sequence);
        if status != PerRequestNodeStatus::Running && !slot.transition(status, PerRequestNodeStatus::Running) {
            tracing::debug!(
                "Node {} request {} changed state before processing",
                self.name,
                request_id
            );
            return Ok(());
        }

        let data = match self.build_execute_data(slot, request_id, sequence_id, host.as_ref()) {
            Ok(data) => data,
            Err(e) => {
                drop(guard);
                return Err(self.fail_request(slot, request_id, e));
            }
        };
        slot.record_stage(sequence_id, NodeStage::DependenciesMet, max_sequence);

        match self.plugin.execute_process_request(self, &data) {
            Ok(()) => {
                slot.transition(PerRequestNodeStatus::Running, PerRequestNodeStatus::Submit);
                slot.record_stage(sequence_id, NodeStage::EPReqEnd, max_sequence);
                let no_fences = slot.state().fence_count == 0;
                drop(guard);
                if no_fences {
                    self.process_partial_metadata_done(request_id);
                    self.process_metadata_done(request_id);
                    self.process_request_id_done(request_id);
                }
                Ok(())
            }
            Err(e) => {
                drop(guard);
                Err(self.fail_request(slot, request_id, e))
            }
        }
    }

    fn fail_request(&self, slot: &RequestSlot, request_id: u64, error: NodeError) -> NodeError {
        if error.is_cancellation() {
            tracing::info!("Node {} request {} cancelled: {}", self.name, request_id, error);
        } else {
            tracing::error!("Node {} failed request {}: {}", self.name, request_id, error);
        }
        slot.set_status(PerRequestNodeStatus::Error);
        if let Err(e) = self.flush(request_id) {
            tracing::warn!("Flush of failed request {} failed: {}", request_id, e);
        }
        error.with_context(format!("node {} request {}", self.name, request_id))
    }

    fn build_execute_data(
        &self,
        slot: &RequestSlot,
        request_id: u64,
        sequence_id: u32,
        host: &dyn PipelineHost,
    ) -> Result<ExecuteProcessRequestData> {
        let request = host.get_request(request_id).ok_or_else(|| {
            NodeError::InvalidArg(format!("request {} is unknown to the pipeline", request_id))
        })?;
        let (mut inputs, active_outputs) = {
            let state = slot.state();
            (state.inputs.clone(), state.active_outputs.clone())
        };

        // Bypassable parents choose their buffers at process time
        let parents: Vec<Option<(crate::pipeline::id::NodeId, usize)>> = {
            let ports = read(&self.ports);
            inputs
                .iter()
                .map(|binding| {
                    ports
                        .inputs
                        .get(binding.input_index)
                        .filter(|p| p.is_linked())
                        .and_then(|p| p.parent.map(|parent| (parent, p.parent_output_index)))
                })
                .collect()
        };
        for (binding, parent) in inputs.iter_mut().zip(parents) {
            let Some((parent, output_index)) = parent else {
                continue;
            };
            let parent = self.peer(parent)?;
            if !parent.is_bypassable() {
                continue;
            }
            if let Some(info) = parent.get_output_port_info(output_index, binding.parent_request_id) {
                binding.buffers = info.buffers;
            }
        }

        let mut outputs = Vec::with_capacity(active_outputs.len());
        for output_index in active_outputs {
            let Some(index) = self.handler_index(output_index, request_id) else {
                continue;
            };
            let (handler, delayed) = {
                let table = lock(&self.fence_table);
                (
                    table.handler(output_index, index, request_id).cloned(),
                    table.delayed_handler(output_index, index, request_id).cloned(),
                )
            };
            let Some(handler) = handler else {
                continue;
            };
            let buffers = handler.live_buffers();
            if self.settings.enable_late_binding {
                let _guard = lock(&self.buffer_request_lock);
                for buffer in buffers.iter().filter(|b| !b.is_backing_bound()) {
                    buffer.bind_backing()?;
                }
            }
            outputs.push(OutputPortRequest {
                output_index,
                port_id: handler.port_id,
                fence: handler.fence(),
                delayed_fence: delayed.map(|d| d.fence()),
                buffers,
            });
        }

        Ok(ExecuteProcessRequestData {
            request_id,
            sequence_id,
            request,
            inputs,
            outputs,
        })
    }
}
