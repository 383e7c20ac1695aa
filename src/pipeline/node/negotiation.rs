//! Buffer negotiation and buffer manager lifetime.
//!
//! Requirements travel from sinks back to sources. Each output port
//! collects one requirement per connected input; once every output of a
//! node is satisfied the node finalizes its own input requirements and
//! forwards them to its parents. The gate is a [`Latch`] so the forwarding
//! runs exactly once no matter how many notifications race for it.
//!
//! [`Latch`]: crate::pipeline::request::Latch

use super::Node;
use crate::buffer::format::{BufferHeap, BufferProperties, ImageFormat};
use crate::buffer::manager::{ImageBufferManager, ImageBufferManagerConfig};
use crate::error::{NodeError, Result, ResultExt};
use crate::pipeline::id::NodeId;
use crate::pipeline::negotiation::{
    BufferNegotiationData, BufferRequirement, InputPortNegotiationData, OutputPortNegotiationData,
};
use crate::pipeline::port::PortTable;
use crate::sync::{lock, read, write};
use std::sync::Arc;

/// Negotiation progress of one node.
#[derive(Debug, Default)]
pub(super) struct NegotiationState {
    /// Requirements reported by the inputs connected to each output
    input_requirements: Vec<Vec<BufferRequirement>>,
    notified: Vec<bool>,
    final_outputs: Vec<Option<BufferRequirement>>,
    final_inputs: Vec<Option<BufferRequirement>>,
    complete: bool,
}

impl NegotiationState {
    pub(super) fn new(ports: &PortTable) -> Self {
        Self {
            input_requirements: vec![Vec::new(); ports.outputs.len()],
            notified: vec![false; ports.outputs.len()],
            final_outputs: vec![None; ports.outputs.len()],
            final_inputs: vec![None; ports.inputs.len()],
            complete: false,
        }
    }

    fn all_notified(&self) -> bool {
        self.notified.iter().all(|n| *n)
    }
}

impl Node {
    /// Start negotiation at this node. Outputs that have no downstream
    /// requirement to wait for are satisfied right away.
    pub fn trigger_buffer_negotiation(&self) -> Result<()> {
        if !self.negotiation_started.fire() {
            return Ok(());
        }

        let ready = {
            let ports = read(&self.ports);
            let mut state = lock(&self.negotiation);
            for port in &ports.outputs {
                if port.is_sink_like() || port.flags.is_loopback || port.num_input_ports_connected == 0 {
                    state.notified[port.index] = true;
                }
            }
            state.all_notified()
        };

        if ready && self.negotiation_gate.fire() {
            self.process_input_buffer_requirement()?;
        }
        Ok(())
    }

    /// A consumer of output `output_index` reports what it needs.
    pub fn buffer_requirement_notification(
        &self,
        output_index: usize,
        requirement: BufferRequirement,
    ) -> Result<()> {
        let ready = {
            let ports = read(&self.ports);
            let port = ports.output(output_index)?;
            let mut state = lock(&self.negotiation);
            if port.flags.is_loopback {
                return Ok(());
            }
            let reported = &mut state.input_requirements[output_index];
            reported.push(requirement);
            if reported.len() >= port.num_input_ports_connected as usize {
                state.notified[output_index] = true;
            }
            state.all_notified()
        };

        if ready && self.negotiation_gate.fire() {
            self.process_input_buffer_requirement()?;
        }
        Ok(())
    }

    /// Finalize output and input requirements and forward each input's
    /// requirement to its parent.
    pub fn process_input_buffer_requirement(&self) -> Result<()> {
        let mut data = {
            let ports = read(&self.ports);
            let state = lock(&self.negotiation);
            BufferNegotiationData {
                node: self.name.clone(),
                outputs: ports
                    .outputs
                    .iter()
                    .map(|p| OutputPortNegotiationData {
                        output_index: p.index,
                        port_id: p.port_id,
                        capability: p.capability,
                        is_sink: p.is_sink_like(),
                        input_requirements: state.input_requirements[p.index].clone(),
                        final_requirement: None,
                    })
                    .collect(),
                inputs: ports
                    .inputs
                    .iter()
                    .map(|p| InputPortNegotiationData {
                        input_index: p.index,
                        port_id: p.port_id,
                        format: p.format,
                        default_size: p.default_size,
                        requirement: None,
                    })
                    .collect(),
            }
        };

        self.plugin
            .finalize_input_requirement(&mut data)
            .with_context(|| format!("finalizing input requirements of {}", self.name))?;

        for output in &data.outputs {
            let requirement = output.final_requirement.ok_or_else(|| {
                NodeError::InvalidState(format!(
                    "{} left output {} without a requirement",
                    self.name, output.port_id
                ))
            })?;
            requirement.validate()?;
        }
        for input in &data.inputs {
            let requirement = input.requirement.ok_or_else(|| {
                NodeError::InvalidState(format!(
                    "{} left input {} without a requirement",
                    self.name, input.port_id
                ))
            })?;
            requirement.validate()?;
        }

        let forward: Vec<(NodeId, usize, BufferRequirement)> = {
            let mut ports = write(&self.ports);
            let mut state = lock(&self.negotiation);
            for output in &data.outputs {
                state.final_outputs[output.output_index] = output.final_requirement;
            }
            let mut forward = Vec::new();
            for input in &data.inputs {
                state.final_inputs[input.input_index] = input.requirement;
                let Some(port) = ports.inputs.get_mut(input.input_index) else {
                    continue;
                };
                port.requirement = input.requirement;
                if port.is_loopback || port.is_source {
                    continue;
                }
                if let (Some(parent), Some(requirement)) = (port.parent, input.requirement) {
                    forward.push((parent, port.parent_output_index, requirement));
                }
            }
            state.complete = true;
            forward
        };

        tracing::debug!(
            "Node {} finalized buffer requirements, forwarding to {} parents",
            self.name,
            forward.len()
        );

        for (parent, output_index, requirement) in forward {
            self.peer(parent)?
                .buffer_requirement_notification(output_index, requirement)?;
        }
        Ok(())
    }

    /// Every source input must accept its configured client stream.
    pub fn check_source_port_buffer_requirements(&self) -> Result<()> {
        let ports = read(&self.ports);
        for port in ports.inputs.iter().filter(|p| p.is_source) {
            let requirement = port.requirement.ok_or_else(|| {
                NodeError::InvalidState(format!(
                    "source port {} of {} was never negotiated",
                    port.port_id, self.name
                ))
            })?;
            let (width, height) = port.default_size;
            if requirement.format != port.format || !requirement.contains(width, height) {
                return Err(NodeError::InvalidArg(format!(
                    "source stream {}x{} {} on port {} of {} is outside {}x{}..{}x{}",
                    width,
                    height,
                    port.format,
                    port.port_id,
                    self.name,
                    requirement.min_width,
                    requirement.min_height,
                    requirement.max_width,
                    requirement.max_height
                )));
            }
        }
        Ok(())
    }

    pub fn is_negotiation_complete(&self) -> bool {
        lock(&self.negotiation).complete
    }

    pub fn output_buffer_properties(&self, output_index: usize) -> Option<BufferProperties> {
        read(&self.ports).outputs.get(output_index)?.properties
    }

    pub fn output_requirement(&self, output_index: usize) -> Option<BufferRequirement> {
        lock(&self.negotiation).final_outputs.get(output_index).copied().flatten()
    }

    pub fn input_requirement(&self, input_index: usize) -> Option<BufferRequirement> {
        lock(&self.negotiation).final_inputs.get(input_index).copied().flatten()
    }

    /// Largest number of buffers an output keeps alive
    pub fn output_max_image_buffers(&self, output_index: usize) -> Option<u32> {
        read(&self.ports).outputs.get(output_index).map(|p| p.max_image_buffers)
    }

    /// Turn the negotiated requirements into buffer properties and create
    /// the buffer managers.
    pub fn finalize_buffer_properties(&self) -> Result<()> {
        let finals = lock(&self.negotiation).final_outputs.clone();
        let depth = self.ring.depth() as u32;

        let lagged: Vec<(NodeId, usize, u32)> = {
            let mut ports = write(&self.ports);
            for port in &mut ports.outputs {
                let requirement = finals
                    .get(port.index)
                    .copied()
                    .flatten()
                    .unwrap_or_else(|| BufferRequirement::fixed(port.capability));
                let image_format = if port.flags.is_sink {
                    port.capability
                } else {
                    requirement.optimal()
                };
                let properties = BufferProperties {
                    image_format,
                    heap: if port.device_indices.is_empty() {
                        BufferHeap::System
                    } else {
                        BufferHeap::Device
                    },
                    max_image_buffers: port.max_image_buffers,
                    immediate_alloc_count: port.immediate_alloc_count.min(port.max_image_buffers),
                };
                port.properties = Some(properties);

                if port.has_buffers() && port.manager.is_none() {
                    let mut config = ImageBufferManagerConfig::new(
                        format!("{}_out{}", self.name, port.port_id),
                        image_format,
                        port.max_image_buffers,
                    );
                    config.immediate_alloc_count = properties.immediate_alloc_count;
                    config.late_binding = self.settings.enable_late_binding && !port.flags.is_sink;
                    config.wait_time = self.settings.image_buffer_wait_time();
                    config.max_timeout_count = self.settings.max_image_buffer_timeout_count;
                    port.manager = Some(Arc::new(ImageBufferManager::new(config)));
                }
            }

            for port in &mut ports.inputs {
                if port.is_source && port.source_manager.is_none() {
                    let image_format = port
                        .requirement
                        .map(|r| r.optimal())
                        .unwrap_or_else(|| port.default_format());
                    let mut config = ImageBufferManagerConfig::new(
                        format!("{}_in{}", self.name, port.port_id),
                        image_format,
                        depth,
                    );
                    config.late_binding = true;
                    config.wait_time = self.settings.image_buffer_wait_time();
                    config.max_timeout_count = self.settings.max_image_buffer_timeout_count;
                    port.source_manager = Some(Arc::new(ImageBufferManager::new(config)));
                }
            }

            ports
                .inputs
                .iter()
                .filter(|p| p.is_linked() && p.buffer_delta > 0)
                .filter_map(|p| p.parent.map(|parent| (parent, p.parent_output_index, p.buffer_delta)))
                .collect()
        };

        for (parent, output_index, delta) in lagged {
            let parent = self.peer(parent)?;
            let buffers = parent.output_max_image_buffers(output_index).unwrap_or(0);
            if buffers <= delta {
                return Err(NodeError::InvalidArg(format!(
                    "{} reads {} requests behind {} which keeps only {} buffers",
                    self.name,
                    delta,
                    parent.name(),
                    buffers
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn image_buffer_managers(&self) -> Vec<Arc<ImageBufferManager>> {
        let ports = read(&self.ports);
        ports
            .outputs
            .iter()
            .filter_map(|p| p.manager.clone())
            .chain(ports.inputs.iter().filter_map(|p| p.source_manager.clone()))
            .collect()
    }

    pub fn activate_image_buffers(&self) -> Result<()> {
        let managers = self.image_buffer_managers();
        if managers.is_empty() && read(&self.ports).outputs.iter().any(|p| p.has_buffers()) {
            return Err(NodeError::InvalidState(format!(
                "{} activated before its buffer properties were finalized",
                self.name
            )));
        }
        for manager in managers {
            manager.activate();
        }
        tracing::debug!("Activated image buffers of {}", self.name);
        Ok(())
    }

    /// Stop handing out buffers. A partial deactivation keeps the
    /// immediately allocated buffers for a quick restart.
    pub fn deactivate_image_buffers(&self, partial: bool) {
        let _guard = lock(&self.buffer_release_lock);
        for manager in self.image_buffer_managers() {
            manager.deactivate(partial);
        }
        tracing::debug!("Deactivated image buffers of {} (partial: {})", self.name, partial);
    }

    /// Optimal image of an output once negotiated
    pub fn output_image_format(&self, output_index: usize) -> Option<ImageFormat> {
        self.output_buffer_properties(output_index).map(|p| p.image_format)
    }
}
