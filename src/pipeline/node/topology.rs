//! Static links between nodes and their per-request toggles.

use super::Node;
use crate::error::{NodeError, Result};
use crate::pipeline::port::Destination;
use crate::sync::{read, write};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Ports taking part in one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivePorts {
    pub inputs: Vec<usize>,
    pub outputs: Vec<usize>,
    pub node_enabled: bool,
}

/// Parent request an input with `buffer_delta` reads for `request_id`.
///
/// Returns `None` when there is nothing to read: the lag reaches past the
/// request ring, past the first request, or into a flushed request.
pub fn request_id_offset_from_last_flush(
    request_id: u64,
    buffer_delta: u32,
    ring_depth: usize,
    last_flushed: Option<u64>,
) -> Option<u64> {
    if buffer_delta == 0 {
        return Some(request_id);
    }
    if buffer_delta as usize >= ring_depth {
        return None;
    }
    let parent_request = request_id.checked_sub(buffer_delta as u64)?;
    match last_flushed {
        Some(flushed) if parent_request <= flushed => None,
        _ => Some(parent_request),
    }
}

impl Node {
    /// Connect input `input_index` to output `parent_port_id` of `parent`.
    pub fn set_input_link(&self, input_index: usize, parent: &Arc<Node>, parent_port_id: u32) -> Result<()> {
        let parent_output = parent.output_index(parent_port_id).ok_or_else(|| {
            NodeError::InvalidArg(format!(
                "node {} has no output port {}",
                parent.name(),
                parent_port_id
            ))
        })?;

        if parent.id() == self.id {
            let mut ports = write(&self.ports);
            ports.input(input_index)?;
            ports.output(parent_output)?;
            let input = &mut ports.inputs[input_index];
            input.parent = Some(self.id);
            input.parent_output_index = parent_output;
            input.is_source = false;
            let output = &mut ports.outputs[parent_output];
            output.destinations.push(Destination {
                node: self.id,
                input_index,
            });
            output.num_input_ports_connected += 1;
            return Ok(());
        }

        {
            let mut ports = write(&self.ports);
            ports.input(input_index)?;
            let input = &mut ports.inputs[input_index];
            input.parent = Some(parent.id());
            input.parent_output_index = parent_output;
            input.is_source = false;
        }

        parent.add_destination(
            parent_output,
            Destination {
                node: self.id,
                input_index,
            },
            &self.device_indices,
        )?;

        if parent.is_bypassable() {
            for (grandparent, output_index) in parent.linked_parents() {
                let grandparent = parent.peer(grandparent)?;
                grandparent.add_bypass_consumer(output_index)?;
            }
        }

        tracing::debug!(
            "Linked {}:{} -> {}:{}",
            parent.name(),
            parent_port_id,
            self.name,
            input_index
        );
        Ok(())
    }

    fn add_destination(&self, output_index: usize, destination: Destination, device_indices: &[u32]) -> Result<()> {
        let mut ports = write(&self.ports);
        ports.output(output_index)?;
        let output = &mut ports.outputs[output_index];
        output.destinations.push(destination);
        output.num_input_ports_connected += 1;
        for index in device_indices {
            if !output.device_indices.contains(index) {
                output.device_indices.push(*index);
            }
        }
        Ok(())
    }

    fn add_bypass_consumer(&self, output_index: usize) -> Result<()> {
        let mut ports = write(&self.ports);
        ports.output(output_index)?;
        ports.outputs[output_index].num_input_ports_connected_in_bypass += 1;
        Ok(())
    }

    /// (parent, parent output) of every linked input other than loopback
    pub(crate) fn linked_parents(&self) -> Vec<(crate::pipeline::id::NodeId, usize)> {
        read(&self.ports)
            .inputs
            .iter()
            .filter(|p| p.is_linked() && p.parent != Some(self.id))
            .filter_map(|p| p.parent.map(|parent| (parent, p.parent_output_index)))
            .collect()
    }

    /// Mark self links as loopback. A loopback input must lag its output by
    /// at least one request.
    pub fn set_up_loopback_ports(&self) -> Result<()> {
        let mut ports = write(&self.ports);
        let loops: Vec<(usize, usize, u32)> = ports
            .inputs
            .iter()
            .filter(|p| p.parent == Some(self.id))
            .map(|p| (p.index, p.parent_output_index, p.buffer_delta))
            .collect();

        for (input_index, output_index, delta) in loops {
            if delta == 0 {
                return Err(NodeError::InvalidArg(format!(
                    "loopback input {} of {} needs a buffer delta",
                    input_index, self.name
                )));
            }
            ports.inputs[input_index].is_loopback = true;
            let output = &mut ports.outputs[output_index];
            output.flags.is_loopback = true;
            output.enabled_in_stream_mask = u64::MAX;
            tracing::debug!(
                "Node {} loops output {} back into input {} (delta {})",
                self.name,
                output.port_id,
                input_index,
                delta
            );
        }
        Ok(())
    }

    /// Stop reading from the parent for the coming requests. Repeated calls
    /// have no further effect.
    pub fn disable_input_output_link(&self, input_index: usize) -> Result<()> {
        self.toggle_input_output_link(input_index, true)
    }

    pub fn enable_input_output_link(&self, input_index: usize) -> Result<()> {
        self.toggle_input_output_link(input_index, false)
    }

    fn toggle_input_output_link(&self, input_index: usize, disable: bool) -> Result<()> {
        let link = {
            let ports = read(&self.ports);
            let input = ports.input(input_index)?;
            if input.port_disabled.swap(disable, Ordering::AcqRel) == disable {
                return Ok(());
            }
            input
                .parent
                .filter(|_| input.is_linked())
                .map(|parent| (parent, input.parent_output_index))
        };

        let Some((parent, output_index)) = link else {
            return Ok(());
        };
        let parent = self.peer(parent)?;
        if disable {
            parent.on_consumer_disabled(output_index, &self.device_indices)
        } else {
            parent.on_consumer_enabled(output_index, &self.device_indices)
        }
    }

    fn on_consumer_disabled(&self, output_index: usize, device_indices: &[u32]) -> Result<()> {
        {
            let ports = read(&self.ports);
            ports.output(output_index)?
                .num_input_ports_disabled
                .fetch_add(1, Ordering::AcqRel);
        }
        self.remove_output_device_indices(output_index, device_indices)
    }

    fn on_consumer_enabled(&self, output_index: usize, device_indices: &[u32]) -> Result<()> {
        {
            let ports = read(&self.ports);
            let _ = ports
                .output(output_index)?
                .num_input_ports_disabled
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        }
        self.add_output_device_indices(output_index, device_indices)
    }

    pub fn add_output_device_indices(&self, output_index: usize, device_indices: &[u32]) -> Result<()> {
        let mut ports = write(&self.ports);
        ports.output(output_index)?;
        let output = &mut ports.outputs[output_index];
        for index in device_indices {
            if !output.device_indices.contains(index) {
                output.device_indices.push(*index);
            }
        }
        Ok(())
    }

    pub fn remove_output_device_indices(&self, output_index: usize, device_indices: &[u32]) -> Result<()> {
        let mut ports = write(&self.ports);
        ports.output(output_index)?;
        ports.outputs[output_index]
            .device_indices
            .retain(|index| !device_indices.contains(index));
        Ok(())
    }

    pub fn output_device_indices(&self, output_index: usize) -> Vec<u32> {
        read(&self.ports)
            .outputs
            .get(output_index)
            .map(|p| p.device_indices.clone())
            .unwrap_or_default()
    }

    pub fn set_output_stream_mask(&self, output_index: usize, mask: u64) -> Result<()> {
        let mut ports = write(&self.ports);
        ports.output(output_index)?;
        let output = &mut ports.outputs[output_index];
        if output.flags.is_loopback || output.flags.is_sink_no_buffer {
            output.enabled_in_stream_mask = u64::MAX;
        } else {
            output.enabled_in_stream_mask = mask;
        }
        Ok(())
    }

    /// Streams that need any output of this node. A node without outputs
    /// is needed by every stream.
    pub fn stream_mask(&self) -> u64 {
        let ports = read(&self.ports);
        if ports.outputs.is_empty() {
            return u64::MAX;
        }
        ports
            .outputs
            .iter()
            .fold(0, |mask, p| mask | p.enabled_in_stream_mask)
    }

    pub fn output_destinations(&self, output_index: usize) -> Vec<Destination> {
        read(&self.ports)
            .outputs
            .get(output_index)
            .map(|p| p.destinations.clone())
            .unwrap_or_default()
    }

    /// Work out which ports take part in a request with `active_streams`.
    pub fn new_active_streams_setup(&self, active_streams: u64) -> ActivePorts {
        let ports = read(&self.ports);
        let outputs: Vec<usize> = ports
            .outputs
            .iter()
            .filter(|p| p.is_enabled_for(active_streams))
            .map(|p| p.index)
            .collect();
        let inputs: Vec<usize> = ports
            .inputs
            .iter()
            .filter(|p| !p.is_disabled())
            .map(|p| p.index)
            .collect();

        let outputs_ok = ports.outputs.is_empty() || !outputs.is_empty();
        let inputs_ok = ports.inputs.is_empty() || !inputs.is_empty();
        let node_enabled = if self.flags.inplace {
            outputs_ok
        } else {
            outputs_ok && inputs_ok
        };

        ActivePorts {
            inputs,
            outputs,
            node_enabled,
        }
    }
}
