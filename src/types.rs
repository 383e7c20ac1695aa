//! Request-level data types shared by the pipeline and its nodes
//!
//! A [`CaptureRequest`] is the record the pipeline hands to every node for
//! one request id. It carries the active stream bitmask, the batch layout and
//! the externally supplied buffers for sink and source ports.
//!
//! # Main Types
//!
//! - [`ExternalBuffer`] - Descriptor of memory owned outside the pipeline
//! - [`StreamBuffer`] - An external buffer bound to a port for one request
//! - [`CaptureRequest`] - Everything a node needs to set up one request

use crate::buffer::format::{Format, ImageFormat};
use crate::fence::FenceHandle;
use serde::{Deserialize, Serialize};

/// Memory owned by the client (a gralloc-like handle).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExternalBuffer {
    /// Opaque handle value
    pub handle: u64,
    /// Size of the backing allocation in bytes
    pub size: usize,
}

impl ExternalBuffer {
    pub fn new(handle: u64, size: usize) -> Self {
        Self { handle, size }
    }
}

/// An external buffer attached to a sink or source port for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamBuffer {
    /// Port id on the node that consumes or produces this buffer
    pub port_id: u32,
    /// Sub-frame index inside a batched request
    pub batch_index: u32,
    pub format: ImageFormat,
    pub buffer: ExternalBuffer,
    /// Fence the client signals when a source buffer is ready to read
    pub acquire_fence: Option<FenceHandle>,
    /// Fence the node signals when a sink buffer has been written
    pub release_fence: Option<FenceHandle>,
}

impl StreamBuffer {
    pub fn new(port_id: u32, format: ImageFormat, buffer: ExternalBuffer) -> Self {
        Self {
            port_id,
            batch_index: 0,
            format,
            buffer,
            acquire_fence: None,
            release_fence: None,
        }
    }

    pub fn with_batch_index(mut self, batch_index: u32) -> Self {
        self.batch_index = batch_index;
        self
    }

    pub fn with_acquire_fence(mut self, fence: FenceHandle) -> Self {
        self.acquire_fence = Some(fence);
        self
    }

    pub fn with_release_fence(mut self, fence: FenceHandle) -> Self {
        self.release_fence = Some(fence);
        self
    }

    pub fn matches(&self, port_id: u32, format: Format) -> bool {
        self.port_id == port_id && self.format.format == format
    }
}

/// Per-request record provided by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRequest {
    pub request_id: u64,
    /// Bitmask of client streams that want output for this request
    pub active_streams: u64,
    /// Number of sub-frames produced for this request
    pub batch_size: u32,
    /// Active streams per sub-frame; empty means every sub-frame uses
    /// `active_streams`
    pub batch_stream_masks: Vec<u64>,
    /// Buffers feeding source input ports
    pub input_buffers: Vec<StreamBuffer>,
    /// Buffers backing sink output ports
    pub output_buffers: Vec<StreamBuffer>,
}

impl CaptureRequest {
    pub fn new(request_id: u64, active_streams: u64) -> Self {
        Self {
            request_id,
            active_streams,
            batch_size: 1,
            batch_stream_masks: Vec::new(),
            input_buffers: Vec::new(),
            output_buffers: Vec::new(),
        }
    }

    pub fn with_input(mut self, buffer: StreamBuffer) -> Self {
        self.input_buffers.push(buffer);
        self
    }

    pub fn with_output(mut self, buffer: StreamBuffer) -> Self {
        self.output_buffers.push(buffer);
        self
    }

    pub fn with_batch(mut self, batch_stream_masks: Vec<u64>) -> Self {
        self.batch_size = batch_stream_masks.len().max(1) as u32;
        self.batch_stream_masks = batch_stream_masks;
        self
    }

    /// Active stream mask of one sub-frame
    pub fn batch_mask(&self, batch_index: u32) -> u64 {
        self.batch_stream_masks
            .get(batch_index as usize)
            .copied()
            .unwrap_or(self.active_streams)
    }

    /// Sink buffer supplied for `port_id` in sub-frame `batch_index`
    pub fn output_buffer(&self, port_id: u32, batch_index: u32) -> Option<&StreamBuffer> {
        self.output_buffers
            .iter()
            .find(|b| b.port_id == port_id && b.batch_index == batch_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_mask_defaults_to_active_streams() {
        let request = CaptureRequest::new(3, 0b101);
        assert_eq!(request.batch_size, 1);
        assert_eq!(request.batch_mask(0), 0b101);
    }

    #[test]
    fn test_batch_masks() {
        let request = CaptureRequest::new(3, 0b11).with_batch(vec![0b01, 0b11]);
        assert_eq!(request.batch_size, 2);
        assert_eq!(request.batch_mask(0), 0b01);
        assert_eq!(request.batch_mask(1), 0b11);
    }

    #[test]
    fn test_output_buffer_lookup() {
        let fmt = ImageFormat::new(Format::Nv12, 64, 48);
        let request = CaptureRequest::new(0, 1)
            .with_output(StreamBuffer::new(2, fmt, ExternalBuffer::new(10, 4608)))
            .with_output(
                StreamBuffer::new(2, fmt, ExternalBuffer::new(11, 4608)).with_batch_index(1),
            );
        assert_eq!(request.output_buffer(2, 1).unwrap().buffer.handle, 11);
        assert!(request.output_buffer(3, 0).is_none());
    }
}
