//! Node settings injected at construction time
//!
//! Every node receives an `Arc<NodeSettings>` when it is created instead of
//! reading process-wide statics. The pipeline shares one instance across all
//! of its nodes, but tests are free to build nodes with their own values.
//!
//! # Defaults
//!
//! | Field | Default |
//! |---|---|
//! | `max_request_queue_depth` | 8 (six requests in flight plus two spare slots) |
//! | `max_fence_error_buffer_depth` | 50 |
//! | `image_buffer_wait_time_ms` | 100 |
//! | `max_image_buffer_timeout_count` | 3 |
//! | `max_process_sequence_id_for_timing` | 8 |

use crate::error::{NodeError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Number of requests the pipeline keeps in flight by default
pub const DEFAULT_REQUEST_QUEUE_DEPTH: usize = 6;

/// Ring size: in-flight requests plus two slots of slack for late callbacks
pub const DEFAULT_MAX_REQUEST_QUEUE_DEPTH: usize = DEFAULT_REQUEST_QUEUE_DEPTH + 2;

/// Depth of the per-node failed-fence history
pub const DEFAULT_MAX_FENCE_ERROR_BUFFER_DEPTH: usize = 50;

/// Sequence ids beyond this are not timed
pub const DEFAULT_MAX_PROCESS_SEQUENCE_ID_FOR_TIMING: u32 = 8;

/// Settings that control per-node request and buffer handling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    /// Number of per-request slots in each node's ring
    pub max_request_queue_depth: usize,

    /// Number of failed fences remembered for postmortem dumps
    pub max_fence_error_buffer_depth: usize,

    /// How long `get_image_buffer` waits for a busy buffer to come back
    pub image_buffer_wait_time_ms: u64,

    /// After this many consecutive waits time out the manager stops waiting
    pub max_image_buffer_timeout_count: u32,

    /// Let `process_request` run concurrently for different requests
    pub parallel_process_requests: bool,

    /// Bind buffer memory at process time instead of at setup time
    pub enable_late_binding: bool,

    /// Worker threads used for fence callbacks and request dispatch
    pub job_pool_threads: usize,

    /// Highest process sequence id that records stage timestamps
    pub max_process_sequence_id_for_timing: u32,

    /// Keep the immediately allocated buffers when deactivating
    pub partial_buffer_release_on_deactivate: bool,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            max_request_queue_depth: DEFAULT_MAX_REQUEST_QUEUE_DEPTH,
            max_fence_error_buffer_depth: DEFAULT_MAX_FENCE_ERROR_BUFFER_DEPTH,
            image_buffer_wait_time_ms: 100,
            max_image_buffer_timeout_count: 3,
            parallel_process_requests: false,
            enable_late_binding: true,
            job_pool_threads: 4,
            max_process_sequence_id_for_timing: DEFAULT_MAX_PROCESS_SEQUENCE_ID_FOR_TIMING,
            partial_buffer_release_on_deactivate: true,
        }
    }
}

impl NodeSettings {
    /// Create settings with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style override of the ring depth
    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.max_request_queue_depth = depth;
        self
    }

    /// Builder-style override of the parallel process flag
    pub fn with_parallel_process_requests(mut self, parallel: bool) -> Self {
        self.parallel_process_requests = parallel;
        self
    }

    /// Builder-style override of late binding
    pub fn with_late_binding(mut self, enabled: bool) -> Self {
        self.enable_late_binding = enabled;
        self
    }

    /// Image buffer wait as a `Duration`
    pub fn image_buffer_wait_time(&self) -> Duration {
        Duration::from_millis(self.image_buffer_wait_time_ms)
    }

    /// Check the settings for values that would make the ring unusable
    pub fn validate(&self) -> Result<()> {
        if self.max_request_queue_depth < 2 {
            return Err(NodeError::Config(format!(
                "max_request_queue_depth must be at least 2, got {}",
                self.max_request_queue_depth
            )));
        }
        if self.max_fence_error_buffer_depth == 0 {
            return Err(NodeError::Config(
                "max_fence_error_buffer_depth must be non-zero".to_string(),
            ));
        }
        if self.job_pool_threads == 0 {
            return Err(NodeError::Config(
                "job_pool_threads must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
