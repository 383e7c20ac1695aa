use super::Node;
use crate::error::Result;
use crate::fence::{FenceHandle, FenceResult};
use crate::pipeline::request::PerRequestNodeStatus;
use crate::sync::lock;
use std::collections::HashSet;

impl Node {
    /// Cancel a request. Every output fence that has not been signalled yet
    /// is signalled `Canceled` once, which runs the regular completion path.
    pub fn flush(&self, request_id: u64) -> Result<()> {
        let Some(slot) = self.ring.lookup(request_id) else {
            tracing::debug!("Node {} has nothing to flush for request {}", self.name, request_id);
            return Ok(());
        };
        if slot.request_complete.is_done() {
            return Ok(());
        }

        if slot.status() != PerRequestNodeStatus::Error {
            slot.set_status(PerRequestNodeStatus::Cancelled);
        }
        tracing::info!("Node {} flushing request {}", self.name, request_id);
        self.plugin.cancel_request(request_id);

        let generation = slot.generation();
        let handlers: Vec<_> = lock(&self.fence_table)
            .handlers_for_request(request_id)
            .into_iter()
            .filter(|h| h.generation == generation && !h.is_signaled())
            .collect();

        if handlers.is_empty() && slot.num_unprocessed_fences() == 0 {
            self.process_partial_metadata_done(request_id);
            self.process_metadata_done(request_id);
            self.process_request_id_done(request_id);
        }

        let mut signaled: HashSet<FenceHandle> = HashSet::new();
        for handler in handlers {
            let fence = handler.fence();
            if !fence.is_valid() {
                self.process_fence_callback(&handler, FenceResult::Canceled);
                continue;
            }
            if !signaled.insert(fence) {
                continue;
            }
            if let Err(e) = self.fences().signal(fence, FenceResult::Canceled) {
                // Already signalled, its callback is on the way
                tracing::debug!("Node {} flush of fence {}: {}", self.name, fence, e);
            }
        }

        if let Ok(host) = self.host() {
            host.notify_request_error(self.id, request_id);
        }
        Ok(())
    }
}
