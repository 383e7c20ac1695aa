//! Fence handler bookkeeping.
//!
//! One [`NodeFenceHandlerData`] exists per (output port, request) and tracks
//! the fence the port signals plus the buffers produced behind it. Ports in
//! the same composite group share one physical fence; the
//! [`FenceTable`] counts the references held on that fence and reports when
//! the last one is gone so the owner can release it exactly once.

use crate::buffer::image_buffer::ImageBuffer;
use crate::fence::{FenceHandle, FenceResult};
use crate::pipeline::id::NodeId;
use crate::sync::lock;
use crate::types::ExternalBuffer;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Buffer of one batched sub-frame.
#[derive(Debug, Clone)]
pub struct FenceHandlerBufferInfo {
    /// `None` once the last reference was dropped
    pub buffer: Option<Arc<ImageBuffer>>,
    pub sequence_id: u32,
    pub external: Option<ExternalBuffer>,
}

/// Buffers a bypassable node selected for its delayed output.
#[derive(Debug, Clone)]
pub struct DelayedOutputBufferInfo {
    pub fence: FenceHandle,
    pub buffers: Vec<Arc<ImageBuffer>>,
    /// Buffers belong to the node's parent rather than to the node
    pub is_parent_input_buffer: bool,
    pub parent_input_index: Option<usize>,
    /// Where consumer releases are forwarded when the parent buffer is used
    pub parent: Option<(NodeId, usize, u64)>,
}

/// Key of a fence reference count entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum GroupKey {
    Composite(u32),
    Port(usize),
    /// Delayed fence of a bypassable node's output
    Delayed(usize),
}

impl GroupKey {
    pub fn for_port(output_index: usize, composite_group: u32) -> Self {
        if composite_group == 0 {
            GroupKey::Port(output_index)
        } else {
            GroupKey::Composite(composite_group)
        }
    }
}

/// Creation parameters of a handler.
#[derive(Debug, Clone, Copy)]
pub struct FenceHandlerInit {
    pub fence: FenceHandle,
    pub request_id: u64,
    pub output_index: usize,
    pub port_id: u32,
    pub primary_fence: bool,
    pub is_chi_fence: bool,
    pub is_delayed: bool,
    pub is_sink: bool,
    pub is_held: bool,
    pub group: GroupKey,
    pub generation: u64,
}

pub struct NodeFenceHandlerData {
    hfence: AtomicU64,
    is_fence_signaled: AtomicBool,
    result: AtomicU8,
    pub request_id: u64,
    pub output_index: usize,
    pub port_id: u32,
    pub primary_fence: bool,
    pub is_chi_fence: bool,
    pub is_delayed: bool,
    pub is_sink: bool,
    /// Own buffer reference is dropped at request completion
    pub is_held: bool,
    pub group: GroupKey,
    /// Ring slot generation at creation
    pub generation: u64,
    buffers: Mutex<Vec<FenceHandlerBufferInfo>>,
    delayed: Mutex<Option<DelayedOutputBufferInfo>>,
}

impl NodeFenceHandlerData {
    pub fn new(init: FenceHandlerInit) -> Self {
        Self {
            hfence: AtomicU64::new(init.fence.0),
            is_fence_signaled: AtomicBool::new(false),
            result: AtomicU8::new(0),
            request_id: init.request_id,
            output_index: init.output_index,
            port_id: init.port_id,
            primary_fence: init.primary_fence,
            is_chi_fence: init.is_chi_fence,
            is_delayed: init.is_delayed,
            is_sink: init.is_sink,
            is_held: init.is_held,
            group: init.group,
            generation: init.generation,
            buffers: Mutex::new(Vec::new()),
            delayed: Mutex::new(None),
        }
    }

    pub fn fence(&self) -> FenceHandle {
        FenceHandle(self.hfence.load(Ordering::Acquire))
    }

    pub fn invalidate_fence(&self) {
        self.hfence.store(FenceHandle::INVALID.0, Ordering::Release);
    }

    /// Claim the signal. Only the first caller gets `true`.
    pub fn try_mark_signaled(&self, result: FenceResult) -> bool {
        if self
            .is_fence_signaled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.result.store(result.to_u8(), Ordering::Release);
            true
        } else {
            false
        }
    }

    pub fn is_signaled(&self) -> bool {
        self.is_fence_signaled.load(Ordering::Acquire)
    }

    pub fn result(&self) -> Option<FenceResult> {
        FenceResult::from_u8(self.result.load(Ordering::Acquire))
    }

    pub fn buffers(&self) -> MutexGuard<'_, Vec<FenceHandlerBufferInfo>> {
        lock(&self.buffers)
    }

    pub fn push_buffer(&self, info: FenceHandlerBufferInfo) {
        lock(&self.buffers).push(info);
    }

    /// Live buffers behind the handler
    pub fn live_buffers(&self) -> Vec<Arc<ImageBuffer>> {
        lock(&self.buffers)
            .iter()
            .filter_map(|info| info.buffer.clone())
            .collect()
    }

    pub fn sequence_ids(&self) -> Vec<u32> {
        lock(&self.buffers).iter().map(|info| info.sequence_id).collect()
    }

    pub fn delayed_info(&self) -> Option<DelayedOutputBufferInfo> {
        lock(&self.delayed).clone()
    }

    pub fn set_delayed_info(&self, info: DelayedOutputBufferInfo) {
        *lock(&self.delayed) = Some(info);
    }
}

impl std::fmt::Debug for NodeFenceHandlerData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeFenceHandlerData")
            .field("fence", &self.fence())
            .field("request_id", &self.request_id)
            .field("output_index", &self.output_index)
            .field("signaled", &self.is_signaled())
            .field("delayed", &self.is_delayed)
            .finish()
    }
}

/// Shared fence of a composite group (or of a single port).
#[derive(Debug)]
pub struct CompositePortFenceInfo {
    pub fence: FenceHandle,
    pub ref_count: u32,
    /// This node created the fence and must release it
    pub owns_fence: bool,
    pub members: Vec<Arc<NodeFenceHandlerData>>,
}

/// Result of dropping a fence reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Pending(u32),
    /// Last reference gone; the caller releases `fence` if it owns it
    Released { fence: FenceHandle, owns_fence: bool },
    Unknown,
}

/// Handlers and composite reference counts of one node. Guarded by the
/// node's fence-create/release lock.
#[derive(Debug, Default)]
pub struct FenceTable {
    handlers: Vec<Vec<Option<Arc<NodeFenceHandlerData>>>>,
    delayed: Vec<Vec<Option<Arc<NodeFenceHandlerData>>>>,
    composite: HashMap<(u64, GroupKey), CompositePortFenceInfo>,
}

impl FenceTable {
    /// `capacities[i]` handlers are kept for output `i`
    pub fn new(capacities: &[usize]) -> Self {
        Self {
            handlers: capacities.iter().map(|&n| vec![None; n]).collect(),
            delayed: capacities.iter().map(|&n| vec![None; n]).collect(),
            composite: HashMap::new(),
        }
    }

    pub fn handler_at(&self, output_index: usize, index: usize) -> Option<&Arc<NodeFenceHandlerData>> {
        self.handlers.get(output_index)?.get(index)?.as_ref()
    }

    /// Handler of `request_id`, if the slot still belongs to it
    pub fn handler(&self, output_index: usize, index: usize, request_id: u64) -> Option<&Arc<NodeFenceHandlerData>> {
        self.handler_at(output_index, index)
            .filter(|h| h.request_id == request_id)
    }

    pub fn delayed_handler(&self, output_index: usize, index: usize, request_id: u64) -> Option<&Arc<NodeFenceHandlerData>> {
        self.delayed
            .get(output_index)?
            .get(index)?
            .as_ref()
            .filter(|h| h.request_id == request_id)
    }

    pub fn install(&mut self, index: usize, handler: Arc<NodeFenceHandlerData>) {
        let table = if handler.is_delayed {
            &mut self.delayed
        } else {
            &mut self.handlers
        };
        if let Some(slot) = table
            .get_mut(handler.output_index)
            .and_then(|slots| slots.get_mut(index))
        {
            *slot = Some(handler);
        }
    }

    /// Every handler (primary and delayed) created for `request_id`
    pub fn handlers_for_request(&self, request_id: u64) -> Vec<Arc<NodeFenceHandlerData>> {
        self.handlers
            .iter()
            .chain(self.delayed.iter())
            .flatten()
            .flatten()
            .filter(|h| h.request_id == request_id)
            .cloned()
            .collect()
    }

    pub fn all_handlers(&self) -> impl Iterator<Item = &Arc<NodeFenceHandlerData>> {
        self.handlers
            .iter()
            .chain(self.delayed.iter())
            .flatten()
            .flatten()
    }

    /// Fence already created for a group in this request
    pub fn group_fence(&self, request_id: u64, key: GroupKey) -> Option<FenceHandle> {
        self.composite.get(&(request_id, key)).map(|info| info.fence)
    }

    pub fn ref_count(&self, request_id: u64, key: GroupKey) -> Option<u32> {
        self.composite.get(&(request_id, key)).map(|info| info.ref_count)
    }

    /// Add `seed` references on the group fence, creating the entry for the
    /// first member.
    pub fn add_reference(
        &mut self,
        request_id: u64,
        key: GroupKey,
        fence: FenceHandle,
        owns_fence: bool,
        seed: u32,
        member: Arc<NodeFenceHandlerData>,
    ) {
        let entry = self
            .composite
            .entry((request_id, key))
            .or_insert_with(|| CompositePortFenceInfo {
                fence,
                ref_count: 0,
                owns_fence,
                members: Vec::new(),
            });
        entry.ref_count += seed;
        entry.members.push(member);
    }

    /// Drop one reference. At zero the entry is removed and every member's
    /// fence handle is invalidated.
    pub fn release_reference(&mut self, request_id: u64, key: GroupKey) -> ReleaseOutcome {
        let Some(info) = self.composite.get_mut(&(request_id, key)) else {
            return ReleaseOutcome::Unknown;
        };
        if info.ref_count == 0 {
            tracing::error!(
                "Fence {} of request {} released with no outstanding references",
                info.fence,
                request_id
            );
            return ReleaseOutcome::Pending(0);
        }
        info.ref_count -= 1;
        if info.ref_count > 0 {
            return ReleaseOutcome::Pending(info.ref_count);
        }
        self.finish(request_id, key)
    }

    /// Release the entry if nobody holds a reference. Used by sink ports,
    /// which hold none themselves.
    pub fn settle(&mut self, request_id: u64, key: GroupKey) -> ReleaseOutcome {
        match self.composite.get(&(request_id, key)) {
            None => ReleaseOutcome::Unknown,
            Some(info) if info.ref_count > 0 => ReleaseOutcome::Pending(info.ref_count),
            Some(_) => self.finish(request_id, key),
        }
    }

    fn finish(&mut self, request_id: u64, key: GroupKey) -> ReleaseOutcome {
        match self.composite.remove(&(request_id, key)) {
            Some(info) => {
                for member in &info.members {
                    member.invalidate_fence();
                }
                ReleaseOutcome::Released {
                    fence: info.fence,
                    owns_fence: info.owns_fence,
                }
            }
            None => ReleaseOutcome::Unknown,
        }
    }

    /// Remove entries of requests other than `request_id` that share its
    /// ring slot. Returns the removed entries.
    pub fn reclaim_stale(
        &mut self,
        request_id: u64,
        ring_depth: usize,
    ) -> Vec<(u64, CompositePortFenceInfo)> {
        let depth = ring_depth.max(1) as u64;
        let stale: Vec<(u64, GroupKey)> = self
            .composite
            .keys()
            .filter(|(id, _)| *id != request_id && id % depth == request_id % depth)
            .copied()
            .collect();
        stale
            .into_iter()
            .filter_map(|key| self.composite.remove(&key).map(|info| (key.0, info)))
            .collect()
    }

    /// Drain every entry, for teardown
    pub fn drain(&mut self) -> Vec<CompositePortFenceInfo> {
        self.composite.drain().map(|(_, info)| info).collect()
    }

    pub fn outstanding_groups(&self) -> usize {
        self.composite.len()
    }
}

/// A failed fence kept for postmortem dumps.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FenceErrorRecord {
    pub fence: FenceHandle,
    pub request_id: u64,
    pub port_id: u32,
    pub result: FenceResult,
    pub timestamp: DateTime<Utc>,
}

/// Bounded ring of fence errors. The oldest record is dropped when full.
#[derive(Debug)]
pub struct FenceErrorRing {
    capacity: usize,
    records: VecDeque<FenceErrorRecord>,
}

impl FenceErrorRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            records: VecDeque::with_capacity(capacity.max(1)),
        }
    }

    pub fn push(&mut self, record: FenceErrorRecord) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    pub fn records(&self) -> Vec<FenceErrorRecord> {
        self.records.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn handler(output_index: usize, request_id: u64, fence: u64) -> Arc<NodeFenceHandlerData> {
        Arc::new(NodeFenceHandlerData::new(FenceHandlerInit {
            fence: FenceHandle(fence),
            request_id,
            output_index,
            port_id: output_index as u32,
            primary_fence: true,
            is_chi_fence: false,
            is_delayed: false,
            is_sink: false,
            is_held: false,
            group: GroupKey::Composite(1),
            generation: 1,
        }))
    }

    #[test]
    fn test_signal_claimed_once() {
        let h = handler(0, 0, 7);
        assert!(h.try_mark_signaled(FenceResult::Canceled));
        assert!(!h.try_mark_signaled(FenceResult::Success));
        assert_eq!(h.result(), Some(FenceResult::Canceled));
    }

    #[test]
    fn test_composite_group_shared_fence() {
        let mut table = FenceTable::new(&[4, 4]);
        let a = handler(0, 3, 9);
        let b = handler(1, 3, 9);
        let key = GroupKey::Composite(1);
        table.add_reference(3, key, FenceHandle(9), true, 2, Arc::clone(&a));
        assert_eq!(table.group_fence(3, key), Some(FenceHandle(9)));
        table.add_reference(3, key, FenceHandle(9), false, 2, Arc::clone(&b));
        assert_eq!(table.ref_count(3, key), Some(4));

        for remaining in [3, 2, 1] {
            assert_eq!(table.release_reference(3, key), ReleaseOutcome::Pending(remaining));
        }
        assert_eq!(
            table.release_reference(3, key),
            ReleaseOutcome::Released {
                fence: FenceHandle(9),
                owns_fence: true
            }
        );
        assert!(!a.fence().is_valid());
        assert!(!b.fence().is_valid());
        assert_eq!(table.release_reference(3, key), ReleaseOutcome::Unknown);
    }

    #[test]
    fn test_settle_waits_for_consumers() {
        let mut table = FenceTable::new(&[2]);
        let key = GroupKey::Port(0);
        table.add_reference(0, key, FenceHandle(1), true, 1, handler(0, 0, 1));
        assert_eq!(table.settle(0, key), ReleaseOutcome::Pending(1));
        table.release_reference(0, key);
        assert_eq!(table.settle(0, key), ReleaseOutcome::Unknown);

        table.add_reference(1, key, FenceHandle(2), false, 0, handler(0, 1, 2));
        assert!(matches!(table.settle(1, key), ReleaseOutcome::Released { owns_fence: false, .. }));
    }

    #[test]
    fn test_handler_lookup_by_request() {
        let mut table = FenceTable::new(&[2]);
        table.install(1, handler(0, 3, 5));
        assert!(table.handler(0, 1, 3).is_some());
        assert!(table.handler(0, 1, 1).is_none());
        assert_eq!(table.handlers_for_request(3).len(), 1);
    }

    #[test]
    fn test_reclaim_stale_same_slot_only() {
        let mut table = FenceTable::new(&[1]);
        table.add_reference(1, GroupKey::Port(0), FenceHandle(1), true, 1, handler(0, 1, 1));
        table.add_reference(2, GroupKey::Port(0), FenceHandle(2), true, 1, handler(0, 2, 2));
        let stale = table.reclaim_stale(9, 8);
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].0, 1);
        assert_eq!(table.outstanding_groups(), 1);
    }

    #[test]
    fn test_error_ring_bounded() {
        let mut ring = FenceErrorRing::new(2);
        for request_id in 0..3 {
            ring.push(FenceErrorRecord {
                fence: FenceHandle(request_id + 1),
                request_id,
                port_id: 0,
                result: FenceResult::Failed,
                timestamp: Utc::now(),
            });
        }
        let records = ring.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].request_id, 1);
    }

    proptest! {
        #[test]
        fn prop_release_exactly_at_seed(seeds in proptest::collection::vec(0u32..5, 1..5)) {
            let mut table = FenceTable::new(&[1; 5]);
            let key = GroupKey::Composite(3);
            for (i, seed) in seeds.iter().enumerate() {
                table.add_reference(0, key, FenceHandle(11), i == 0, *seed, handler(i, 0, 11));
            }
            let total: u32 = seeds.iter().sum();
            let mut released = 0;
            for call in 0..total {
                match table.release_reference(0, key) {
                    ReleaseOutcome::Released { fence, owns_fence } => {
                        prop_assert_eq!(call, total - 1);
                        prop_assert_eq!(fence, FenceHandle(11));
                        prop_assert!(owns_fence);
                        released += 1;
                    }
                    ReleaseOutcome::Pending(left) => prop_assert_eq!(left, total - call - 1),
                    ReleaseOutcome::Unknown => prop_assert!(false, "entry vanished early"),
                }
            }
            if total > 0 {
                prop_assert_eq!(released, 1);
            }
        }
    }
}
