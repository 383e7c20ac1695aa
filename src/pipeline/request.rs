//! Per-request slot ring.
//!
//! Every node keeps a fixed ring of [`RequestSlot`]s indexed by
//! `request_id % depth`. A slot may only be reused once the request that
//! occupies it has completed; [`RequestRing::begin`] rejects a request whose
//! slot is still held by an unresolved one. Each reuse bumps the slot's
//! generation so late callbacks from an older occupant can be recognised and
//! dropped.

use crate::buffer::image_buffer::ImageBuffer;
use crate::error::{NodeError, Result};
use crate::fence::FenceHandle;
use crate::pipeline::id::NodeId;
use crate::sync::lock;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

const NO_REQUEST: u64 = u64::MAX;

/// Request state as seen by one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum PerRequestNodeStatus {
    Uninitialized = 0,
    Setup = 1,
    Deferred = 2,
    Running = 3,
    Error = 4,
    Cancelled = 5,
    Success = 6,
    Submit = 7,
}

impl PerRequestNodeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PerRequestNodeStatus::Uninitialized => "Uninitialized",
            PerRequestNodeStatus::Setup => "Setup",
            PerRequestNodeStatus::Deferred => "Deferred",
            PerRequestNodeStatus::Running => "Running",
            PerRequestNodeStatus::Error => "Error",
            PerRequestNodeStatus::Cancelled => "Cancelled",
            PerRequestNodeStatus::Success => "Success",
            PerRequestNodeStatus::Submit => "Submit",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => PerRequestNodeStatus::Setup,
            2 => PerRequestNodeStatus::Deferred,
            3 => PerRequestNodeStatus::Running,
            4 => PerRequestNodeStatus::Error,
            5 => PerRequestNodeStatus::Cancelled,
            6 => PerRequestNodeStatus::Success,
            7 => PerRequestNodeStatus::Submit,
            _ => PerRequestNodeStatus::Uninitialized,
        }
    }

    /// Error and cancellation are sticky until the slot is reused
    pub fn is_failed(self) -> bool {
        matches!(self, PerRequestNodeStatus::Error | PerRequestNodeStatus::Cancelled)
    }
}

impl fmt::Display for PerRequestNodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Points in a request's processing where a timestamp is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NodeStage {
    Start = 0,
    DependenciesMet = 1,
    EPReqEnd = 2,
    End = 3,
}

const STAGE_COUNT: usize = 4;

/// Run-once flag. Exactly one caller of [`Latch::fire`] wins.
#[derive(Debug, Default)]
pub struct Latch(AtomicU8);

impl Latch {
    const PENDING: u8 = 0;
    const DONE: u8 = 1;

    pub const fn new() -> Self {
        Self(AtomicU8::new(Self::PENDING))
    }

    /// Transition Pending -> Done. Returns `true` for the caller that made
    /// the transition.
    pub fn fire(&self) -> bool {
        self.0
            .compare_exchange(Self::PENDING, Self::DONE, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_done(&self) -> bool {
        self.0.load(Ordering::Acquire) == Self::DONE
    }

    pub(crate) fn reset(&self) {
        self.0.store(Self::PENDING, Ordering::Release);
    }
}

/// A parent reference that must be dropped when the request completes.
#[derive(Debug, Clone)]
pub enum ParentRelease {
    /// Output buffer of another node (or of this node for loopback ports)
    Linked {
        parent: NodeId,
        output_index: usize,
        request_id: u64,
    },
    /// Client buffer imported into a source port
    Source {
        input_index: usize,
        port_id: u32,
        buffer: Arc<ImageBuffer>,
        fence: FenceHandle,
        /// Fence created by this node rather than supplied by the client
        private_fence: bool,
    },
}

/// Buffers and fence an input port reads for one request.
#[derive(Debug, Clone)]
pub struct InputBinding {
    pub input_index: usize,
    pub port_id: u32,
    /// Fence the port waits on before the node may process
    pub fence: FenceHandle,
    pub buffers: Vec<Arc<ImageBuffer>>,
    pub is_loopback: bool,
    pub is_source: bool,
    /// Parent request actually read, after the buffer delta is applied
    pub parent_request_id: u64,
}

/// Mutable bookkeeping of a slot, guarded by the slot mutex.
#[derive(Debug, Default)]
pub struct SlotState {
    pub node_enabled: bool,
    pub active_inputs: Vec<usize>,
    pub active_outputs: Vec<usize>,
    pub inputs: Vec<InputBinding>,
    pub parent_releases: Vec<ParentRelease>,
    /// Outputs whose own reference is dropped at request completion
    pub held_outputs: Vec<usize>,
    /// Fence handlers created for this request (primary and delayed)
    pub fence_count: u32,
    /// Set by the caller that performs the completion releases
    pub completing: bool,
    timings: Vec<[Option<DateTime<Utc>>; STAGE_COUNT]>,
}

impl SlotState {
    pub fn stage_time(&self, sequence_id: u32, stage: NodeStage) -> Option<DateTime<Utc>> {
        self.timings
            .get(sequence_id as usize)
            .and_then(|stages| stages[stage as usize])
    }
}

pub struct RequestSlot {
    request_id: AtomicU64,
    generation: AtomicU64,
    status: AtomicU8,
    num_unsignaled_fences: AtomicU32,
    num_unprocessed_fences: AtomicU32,
    pub partial_metadata_complete: Latch,
    pub metadata_complete: Latch,
    pub request_complete: Latch,
    state: Mutex<SlotState>,
}

impl RequestSlot {
    fn new() -> Self {
        Self {
            request_id: AtomicU64::new(NO_REQUEST),
            generation: AtomicU64::new(0),
            status: AtomicU8::new(PerRequestNodeStatus::Uninitialized as u8),
            num_unsignaled_fences: AtomicU32::new(0),
            num_unprocessed_fences: AtomicU32::new(0),
            partial_metadata_complete: Latch::new(),
            metadata_complete: Latch::new(),
            request_complete: Latch::new(),
            state: Mutex::new(SlotState::default()),
        }
    }

    pub fn request_id(&self) -> Option<u64> {
        match self.request_id.load(Ordering::Acquire) {
            NO_REQUEST => None,
            id => Some(id),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn status(&self) -> PerRequestNodeStatus {
        PerRequestNodeStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn set_status(&self, status: PerRequestNodeStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// Move from `from` to `to` only if the slot is still in `from`
    pub fn transition(&self, from: PerRequestNodeStatus, to: PerRequestNodeStatus) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Mark completion unless the request already failed
    pub fn mark_success(&self) {
        let _ = self
            .status
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if PerRequestNodeStatus::from_u8(current).is_failed() {
                    None
                } else {
                    Some(PerRequestNodeStatus::Success as u8)
                }
            });
    }

    /// Account for one more outstanding fence
    pub fn add_fence(&self) {
        self.num_unsignaled_fences.fetch_add(1, Ordering::AcqRel);
        self.num_unprocessed_fences.fetch_add(1, Ordering::AcqRel);
    }

    pub fn num_unsignaled_fences(&self) -> u32 {
        self.num_unsignaled_fences.load(Ordering::Acquire)
    }

    pub fn num_unprocessed_fences(&self) -> u32 {
        self.num_unprocessed_fences.load(Ordering::Acquire)
    }

    pub fn decrement_unsignaled(&self) -> Option<u32> {
        decrement(&self.num_unsignaled_fences, "unsignaled", self.request_id())
    }

    /// Returns the remaining count, or `None` if the counter was already
    /// zero (logged, never fatal)
    pub fn decrement_unprocessed(&self) -> Option<u32> {
        decrement(&self.num_unprocessed_fences, "unprocessed", self.request_id())
    }

    pub fn state(&self) -> MutexGuard<'_, SlotState> {
        lock(&self.state)
    }

    /// Record `stage` for `sequence_id` unless it is beyond `max_sequence_id`
    pub fn record_stage(&self, sequence_id: u32, stage: NodeStage, max_sequence_id: u32) {
        if sequence_id >= max_sequence_id {
            return;
        }
        let mut state = self.state();
        let index = sequence_id as usize;
        if state.timings.len() <= index {
            state.timings.resize(index + 1, [None; STAGE_COUNT]);
        }
        state.timings[index][stage as usize] = Some(Utc::now());
    }

    fn reset(&self, request_id: u64) {
        *self.state() = SlotState::default();
        self.num_unsignaled_fences.store(0, Ordering::Release);
        self.num_unprocessed_fences.store(0, Ordering::Release);
        self.partial_metadata_complete.reset();
        self.metadata_complete.reset();
        self.request_complete.reset();
        self.set_status(PerRequestNodeStatus::Setup);
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.request_id.store(request_id, Ordering::Release);
    }
}

fn decrement(counter: &AtomicU32, what: &str, request_id: Option<u64>) -> Option<u32> {
    match counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1)) {
        Ok(previous) => Some(previous - 1),
        Err(_) => {
            tracing::error!(
                "Accounting underflow: {} fence count already zero for request {:?}",
                what,
                request_id
            );
            None
        }
    }
}

/// Fixed-capacity ring of request slots.
pub struct RequestRing {
    slots: Box<[RequestSlot]>,
}

impl RequestRing {
    pub fn new(depth: usize) -> Self {
        let slots = (0..depth.max(1)).map(|_| RequestSlot::new()).collect();
        Self { slots }
    }

    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    pub fn slot_index(&self, request_id: u64) -> usize {
        (request_id % self.slots.len() as u64) as usize
    }

    /// Slot that `request_id` maps to, whoever occupies it
    pub fn slot_at(&self, request_id: u64) -> &RequestSlot {
        &self.slots[self.slot_index(request_id)]
    }

    /// Slot currently owned by `request_id`
    pub fn lookup(&self, request_id: u64) -> Option<&RequestSlot> {
        let slot = self.slot_at(request_id);
        (slot.request_id() == Some(request_id)).then_some(slot)
    }

    /// Claim the slot for `request_id`, clearing the previous occupant.
    pub fn begin(&self, request_id: u64) -> Result<&RequestSlot> {
        let slot = self.slot_at(request_id);
        if let Some(occupant) = slot.request_id() {
            if !slot.request_complete.is_done() {
                if occupant == request_id {
                    return Err(NodeError::InvalidState(format!(
                        "request {} is already set up",
                        request_id
                    )));
                }
                return Err(NodeError::Resource(format!(
                    "slot {} still held by unresolved request {}",
                    self.slot_index(request_id),
                    occupant
                )));
            }
        }
        slot.reset(request_id);
        Ok(slot)
    }

    /// Requests that occupy a slot and have not completed
    pub fn unresolved(&self) -> Vec<u64> {
        self.slots
            .iter()
            .filter(|slot| !slot.request_complete.is_done())
            .filter_map(|slot| slot.request_id())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RequestSlot> {
        self.slots.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn test_latch_fires_once() {
        let latch = Latch::new();
        assert!(latch.fire());
        assert!(!latch.fire());
        assert!(latch.is_done());
    }

    #[test]
    fn test_latch_concurrent_single_winner() {
        let latch = Arc::new(Latch::new());
        let winners: u32 = (0..8)
            .map(|_| {
                let latch = Arc::clone(&latch);
                std::thread::spawn(move || latch.fire() as u32)
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .sum();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_begin_rejects_unresolved_collision() {
        let ring = RequestRing::new(4);
        ring.begin(1).unwrap();
        let err = ring.begin(5).err().unwrap();
        assert!(err.is_retryable());
        ring.slot_at(1).request_complete.fire();
        let slot = ring.begin(5).unwrap();
        assert_eq!(slot.request_id(), Some(5));
        assert!(ring.lookup(1).is_none());
    }

    #[test]
    fn test_begin_same_request_twice() {
        let ring = RequestRing::new(4);
        ring.begin(2).unwrap();
        assert!(matches!(ring.begin(2), Err(NodeError::InvalidState(_))));
    }

    #[test]
    fn test_generation_bumps_on_reuse() {
        let ring = RequestRing::new(2);
        let first = ring.begin(0).unwrap().generation();
        ring.slot_at(0).request_complete.fire();
        let second = ring.begin(2).unwrap().generation();
        assert_eq!(second, first + 1);
    }

    #[test]
    fn test_reset_clears_counters_and_latches() {
        let ring = RequestRing::new(2);
        let slot = ring.begin(0).unwrap();
        slot.add_fence();
        slot.metadata_complete.fire();
        slot.request_complete.fire();
        let slot = ring.begin(2).unwrap();
        assert_eq!(slot.num_unprocessed_fences(), 0);
        assert!(!slot.metadata_complete.is_done());
        assert_eq!(slot.status(), PerRequestNodeStatus::Setup);
    }

    #[test]
    fn test_decrement_underflow_guarded() {
        let ring = RequestRing::new(2);
        let slot = ring.begin(0).unwrap();
        slot.add_fence();
        assert_eq!(slot.decrement_unprocessed(), Some(0));
        assert_eq!(slot.decrement_unprocessed(), None);
        assert_eq!(slot.num_unprocessed_fences(), 0);
    }

    #[test]
    fn test_mark_success_keeps_failure() {
        let ring = RequestRing::new(2);
        let slot = ring.begin(0).unwrap();
        slot.set_status(PerRequestNodeStatus::Cancelled);
        slot.mark_success();
        assert_eq!(slot.status(), PerRequestNodeStatus::Cancelled);
        slot.set_status(PerRequestNodeStatus::Submit);
        slot.mark_success();
        assert_eq!(slot.status(), PerRequestNodeStatus::Success);
    }

    #[test]
    fn test_stage_timing_limit() {
        let ring = RequestRing::new(2);
        let slot = ring.begin(0).unwrap();
        slot.record_stage(0, NodeStage::Start, 2);
        slot.record_stage(5, NodeStage::Start, 2);
        let state = slot.state();
        assert!(state.stage_time(0, NodeStage::Start).is_some());
        assert!(state.stage_time(5, NodeStage::Start).is_none());
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(PerRequestNodeStatus::Submit.as_str(), "Submit");
        assert_eq!(PerRequestNodeStatus::Cancelled.to_string(), "Cancelled");
    }

    proptest! {
        #[test]
        fn prop_unresolved_never_exceeds_depth(
            depth in 2usize..10,
            ops in proptest::collection::vec((0u64..40, any::<bool>()), 1..80),
        ) {
            let ring = RequestRing::new(depth);
            for (request_id, complete) in ops {
                let _ = ring.begin(request_id);
                if complete {
                    if let Some(slot) = ring.lookup(request_id) {
                        slot.request_complete.fire();
                    }
                }
                prop_assert!(ring.unresolved().len() <= depth);
                let unresolved: HashSet<usize> =
                    ring.unresolved().iter().map(|r| ring.slot_index(*r)).collect();
                prop_assert_eq!(unresolved.len(), ring.unresolved().len());
            }
        }
    }
}
