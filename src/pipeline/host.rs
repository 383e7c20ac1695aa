//! Upward interface from a node to the pipeline that owns it.
//!
//! [`PipelineHost`] is implemented by [`crate::pipeline::Pipeline`]. For
//! driving single nodes without a full pipeline (unit tests, benches) there
//! is [`StandaloneHost`], which records every notification in a
//! [`RequestLedger`].

use crate::fence::{FenceHandle, FenceResult};
use crate::pipeline::id::NodeId;
use crate::pipeline::node::Node;
use crate::sync::{lock, read, write};
use crate::types::CaptureRequest;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Calls a node makes on its pipeline.
pub trait PipelineHost: Send + Sync {
    /// Resolve a node of the same pipeline
    fn node(&self, id: NodeId) -> Option<Arc<Node>>;

    fn get_request(&self, request_id: u64) -> Option<Arc<CaptureRequest>>;

    fn notify_node_partial_metadata_done(&self, node: NodeId, request_id: u64);
    fn notify_node_metadata_done(&self, node: NodeId, request_id: u64);
    fn notify_node_request_id_done(&self, node: NodeId, request_id: u64);

    fn register_request_fence(&self, fence: FenceHandle, request_id: u64);
    fn remove_request_fence(&self, fence: FenceHandle, request_id: u64);

    fn non_sink_port_fence_signaled(&self, node: NodeId, port_id: u32, request_id: u64);
    fn non_sink_port_fence_error_signaled(
        &self,
        node: NodeId,
        port_id: u32,
        request_id: u64,
        result: FenceResult,
    );
    fn sink_port_fence_signaled(&self, node: NodeId, port_id: u32, request_id: u64, sequence_id: u32);
    fn sink_port_fence_error_signaled(
        &self,
        node: NodeId,
        port_id: u32,
        request_id: u64,
        sequence_id: u32,
        result: FenceResult,
    );

    fn request_in_error_state(&self, request_id: u64) -> bool;
    /// Pipeline-wide flush in progress
    fn flush_status(&self) -> bool;
    fn last_flushed_request_id(&self) -> Option<u64>;

    fn send_recovery_error(&self, node: NodeId, request_id: u64);
    fn notify_request_error(&self, node: NodeId, request_id: u64);
    fn release_source_input_reference(&self, node: NodeId, port_id: u32, request_id: u64);
}

/// Kinds of notification recorded by a [`RequestLedger`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum HostEvent {
    PartialMetadataDone,
    MetadataDone,
    RequestIdDone,
    NonSinkSignaled,
    NonSinkError,
    SinkSignaled,
    SinkError,
    RecoveryError,
    RequestError,
    SourceReleased,
}

/// Notification counters keyed by event, node and request, plus the set of
/// fences registered as outstanding.
#[derive(Debug, Default)]
pub struct RequestLedger {
    counts: Mutex<HashMap<(HostEvent, NodeId, u64), u32>>,
    fences: Mutex<HashMap<FenceHandle, u64>>,
}

impl RequestLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: HostEvent, node: NodeId, request_id: u64) {
        *lock(&self.counts).entry((event, node, request_id)).or_insert(0) += 1;
    }

    pub fn count(&self, event: HostEvent, node: NodeId, request_id: u64) -> u32 {
        lock(&self.counts)
            .get(&(event, node, request_id))
            .copied()
            .unwrap_or(0)
    }

    /// Sum over every node
    pub fn total(&self, event: HostEvent, request_id: u64) -> u32 {
        lock(&self.counts)
            .iter()
            .filter(|((e, _, r), _)| *e == event && *r == request_id)
            .map(|(_, n)| *n)
            .sum()
    }

    pub fn register_fence(&self, fence: FenceHandle, request_id: u64) {
        lock(&self.fences).insert(fence, request_id);
    }

    /// Returns `false` if the fence was not registered
    pub fn remove_fence(&self, fence: FenceHandle) -> bool {
        lock(&self.fences).remove(&fence).is_some()
    }

    pub fn outstanding_fences(&self, request_id: u64) -> usize {
        lock(&self.fences)
            .values()
            .filter(|r| **r == request_id)
            .count()
    }
}

/// Minimal host for nodes that run outside a [`crate::pipeline::Pipeline`].
#[derive(Default)]
pub struct StandaloneHost {
    nodes: RwLock<HashMap<NodeId, Arc<Node>>>,
    requests: RwLock<HashMap<u64, Arc<CaptureRequest>>>,
    ledger: RequestLedger,
    flushing: AtomicBool,
    last_flushed: Mutex<Option<u64>>,
    errored: Mutex<HashSet<u64>>,
}

impl StandaloneHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_node(&self, node: Arc<Node>) {
        write(&self.nodes).insert(node.id(), node);
    }

    pub fn add_request(&self, request: CaptureRequest) {
        write(&self.requests).insert(request.request_id, Arc::new(request));
    }

    pub fn ledger(&self) -> &RequestLedger {
        &self.ledger
    }

    pub fn set_flushing(&self, flushing: bool) {
        self.flushing.store(flushing, Ordering::Release);
    }

    pub fn set_last_flushed(&self, request_id: Option<u64>) {
        *lock(&self.last_flushed) = request_id;
    }

    pub fn mark_error(&self, request_id: u64) {
        lock(&self.errored).insert(request_id);
    }

    /// Drop node references so nodes can be freed
    pub fn clear(&self) {
        write(&self.nodes).clear();
    }
}

impl PipelineHost for StandaloneHost {
    fn node(&self, id: NodeId) -> Option<Arc<Node>> {
        read(&self.nodes).get(&id).cloned()
    }

    fn get_request(&self, request_id: u64) -> Option<Arc<CaptureRequest>> {
        read(&self.requests).get(&request_id).cloned()
    }

    fn notify_node_partial_metadata_done(&self, node: NodeId, request_id: u64) {
        self.ledger.record(HostEvent::PartialMetadataDone, node, request_id);
    }

    fn notify_node_metadata_done(&self, node: NodeId, request_id: u64) {
        self.ledger.record(HostEvent::MetadataDone, node, request_id);
    }

    fn notify_node_request_id_done(&self, node: NodeId, request_id: u64) {
        self.ledger.record(HostEvent::RequestIdDone, node, request_id);
    }

    fn register_request_fence(&self, fence: FenceHandle, request_id: u64) {
        self.ledger.register_fence(fence, request_id);
    }

    fn remove_request_fence(&self, fence: FenceHandle, _request_id: u64) {
        self.ledger.remove_fence(fence);
    }

    fn non_sink_port_fence_signaled(&self, node: NodeId, _port_id: u32, request_id: u64) {
        self.ledger.record(HostEvent::NonSinkSignaled, node, request_id);
    }

    fn non_sink_port_fence_error_signaled(
        &self,
        node: NodeId,
        _port_id: u32,
        request_id: u64,
        _result: FenceResult,
    ) {
        self.ledger.record(HostEvent::NonSinkError, node, request_id);
    }

    fn sink_port_fence_signaled(&self, node: NodeId, _port_id: u32, request_id: u64, _sequence_id: u32) {
        self.ledger.record(HostEvent::SinkSignaled, node, request_id);
    }

    fn sink_port_fence_error_signaled(
        &self,
        node: NodeId,
        _port_id: u32,
        request_id: u64,
        _sequence_id: u32,
        _result: FenceResult,
    ) {
        self.ledger.record(HostEvent::SinkError, node, request_id);
    }

    fn request_in_error_state(&self, request_id: u64) -> bool {
        lock(&self.errored).contains(&request_id)
    }

    fn flush_status(&self) -> bool {
        self.flushing.load(Ordering::Acquire)
    }

    fn last_flushed_request_id(&self) -> Option<u64> {
        *lock(&self.last_flushed)
    }

    fn send_recovery_error(&self, node: NodeId, request_id: u64) {
        self.ledger.record(HostEvent::RecoveryError, node, request_id);
    }

    fn notify_request_error(&self, node: NodeId, request_id: u64) {
        self.ledger.record(HostEvent::RequestError, node, request_id);
    }

    fn release_source_input_reference(&self, node: NodeId, _port_id: u32, request_id: u64) {
        self.ledger.record(HostEvent::SourceReleased, node, request_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ledger_counts() {
        let ledger = RequestLedger::new();
        ledger.record(HostEvent::MetadataDone, NodeId(0), 4);
        ledger.record(HostEvent::MetadataDone, NodeId(1), 4);
        ledger.record(HostEvent::MetadataDone, NodeId(1), 5);
        assert_eq!(ledger.count(HostEvent::MetadataDone, NodeId(1), 4), 1);
        assert_eq!(ledger.total(HostEvent::MetadataDone, 4), 2);
    }

    #[test]
    fn test_ledger_fences() {
        let ledger = RequestLedger::new();
        ledger.register_fence(FenceHandle(3), 1);
        assert_eq!(ledger.outstanding_fences(1), 1);
        assert!(ledger.remove_fence(FenceHandle(3)));
        assert!(!ledger.remove_fence(FenceHandle(3)));
    }

    #[test]
    fn test_standalone_flags() {
        let host = StandaloneHost::new();
        host.add_request(CaptureRequest::new(2, 1));
        assert!(host.get_request(2).is_some());
        host.mark_error(2);
        assert!(host.request_in_error_state(2));
        host.set_last_flushed(Some(1));
        assert_eq!(host.last_flushed_request_id(), Some(1));
    }
}
