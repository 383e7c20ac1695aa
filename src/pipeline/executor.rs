//! Pipeline executor: request admission, per-node scheduling and completion
//! tracking.
//!
//! A submitted request goes through these steps:
//! 1. Wait until every node has a free ring slot for it.
//! 2. Set the request up on every node in topological order.
//! 3. For each node, wait on the fences of its inputs and then post
//!    `process_request` to the job pool.
//! 4. Count `request_id_done` notifications; once every node has reported,
//!    the request is complete.
//!
//! The pipeline is the [`PipelineHost`] of its nodes. Nodes reach it through
//! a `Weak` so dropping the last `Arc<Pipeline>` tears everything down.

use crate::backend::device::SimulatedDevice;
use crate::backend::job_pool::JobPool;
use crate::config::NodeSettings;
use crate::error::NodeError;
use crate::fence::{FenceHandle, FenceProvider, FenceResult, SoftwareFences};
use crate::metadata::{InMemoryMetadataPool, MetadataPool};
use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::host::{HostEvent, PipelineHost, RequestLedger};
use crate::pipeline::id::{EdgeId, NodeId};
use crate::pipeline::node::{Node, NodeStateDump};
use crate::sync::{lock, read, write};
use crate::types::CaptureRequest;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

/// Capacity of the event channel; events are dropped when nobody reads them
const EVENT_CHANNEL_CAPACITY: usize = 4096;

/// Outcomes remembered for `wait_request` after a request completes
const MAX_REMEMBERED_OUTCOMES: usize = 1024;

/// Poll interval while waiting for ring slots to free up
const ADMISSION_POLL: Duration = Duration::from_millis(2);

/// Longest a submission waits for ring slots
const ADMISSION_TIMEOUT: Duration = Duration::from_secs(5);

/// A link from an output port of one node to an input port of another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Edge {
    pub id: EdgeId,
    pub from_node: NodeId,
    pub from_port: u32,
    pub to_node: NodeId,
    pub to_input: usize,
}

/// Notifications published by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum PipelineEvent {
    RequestSubmitted {
        request_id: u64,
    },
    NodeRequestDone {
        node: NodeId,
        request_id: u64,
    },
    SinkBufferReady {
        node: NodeId,
        port_id: u32,
        request_id: u64,
        sequence_id: u32,
    },
    SinkBufferError {
        node: NodeId,
        port_id: u32,
        request_id: u64,
        sequence_id: u32,
        result: FenceResult,
    },
    RequestCompleted {
        request_id: u64,
        failed: bool,
    },
    RequestError {
        node: NodeId,
        request_id: u64,
    },
    RecoveryError {
        node: NodeId,
        request_id: u64,
    },
}

/// Final state of a request once every node has reported it done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RequestOutcome {
    pub request_id: u64,
    pub failed: bool,
}

#[derive(Debug, Default)]
struct RequestTracker {
    /// Nodes that still have to report each in-flight request
    in_flight: HashMap<u64, usize>,
    outcomes: HashMap<u64, RequestOutcome>,
    outcome_order: VecDeque<u64>,
}

impl RequestTracker {
    fn remember(&mut self, outcome: RequestOutcome) {
        self.outcomes.insert(outcome.request_id, outcome);
        self.outcome_order.push_back(outcome.request_id);
        while self.outcome_order.len() > MAX_REMEMBERED_OUTCOMES {
            if let Some(old) = self.outcome_order.pop_front() {
                self.outcomes.remove(&old);
            }
        }
    }
}

/// Input fences a node still waits on for one request.
struct DependencyCountdown {
    remaining: AtomicUsize,
    failed: AtomicBool,
}

impl DependencyCountdown {
    fn new(count: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(count),
            failed: AtomicBool::new(false),
        }
    }

    /// Returns whether any dependency failed once the last one arrives
    fn arrive(&self, result: FenceResult) -> Option<bool> {
        if !result.is_success() {
            self.failed.store(true, Ordering::Release);
        }
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            Some(self.failed.load(Ordering::Acquire))
        } else {
            None
        }
    }
}

/// Everything the builder hands over to a new pipeline.
pub(crate) struct PipelineParts {
    pub name: String,
    pub settings: Arc<NodeSettings>,
    pub nodes: Vec<Arc<Node>>,
    pub edges: Vec<Edge>,
    pub execution_order: Vec<usize>,
    pub fences: Arc<SoftwareFences>,
    pub metadata: Arc<InMemoryMetadataPool>,
    pub job_pool: Arc<JobPool>,
    pub device: Option<Arc<SimulatedDevice>>,
}

/// Postmortem snapshot of a whole pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineDump {
    pub name: String,
    pub in_flight: Vec<u64>,
    pub errored: Vec<u64>,
    pub last_flushed_request_id: Option<u64>,
    pub live_fences: usize,
    pub nodes: Vec<NodeStateDump>,
}

/// The pipeline graph and request driver.
pub struct Pipeline {
    name: String,
    weak_self: Weak<Pipeline>,
    settings: Arc<NodeSettings>,
    nodes: Vec<Arc<Node>>,
    names: HashMap<String, NodeId>,
    edges: Vec<Edge>,
    /// Topological order (indices into `nodes`)
    execution_order: Vec<usize>,

    fences: Arc<SoftwareFences>,
    metadata: Arc<InMemoryMetadataPool>,
    job_pool: Arc<JobPool>,
    device: Option<Arc<SimulatedDevice>>,

    requests: RwLock<HashMap<u64, Arc<CaptureRequest>>>,
    ledger: RequestLedger,
    tracker: Mutex<RequestTracker>,
    progress: Condvar,
    errored: Mutex<HashSet<u64>>,
    flushing: AtomicBool,
    last_flushed: Mutex<Option<u64>>,
    finalized: AtomicBool,
    destroyed: AtomicBool,

    event_tx: Sender<PipelineEvent>,
    event_rx: Receiver<PipelineEvent>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    pub(crate) fn new(parts: PipelineParts) -> Arc<Self> {
        let (event_tx, event_rx) = bounded(EVENT_CHANNEL_CAPACITY);
        let names = parts
            .nodes
            .iter()
            .map(|n| (n.name().to_string(), n.id()))
            .collect();

        Arc::new_cyclic(|weak_self: &Weak<Pipeline>| {
            let host: Weak<dyn PipelineHost> = weak_self.clone();
            for node in &parts.nodes {
                if let Err(e) = node.attach_host(host.clone()) {
                    tracing::error!("Node {} already has a host: {}", node.name(), e);
                }
            }
            Pipeline {
                name: parts.name,
                weak_self: weak_self.clone(),
                settings: parts.settings,
                nodes: parts.nodes,
                names,
                edges: parts.edges,
                execution_order: parts.execution_order,
                fences: parts.fences,
                metadata: parts.metadata,
                job_pool: parts.job_pool,
                device: parts.device,
                requests: RwLock::new(HashMap::new()),
                ledger: RequestLedger::new(),
                tracker: Mutex::new(RequestTracker::default()),
                progress: Condvar::new(),
                errored: Mutex::new(HashSet::new()),
                flushing: AtomicBool::new(false),
                last_flushed: Mutex::new(None),
                finalized: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
                event_tx,
                event_rx,
            }
        })
    }

    // ── Accessors ──

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    pub fn node_by_name(&self, name: &str) -> Option<&Arc<Node>> {
        self.names.get(name).and_then(|id| self.nodes.get(id.index()))
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn execution_order(&self) -> &[usize] {
        &self.execution_order
    }

    pub fn settings(&self) -> &NodeSettings {
        &self.settings
    }

    pub fn fences(&self) -> &Arc<SoftwareFences> {
        &self.fences
    }

    pub fn metadata(&self) -> &Arc<InMemoryMetadataPool> {
        &self.metadata
    }

    pub fn device(&self) -> Option<&Arc<SimulatedDevice>> {
        self.device.as_ref()
    }

    pub fn ledger(&self) -> &RequestLedger {
        &self.ledger
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }

    /// Receiver of pipeline events. All clones share one queue.
    pub fn events(&self) -> Receiver<PipelineEvent> {
        self.event_rx.clone()
    }

    pub fn in_flight_requests(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = lock(&self.tracker).in_flight.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn emit(&self, event: PipelineEvent) {
        match self.event_tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                tracing::trace!("Event channel full, dropping {:?}", event);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    // ── Lifecycle ──

    /// Finish node initialization, negotiate buffers from the sinks back to
    /// the sources and bring the buffer managers up.
    pub fn finalize(&self) -> PipelineResult<()> {
        if self.is_finalized() {
            return Ok(());
        }

        for node in &self.nodes {
            node.finalize_initialization()
                .map_err(|e| PipelineError::node(node.id(), e))?;
        }

        for &index in self.execution_order.iter().rev() {
            let node = &self.nodes[index];
            node.trigger_buffer_negotiation()
                .map_err(|e| PipelineError::node(node.id(), e))?;
        }
        if let Some(node) = self.nodes.iter().find(|n| !n.is_negotiation_complete()) {
            return Err(PipelineError::node(
                node.id(),
                NodeError::InvalidState(format!(
                    "buffer negotiation of {} did not complete",
                    node.name()
                )),
            ));
        }

        for &index in &self.execution_order {
            let node = &self.nodes[index];
            node.finalize_buffer_properties()
                .and_then(|_| node.check_source_port_buffer_requirements())
                .and_then(|_| node.activate_image_buffers())
                .map_err(|e| PipelineError::node(node.id(), e))?;
        }

        self.finalized.store(true, Ordering::Release);
        tracing::info!(
            "Pipeline '{}' finalized with {} nodes and {} links",
            self.name,
            self.nodes.len(),
            self.edges.len()
        );
        Ok(())
    }

    /// Flush everything in flight and tear the nodes down. Safe to call
    /// more than once.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.flush_all() {
            tracing::warn!("Flush during teardown of '{}' failed: {}", self.name, e);
        }
        if !self.job_pool.wait_idle(Duration::from_secs(1)) {
            tracing::warn!(
                "Pipeline '{}' torn down with {} jobs pending",
                self.name,
                self.job_pool.pending()
            );
        }
        if let Some(device) = &self.device {
            device.shutdown();
        }
        let partial = self.settings.partial_buffer_release_on_deactivate;
        for node in &self.nodes {
            node.deactivate_image_buffers(partial);
            node.destroy();
        }
        self.finalized.store(false, Ordering::Release);
        self.progress.notify_all();
        tracing::info!("Pipeline '{}' destroyed", self.name);
    }

    // ── Requests ──

    /// Admit a request, set it up on every node and schedule processing.
    pub fn submit_request(&self, request: CaptureRequest) -> PipelineResult<()> {
        if !self.is_finalized() || self.destroyed.load(Ordering::Acquire) {
            return Err(PipelineError::NotFinalized);
        }
        let request_id = request.request_id;

        {
            let tracker = lock(&self.tracker);
            if tracker.in_flight.contains_key(&request_id) {
                return Err(NodeError::InvalidArg(format!(
                    "request {} is already in flight",
                    request_id
                ))
                .into());
            }
        }
        self.wait_for_slots(request_id)?;

        write(&self.requests).insert(request_id, Arc::new(request));
        {
            let mut tracker = lock(&self.tracker);
            tracker.outcomes.remove(&request_id);
            tracker.in_flight.insert(request_id, self.nodes.len());
        }
        self.metadata
            .reset_slot((request_id % self.settings.max_request_queue_depth as u64) as usize);
        self.emit(PipelineEvent::RequestSubmitted { request_id });
        tracing::debug!("Pipeline '{}' admitted request {}", self.name, request_id);

        for &index in &self.execution_order {
            let node = &self.nodes[index];
            if let Err(e) = node.setup_request(request_id) {
                self.abort_request(request_id);
                return Err(PipelineError::node(node.id(), e));
            }
        }

        for &index in &self.execution_order {
            self.schedule_process(&self.nodes[index], request_id);
        }
        Ok(())
    }

    /// Block until every node can take `request_id` into its ring.
    fn wait_for_slots(&self, request_id: u64) -> PipelineResult<()> {
        let deadline = Instant::now() + ADMISSION_TIMEOUT;
        let mut tracker = lock(&self.tracker);
        loop {
            let blocked = self.nodes.iter().find(|n| !n.is_slot_available(request_id));
            let Some(node) = blocked else {
                return Ok(());
            };
            let now = Instant::now();
            if now >= deadline || self.destroyed.load(Ordering::Acquire) {
                return Err(PipelineError::node(
                    node.id(),
                    NodeError::Resource(format!(
                        "no free slot in {} for request {}",
                        node.name(),
                        request_id
                    )),
                ));
            }
            tracker = match self.progress.wait_timeout(tracker, ADMISSION_POLL.min(deadline - now)) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Setup failed part way: flush what was set up and stop waiting for
    /// nodes that never saw the request.
    fn abort_request(&self, request_id: u64) {
        lock(&self.errored).insert(request_id);
        let silent = self
            .nodes
            .iter()
            .filter(|n| n.request_status(request_id).is_none())
            .count();
        for &index in &self.execution_order {
            let node = &self.nodes[index];
            if node.request_status(request_id).is_none() {
                continue;
            }
            if let Err(e) = node.flush(request_id) {
                tracing::warn!("Flush of {} in {} failed: {}", request_id, node.name(), e);
            }
        }
        self.settle_nodes(request_id, silent);
    }

    /// Wait for the input fences of a node, then post its processing.
    fn schedule_process(&self, node: &Arc<Node>, request_id: u64) {
        if !node.is_enabled_for_request(request_id) || node.is_request_complete(request_id) {
            return;
        }
        let fences = node.input_fences(request_id);
        if fences.is_empty() {
            self.dispatch_process(node, request_id, false);
            return;
        }

        let countdown = Arc::new(DependencyCountdown::new(fences.len()));
        for fence in fences {
            let pipeline = self.weak_self.clone();
            let weak_node = Arc::downgrade(node);
            let waiter = Arc::clone(&countdown);
            let callback = Box::new(move |_fence: FenceHandle, result: FenceResult| {
                let Some(failed) = waiter.arrive(result) else {
                    return;
                };
                if let (Some(pipeline), Some(node)) = (pipeline.upgrade(), weak_node.upgrade()) {
                    pipeline.dispatch_process(&node, request_id, failed);
                }
            });
            if let Err(e) = self.fences.async_wait(fence, callback) {
                tracing::error!(
                    "{} cannot wait on input fence {} of request {}: {}",
                    node.name(),
                    fence,
                    request_id,
                    e
                );
                if let Some(failed) = countdown.arrive(FenceResult::Failed) {
                    self.dispatch_process(node, request_id, failed);
                }
            }
        }
    }

    fn dispatch_process(&self, node: &Arc<Node>, request_id: u64, failed_dependency: bool) {
        if failed_dependency {
            tracing::debug!(
                "Input of {} failed for request {}, flushing",
                node.name(),
                request_id
            );
            lock(&self.errored).insert(request_id);
            if let Err(e) = node.flush(request_id) {
                tracing::warn!("Flush of {} in {} failed: {}", request_id, node.name(), e);
            }
            return;
        }

        let job_node = Arc::clone(node);
        let job = Box::new(move || {
            if let Err(e) = job_node.process_request(request_id, 0) {
                tracing::warn!("{} failed request {}: {}", job_node.name(), request_id, e);
            }
        });
        if let Err(job) = self.job_pool.post(job) {
            tracing::debug!("Job pool unavailable, processing {} inline", request_id);
            job();
        }
    }

    /// Cancel one request on every node.
    pub fn flush_request(&self, request_id: u64) -> PipelineResult<()> {
        {
            let tracker = lock(&self.tracker);
            if !tracker.in_flight.contains_key(&request_id) {
                if tracker.outcomes.contains_key(&request_id) {
                    return Ok(());
                }
                return Err(PipelineError::UnknownRequest(request_id));
            }
        }
        lock(&self.errored).insert(request_id);
        {
            let mut last = lock(&self.last_flushed);
            *last = Some(last.map_or(request_id, |l| l.max(request_id)));
        }
        tracing::info!("Pipeline '{}' flushing request {}", self.name, request_id);

        for &index in &self.execution_order {
            let node = &self.nodes[index];
            node.flush(request_id)
                .map_err(|e| PipelineError::node(node.id(), e))?;
        }
        Ok(())
    }

    /// Cancel every request in flight.
    pub fn flush_all(&self) -> PipelineResult<()> {
        self.flushing.store(true, Ordering::Release);
        let result = self
            .in_flight_requests()
            .into_iter()
            .try_for_each(|request_id| match self.flush_request(request_id) {
                Err(PipelineError::UnknownRequest(_)) => Ok(()),
                other => other,
            });
        self.flushing.store(false, Ordering::Release);
        result
    }

    /// Wait for a request to complete on every node.
    pub fn wait_request(&self, request_id: u64, timeout: Duration) -> PipelineResult<RequestOutcome> {
        let deadline = Instant::now() + timeout;
        let mut tracker = lock(&self.tracker);
        loop {
            if let Some(outcome) = tracker.outcomes.get(&request_id) {
                return Ok(*outcome);
            }
            if !tracker.in_flight.contains_key(&request_id) {
                return Err(PipelineError::UnknownRequest(request_id));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(PipelineError::Timeout(request_id));
            }
            tracker = match self.progress.wait_timeout(tracker, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Wait until nothing is in flight. Returns `true` when idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut tracker = lock(&self.tracker);
        while !tracker.in_flight.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            tracker = match self.progress.wait_timeout(tracker, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }

    /// `count` nodes are done with `request_id`.
    fn settle_nodes(&self, request_id: u64, count: usize) {
        if count == 0 {
            return;
        }
        let completed = {
            let mut tracker = lock(&self.tracker);
            let Some(remaining) = tracker.in_flight.get_mut(&request_id) else {
                return;
            };
            *remaining = remaining.saturating_sub(count);
            if *remaining > 0 {
                None
            } else {
                tracker.in_flight.remove(&request_id);
                let failed = lock(&self.errored).remove(&request_id);
                let outcome = RequestOutcome { request_id, failed };
                tracker.remember(outcome);
                Some(outcome)
            }
        };
        self.progress.notify_all();

        if let Some(outcome) = completed {
            write(&self.requests).remove(&request_id);
            if outcome.failed {
                tracing::warn!("Request {} completed with errors", request_id);
            } else {
                tracing::debug!("Request {} completed", request_id);
            }
            self.emit(PipelineEvent::RequestCompleted {
                request_id,
                failed: outcome.failed,
            });
        }
    }

    // ── Diagnostics ──

    pub fn dump(&self) -> PipelineDump {
        let mut errored: Vec<u64> = lock(&self.errored).iter().copied().collect();
        errored.sort_unstable();
        PipelineDump {
            name: self.name.clone(),
            in_flight: self.in_flight_requests(),
            errored,
            last_flushed_request_id: *lock(&self.last_flushed),
            live_fences: self.fences.live_fences(),
            nodes: self.nodes.iter().map(|n| n.dump_state()).collect(),
        }
    }

    pub fn dump_json(&self) -> PipelineResult<String> {
        serde_json::to_string_pretty(&self.dump())
            .map_err(|e| NodeError::Failed(format!("failed to serialize pipeline dump: {}", e)).into())
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl PipelineHost for Pipeline {
    fn node(&self, id: NodeId) -> Option<Arc<Node>> {
        self.nodes.get(id.index()).cloned()
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
        self.emit(PipelineEvent::NodeRequestDone { node, request_id });
        self.settle_nodes(request_id, 1);
    }

    fn register_request_fence(&self, fence: FenceHandle, request_id: u64) {
        self.ledger.register_fence(fence, request_id);
    }

    fn remove_request_fence(&self, fence: FenceHandle, request_id: u64) {
        if !self.ledger.remove_fence(fence) {
            tracing::trace!("Fence {} of request {} was not registered", fence, request_id);
        }
    }

    fn non_sink_port_fence_signaled(&self, node: NodeId, _port_id: u32, request_id: u64) {
        self.ledger.record(HostEvent::NonSinkSignaled, node, request_id);
    }

    fn non_sink_port_fence_error_signaled(
        &self,
        node: NodeId,
        port_id: u32,
        request_id: u64,
        result: FenceResult,
    ) {
        self.ledger.record(HostEvent::NonSinkError, node, request_id);
        if result == FenceResult::Failed {
            tracing::warn!("{} port {} failed request {}", node, port_id, request_id);
            lock(&self.errored).insert(request_id);
        }
    }

    fn sink_port_fence_signaled(&self, node: NodeId, port_id: u32, request_id: u64, sequence_id: u32) {
        self.ledger.record(HostEvent::SinkSignaled, node, request_id);
        self.emit(PipelineEvent::SinkBufferReady {
            node,
            port_id,
            request_id,
            sequence_id,
        });
    }

    fn sink_port_fence_error_signaled(
        &self,
        node: NodeId,
        port_id: u32,
        request_id: u64,
        sequence_id: u32,
        result: FenceResult,
    ) {
        self.ledger.record(HostEvent::SinkError, node, request_id);
        lock(&self.errored).insert(request_id);
        self.emit(PipelineEvent::SinkBufferError {
            node,
            port_id,
            request_id,
            sequence_id,
            result,
        });
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
        tracing::error!("Realtime node {} needs recovery after request {}", node, request_id);
        self.emit(PipelineEvent::RecoveryError { node, request_id });
    }

    fn notify_request_error(&self, node: NodeId, request_id: u64) {
        self.ledger.record(HostEvent::RequestError, node, request_id);
        lock(&self.errored).insert(request_id);
        self.emit(PipelineEvent::RequestError { node, request_id });
    }

    fn release_source_input_reference(&self, node: NodeId, _port_id: u32, request_id: u64) {
        self.ledger.record(HostEvent::SourceReleased, node, request_id);
    }
}

// ── Topological sort (Kahn's algorithm) ──

/// Order `node_count` nodes so every parent comes before its children.
/// Self links (loopback) do not constrain the order.
pub fn execution_order(node_count: usize, edges: &[Edge]) -> PipelineResult<Vec<usize>> {
    let n = node_count;
    let mut in_degree = vec![0u32; n];
    let mut adj: Vec<Vec<usize>> = vec![Vec::new(); n];

    for edge in edges {
        let from = edge.from_node.index();
        let to = edge.to_node.index();
        if from == to {
            continue;
        }
        if from >= n || to >= n {
            return Err(PipelineError::InvalidEdge(format!(
                "{:?} -> {:?} references a missing node",
                edge.from_node, edge.to_node
            )));
        }
        adj[from].push(to);
        in_degree[to] += 1;
    }

    // Lowest index first keeps the order stable across runs
    let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);

    while let Some(node) = queue.pop_front() {
        order.push(node);
        for &next in &adj[node] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push_back(next);
            }
        }
    }

    if order.len() != n {
        tracing::warn!(
            "Pipeline graph has a cycle! Only {} of {} nodes scheduled.",
            order.len(),
            n
        );
        return Err(PipelineError::CycleDetected);
    }
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(id: u32, from: u32, to: u32) -> Edge {
        Edge {
            id: EdgeId(id),
            from_node: NodeId(from),
            from_port: 0,
            to_node: NodeId(to),
            to_input: 0,
        }
    }

    #[test]
    fn test_topological_sort_linear() {
        // A → B → C, declared out of order
        let edges = vec![edge(0, 1, 2), edge(1, 0, 1)];
        let order = execution_order(3, &edges).unwrap();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn test_topological_sort_diamond() {
        // Diamond: A → B, A → C, B → D, C → D
        let edges = vec![edge(0, 0, 1), edge(1, 0, 2), edge(2, 1, 3), edge(3, 2, 3)];
        let order = execution_order(4, &edges).unwrap();
        assert_eq!(order.len(), 4);

        let pos = |nid: u32| order.iter().position(|&x| x == nid as usize).unwrap();
        assert!(pos(0) < pos(1));
        assert!(pos(0) < pos(2));
        assert!(pos(1) < pos(3));
        assert!(pos(2) < pos(3));
    }

    #[test]
    fn test_self_link_ignored() {
        let edges = vec![edge(0, 0, 1), edge(1, 1, 1)];
        assert_eq!(execution_order(2, &edges).unwrap(), vec![0, 1]);
    }

    #[test]
    fn test_cycle_detected() {
        let edges = vec![edge(0, 0, 1), edge(1, 1, 2), edge(2, 2, 0)];
        assert!(matches!(
            execution_order(3, &edges),
            Err(PipelineError::CycleDetected)
        ));
    }

    #[test]
    fn test_missing_node_rejected() {
        let edges = vec![edge(0, 0, 5)];
        assert!(matches!(
            execution_order(2, &edges),
            Err(PipelineError::InvalidEdge(_))
        ));
    }

    #[test]
    fn test_dependency_countdown() {
        let countdown = DependencyCountdown::new(2);
        assert_eq!(countdown.arrive(FenceResult::Canceled), None);
        assert_eq!(countdown.arrive(FenceResult::Success), Some(true));

        let countdown = DependencyCountdown::new(1);
        assert_eq!(countdown.arrive(FenceResult::Success), Some(false));
    }
}
