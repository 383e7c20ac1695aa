//! Device submission channel.
//!
//! Hardware nodes hand a [`DevicePacket`] to a [`DeviceChannel`]; the device
//! signals the packet's fences when the work is done. [`SimulatedDevice`]
//! stands in for real hardware: a worker thread receives packets over a
//! crossbeam channel, waits for the configured latency and signals each fence
//! with `Success`, or `Failed` for requests configured to fail.

use crate::backend::cmd_buffer::CmdBuffer;
use crate::config::DeviceConfig;
use crate::error::{NodeError, Result};
use crate::fence::{FenceHandle, FenceProvider, FenceResult};
use crate::sync::lock;
use crossbeam_channel::{unbounded, Sender};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Work submitted by one node for one request.
#[derive(Debug, Clone)]
pub struct DevicePacket {
    pub node: String,
    pub request_id: u64,
    /// Fences the device signals on completion
    pub fences: Vec<FenceHandle>,
    pub cmd_buffer: Option<CmdBuffer>,
}

/// Channel used by hardware nodes to reach the device.
pub trait DeviceChannel: Send + Sync {
    fn submit(&self, packet: DevicePacket) -> Result<()>;

    /// Drop outstanding work for `request_id`. Fences of cancelled work are
    /// not signalled by the device.
    fn cancel(&self, request_id: u64);
}

enum DeviceCommand {
    Submit(DevicePacket),
    Shutdown,
}

struct DeviceState {
    cancelled: HashSet<u64>,
    submitted: u64,
    completed: u64,
}

/// Thread-backed stand-in for a hardware device.
pub struct SimulatedDevice {
    tx: Sender<DeviceCommand>,
    state: Arc<Mutex<DeviceState>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SimulatedDevice {
    pub fn new(config: DeviceConfig, fences: Arc<dyn FenceProvider>) -> Result<Self> {
        let (tx, rx) = unbounded::<DeviceCommand>();
        let state = Arc::new(Mutex::new(DeviceState {
            cancelled: HashSet::new(),
            submitted: 0,
            completed: 0,
        }));
        let worker_state = Arc::clone(&state);
        let latency = Duration::from_millis(config.latency_ms);
        let failing: HashSet<u64> = config.failing_requests.iter().copied().collect();

        let worker = std::thread::Builder::new()
            .name("camnode-device".to_string())
            .spawn(move || {
                tracing::debug!("Simulated device started");
                for command in rx.iter() {
                    let packet = match command {
                        DeviceCommand::Submit(packet) => packet,
                        DeviceCommand::Shutdown => break,
                    };
                    if !latency.is_zero() {
                        std::thread::sleep(latency);
                    }
                    if lock(&worker_state).cancelled.contains(&packet.request_id) {
                        tracing::debug!(
                            "Device dropped cancelled work of {} for request {}",
                            packet.node,
                            packet.request_id
                        );
                        continue;
                    }
                    let result = if failing.contains(&packet.request_id) {
                        FenceResult::Failed
                    } else {
                        FenceResult::Success
                    };
                    for fence in &packet.fences {
                        if let Err(e) = fences.signal(*fence, result) {
                            // The node may already have cancelled it
                            tracing::debug!("Device could not signal {}: {}", fence, e);
                        }
                    }
                    lock(&worker_state).completed += 1;
                }
                tracing::debug!("Simulated device stopped");
            })
            .map_err(|e| NodeError::Failed(format!("failed to spawn device thread: {}", e)))?;

        Ok(Self {
            tx,
            state,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn submitted(&self) -> u64 {
        lock(&self.state).submitted
    }

    pub fn completed(&self) -> u64 {
        lock(&self.state).completed
    }

    /// Stop the worker after it drains queued packets
    pub fn shutdown(&self) {
        let _ = self.tx.send(DeviceCommand::Shutdown);
        if let Some(handle) = lock(&self.worker).take() {
            if handle.join().is_err() {
                tracing::error!("Simulated device thread panicked");
            }
        }
    }
}

impl DeviceChannel for SimulatedDevice {
    fn submit(&self, packet: DevicePacket) -> Result<()> {
        tracing::trace!(
            "Device submit from {} for request {} ({} fences)",
            packet.node,
            packet.request_id,
            packet.fences.len()
        );
        lock(&self.state).submitted += 1;
        self.tx
            .send(DeviceCommand::Submit(packet))
            .map_err(|_| NodeError::Failed("device channel closed".to_string()))
    }

    fn cancel(&self, request_id: u64) {
        lock(&self.state).cancelled.insert(request_id);
    }
}

impl Drop for SimulatedDevice {
    fn drop(&mut self) {
        self.shutdown();
    }
}
