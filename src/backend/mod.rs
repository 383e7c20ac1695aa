//! Execution substrate and hardware-facing collaborators.
//!
//! Nodes never block on hardware. Work is handed to a device channel and
//! completion arrives later through fence callbacks that run on a job pool.
//!
//! # Components
//!
//! - [`JobPool`] - worker threads running one-shot jobs ("run this callback
//!   asynchronously, once")
//! - [`DeviceChannel`] / [`SimulatedDevice`] - submission of per-request work
//!   packets and signalling of their fences
//! - [`CmdBufferManager`] - per-node pools of command buffers recycled when a
//!   request completes
//!
//! # Example
//!
//! ```ignore
//! use camnode::backend::{JobPool, SimulatedDevice};
//! use camnode::config::DeviceConfig;
//! use camnode::fence::SoftwareFences;
//!
//! let pool = Arc::new(JobPool::new("fences", 4));
//! let fences = Arc::new(SoftwareFences::with_job_pool(pool));
//! let device = SimulatedDevice::new(DeviceConfig::default(), fences)?;
//! ```

pub mod cmd_buffer;
pub mod device;
pub mod job_pool;

pub use cmd_buffer::{CmdBuffer, CmdBufferManager, CmdBufferManagerConfig};
pub use device::{DeviceChannel, DevicePacket, SimulatedDevice};
pub use job_pool::{Job, JobPool};
