//! Node strategies.
//!
//! Each strategy implements [`crate::pipeline::plugin::NodePlugin`] for one
//! kind of node:
//!
//! - [`HardwareNode`] - submits work to a device and lets the device signal
//!   the output fences
//! - [`SoftwareNode`] - completes its outputs inline, optionally passing a
//!   parent buffer through when bypassed

pub mod hardware;
pub mod software;

pub use hardware::HardwareNode;
pub use software::SoftwareNode;
