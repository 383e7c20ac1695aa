//! Image buffers and the pools that recycle them.
//!
//! - [`format`] - pixel formats and negotiated buffer properties
//! - [`image_buffer`] - reference-counted buffer handle with late binding
//! - [`manager`] - per-port pool with free/busy lists

pub mod format;
pub mod image_buffer;
pub mod manager;

pub use format::{BufferHeap, BufferProperties, Format, ImageFormat};
pub use image_buffer::{Backing, ImageBuffer};
pub use manager::{ImageBufferManager, ImageBufferManagerConfig, ImageBufferManagerStats};
