//! Reference-counted image buffer handle.
//!
//! Image buffers are shared as `Arc<ImageBuffer>` but their lifetime inside
//! the pipeline is governed by an explicit reference count: the producing
//! node seeds it with one reference for itself plus one per consumer, and
//! each party releases exactly once. When the count reaches zero the owning
//! manager may hand the buffer out again.

use crate::buffer::format::ImageFormat;
use crate::buffer::manager::PoolShared;
use crate::error::{NodeError, Result};
use crate::sync::lock;
use crate::types::ExternalBuffer;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, Weak};

/// Memory currently behind a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Backing {
    /// No memory bound yet (late binding)
    Unbound,
    /// Memory allocated by the manager
    Allocated { size: usize },
    /// Client memory imported for one request
    Imported(ExternalBuffer),
}

pub struct ImageBuffer {
    id: u32,
    format: ImageFormat,
    late_binding: bool,
    ref_count: AtomicU32,
    backing: Mutex<Backing>,
    pool: Weak<PoolShared>,
}

impl ImageBuffer {
    pub(crate) fn new(id: u32, format: ImageFormat, late_binding: bool, pool: Weak<PoolShared>) -> Self {
        let backing = if late_binding {
            Backing::Unbound
        } else {
            Backing::Allocated {
                size: format.size_bytes(),
            }
        };
        Self {
            id,
            format,
            late_binding,
            ref_count: AtomicU32::new(0),
            backing: Mutex::new(backing),
            pool,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    pub fn reference_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Add `count` references, returns the new count
    pub fn add_references(&self, count: u32) -> u32 {
        self.ref_count.fetch_add(count, Ordering::AcqRel) + count
    }

    /// Drop one reference and return what is left. Releasing a buffer that
    /// holds no references is logged and leaves the count at zero.
    pub fn release_reference(&self) -> u32 {
        let previous = self
            .ref_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| count.checked_sub(1));

        match previous {
            Ok(1) => {
                self.on_last_reference();
                0
            }
            Ok(count) => count - 1,
            Err(_) => {
                tracing::error!("Image buffer {} released with no outstanding references", self.id);
                0
            }
        }
    }

    fn on_last_reference(&self) {
        {
            let mut backing = lock(&self.backing);
            match *backing {
                Backing::Imported(_) => *backing = Backing::Unbound,
                Backing::Allocated { .. } if self.late_binding => *backing = Backing::Unbound,
                _ => {}
            }
        }
        if let Some(pool) = self.pool.upgrade() {
            pool.notify_available();
        }
    }

    /// Point the buffer at client memory
    pub fn import(&self, external: &ExternalBuffer) -> Result<()> {
        let needed = self.format.size_bytes();
        if external.size < needed {
            return Err(NodeError::InvalidArg(format!(
                "external buffer {:#x} holds {} bytes, {} needs {}",
                external.handle, external.size, self.format, needed
            )));
        }
        *lock(&self.backing) = Backing::Imported(*external);
        Ok(())
    }

    /// Allocate memory if none is bound yet
    pub fn bind_backing(&self) -> Result<()> {
        let mut backing = lock(&self.backing);
        if *backing == Backing::Unbound {
            *backing = Backing::Allocated {
                size: self.format.size_bytes(),
            };
        }
        Ok(())
    }

    pub fn is_backing_bound(&self) -> bool {
        *lock(&self.backing) != Backing::Unbound
    }

    pub fn backing(&self) -> Backing {
        *lock(&self.backing)
    }
}

impl fmt::Debug for ImageBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageBuffer")
            .field("id", &self.id)
            .field("format", &self.format)
            .field("ref_count", &self.reference_count())
            .field("backing", &self.backing())
            .finish()
    }
}
