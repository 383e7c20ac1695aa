//! Pool of image buffers for one output port.
//!
//! Buffers move between a free list and a busy list. A busy buffer whose
//! reference count has dropped to zero is reclaimed lazily the next time a
//! caller asks for a buffer.
//!
//! # Acquisition order
//!
//! 1. Pop the head of the free list.
//! 2. Move every unreferenced busy buffer back to the free list and retry.
//! 3. Allocate a new buffer while the pool is below its maximum.
//! 4. Wait for a release, up to the configured wait time. Consecutive
//!    timeouts are counted and once the limit is reached the manager stops
//!    waiting altogether.

use crate::buffer::format::ImageFormat;
use crate::buffer::image_buffer::ImageBuffer;
use crate::sync::lock;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Creation parameters for an [`ImageBufferManager`].
#[derive(Debug, Clone)]
pub struct ImageBufferManagerConfig {
    pub name: String,
    pub format: ImageFormat,
    /// Buffers allocated on activation
    pub immediate_alloc_count: u32,
    /// Hard limit on buffers owned by the manager
    pub max_buffer_count: u32,
    /// Allocate backing memory only when a buffer is bound
    pub late_binding: bool,
    /// How long to wait for a buffer to be released
    pub wait_time: Duration,
    /// Consecutive timeouts tolerated before giving up immediately
    pub max_timeout_count: u32,
}

impl ImageBufferManagerConfig {
    pub fn new(name: impl Into<String>, format: ImageFormat, max_buffer_count: u32) -> Self {
        Self {
            name: name.into(),
            format,
            immediate_alloc_count: 0,
            max_buffer_count,
            late_binding: false,
            wait_time: Duration::from_millis(100),
            max_timeout_count: 3,
        }
    }
}

/// Counters reported in state dumps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImageBufferManagerStats {
    pub allocated: u32,
    pub free: usize,
    pub busy: usize,
    /// Busy buffers that still hold references
    pub in_use: usize,
    pub acquisitions: u64,
    pub waits: u64,
    pub timeouts: u32,
    pub active: bool,
}

#[derive(Default)]
struct PoolState {
    free: VecDeque<Arc<ImageBuffer>>,
    busy: Vec<Arc<ImageBuffer>>,
    allocated: u32,
    next_id: u32,
    active: bool,
    timeout_count: u32,
    acquisitions: u64,
    waits: u64,
}

impl PoolState {
    fn reclaim_unreferenced(&mut self) -> usize {
        let mut moved = 0;
        let mut index = 0;
        while index < self.busy.len() {
            if self.busy[index].reference_count() == 0 {
                let buffer = self.busy.swap_remove(index);
                self.free.push_back(buffer);
                moved += 1;
            } else {
                index += 1;
            }
        }
        moved
    }
}

/// State shared between the manager and its buffers.
pub(crate) struct PoolShared {
    state: Mutex<PoolState>,
    available: Condvar,
}

impl PoolShared {
    pub(crate) fn notify_available(&self) {
        let _guard = lock(&self.state);
        self.available.notify_all();
    }
}

pub struct ImageBufferManager {
    config: ImageBufferManagerConfig,
    shared: Arc<PoolShared>,
}

impl ImageBufferManager {
    pub fn new(config: ImageBufferManagerConfig) -> Self {
        Self {
            config,
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState::default()),
                available: Condvar::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn format(&self) -> ImageFormat {
        self.config.format
    }

    pub fn max_buffer_count(&self) -> u32 {
        self.config.max_buffer_count
    }

    fn allocate(&self, state: &mut PoolState) -> Arc<ImageBuffer> {
        state.next_id += 1;
        state.allocated += 1;
        Arc::new(ImageBuffer::new(
            state.next_id,
            self.config.format,
            self.config.late_binding,
            Arc::downgrade(&self.shared),
        ))
    }

    /// Make the pool usable and allocate the immediate buffers
    pub fn activate(&self) {
        let mut state = lock(&self.shared.state);
        state.active = true;
        state.timeout_count = 0;
        let target = self
            .config
            .immediate_alloc_count
            .min(self.config.max_buffer_count);
        while state.allocated < target {
            let buffer = self.allocate(&mut state);
            state.free.push_back(buffer);
        }
        tracing::debug!(
            "Activated image buffer manager {} ({} buffers)",
            self.config.name,
            state.allocated
        );
    }

    /// Stop handing out buffers and free unreferenced ones. A partial
    /// deactivation keeps the immediately allocated buffers around.
    pub fn deactivate(&self, partial: bool) {
        let mut state = lock(&self.shared.state);
        state.active = false;
        state.reclaim_unreferenced();

        let keep = if partial {
            self.config.immediate_alloc_count as usize
        } else {
            0
        };
        while state.free.len() > keep {
            state.free.pop_back();
            state.allocated = state.allocated.saturating_sub(1);
        }

        if !state.busy.is_empty() {
            tracing::warn!(
                "Deactivating {} with {} buffers still referenced",
                self.config.name,
                state.busy.len()
            );
        }
        self.shared.available.notify_all();
    }

    /// Drop every buffer owned by the manager
    pub fn destroy(&self) {
        self.deactivate(false);
        let mut state = lock(&self.shared.state);
        let leaked = state.busy.len();
        state.busy.clear();
        state.allocated = 0;
        if leaked > 0 {
            tracing::warn!(
                "Image buffer manager {} destroyed with {} outstanding buffers",
                self.config.name,
                leaked
            );
        }
    }

    /// Acquire a buffer. The returned buffer already carries one reference
    /// owned by the caller. Returns `None` when the pool is inactive or
    /// exhausted.
    pub fn get_image_buffer(&self) -> Option<Arc<ImageBuffer>> {
        let mut state = lock(&self.shared.state);
        if !state.active {
            tracing::warn!("get_image_buffer on inactive manager {}", self.config.name);
            return None;
        }

        if let Some(buffer) = self.try_take(&mut state) {
            return Some(buffer);
        }

        if state.timeout_count >= self.config.max_timeout_count {
            tracing::error!(
                "Manager {} exhausted after {} consecutive timeouts",
                self.config.name,
                state.timeout_count
            );
            return None;
        }

        state.waits += 1;
        let deadline = Instant::now() + self.config.wait_time;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                state.timeout_count += 1;
                tracing::warn!(
                    "Timed out waiting for a buffer from {} ({} of {})",
                    self.config.name,
                    state.timeout_count,
                    self.config.max_timeout_count
                );
                return None;
            }
            state = self.wait(state, remaining);
            if !state.active {
                return None;
            }
            if let Some(buffer) = self.try_take(&mut state) {
                return Some(buffer);
            }
        }
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, PoolState>, timeout: Duration) -> MutexGuard<'a, PoolState> {
        match self.shared.available.wait_timeout(guard, timeout) {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        }
    }

    fn try_take(&self, state: &mut PoolState) -> Option<Arc<ImageBuffer>> {
        let buffer = match state.free.pop_front() {
            Some(buffer) => buffer,
            None => {
                if state.reclaim_unreferenced() > 0 {
                    state.free.pop_front()?
                } else if state.allocated < self.config.max_buffer_count {
                    self.allocate(state)
                } else {
                    return None;
                }
            }
        };
        buffer.add_references(1);
        state.busy.push(Arc::clone(&buffer));
        state.acquisitions += 1;
        state.timeout_count = 0;
        Some(buffer)
    }

    pub fn stats(&self) -> ImageBufferManagerStats {
        let state = lock(&self.shared.state);
        ImageBufferManagerStats {
            allocated: state.allocated,
            free: state.free.len(),
            busy: state.busy.len(),
            in_use: state
                .busy
                .iter()
                .filter(|b| b.reference_count() > 0)
                .count(),
            acquisitions: state.acquisitions,
            waits: state.waits,
            timeouts: state.timeout_count,
            active: state.active,
        }
    }
}

impl fmt::Debug for ImageBufferManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageBufferManager")
            .field("name", &self.name())
            .field("format", &self.config.format)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Drop for ImageBufferManager {
    fn drop(&mut self) {
        self.shared.available.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::format::Format;
    use std::thread;

    fn manager(max: u32, immediate: u32) -> ImageBufferManager {
        let mut config =
            ImageBufferManagerConfig::new("test", ImageFormat::new(Format::Nv12, 64, 48), max);
        config.immediate_alloc_count = immediate;
        config.wait_time = Duration::from_millis(20);
        ImageBufferManager::new(config)
    }

    #[test]
    fn test_inactive_manager_returns_none() {
        let mgr = manager(2, 0);
        assert!(mgr.get_image_buffer().is_none());
    }

    #[test]
    fn test_activate_allocates_immediate() {
        let mgr = manager(4, 2);
        mgr.activate();
        let stats = mgr.stats();
        assert_eq!(stats.allocated, 2);
        assert_eq!(stats.free, 2);
    }

    #[test]
    fn test_buffer_returned_with_reference() {
        let mgr = manager(2, 0);
        mgr.activate();
        let buf = mgr.get_image_buffer().unwrap();
        assert_eq!(buf.reference_count(), 1);
    }

    #[test]
    fn test_busy_buffer_reclaimed_after_release() {
        let mgr = manager(1, 0);
        mgr.activate();
        let first = mgr.get_image_buffer().unwrap();
        let first_id = first.id();
        first.release_reference();
        let second = mgr.get_image_buffer().unwrap();
        assert_eq!(second.id(), first_id);
        assert_eq!(mgr.stats().allocated, 1);
    }

    #[test]
    fn test_exhaustion_times_out_and_counts() {
        let mgr = manager(1, 0);
        mgr.activate();
        let _held = mgr.get_image_buffer().unwrap();
        assert!(mgr.get_image_buffer().is_none());
        assert_eq!(mgr.stats().timeouts, 1);
    }

    #[test]
    fn test_waiter_woken_by_release() {
        let mut config =
            ImageBufferManagerConfig::new("wake", ImageFormat::new(Format::Y8, 8, 8), 1);
        config.wait_time = Duration::from_secs(2);
        let mgr = Arc::new(ImageBufferManager::new(config));
        mgr.activate();
        let held = mgr.get_image_buffer().unwrap();

        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            held.release_reference();
        });
        let buf = mgr.get_image_buffer();
        releaser.join().unwrap();
        assert!(buf.is_some());
    }

    #[test]
    fn test_debug_shows_name_and_stats() {
        let mgr = manager(2, 1);
        mgr.activate();
        let text = format!("{:?}", mgr);
        assert!(text.contains("\"test\""), "{}", text);
        assert!(text.contains("allocated: 1"), "{}", text);
    }

    #[test]
    fn test_partial_deactivate_keeps_immediate() {
        let mgr = manager(4, 1);
        mgr.activate();
        let a = mgr.get_image_buffer().unwrap();
        let b = mgr.get_image_buffer().unwrap();
        a.release_reference();
        b.release_reference();
        assert_eq!(mgr.stats().allocated, 2);
        mgr.deactivate(true);
        let stats = mgr.stats();
        assert_eq!(stats.allocated, 1);
        assert!(!stats.active);
        mgr.deactivate(false);
        assert_eq!(mgr.stats().allocated, 0);
    }
}
