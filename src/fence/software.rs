//! In-process fence implementation.
//!
//! Fences live in a registry guarded by a single mutex. Callbacks are never
//! invoked while that mutex is held: waiters are drained first and then
//! dispatched either inline on the signalling thread or through a
//! [`JobPool`].

use crate::backend::job_pool::JobPool;
use crate::error::{NodeError, Result};
use crate::fence::{FenceCallback, FenceHandle, FenceProvider, FenceResult};
use crate::sync::lock;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

enum Dispatch {
    Inline,
    Pool(Arc<JobPool>),
}

struct FenceState {
    name: String,
    result: Option<FenceResult>,
    waiters: Vec<FenceCallback>,
}

#[derive(Default)]
struct Registry {
    next_handle: u64,
    live: HashMap<u64, FenceState>,
    release_counts: HashMap<u64, u32>,
    created: u64,
}

/// Software fences backed by a hash map.
pub struct SoftwareFences {
    registry: Mutex<Registry>,
    dispatch: Dispatch,
}

impl SoftwareFences {
    /// Callbacks run on the thread that signals the fence
    pub fn inline() -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            dispatch: Dispatch::Inline,
        }
    }

    /// Callbacks are posted to `pool`
    pub fn with_job_pool(pool: Arc<JobPool>) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            dispatch: Dispatch::Pool(pool),
        }
    }

    /// Number of fences created and not yet released
    pub fn live_fences(&self) -> usize {
        lock(&self.registry).live.len()
    }

    /// Total number of fences ever created
    pub fn created_count(&self) -> u64 {
        lock(&self.registry).created
    }

    /// How many times `fence` was successfully released (0 or 1)
    pub fn release_count(&self, fence: FenceHandle) -> u32 {
        lock(&self.registry)
            .release_counts
            .get(&fence.0)
            .copied()
            .unwrap_or(0)
    }

    /// Result of a live fence, `None` while pending or once released
    pub fn result(&self, fence: FenceHandle) -> Option<FenceResult> {
        lock(&self.registry)
            .live
            .get(&fence.0)
            .and_then(|state| state.result)
    }

    pub fn is_live(&self, fence: FenceHandle) -> bool {
        lock(&self.registry).live.contains_key(&fence.0)
    }

    /// Debug name given at creation
    pub fn name(&self, fence: FenceHandle) -> Option<String> {
        lock(&self.registry)
            .live
            .get(&fence.0)
            .map(|state| state.name.clone())
    }

    fn dispatch(&self, fence: FenceHandle, result: FenceResult, callbacks: Vec<FenceCallback>) {
        for callback in callbacks {
            match &self.dispatch {
                Dispatch::Inline => callback(fence, result),
                Dispatch::Pool(pool) => {
                    if let Err(job) = pool.post(Box::new(move || callback(fence, result))) {
                        tracing::warn!("Job pool unavailable, running {} callback inline", fence);
                        job();
                    }
                }
            }
        }
    }
}

impl FenceProvider for SoftwareFences {
    fn create_private_fence(&self, name: &str) -> Result<FenceHandle> {
        let mut registry = lock(&self.registry);
        registry.next_handle += 1;
        registry.created += 1;
        let handle = registry.next_handle;
        registry.live.insert(
            handle,
            FenceState {
                name: name.to_string(),
                result: None,
                waiters: Vec::new(),
            },
        );
        tracing::trace!("Created fence {} ({})", handle, name);
        Ok(FenceHandle(handle))
    }

    fn async_wait(&self, fence: FenceHandle, callback: FenceCallback) -> Result<()> {
        let ready = {
            let mut registry = lock(&self.registry);
            let state = registry
                .live
                .get_mut(&fence.0)
                .ok_or_else(|| NodeError::Fence(format!("async wait on unknown {}", fence)))?;
            match state.result {
                Some(result) => Some((result, callback)),
                None => {
                    state.waiters.push(callback);
                    None
                }
            }
        };

        if let Some((result, callback)) = ready {
            self.dispatch(fence, result, vec![callback]);
        }
        Ok(())
    }

    fn signal(&self, fence: FenceHandle, result: FenceResult) -> Result<()> {
        let waiters = {
            let mut registry = lock(&self.registry);
            let state = registry
                .live
                .get_mut(&fence.0)
                .ok_or_else(|| NodeError::Fence(format!("signal of unknown {}", fence)))?;
            if let Some(previous) = state.result {
                return Err(NodeError::Fence(format!(
                    "{} already signalled with {:?}",
                    fence, previous
                )));
            }
            state.result = Some(result);
            std::mem::take(&mut state.waiters)
        };

        tracing::trace!("Signalled {} with {:?}", fence, result);
        self.dispatch(fence, result, waiters);
        Ok(())
    }

    fn release(&self, fence: FenceHandle) -> Result<()> {
        let mut registry = lock(&self.registry);
        if registry.live.remove(&fence.0).is_none() {
            return Err(NodeError::Fence(format!("release of unknown {}", fence)));
        }
        *registry.release_counts.entry(fence.0).or_insert(0) += 1;
        tracing::trace!("Released {}", fence);
        Ok(())
    }
}
