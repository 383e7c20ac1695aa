//! Command buffer managers.
//!
//! Hardware nodes write register programming into command buffers before
//! submission. A buffer handed out for a request stays busy until the node
//! finishes that request, at which point it is recycled.

use crate::error::{NodeError, Result};
use crate::sync::lock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Mutex;

/// Description of one manager requested by a node at initialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CmdBufferManagerConfig {
    pub name: String,
    /// Size of each command buffer in bytes
    pub buffer_size: usize,
    /// Number of buffers in the pool
    pub buffer_count: u32,
}

impl CmdBufferManagerConfig {
    pub fn new(name: impl Into<String>, buffer_size: usize, buffer_count: u32) -> Self {
        Self {
            name: name.into(),
            buffer_size,
            buffer_count,
        }
    }
}

/// A command buffer checked out for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdBuffer {
    pub id: u32,
    pub request_id: u64,
    pub size: usize,
}

struct CmdPool {
    free: VecDeque<u32>,
    busy: VecDeque<CmdBuffer>,
}

pub struct CmdBufferManager {
    config: CmdBufferManagerConfig,
    pool: Mutex<CmdPool>,
}

impl CmdBufferManager {
    pub fn new(config: CmdBufferManagerConfig) -> Self {
        let free = (0..config.buffer_count).collect();
        Self {
            config,
            pool: Mutex::new(CmdPool {
                free,
                busy: VecDeque::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Check out a buffer for `request_id`
    pub fn get_buffer(&self, request_id: u64) -> Result<CmdBuffer> {
        let mut pool = lock(&self.pool);
        let id = pool.free.pop_front().ok_or_else(|| {
            NodeError::Resource(format!(
                "command buffer manager {} has no free buffers",
                self.config.name
            ))
        })?;
        let buffer = CmdBuffer {
            id,
            request_id,
            size: self.config.buffer_size,
        };
        pool.busy.push_back(buffer);
        Ok(buffer)
    }

    /// Return every buffer used by requests up to and including `request_id`
    pub fn recycle(&self, request_id: u64) -> usize {
        let mut pool = lock(&self.pool);
        let mut recycled = Vec::new();
        pool.busy.retain(|buffer| {
            if buffer.request_id <= request_id {
                recycled.push(buffer.id);
                false
            } else {
                true
            }
        });
        let count = recycled.len();
        pool.free.extend(recycled);
        count
    }

    pub fn busy_count(&self) -> usize {
        lock(&self.pool).busy.len()
    }

    pub fn free_count(&self) -> usize {
        lock(&self.pool).free.len()
    }
}
