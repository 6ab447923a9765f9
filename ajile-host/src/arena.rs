// SPDX-License-Identifier: Apache-2.0
// Copyright © 2021 Will Ross
use core::fmt;
use core::ops::Deref;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crossbeam::queue::ArrayQueue;

/// A pool of pixel buffers for one camera.
///
/// Acquired images arrive at the camera's frame rate, all the same size. Buffers handed out by
/// the arena go back to it when the last [`PooledPixels`] referring to them is dropped, so a
/// steady stream of frames stops allocating once the pool is warm.
pub struct ImageArena {
    free: ArrayQueue<Vec<u8>>,
    allocations: AtomicUsize,
}

impl ImageArena {
    /// Create an arena keeping up to `capacity` idle buffers.
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            free: ArrayQueue::new(capacity.max(1)),
            allocations: AtomicUsize::new(0),
        })
    }

    /// Copy `pixels` into a buffer from the pool.
    pub fn copy_from(self: &Arc<Self>, pixels: &[u8]) -> PooledPixels {
        let mut data = match self.free.pop() {
            Some(buffer) => buffer,
            None => {
                self.allocations.fetch_add(1, Ordering::Relaxed);
                Vec::with_capacity(pixels.len())
            }
        };
        data.clear();
        data.extend_from_slice(pixels);
        PooledPixels {
            data,
            arena: Arc::downgrade(self),
        }
    }

    /// The number of buffers this arena has had to allocate.
    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::Relaxed)
    }

    /// The number of buffers waiting to be reused.
    pub fn idle(&self) -> usize {
        self.free.len()
    }
}

impl fmt::Debug for ImageArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageArena")
            .field("idle", &self.free.len())
            .field("allocations", &self.allocations())
            .finish()
    }
}

/// Pixels borrowed from an [`ImageArena`].
pub struct PooledPixels {
    data: Vec<u8>,
    arena: Weak<ImageArena>,
}

impl Deref for PooledPixels {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for PooledPixels {
    fn drop(&mut self) {
        if let Some(arena) = self.arena.upgrade() {
            // A full pool just lets the buffer go.
            let _ = arena.free.push(core::mem::take(&mut self.data));
        }
    }
}

impl fmt::Debug for PooledPixels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledPixels")
            .field("len", &self.data.len())
            .finish()
    }
}
