// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;

use crate::backend::DeviceMemory;
use crate::backend::MemoryKind;
use crate::memory::DeviceBuffer;
use crate::memory::MemoryError;

/// Number of buffers allocated when the pool is (re)sized.
pub const INITIAL_POOL_SIZE: usize = 3;

/// A buffer borrowed from a [`FramePool`]. It goes back to the pool when dropped, or is freed if
/// the pool has been resized or dropped in the meantime.
#[derive(Debug)]
pub struct PooledBuffer {
    inner: Option<DeviceBuffer>,
    pool: Weak<Mutex<VecDeque<DeviceBuffer>>>,
}

impl Deref for PooledBuffer {
    type Target = DeviceBuffer;

    fn deref(&self) -> &DeviceBuffer {
        // `inner` is only taken in `drop`.
        self.inner.as_ref().unwrap()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let (Some(pool), Some(buffer)) = (self.pool.upgrade(), self.inner.take()) {
            (*pool.lock().unwrap()).push_back(buffer);
        }
    }
}

/// Pool of equally-sized device buffers receiving copies of decoded frames.
pub struct FramePool {
    memory: Arc<dyn DeviceMemory>,
    buffer_size: usize,
    pool: Arc<Mutex<VecDeque<DeviceBuffer>>>,
}

impl FramePool {
    pub fn new(memory: Arc<dyn DeviceMemory>) -> FramePool {
        Self {
            memory,
            buffer_size: 0,
            pool: Default::default(),
        }
    }

    /// Size of the buffers currently handed out by the pool.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Number of buffers waiting in the pool.
    pub fn num_free(&self) -> usize {
        self.pool.lock().unwrap().len()
    }

    /// Replaces the pool with `count` new buffers of `buffer_size` bytes. Buffers of the previous
    /// pool still in use are freed when they are dropped.
    pub fn resize(&mut self, buffer_size: usize, count: usize) -> Result<(), MemoryError> {
        let mut pool: VecDeque<DeviceBuffer> = VecDeque::new();
        for _ in 0..count {
            pool.push_back(DeviceBuffer::new(
                Arc::clone(&self.memory),
                buffer_size,
                MemoryKind::Device,
            )?);
        }
        log::debug!("frame pool resized to {} buffers of {} bytes", count, buffer_size);

        self.buffer_size = buffer_size;
        self.pool = Arc::new(Mutex::new(pool));
        Ok(())
    }

    /// Returns a buffer of `size` bytes, reusing a pooled one if possible. The pool is resized if
    /// `size` differs from the current buffer size, and grows when all its buffers are in use.
    pub fn alloc(&mut self, size: usize) -> Result<PooledBuffer, MemoryError> {
        if size != self.buffer_size {
            self.resize(size, INITIAL_POOL_SIZE)?;
        }

        let buffer = (*self.pool.lock().unwrap()).pop_front();
        let buffer = match buffer {
            Some(buffer) => buffer,
            None => DeviceBuffer::new(Arc::clone(&self.memory), size, MemoryKind::Device)?,
        };

        Ok(PooledBuffer {
            inner: Some(buffer),
            pool: Arc::downgrade(&self.pool),
        })
    }
}
