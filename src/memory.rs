// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Owned device memory.
//!
//! Allocations are wrapped into [`DeviceBuffer`], which frees them when dropped. Failures are
//! never retried here: they are reported to the caller, which aborts the operation in progress.

pub mod pool;

use std::sync::Arc;

use thiserror::Error;

use crate::backend::BackendError;
use crate::backend::DeviceMemory;
use crate::backend::MemoryKind;
use crate::backend::Transfer;
use crate::utils::align_up;
use crate::Resolution;

/// Alignment of the compressed stream staging buffer.
const STREAM_BUFFER_ALIGNMENT: usize = 4096;

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("failed to allocate {size} bytes of device memory: {source}")]
    OutOfMemory {
        size: usize,
        #[source]
        source: BackendError,
    },
    #[error("{direction} copy of {size} bytes failed: {source}")]
    Copy {
        direction: &'static str,
        size: usize,
        #[source]
        source: BackendError,
    },
    #[error("failed to resolve the device address of {addr:#x}: {source}")]
    Pointer {
        addr: u64,
        #[source]
        source: BackendError,
    },
    #[error("access of {size} bytes at offset {offset} is out of the {capacity} bytes buffer")]
    OutOfBounds {
        offset: usize,
        size: usize,
        capacity: usize,
    },
}

/// Performs `transfer` on `memory`, turning failures into a [`MemoryError`].
pub fn copy(memory: &dyn DeviceMemory, transfer: Transfer<'_>) -> Result<(), MemoryError> {
    let direction = match &transfer {
        Transfer::HostToDevice { .. } => "H2D",
        Transfer::DeviceToDevice { .. } => "D2D",
        Transfer::DeviceToHost { .. } => "D2H",
    };
    let size = transfer.size();

    memory.copy(transfer).map_err(|source| MemoryError::Copy {
        direction,
        size,
        source,
    })
}

/// A device allocation, freed on drop.
pub struct DeviceBuffer {
    memory: Arc<dyn DeviceMemory>,
    addr: u64,
    size: usize,
    kind: MemoryKind,
}

impl DeviceBuffer {
    pub fn new(
        memory: Arc<dyn DeviceMemory>,
        size: usize,
        kind: MemoryKind,
    ) -> Result<Self, MemoryError> {
        let addr = memory
            .alloc(size, kind)
            .map_err(|source| MemoryError::OutOfMemory { size, source })?;
        log::trace!("allocated {} bytes of {:?} memory at {:#x}", size, kind, addr);

        Ok(Self {
            memory,
            addr,
            size,
            kind,
        })
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn kind(&self) -> MemoryKind {
        self.kind
    }

    pub fn memory(&self) -> &Arc<dyn DeviceMemory> {
        &self.memory
    }

    fn check_bounds(&self, offset: usize, size: usize) -> Result<(), MemoryError> {
        match offset.checked_add(size) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(MemoryError::OutOfBounds {
                offset,
                size,
                capacity: self.size,
            }),
        }
    }

    /// Copies `data` from the host into the buffer at `offset`.
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<(), MemoryError> {
        self.check_bounds(offset, data.len())?;
        copy(
            self.memory.as_ref(),
            Transfer::HostToDevice {
                dst: self.addr + offset as u64,
                src: data,
            },
        )
    }

    /// Copies `size` bytes of device memory at `src` into the buffer at `offset`.
    pub fn copy_from_device(&self, offset: usize, src: u64, size: usize) -> Result<(), MemoryError> {
        self.check_bounds(offset, size)?;
        copy(
            self.memory.as_ref(),
            Transfer::DeviceToDevice {
                dst: self.addr + offset as u64,
                src,
                size,
            },
        )
    }

    /// Copies the buffer contents at `offset` into `dst`.
    pub fn read(&self, offset: usize, dst: &mut [u8]) -> Result<(), MemoryError> {
        self.check_bounds(offset, dst.len())?;
        copy(
            self.memory.as_ref(),
            Transfer::DeviceToHost {
                dst,
                src: self.addr + offset as u64,
            },
        )
    }
}

impl std::fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("addr", &format_args!("{:#x}", self.addr))
            .field("size", &self.size)
            .field("kind", &self.kind)
            .finish()
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        if let Err(e) = self.memory.free(self.addr) {
            log::warn!("failed to free device buffer at {:#x}: {}", self.addr, e);
        }
    }
}

/// Returns the staging buffer size needed for the compressed frames of a `resolution` stream.
pub fn stream_buffer_size(resolution: Resolution) -> usize {
    let area = resolution.get_area();
    // 1.25 bytes per pixel, rounded up.
    let bitstream_size = (area * 5 + 3) / 4;
    align_up(bitstream_size, STREAM_BUFFER_ALIGNMENT)
}

/// Host-accessible device buffer in which compressed payloads are staged before submission.
#[derive(Debug)]
pub struct StreamBuffer {
    buffer: DeviceBuffer,
    device_addr: u64,
}

impl StreamBuffer {
    pub fn new(memory: Arc<dyn DeviceMemory>, size: usize) -> Result<Self, MemoryError> {
        let buffer = DeviceBuffer::new(memory, size, MemoryKind::HostAccessible)?;
        let addr = buffer.addr();
        let device_addr = buffer
            .memory()
            .device_pointer(addr)
            .map_err(|source| MemoryError::Pointer { addr, source })?;
        log::debug!(
            "stream buffer of {} bytes at {:#x} (device {:#x})",
            size,
            addr,
            device_addr
        );

        Ok(Self {
            buffer,
            device_addr,
        })
    }

    pub fn size(&self) -> usize {
        self.buffer.size()
    }

    /// Address of the buffer as seen by the device.
    pub fn device_addr(&self) -> u64 {
        self.device_addr
    }

    /// Copies `payload` at the start of the buffer.
    pub fn stage(&self, payload: &[u8]) -> Result<(), MemoryError> {
        self.buffer.write(0, payload)
    }
}
