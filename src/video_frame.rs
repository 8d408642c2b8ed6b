// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decoded frames handed to the client.
//!
//! A [`DecodedFrame`] either aliases the accelerator's output buffer directly
//! ([`Representation::DeviceWire`]) or owns a copy of it ([`Representation::HostOwned`]). In the
//! first case every plane holds a reference to the same [`MappedFrame`], which returns the buffer
//! to the accelerator once the last plane reference is dropped.

use std::fmt::Debug;
use std::sync::Arc;

use bytes::Bytes;

use crate::backend::wire::PictureType;
use crate::backend::wire::WireFrame;
use crate::backend::BackendResult;
use crate::backend::DeviceMemory;
use crate::backend::Transfer;
use crate::memory::copy;
use crate::memory::pool::PooledBuffer;
use crate::memory::MemoryError;
use crate::ColorMatrix;
use crate::ColorRange;
use crate::DecodedFormat;
use crate::Resolution;

type ReleaseFn = Box<dyn FnOnce(&WireFrame) -> BackendResult<()> + Send + Sync>;

/// A frame mapped out of the accelerator's output pool. `release` runs exactly once, either
/// through [`MappedFrame::unmap`] or when the value is dropped.
pub struct MappedFrame {
    frame: WireFrame,
    release: Option<ReleaseFn>,
}

impl MappedFrame {
    pub fn new<F>(frame: WireFrame, release: F) -> Self
    where
        F: FnOnce(&WireFrame) -> BackendResult<()> + Send + Sync + 'static,
    {
        Self {
            frame,
            release: Some(Box::new(release)),
        }
    }

    pub fn wire(&self) -> &WireFrame {
        &self.frame
    }

    /// Returns the frame to the accelerator now, reporting any error.
    pub fn unmap(mut self) -> BackendResult<()> {
        self.release_now()
    }

    fn release_now(&mut self) -> BackendResult<()> {
        match self.release.take() {
            Some(release) => release(&self.frame),
            None => Ok(()),
        }
    }
}

impl Debug for MappedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedFrame")
            .field("frame", &self.frame)
            .field("released", &self.release.is_none())
            .finish()
    }
}

impl Drop for MappedFrame {
    fn drop(&mut self) {
        if let Err(e) = self.release_now() {
            log::warn!("failed to unmap frame {}: {}", self.frame.id, e);
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Representation {
    /// Planes alias the accelerator's output buffer.
    DeviceWire,
    /// Planes live in a buffer owned by the frame.
    HostOwned,
}

#[derive(Clone, Debug)]
pub(crate) enum PlaneBacking {
    Wire(Arc<MappedFrame>),
    Owned(Arc<PooledBuffer>),
}

/// One plane of a decoded frame, in device memory.
#[derive(Clone, Debug)]
pub struct FramePlane {
    backing: PlaneBacking,
    addr: u64,
    stride: usize,
    size: usize,
}

impl FramePlane {
    pub(crate) fn new(backing: PlaneBacking, addr: u64, stride: usize, size: usize) -> Self {
        Self {
            backing,
            addr,
            stride,
            size,
        }
    }

    /// Device address of the first byte of the plane.
    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

/// Opaque side data attached to a packet and carried over to the frame it produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SideData {
    pub kind: u32,
    pub data: Bytes,
}

/// Properties of the packet a frame was decoded from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameProperties {
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub duration: i64,
    /// Byte position of the packet in its container, -1 if unknown.
    pub pos: i64,
    pub opaque: Option<u64>,
    pub side_data: Vec<SideData>,
}

impl Default for FrameProperties {
    fn default() -> Self {
        Self {
            pts: None,
            dts: None,
            duration: 0,
            pos: -1,
            opaque: None,
            side_data: Vec::new(),
        }
    }
}

/// A decoded picture.
#[derive(Clone)]
pub struct DecodedFrame {
    pub(crate) format: DecodedFormat,
    pub(crate) resolution: Resolution,
    pub(crate) planes: Vec<FramePlane>,
    pub(crate) memory: Arc<dyn DeviceMemory>,
    pub(crate) props: FrameProperties,
    pub(crate) picture_type: PictureType,
    pub(crate) color_matrix: ColorMatrix,
    pub(crate) color_range: ColorRange,
    pub(crate) interlaced: bool,
}

impl DecodedFrame {
    pub fn format(&self) -> DecodedFormat {
        self.format
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn planes(&self) -> &[FramePlane] {
        &self.planes
    }

    pub fn representation(&self) -> Representation {
        match self.planes.first().map(|p| &p.backing) {
            Some(PlaneBacking::Owned(_)) => Representation::HostOwned,
            _ => Representation::DeviceWire,
        }
    }

    pub fn props(&self) -> &FrameProperties {
        &self.props
    }

    pub fn props_mut(&mut self) -> &mut FrameProperties {
        &mut self.props
    }

    pub fn pts(&self) -> Option<i64> {
        self.props.pts
    }

    pub fn picture_type(&self) -> PictureType {
        self.picture_type
    }

    pub fn is_key_frame(&self) -> bool {
        self.picture_type.is_key()
    }

    pub fn color_matrix(&self) -> ColorMatrix {
        self.color_matrix
    }

    pub fn color_range(&self) -> ColorRange {
        self.color_range
    }

    pub fn is_interlaced(&self) -> bool {
        self.interlaced
    }

    /// Total size of the planes, padding included.
    pub fn image_size(&self) -> usize {
        self.planes.iter().map(|p| p.size).sum()
    }

    /// Reads the planes into host memory, one after the other.
    pub fn download(&self) -> Result<Vec<u8>, MemoryError> {
        let mut data = vec![0u8; self.image_size()];
        let mut dst = data.as_mut_slice();
        for plane in &self.planes {
            let (chunk, rest) = dst.split_at_mut(plane.size);
            copy(
                self.memory.as_ref(),
                Transfer::DeviceToHost {
                    dst: chunk,
                    src: plane.addr,
                },
            )?;
            dst = rest;
        }

        Ok(data)
    }
}

impl Debug for DecodedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodedFrame")
            .field("format", &self.format)
            .field("resolution", &self.resolution)
            .field("representation", &self.representation())
            .field("planes", &self.planes.len())
            .field("props", &self.props)
            .field("picture_type", &self.picture_type)
            .finish()
    }
}
