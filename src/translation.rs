// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Conversion between host packets/frames and the accelerator's wire descriptors.
//!
//! Lookups in the format tables never fail: values missing from a table fall back to a default
//! (I420 for pixel formats, BT.601 for color spaces) since the tables cannot be exhaustive.

use std::sync::Arc;
use std::sync::Mutex;

use thiserror::Error;

use crate::backend::wire::MemType;
use crate::backend::wire::StreamType;
use crate::backend::wire::WireColorSpace;
use crate::backend::wire::WirePixelFormat;
use crate::backend::wire::WireStream;
use crate::backend::BackendError;
use crate::backend::DeviceMemory;
use crate::decoder::Packet;
use crate::memory::pool::FramePool;
use crate::memory::MemoryError;
use crate::memory::StreamBuffer;
use crate::utils::rescale_ts;
use crate::utils::Timebase;
use crate::utils::DEVICE_TIMEBASE;
use crate::video_frame::DecodedFrame;
use crate::video_frame::FramePlane;
use crate::video_frame::FrameProperties;
use crate::video_frame::MappedFrame;
use crate::video_frame::PlaneBacking;
use crate::ColorMatrix;
use crate::ColorRange;
use crate::DecodedFormat;

#[derive(Error, Debug)]
pub enum TranslationError {
    #[error("packet of {size} bytes does not fit in the {capacity} bytes stream buffer")]
    PacketTooLarge { size: usize, capacity: usize },
    #[error("{format:?} frame has {actual} planes, expected {expected}")]
    PlaneCountMismatch {
        format: DecodedFormat,
        expected: usize,
        actual: usize,
    },
    #[error("plane {plane} has a line size of {actual} bytes, expected {expected}")]
    LinesizeMismatch {
        plane: usize,
        expected: usize,
        actual: usize,
    },
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error("failed to unmap frame after copy: {0}")]
    Unmap(#[source] BackendError),
}

impl TranslationError {
    /// Whether the error reveals a broken internal invariant rather than bad input or a device
    /// failure.
    pub fn is_bug(&self) -> bool {
        matches!(
            self,
            TranslationError::PlaneCountMismatch { .. } | TranslationError::LinesizeMismatch { .. }
        )
    }
}

const PIXEL_FORMAT_MAP: &[(DecodedFormat, WirePixelFormat)] = &[
    (DecodedFormat::I420, WirePixelFormat::I420),
    (DecodedFormat::NV12, WirePixelFormat::Nv12),
    (DecodedFormat::NV21, WirePixelFormat::Nv21),
    (DecodedFormat::I444, WirePixelFormat::Yuv444),
    (DecodedFormat::RGB24, WirePixelFormat::Rgb888),
    (DecodedFormat::BGR24, WirePixelFormat::Bgr888),
    (DecodedFormat::RGB24P, WirePixelFormat::Rgb3p),
    (DecodedFormat::BGR24P, WirePixelFormat::Bgr3p),
    (DecodedFormat::Gray8, WirePixelFormat::Monochrome),
    (DecodedFormat::Gray10LE, WirePixelFormat::Monochrome10),
    (DecodedFormat::I444P10LE, WirePixelFormat::Yuv444P10),
    (DecodedFormat::P010LEEf, WirePixelFormat::P010Le),
    (DecodedFormat::P010, WirePixelFormat::P010),
];

pub fn wire_pixel_format(format: DecodedFormat) -> WirePixelFormat {
    PIXEL_FORMAT_MAP
        .iter()
        .find(|(decoded, _)| *decoded == format)
        .map(|(_, wire)| *wire)
        .unwrap_or(WirePixelFormat::I420)
}

pub fn decoded_format(format: WirePixelFormat) -> DecodedFormat {
    PIXEL_FORMAT_MAP
        .iter()
        .find(|(_, wire)| *wire == format)
        .map(|(decoded, _)| *decoded)
        .unwrap_or(DecodedFormat::I420)
}

const COLOR_SPACE_MAP: &[(&str, WireColorSpace)] = &[
    ("bt601", WireColorSpace::Bt601),
    ("bt601f", WireColorSpace::Bt601Er),
    ("bt709", WireColorSpace::Bt709),
    ("bt709f", WireColorSpace::Bt709Er),
    ("bt2020", WireColorSpace::Bt2020),
    ("bt2020f", WireColorSpace::Bt2020Er),
];

/// Parses an output color space name, the `f` suffix selecting the full range variant.
pub fn wire_color_space(name: &str) -> WireColorSpace {
    let lower = name.to_ascii_lowercase();
    match COLOR_SPACE_MAP.iter().find(|(n, _)| *n == lower) {
        Some((_, color_space)) => *color_space,
        None => {
            log::warn!("unknown color space {:?}, using bt601", name);
            WireColorSpace::Bt601
        }
    }
}

pub fn color_matrix(color_space: WireColorSpace) -> ColorMatrix {
    match color_space {
        WireColorSpace::Bt601 => ColorMatrix::Smpte170m,
        WireColorSpace::Bt709 => ColorMatrix::Bt709,
        WireColorSpace::Bt2020 => ColorMatrix::Bt2020Cl,
        WireColorSpace::Bt601Er => ColorMatrix::Bt470bg,
        WireColorSpace::Bt709Er => ColorMatrix::Rgb,
        WireColorSpace::Bt2020Er => ColorMatrix::Bt2020Ncl,
    }
}

pub fn color_range(color_space: WireColorSpace) -> ColorRange {
    match color_space {
        WireColorSpace::Bt601Er | WireColorSpace::Bt709Er | WireColorSpace::Bt2020Er => {
            ColorRange::Full
        }
        _ => ColorRange::Limited,
    }
}

/// Translates packets into staged wire streams, and mapped wire frames into [`DecodedFrame`]s.
pub struct Translator {
    memory: Arc<dyn DeviceMemory>,
    zero_copy: bool,
    pool: Mutex<FramePool>,
    pkt_timebase: Option<Timebase>,
    interlaced: bool,
}

impl Translator {
    pub fn new(
        memory: Arc<dyn DeviceMemory>,
        zero_copy: bool,
        pkt_timebase: Option<Timebase>,
        interlaced: bool,
    ) -> Self {
        if !pkt_timebase.map(|tb| tb.is_valid()).unwrap_or(false) {
            log::debug!("no valid packet time base, passing timestamps as-is");
        }

        Self {
            pool: Mutex::new(FramePool::new(Arc::clone(&memory))),
            memory,
            zero_copy,
            pkt_timebase,
            interlaced,
        }
    }

    /// Stages `packet` into `stream` and returns the descriptor to submit.
    pub fn packet_to_wire(
        &self,
        packet: &Packet,
        stream: &StreamBuffer,
    ) -> Result<WireStream, TranslationError> {
        let size = packet.data.len();
        if size > stream.size() {
            return Err(TranslationError::PacketTooLarge {
                size,
                capacity: stream.size(),
            });
        }

        if size > 0 {
            stream.stage(&packet.data)?;
            log::trace!(
                "staged {} bytes at {:#x}, crc32 {:08x}",
                size,
                stream.device_addr(),
                crc32fast::hash(&packet.data)
            );
        }

        Ok(WireStream {
            mem_addr: stream.device_addr(),
            alloc_len: stream.size() as u32,
            data_offset: 0,
            data_len: size as u32,
            pts: packet.pts.unwrap_or(0).max(0) as u64,
            stream_type: if packet.key {
                StreamType::I
            } else {
                StreamType::Unknown
            },
            mem_type: MemType::Host,
        })
    }

    /// Wraps `mapped` into a frame. In zero-copy mode the planes keep `mapped` alive; otherwise
    /// they are copied into a pooled buffer and `mapped` is unmapped before returning.
    pub fn wire_to_frame(&self, mapped: MappedFrame) -> Result<DecodedFrame, TranslationError> {
        let wire = mapped.wire().clone();
        let format = decoded_format(wire.pixel_format);
        let resolution = wire.resolution();

        if wire.planes.len() != format.num_planes() {
            return Err(TranslationError::PlaneCountMismatch {
                format,
                expected: format.num_planes(),
                actual: wire.planes.len(),
            });
        }

        let plane_heights = format.plane_heights(resolution.height);
        let planes = if self.zero_copy {
            let mapped = Arc::new(mapped);
            wire.planes
                .iter()
                .zip(plane_heights)
                .map(|(plane, lines)| {
                    let stride = plane.stride as usize;
                    FramePlane::new(
                        PlaneBacking::Wire(Arc::clone(&mapped)),
                        plane.dev_addr,
                        stride,
                        stride * lines,
                    )
                })
                .collect::<Vec<_>>()
        } else {
            let linesizes = format.linesizes(resolution.width);
            for (i, (plane, expected)) in wire.planes.iter().zip(&linesizes).enumerate() {
                if plane.stride as usize != *expected {
                    return Err(TranslationError::LinesizeMismatch {
                        plane: i,
                        expected: *expected,
                        actual: plane.stride as usize,
                    });
                }
            }

            let sizes = format.plane_sizes(resolution);
            let buffer = self.pool.lock().unwrap().alloc(sizes.iter().sum())?;
            let mut layout = Vec::with_capacity(sizes.len());
            let mut offset = 0;
            for (plane, size) in wire.planes.iter().zip(&sizes) {
                buffer.copy_from_device(offset, plane.dev_addr, *size)?;
                layout.push((offset, *size));
                offset += size;
            }
            mapped.unmap().map_err(TranslationError::Unmap)?;

            let buffer = Arc::new(buffer);
            layout
                .into_iter()
                .zip(linesizes)
                .map(|((offset, size), stride)| {
                    FramePlane::new(
                        PlaneBacking::Owned(Arc::clone(&buffer)),
                        buffer.addr() + offset as u64,
                        stride,
                        size,
                    )
                })
                .collect::<Vec<_>>()
        };

        let pts = wire.pts as i64;
        let pts = match self.pkt_timebase {
            Some(tb) if tb.is_valid() => rescale_ts(pts, DEVICE_TIMEBASE, tb),
            _ => pts,
        };

        Ok(DecodedFrame {
            format,
            resolution,
            planes,
            memory: Arc::clone(&self.memory),
            props: FrameProperties {
                pts: Some(pts),
                ..Default::default()
            },
            picture_type: wire.pic_type,
            color_matrix: color_matrix(wire.color_space),
            color_range: color_range(wire.color_space),
            interlaced: self.interlaced,
        })
    }
}
