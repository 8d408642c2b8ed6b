// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Descriptors exchanged with the decode session: compressed streams going in, decoded frames
//! coming out, and the parameters used to create and configure a session.
//!
//! These mirror the accelerator's own structures field for field, but use owned Rust types so the
//! rest of the crate never handles raw pointers. The conversion to and from the C layout lives in
//! the backend that talks to the vendor library.

use enumn::N;

use crate::EncodedFormat;
use crate::Rect;
use crate::Resolution;

/// Pixel formats understood by the accelerator.
#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u32)]
pub enum WirePixelFormat {
    #[default]
    I420 = 0,
    Nv12 = 1,
    Nv21 = 2,
    Yuv444 = 3,
    Rgb888 = 4,
    Bgr888 = 5,
    Rgb3p = 6,
    Bgr3p = 7,
    Monochrome = 8,
    Monochrome10 = 9,
    Yuv444P10 = 10,
    P010Le = 11,
    P010 = 12,
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u32)]
pub enum WireColorSpace {
    #[default]
    Bt601 = 0,
    Bt601Er = 1,
    Bt709 = 2,
    Bt709Er = 3,
    Bt2020 = 4,
    Bt2020Er = 5,
}

#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u32)]
pub enum PictureType {
    #[default]
    Unknown = 0,
    I = 1,
    P = 2,
    B = 3,
    Idr = 4,
}

impl PictureType {
    pub fn is_key(&self) -> bool {
        matches!(self, PictureType::I | PictureType::Idr)
    }
}

/// Hint about the content of a submitted stream buffer.
#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u32)]
pub enum StreamType {
    #[default]
    Unknown = 0,
    I = 1,
    P = 2,
    B = 3,
    Idr = 4,
}

/// Where the payload of a submitted stream lives.
#[derive(N, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u32)]
pub enum MemType {
    #[default]
    Host = 0,
    Device = 1,
}

/// A compressed payload staged in device memory, ready to be submitted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WireStream {
    /// Device address of the staging buffer.
    pub mem_addr: u64,
    /// Total size of the staging buffer.
    pub alloc_len: u32,
    pub data_offset: u32,
    /// Number of valid bytes at `data_offset`. Zero signals the end of the stream.
    pub data_len: u32,
    pub pts: u64,
    pub stream_type: StreamType,
    pub mem_type: MemType,
}

impl WireStream {
    pub fn is_end_of_stream(&self) -> bool {
        self.data_len == 0
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WirePlane {
    pub dev_addr: u64,
    pub stride: u32,
}

/// A decoded picture as reported by the accelerator. Its planes belong to the session's output
/// pool until the frame is unmapped.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WireFrame {
    /// Backend-specific identity of the output buffer, passed back when unmapping.
    pub id: u64,
    pub width: u32,
    pub height: u32,
    pub pixel_format: WirePixelFormat,
    pub color_space: WireColorSpace,
    pub pic_type: PictureType,
    /// Presentation timestamp, in 100ns device ticks.
    pub pts: u64,
    pub planes: Vec<WirePlane>,
}

impl WireFrame {
    pub fn resolution(&self) -> Resolution {
        Resolution::from((self.width, self.height))
    }

    /// Whether this is the zero-sized frame the accelerator uses to signal the end of a drain.
    pub fn is_eos_sentinel(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LibVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl std::fmt::Display for LibVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Decoding capabilities of one device for one codec.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub supported: bool,
    pub max_resolution: Resolution,
    pub min_resolution: Resolution,
    /// Output formats the device can produce. Empty if the device does not report them.
    pub output_formats: Vec<WirePixelFormat>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RunMode {
    #[default]
    Async,
    Sync,
}

/// Granularity of the payloads submitted to the session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SendMode {
    #[default]
    Stream,
    Frame,
}

/// Everything needed to create a decode session.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateInfo {
    pub card_id: u32,
    pub device_id: u32,
    pub hw_ctx_id: u32,
    pub codec: EncodedFormat,
    pub stream_buf_size: u32,
    pub run_mode: RunMode,
    pub send_mode: SendMode,
    /// Number of frames decoded before switching hardware contexts.
    pub switch_frames: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DownscaleMode {
    #[default]
    Bilinear = 0,
    Nearest = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Downscale {
    pub resolution: Resolution,
    pub mode: DownscaleMode,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rotation {
    Rotate90,
    Rotate180,
    Rotate270,
}

impl Rotation {
    pub fn from_degrees(degrees: u32) -> Option<Self> {
        match degrees {
            90 => Some(Rotation::Rotate90),
            180 => Some(Rotation::Rotate180),
            270 => Some(Rotation::Rotate270),
            _ => None,
        }
    }

    /// Whether the rotation exchanges the output width and height.
    pub fn swaps_dimensions(&self) -> bool {
        matches!(self, Rotation::Rotate90 | Rotation::Rotate270)
    }
}

/// Output frame sampling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameSampling {
    /// Output one frame every `n` decoded frames.
    Interval(u32),
    /// Output IDR frames only.
    IdrOnly,
}

/// Post-processing applied by the accelerator on decoded frames.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PostProcessing {
    pub downscale: Option<Downscale>,
    pub crop: Option<Rect>,
    pub rotation: Option<Rotation>,
    pub sampling: Option<FrameSampling>,
}

/// Output configuration of a decode session.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionParams {
    pub pixel_format: WirePixelFormat,
    pub color_space: WireColorSpace,
    pub output_buf_num: u32,
    pub input_buf_num: u32,
    pub post_processing: PostProcessing,
}
