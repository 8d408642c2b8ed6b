// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decoding through the TOPSCODEC hardware video decoder.
//!
//! The crate is organized bottom-up: [`backend`] abstracts the vendor runtime and decode session,
//! [`memory`] manages device allocations, [`translation`] converts between host packets/frames
//! and the vendor's wire descriptors, and [`decoder`] drives the session state machine exposed to
//! the client.

pub mod backend;
pub mod backoff;
pub mod decoder;
pub mod memory;
pub mod translation;
pub mod utils;
pub mod video_frame;

use std::str::FromStr;

#[cfg(feature = "topscodec")]
pub use libloading;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Whether `self` can contain `other`.
    pub fn can_contain(&self, other: Self) -> bool {
        self.width >= other.width && self.height >= other.height
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Returns `self` with width and height exchanged.
    pub fn transposed(self) -> Self {
        Self {
            width: self.height,
            height: self.width,
        }
    }

    pub fn get_area(&self) -> usize {
        (self.width as usize) * (self.height as usize)
    }
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self {
            width: value.0,
            height: value.1,
        }
    }
}

impl From<Resolution> for (u32, u32) {
    fn from(value: Resolution) -> Self {
        (value.width, value.height)
    }
}

/// A rectangle expressed with its top-left and bottom-right corners.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Rect {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl Rect {
    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top)
    }

    pub fn resolution(&self) -> Resolution {
        Resolution {
            width: self.width(),
            height: self.height(),
        }
    }
}

/// Pixel formats the decoder can output.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DecodedFormat {
    /// Y, U and V planes, 4:2:0 sampling, 8 bits per sample.
    I420,
    /// One Y and one interleaved UV plane, 4:2:0 sampling, 8 bits per sample.
    NV12,
    /// One Y and one interleaved VU plane, 4:2:0 sampling, 8 bits per sample.
    NV21,
    /// Y, U and V planes, 4:4:4 sampling, 8 bits per sample.
    I444,
    /// Packed 24-bit RGB.
    RGB24,
    /// Packed 24-bit BGR.
    BGR24,
    /// Planar 24-bit RGB.
    RGB24P,
    /// Planar 24-bit BGR.
    BGR24P,
    /// Single 8-bit luma plane.
    Gray8,
    /// Single 10-bit luma plane, stored in 16-bit little-endian words.
    Gray10LE,
    /// Y, U and V planes, 4:4:4 sampling, 10 bits per sample in 16-bit words.
    I444P10LE,
    /// P010 variant produced natively by the accelerator, LSB-aligned samples.
    P010LEEf,
    /// Y and interleaved UV planes, 4:2:0 sampling, 10 bits per sample in 16-bit words.
    P010,
}

/// Name/format table, using the names host frameworks conventionally give to these layouts.
const FORMAT_NAMES: &[(&str, DecodedFormat)] = &[
    ("yuv420p", DecodedFormat::I420),
    ("nv12", DecodedFormat::NV12),
    ("nv21", DecodedFormat::NV21),
    ("yuv444p", DecodedFormat::I444),
    ("rgb24", DecodedFormat::RGB24),
    ("bgr24", DecodedFormat::BGR24),
    ("rgb24p", DecodedFormat::RGB24P),
    ("bgr24p", DecodedFormat::BGR24P),
    ("gray", DecodedFormat::Gray8),
    ("gray10le", DecodedFormat::Gray10LE),
    ("yuv444p10le", DecodedFormat::I444P10LE),
    ("p010le_ef", DecodedFormat::P010LEEf),
    ("p010le", DecodedFormat::P010),
];

impl FromStr for DecodedFormat {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        match lower.as_str() {
            "i420" => return Ok(DecodedFormat::I420),
            "gray8" => return Ok(DecodedFormat::Gray8),
            "p010" => return Ok(DecodedFormat::P010),
            _ => (),
        }

        FORMAT_NAMES
            .iter()
            .find(|(name, _)| *name == lower)
            .map(|(_, format)| *format)
            .ok_or("unrecognized output format. Valid values: yuv420p, nv12, nv21, yuv444p, rgb24, bgr24, rgb24p, bgr24p, gray, gray10le, yuv444p10le, p010le_ef, p010le")
    }
}

impl DecodedFormat {
    /// Conventional name of the format.
    pub fn name(&self) -> &'static str {
        FORMAT_NAMES
            .iter()
            .find(|(_, format)| format == self)
            .map(|(name, _)| *name)
            .unwrap_or("unknown")
    }

    pub fn num_planes(&self) -> usize {
        match self {
            DecodedFormat::RGB24 | DecodedFormat::BGR24 => 1,
            DecodedFormat::Gray8 | DecodedFormat::Gray10LE => 1,
            DecodedFormat::NV12
            | DecodedFormat::NV21
            | DecodedFormat::P010
            | DecodedFormat::P010LEEf => 2,
            DecodedFormat::I420
            | DecodedFormat::I444
            | DecodedFormat::I444P10LE
            | DecodedFormat::RGB24P
            | DecodedFormat::BGR24P => 3,
        }
    }

    /// Returns the unpadded line size in bytes of each plane for a frame `width` pixels wide.
    pub fn linesizes(&self, width: u32) -> Vec<usize> {
        let width = width as usize;
        let half = (width + 1) / 2;
        match self {
            DecodedFormat::I420 => vec![width, half, half],
            DecodedFormat::NV12 | DecodedFormat::NV21 => vec![width, half * 2],
            DecodedFormat::I444 | DecodedFormat::RGB24P | DecodedFormat::BGR24P => {
                vec![width; 3]
            }
            DecodedFormat::RGB24 | DecodedFormat::BGR24 => vec![width * 3],
            DecodedFormat::Gray8 => vec![width],
            DecodedFormat::Gray10LE => vec![width * 2],
            DecodedFormat::I444P10LE => vec![width * 2; 3],
            DecodedFormat::P010 | DecodedFormat::P010LEEf => vec![width * 2, half * 4],
        }
    }

    /// Returns the number of lines of each plane for a frame `height` pixels high.
    pub fn plane_heights(&self, height: u32) -> Vec<usize> {
        let height = height as usize;
        let half = (height + 1) / 2;
        match self {
            DecodedFormat::I420 => vec![height, half, half],
            DecodedFormat::NV12
            | DecodedFormat::NV21
            | DecodedFormat::P010
            | DecodedFormat::P010LEEf => vec![height, half],
            _ => vec![height; self.num_planes()],
        }
    }

    /// Size in bytes of each plane of an unpadded `resolution` frame.
    pub fn plane_sizes(&self, resolution: Resolution) -> Vec<usize> {
        self.linesizes(resolution.width)
            .into_iter()
            .zip(self.plane_heights(resolution.height))
            .map(|(linesize, lines)| linesize * lines)
            .collect()
    }
}

/// Returns the size required to store a frame of `format` with size `resolution`, without any
/// padding.
pub fn decoded_frame_size(format: DecodedFormat, resolution: Resolution) -> usize {
    format.plane_sizes(resolution).iter().sum()
}

/// Compressed formats the accelerator can decode.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum EncodedFormat {
    H263,
    H264,
    HEVC,
    MJPEG,
    MPEG2,
    MPEG4,
    VC1,
    VP8,
    VP9,
    AVS,
    AVS2,
    AV1,
}

impl EncodedFormat {
    /// Whether the accelerator expects exactly one frame per submitted buffer for this format,
    /// rather than an arbitrarily split elementary stream.
    pub fn is_frame_based(&self) -> bool {
        matches!(
            self,
            EncodedFormat::VP8 | EncodedFormat::VP9 | EncodedFormat::AV1
        )
    }
}

impl FromStr for EncodedFormat {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "h263" => Ok(EncodedFormat::H263),
            "h264" => Ok(EncodedFormat::H264),
            "hevc" | "h265" => Ok(EncodedFormat::HEVC),
            "mjpeg" | "jpeg" => Ok(EncodedFormat::MJPEG),
            "mpeg2" | "mpeg2video" => Ok(EncodedFormat::MPEG2),
            "mpeg4" => Ok(EncodedFormat::MPEG4),
            "vc1" => Ok(EncodedFormat::VC1),
            "vp8" => Ok(EncodedFormat::VP8),
            "vp9" => Ok(EncodedFormat::VP9),
            "avs" => Ok(EncodedFormat::AVS),
            "avs2" => Ok(EncodedFormat::AVS2),
            "av1" => Ok(EncodedFormat::AV1),
            _ => Err("unrecognized input format. Valid values: h263, h264, hevc, mjpeg, mpeg2, mpeg4, vc1, vp8, vp9, avs, avs2, av1"),
        }
    }
}

/// Matrix coefficients of a decoded frame.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ColorMatrix {
    #[default]
    Unspecified,
    Rgb,
    Bt709,
    Bt470bg,
    Smpte170m,
    Bt2020Ncl,
    Bt2020Cl,
}

/// Sample range of a decoded frame.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum ColorRange {
    #[default]
    Unspecified,
    Limited,
    Full,
}
