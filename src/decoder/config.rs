// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decoder options and their validation against the device capabilities.
//!
//! Everything here is checked before any device resource is allocated, so a rejected
//! configuration never leaves a half-created session behind.

use bytes::Bytes;
use thiserror::Error;

use crate::backend::wire::Capabilities;
use crate::backend::wire::CreateInfo;
use crate::backend::wire::Downscale;
use crate::backend::wire::DownscaleMode;
use crate::backend::wire::FrameSampling;
use crate::backend::wire::PostProcessing;
use crate::backend::wire::Rotation;
use crate::backend::wire::RunMode;
use crate::backend::wire::SendMode;
use crate::backend::wire::SessionParams;
use crate::backoff::Backoff;
use crate::memory::stream_buffer_size;
use crate::translation::wire_color_space;
use crate::translation::wire_pixel_format;
use crate::utils::Timebase;
use crate::DecodedFormat;
use crate::EncodedFormat;
use crate::Rect;
use crate::Resolution;

pub const MAX_DEVICE_ID: u32 = 32;
pub const MAX_HW_ID: u32 = 100;
pub const MAX_SWITCH_FRAMES: u32 = 500;
pub const MAX_BUF_NUM: u32 = 100;
/// Smallest crop extent accepted by the device, on both axes.
pub const MIN_CROP_SIZE: u32 = 8;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{option} is {value}, must be between {min} and {max}")]
    OutOfRange {
        option: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },
    #[error("{0:?} decoding is not supported by the device")]
    UnsupportedCodec(EncodedFormat),
    #[error("{requested:?} is outside of the supported {min:?} - {max:?} range")]
    DimensionsOutOfRange {
        requested: Resolution,
        min: Resolution,
        max: Resolution,
    },
    #[error("invalid crop rectangle {0:?}")]
    InvalidCrop(Rect),
    #[error("crop and rotation cannot be used together")]
    CropWithRotation,
    #[error("crop and resize cannot be used together")]
    CropWithResize,
    #[error("invalid resize to {0:?}, only downscaling is supported")]
    InvalidResize(Resolution),
    #[error("invalid rotation of {0} degrees, only 90, 180 and 270 are supported")]
    InvalidRotation(u32),
    #[error("frame sampling interval and IDR sampling cannot be used together")]
    ConflictingSampling,
    #[error("output format {0:?} is not supported by the device")]
    UnsupportedOutputFormat(DecodedFormat),
}

/// Target of the accelerator's downscaler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Resize {
    pub resolution: Resolution,
    pub mode: DownscaleMode,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameSamplingOptions {
    /// Keep one frame every `interval` frames, 0 to disable.
    pub interval: u32,
    /// Keep IDR frames only.
    pub idr_only: bool,
}

/// Options of a decoder instance.
#[derive(Clone, Debug)]
pub struct DecoderOptions {
    /// Accelerator card to use.
    pub card_id: u32,
    /// Device on the card to use.
    pub device_id: u32,
    /// Hardware context of the device.
    pub hw_id: u32,
    /// Overrides the input width and height reported by the stream, if both are non-zero.
    pub in_width: u32,
    pub in_height: u32,
    /// Frames decoded before switching hardware contexts, 0 to never switch.
    pub sf: u32,
    pub output_buf_num: u32,
    pub input_buf_num: u32,
    /// Hand out the accelerator's buffers instead of copies of them.
    pub zero_copy: bool,
    pub output_pixfmt: String,
    /// One of bt601, bt709 and bt2020, with an `f` suffix for full range.
    pub color_space: String,
    pub crop: Option<Rect>,
    pub resize: Option<Resize>,
    /// Rotation in degrees.
    pub rotation: Option<u32>,
    pub sampling: Option<FrameSamplingOptions>,
    /// Receive frames through the session callback instead of polling for them.
    pub async_callback: bool,
    pub backoff: Backoff,
    /// Frames queued beyond which the decoder stops pulling frames while waiting on a busy
    /// device.
    pub ready_queue_capacity: usize,
    /// Time base of the packet timestamps.
    pub pkt_timebase: Option<Timebase>,
}

impl Default for DecoderOptions {
    fn default() -> Self {
        Self {
            card_id: 0,
            device_id: 0,
            hw_id: 15,
            in_width: 0,
            in_height: 0,
            sf: 0,
            output_buf_num: 8,
            input_buf_num: 8,
            zero_copy: true,
            output_pixfmt: "yuv420p".into(),
            color_space: "bt601".into(),
            crop: None,
            resize: None,
            rotation: None,
            sampling: None,
            async_callback: false,
            backoff: Default::default(),
            ready_queue_capacity: 8,
            pkt_timebase: None,
        }
    }
}

/// Field order of the stream, as reported by the demuxer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FieldOrder {
    /// Treated as progressive.
    #[default]
    Unknown,
    Progressive,
    TopFirst,
    BottomFirst,
    TopCodedBottomFirst,
    BottomCodedTopFirst,
}

impl FieldOrder {
    pub fn is_interlaced(&self) -> bool {
        !matches!(self, FieldOrder::Unknown | FieldOrder::Progressive)
    }
}

/// Parameters of the stream to decode.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamParams {
    pub codec: EncodedFormat,
    /// Coded size, if known.
    pub coded_resolution: Resolution,
    /// Display size, used when the coded size is unknown.
    pub display_resolution: Resolution,
    /// Out-of-band codec headers, submitted once before the first packet.
    pub extradata: Bytes,
    pub field_order: FieldOrder,
}

impl StreamParams {
    pub fn new(codec: EncodedFormat, resolution: Resolution) -> Self {
        Self {
            codec,
            coded_resolution: resolution,
            display_resolution: resolution,
            extradata: Bytes::new(),
            field_order: FieldOrder::Unknown,
        }
    }
}

/// A validated configuration, ready to create a session from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedConfig {
    pub input_resolution: Resolution,
    pub output_resolution: Resolution,
    pub output_format: DecodedFormat,
    pub stream_buffer_size: usize,
    pub create_info: CreateInfo,
    pub params: SessionParams,
}

fn check_range(option: &'static str, value: u32, min: u32, max: u32) -> Result<(), ConfigError> {
    if value < min || value > max {
        Err(ConfigError::OutOfRange {
            option,
            value,
            min,
            max,
        })
    } else {
        Ok(())
    }
}

/// Validates `options` for `stream` on a device with capabilities `caps`.
pub fn resolve(
    stream: &StreamParams,
    options: &DecoderOptions,
    caps: &Capabilities,
) -> Result<ResolvedConfig, ConfigError> {
    check_range("card_id", options.card_id, 0, MAX_DEVICE_ID)?;
    check_range("device_id", options.device_id, 0, MAX_DEVICE_ID)?;
    check_range("hw_id", options.hw_id, 0, MAX_HW_ID)?;
    check_range("sf", options.sf, 0, MAX_SWITCH_FRAMES)?;
    check_range("output_buf_num", options.output_buf_num, 0, MAX_BUF_NUM)?;
    check_range("input_buf_num", options.input_buf_num, 0, MAX_BUF_NUM)?;

    if !caps.supported {
        return Err(ConfigError::UnsupportedCodec(stream.codec));
    }

    let output_format = match options.output_pixfmt.parse::<DecodedFormat>() {
        Ok(format) => format,
        Err(e) => {
            log::warn!("{}: {:?}, using yuv420p", e, options.output_pixfmt);
            DecodedFormat::I420
        }
    };
    let pixel_format = wire_pixel_format(output_format);
    if !caps.output_formats.is_empty() && !caps.output_formats.contains(&pixel_format) {
        return Err(ConfigError::UnsupportedOutputFormat(output_format));
    }

    let input_resolution = if options.in_width > 0 && options.in_height > 0 {
        Resolution::from((options.in_width, options.in_height))
    } else if !stream.coded_resolution.is_empty() {
        stream.coded_resolution
    } else if !stream.display_resolution.is_empty() {
        stream.display_resolution
    } else {
        caps.max_resolution
    };
    log::debug!("input resolution {:?}", input_resolution);

    if !caps.max_resolution.can_contain(input_resolution)
        || !input_resolution.can_contain(caps.min_resolution)
    {
        return Err(ConfigError::DimensionsOutOfRange {
            requested: input_resolution,
            min: caps.min_resolution,
            max: caps.max_resolution,
        });
    }

    if options.crop.is_some() && options.rotation.is_some() {
        return Err(ConfigError::CropWithRotation);
    }
    if options.crop.is_some() && options.resize.is_some() {
        return Err(ConfigError::CropWithResize);
    }

    let mut output_resolution = input_resolution;

    if let Some(crop) = options.crop {
        if crop.right > input_resolution.width
            || crop.bottom > input_resolution.height
            || crop.left >= crop.right
            || crop.top >= crop.bottom
            || crop.width() < MIN_CROP_SIZE
            || crop.height() < MIN_CROP_SIZE
        {
            return Err(ConfigError::InvalidCrop(crop));
        }
        output_resolution = crop.resolution();
    }

    let downscale = match options.resize {
        Some(resize) => {
            if resize.resolution.is_empty() || !input_resolution.can_contain(resize.resolution) {
                return Err(ConfigError::InvalidResize(resize.resolution));
            }
            output_resolution = resize.resolution;
            Some(Downscale {
                resolution: resize.resolution,
                mode: resize.mode,
            })
        }
        None => None,
    };

    let rotation = match options.rotation {
        Some(degrees) => {
            let rotation =
                Rotation::from_degrees(degrees).ok_or(ConfigError::InvalidRotation(degrees))?;
            if rotation.swaps_dimensions() {
                output_resolution = output_resolution.transposed();
            }
            Some(rotation)
        }
        None => None,
    };

    let sampling = match options.sampling {
        Some(FrameSamplingOptions {
            interval,
            idr_only: true,
        }) if interval != 0 => return Err(ConfigError::ConflictingSampling),
        Some(FrameSamplingOptions { interval, .. }) if interval != 0 => {
            Some(FrameSampling::Interval(interval))
        }
        Some(FrameSamplingOptions { idr_only: true, .. }) => Some(FrameSampling::IdrOnly),
        Some(_) => {
            log::warn!("frame sampling enabled without interval nor IDR sampling, ignoring");
            None
        }
        None => None,
    };

    let stream_buffer_size = stream_buffer_size(input_resolution);

    Ok(ResolvedConfig {
        input_resolution,
        output_resolution,
        output_format,
        stream_buffer_size,
        create_info: CreateInfo {
            card_id: options.card_id,
            device_id: options.device_id,
            hw_ctx_id: options.hw_id,
            codec: stream.codec,
            stream_buf_size: stream_buffer_size as u32,
            run_mode: RunMode::Async,
            send_mode: if stream.codec.is_frame_based() {
                SendMode::Frame
            } else {
                SendMode::Stream
            },
            switch_frames: options.sf,
        },
        params: SessionParams {
            pixel_format,
            color_space: wire_color_space(&options.color_space),
            output_buf_num: options.output_buf_num,
            input_buf_num: options.input_buf_num,
            post_processing: PostProcessing {
                downscale,
                crop: options.crop,
                rotation,
                sampling,
            },
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::wire::WireColorSpace;
    use crate::backend::wire::WirePixelFormat;

    fn caps() -> Capabilities {
        Capabilities {
            supported: true,
            max_resolution: Resolution::from((4096, 2304)),
            min_resolution: Resolution::from((64, 64)),
            output_formats: vec![],
        }
    }

    fn stream() -> StreamParams {
        StreamParams::new(EncodedFormat::H264, Resolution::from((1920, 1080)))
    }

    fn crop(left: u32, top: u32, right: u32, bottom: u32) -> Option<Rect> {
        Some(Rect {
            left,
            top,
            right,
            bottom,
        })
    }

    #[test]
    fn defaults() {
        let config = resolve(&stream(), &Default::default(), &caps()).unwrap();

        assert_eq!(config.input_resolution, Resolution::from((1920, 1080)));
        assert_eq!(config.output_resolution, config.input_resolution);
        assert_eq!(config.output_format, DecodedFormat::I420);
        assert_eq!(config.stream_buffer_size, 2592768);
        assert_eq!(config.create_info.hw_ctx_id, 15);
        assert_eq!(config.create_info.send_mode, SendMode::Stream);
        assert_eq!(config.create_info.run_mode, RunMode::Async);
        assert_eq!(config.params.pixel_format, WirePixelFormat::I420);
        assert_eq!(config.params.color_space, WireColorSpace::Bt601);
        assert_eq!(config.params.output_buf_num, 8);
        assert_eq!(config.params.post_processing, PostProcessing::default());
    }

    #[test]
    fn frame_based_send_mode() {
        let mut stream = stream();
        stream.codec = EncodedFormat::VP9;
        let config = resolve(&stream, &Default::default(), &caps()).unwrap();
        assert_eq!(config.create_info.send_mode, SendMode::Frame);
    }

    #[test]
    fn probed_resolution_fallbacks() {
        let mut stream = stream();
        stream.coded_resolution = Resolution::default();
        stream.display_resolution = Resolution::from((640, 480));
        let config = resolve(&stream, &Default::default(), &caps()).unwrap();
        assert_eq!(config.input_resolution, Resolution::from((640, 480)));

        stream.display_resolution = Resolution::default();
        let config = resolve(&stream, &Default::default(), &caps()).unwrap();
        assert_eq!(config.input_resolution, caps().max_resolution);

        let options = DecoderOptions {
            in_width: 720,
            in_height: 576,
            ..Default::default()
        };
        let config = resolve(&stream, &options, &caps()).unwrap();
        assert_eq!(config.input_resolution, Resolution::from((720, 576)));
    }

    #[test]
    fn dimensions_out_of_caps() {
        let mut stream = stream();
        stream.coded_resolution = Resolution::from((8192, 1080));
        assert!(matches!(
            resolve(&stream, &Default::default(), &caps()),
            Err(ConfigError::DimensionsOutOfRange { .. })
        ));

        stream.coded_resolution = Resolution::from((32, 32));
        assert!(matches!(
            resolve(&stream, &Default::default(), &caps()),
            Err(ConfigError::DimensionsOutOfRange { .. })
        ));
    }

    #[test]
    fn unsupported_codec() {
        let caps = Capabilities {
            supported: false,
            ..caps()
        };
        assert_eq!(
            resolve(&stream(), &Default::default(), &caps),
            Err(ConfigError::UnsupportedCodec(EncodedFormat::H264))
        );
    }

    #[test]
    fn option_ranges() {
        let options = DecoderOptions {
            card_id: 33,
            ..Default::default()
        };
        assert!(matches!(
            resolve(&stream(), &options, &caps()),
            Err(ConfigError::OutOfRange {
                option: "card_id",
                ..
            })
        ));

        let options = DecoderOptions {
            sf: 501,
            ..Default::default()
        };
        assert!(matches!(
            resolve(&stream(), &options, &caps()),
            Err(ConfigError::OutOfRange { option: "sf", .. })
        ));
    }

    #[test]
    fn crop_validation() {
        let options = DecoderOptions {
            crop: crop(16, 8, 336, 248),
            ..Default::default()
        };
        let config = resolve(&stream(), &options, &caps()).unwrap();
        assert_eq!(config.output_resolution, Resolution::from((320, 240)));
        assert_eq!(config.params.post_processing.crop, options.crop);

        // Too narrow.
        let options = DecoderOptions {
            crop: crop(0, 0, 7, 100),
            ..Default::default()
        };
        assert!(matches!(
            resolve(&stream(), &options, &caps()),
            Err(ConfigError::InvalidCrop(_))
        ));

        // Too short.
        let options = DecoderOptions {
            crop: crop(0, 100, 100, 107),
            ..Default::default()
        };
        assert!(matches!(
            resolve(&stream(), &options, &caps()),
            Err(ConfigError::InvalidCrop(_))
        ));

        // Outside of the picture.
        let options = DecoderOptions {
            crop: crop(0, 0, 1921, 100),
            ..Default::default()
        };
        assert!(matches!(
            resolve(&stream(), &options, &caps()),
            Err(ConfigError::InvalidCrop(_))
        ));

        // Inverted.
        let options = DecoderOptions {
            crop: crop(100, 0, 50, 100),
            ..Default::default()
        };
        assert!(matches!(
            resolve(&stream(), &options, &caps()),
            Err(ConfigError::InvalidCrop(_))
        ));
    }

    #[test]
    fn conflicting_post_processing() {
        let options = DecoderOptions {
            crop: crop(0, 0, 64, 64),
            rotation: Some(90),
            ..Default::default()
        };
        assert_eq!(
            resolve(&stream(), &options, &caps()),
            Err(ConfigError::CropWithRotation)
        );

        let options = DecoderOptions {
            crop: crop(0, 0, 64, 64),
            resize: Some(Resize {
                resolution: Resolution::from((32, 32)),
                mode: DownscaleMode::Bilinear,
            }),
            ..Default::default()
        };
        assert_eq!(
            resolve(&stream(), &options, &caps()),
            Err(ConfigError::CropWithResize)
        );

        let options = DecoderOptions {
            sampling: Some(FrameSamplingOptions {
                interval: 3,
                idr_only: true,
            }),
            ..Default::default()
        };
        assert_eq!(
            resolve(&stream(), &options, &caps()),
            Err(ConfigError::ConflictingSampling)
        );
    }

    #[test]
    fn resize_and_rotation() {
        let options = DecoderOptions {
            resize: Some(Resize {
                resolution: Resolution::from((960, 540)),
                mode: DownscaleMode::Nearest,
            }),
            rotation: Some(270),
            ..Default::default()
        };
        let config = resolve(&stream(), &options, &caps()).unwrap();
        assert_eq!(config.output_resolution, Resolution::from((540, 960)));
        let pp = &config.params.post_processing;
        assert_eq!(pp.rotation, Some(Rotation::Rotate270));
        assert_eq!(
            pp.downscale.map(|d| d.mode),
            Some(DownscaleMode::Nearest)
        );

        let options = DecoderOptions {
            rotation: Some(180),
            ..Default::default()
        };
        let config = resolve(&stream(), &options, &caps()).unwrap();
        assert_eq!(config.output_resolution, Resolution::from((1920, 1080)));

        let options = DecoderOptions {
            rotation: Some(45),
            ..Default::default()
        };
        assert_eq!(
            resolve(&stream(), &options, &caps()),
            Err(ConfigError::InvalidRotation(45))
        );

        // Upscaling.
        let options = DecoderOptions {
            resize: Some(Resize {
                resolution: Resolution::from((3840, 2160)),
                mode: DownscaleMode::Bilinear,
            }),
            ..Default::default()
        };
        assert!(matches!(
            resolve(&stream(), &options, &caps()),
            Err(ConfigError::InvalidResize(_))
        ));
    }

    #[test]
    fn sampling() {
        let options = DecoderOptions {
            sampling: Some(FrameSamplingOptions {
                interval: 0,
                idr_only: true,
            }),
            ..Default::default()
        };
        let config = resolve(&stream(), &options, &caps()).unwrap();
        assert_eq!(
            config.params.post_processing.sampling,
            Some(FrameSampling::IdrOnly)
        );

        let options = DecoderOptions {
            sampling: Some(FrameSamplingOptions {
                interval: 5,
                idr_only: false,
            }),
            ..Default::default()
        };
        let config = resolve(&stream(), &options, &caps()).unwrap();
        assert_eq!(
            config.params.post_processing.sampling,
            Some(FrameSampling::Interval(5))
        );
    }

    #[test]
    fn output_format() {
        let options = DecoderOptions {
            output_pixfmt: "nv12".into(),
            color_space: "bt709f".into(),
            ..Default::default()
        };
        let config = resolve(&stream(), &options, &caps()).unwrap();
        assert_eq!(config.output_format, DecodedFormat::NV12);
        assert_eq!(config.params.pixel_format, WirePixelFormat::Nv12);
        assert_eq!(config.params.color_space, WireColorSpace::Bt709Er);

        // Unknown names fall back to the defaults.
        let options = DecoderOptions {
            output_pixfmt: "yuyv422".into(),
            ..Default::default()
        };
        let config = resolve(&stream(), &options, &caps()).unwrap();
        assert_eq!(config.output_format, DecodedFormat::I420);

        let caps = Capabilities {
            output_formats: vec![WirePixelFormat::Nv12],
            ..caps()
        };
        assert_eq!(
            resolve(&stream(), &Default::default(), &caps),
            Err(ConfigError::UnsupportedOutputFormat(DecodedFormat::I420))
        );
    }
}
