// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Backend driving the accelerator through the vendor's `libtopscodec` and `libtopsrt`
//! libraries.
//!
//! Both libraries are opened at runtime, once per process: every backend shares the same
//! [`TopsLibrary`], which is unloaded when the last backend and session using it are gone.

use std::ffi::c_void;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;

use anyhow::anyhow;
use enumn::N;
use libloading::Library;

use crate::backend::wire::Capabilities;
use crate::backend::wire::CreateInfo;
use crate::backend::wire::FrameSampling;
use crate::backend::wire::LibVersion;
use crate::backend::wire::PictureType;
use crate::backend::wire::Rotation;
use crate::backend::wire::RunMode;
use crate::backend::wire::SendMode;
use crate::backend::wire::SessionParams;
use crate::backend::wire::WireColorSpace;
use crate::backend::wire::WireFrame;
use crate::backend::wire::WirePixelFormat;
use crate::backend::wire::WirePlane;
use crate::backend::wire::WireStream;
use crate::backend::BackendError;
use crate::backend::BackendResult;
use crate::backend::DecoderBackend;
use crate::backend::DecoderSession;
use crate::backend::DeviceMemory;
use crate::backend::EventSink;
use crate::backend::FatalEvent;
use crate::backend::MemoryKind;
use crate::backend::SessionEvent;
use crate::backend::Transfer;
use crate::EncodedFormat;
use crate::Resolution;

const CODEC_LIBRARY: &str = "libtopscodec.so";
const RUNTIME_LIBRARY: &str = "libtopsrt.so";

const TOPS_SUCCESS: i32 = 0;
const TOPS_MALLOC_HOST_ACCESSIBLE: u32 = 0x1;

const TOPSCODEC_SUCCESS: i32 = 0;
const TOPSCODEC_ERROR_TIMEOUT: i32 = 5;
const TOPSCODEC_ERROR_BUFFER_EMPTY: i32 = 6;

/// Frame sampling value selecting IDR frames only.
const SF_IDR_MAGIC: u32 = 16384;
const SWITCH_FRAMES_MODE: u32 = 1;
const MAX_PLANES: usize = 3;

/// Events passed to the frame callback.
#[derive(N, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
enum RawEvent {
    FrameReady = 0,
    OutOfMemory = 1,
    StreamCorrupt = 2,
    StreamNotSupported = 3,
    BufferOverflow = 4,
    Fatal = 5,
}

type FrameCallback =
    unsafe extern "C" fn(user_data: *mut c_void, event: u32, frame: *const RawFrame) -> i32;

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
struct RawCaps {
    supported: u32,
    max_width: u32,
    max_height: u32,
    min_width: u32,
    min_height: u32,
    /// Bit `n` is set if pixel format `n` can be produced.
    output_pixel_format_mask: u64,
}

// Written for the vendor library only.
#[allow(dead_code)]
#[repr(C)]
struct RawCreateInfo {
    device_id: u32,
    session_id: u32,
    hw_ctx_id: u32,
    codec: u32,
    stream_buf_size: u32,
    run_mode: u32,
    send_mode: u32,
    frame_callback: Option<FrameCallback>,
    user_data: *mut c_void,
    reserved: [u32; 16],
}

#[allow(dead_code)]
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
struct RawDownscale {
    enable: u32,
    width: u32,
    height: u32,
    inter_dsl_mode: u32,
}

#[allow(dead_code)]
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
struct RawCrop {
    enable: u32,
    tl_x: u32,
    tl_y: u32,
    br_x: u32,
    br_y: u32,
}

#[allow(dead_code)]
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
struct RawRotation {
    enable: u32,
    rotation: u32,
}

#[allow(dead_code)]
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
struct RawSampling {
    enable: u32,
    sfo: u32,
    sf_idr: u32,
}

#[allow(dead_code)]
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
struct RawPpAttr {
    downscale: RawDownscale,
    crop: RawCrop,
    rotation: RawRotation,
    sf: RawSampling,
}

#[allow(dead_code)]
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
struct RawParams {
    pixel_format: u32,
    color_space: u32,
    output_buf_num: u32,
    pp_attr: RawPpAttr,
    /// `reserved[4]` holds the number of input buffers.
    reserved: [u32; 8],
}

#[allow(dead_code)]
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
struct RawStream {
    mem_addr: u64,
    alloc_len: u32,
    data_offset: u32,
    data_len: u32,
    pts: u64,
    stream_type: u32,
    mem_type: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
struct RawPlane {
    dev_addr: u64,
    stride: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
struct RawFrame {
    pixel_format: u32,
    color_space: u32,
    width: u32,
    height: u32,
    pic_type: u32,
    pts: u64,
    plane_num: u32,
    plane: [RawPlane; MAX_PLANES],
    /// Opaque handle of the output buffer, to be passed back on unmap.
    private_data: u64,
}

#[allow(dead_code)]
#[repr(C)]
struct RawPointerAttribute {
    memory_type: u32,
    device: i32,
    device_pointer: *mut c_void,
    host_pointer: *mut c_void,
    is_managed: i32,
    allocation_flags: u32,
}

impl Default for RawPointerAttribute {
    fn default() -> Self {
        Self {
            memory_type: 0,
            device: 0,
            device_pointer: std::ptr::null_mut(),
            host_pointer: std::ptr::null_mut(),
            is_managed: 0,
            allocation_flags: 0,
        }
    }
}

fn codec_id(codec: EncodedFormat) -> u32 {
    match codec {
        EncodedFormat::H263 => 0,
        EncodedFormat::H264 => 1,
        EncodedFormat::HEVC => 2,
        EncodedFormat::MJPEG => 3,
        EncodedFormat::MPEG2 => 4,
        EncodedFormat::MPEG4 => 5,
        EncodedFormat::VC1 => 6,
        EncodedFormat::VP8 => 7,
        EncodedFormat::VP9 => 8,
        EncodedFormat::AVS => 9,
        EncodedFormat::AVS2 => 10,
        EncodedFormat::AV1 => 11,
    }
}

impl From<RawCaps> for Capabilities {
    fn from(raw: RawCaps) -> Self {
        Capabilities {
            supported: raw.supported != 0,
            max_resolution: Resolution::from((raw.max_width, raw.max_height)),
            min_resolution: Resolution::from((raw.min_width, raw.min_height)),
            output_formats: (0..64)
                .filter(|bit| raw.output_pixel_format_mask & (1u64 << bit) != 0)
                .filter_map(WirePixelFormat::n)
                .collect(),
        }
    }
}

impl From<&SessionParams> for RawParams {
    fn from(params: &SessionParams) -> Self {
        let pp = &params.post_processing;
        let mut raw = RawParams {
            pixel_format: params.pixel_format as u32,
            color_space: params.color_space as u32,
            output_buf_num: params.output_buf_num,
            ..Default::default()
        };
        raw.reserved[4] = params.input_buf_num;

        if let Some(downscale) = pp.downscale {
            raw.pp_attr.downscale = RawDownscale {
                enable: 1,
                width: downscale.resolution.width,
                height: downscale.resolution.height,
                inter_dsl_mode: downscale.mode as u32,
            };
        }
        if let Some(crop) = pp.crop {
            raw.pp_attr.crop = RawCrop {
                enable: 1,
                tl_x: crop.left,
                tl_y: crop.top,
                br_x: crop.right,
                br_y: crop.bottom,
            };
        }
        if let Some(rotation) = pp.rotation {
            raw.pp_attr.rotation = RawRotation {
                enable: 1,
                rotation: match rotation {
                    Rotation::Rotate90 => 1,
                    Rotation::Rotate180 => 2,
                    Rotation::Rotate270 => 3,
                },
            };
        }
        match pp.sampling {
            Some(FrameSampling::Interval(sfo)) => {
                raw.pp_attr.sf = RawSampling {
                    enable: 1,
                    sfo,
                    sf_idr: 0,
                }
            }
            Some(FrameSampling::IdrOnly) => {
                raw.pp_attr.sf = RawSampling {
                    enable: 1,
                    sfo: 0,
                    sf_idr: SF_IDR_MAGIC,
                }
            }
            None => (),
        }

        raw
    }
}

impl From<&WireStream> for RawStream {
    fn from(stream: &WireStream) -> Self {
        RawStream {
            mem_addr: stream.mem_addr,
            alloc_len: stream.alloc_len,
            data_offset: stream.data_offset,
            data_len: stream.data_len,
            pts: stream.pts,
            stream_type: stream.stream_type as u32,
            mem_type: stream.mem_type as u32,
        }
    }
}

impl From<&RawFrame> for WireFrame {
    fn from(raw: &RawFrame) -> Self {
        let plane_num = (raw.plane_num as usize).min(MAX_PLANES);
        if plane_num < raw.plane_num as usize {
            log::warn!("frame reports {} planes, keeping {}", raw.plane_num, plane_num);
        }

        WireFrame {
            id: raw.private_data,
            width: raw.width,
            height: raw.height,
            pixel_format: WirePixelFormat::n(raw.pixel_format).unwrap_or_else(|| {
                log::warn!("unknown pixel format {}", raw.pixel_format);
                Default::default()
            }),
            color_space: WireColorSpace::n(raw.color_space).unwrap_or_default(),
            pic_type: PictureType::n(raw.pic_type).unwrap_or_default(),
            pts: raw.pts,
            planes: raw.plane[..plane_num]
                .iter()
                .map(|p| WirePlane {
                    dev_addr: p.dev_addr,
                    stride: p.stride,
                })
                .collect(),
        }
    }
}

impl From<&WireFrame> for RawFrame {
    fn from(frame: &WireFrame) -> Self {
        let mut raw = RawFrame {
            pixel_format: frame.pixel_format as u32,
            color_space: frame.color_space as u32,
            width: frame.width,
            height: frame.height,
            pic_type: frame.pic_type as u32,
            pts: frame.pts,
            plane_num: frame.planes.len().min(MAX_PLANES) as u32,
            private_data: frame.id,
            ..Default::default()
        };
        for (raw_plane, plane) in raw.plane.iter_mut().zip(&frame.planes) {
            *raw_plane = RawPlane {
                dev_addr: plane.dev_addr,
                stride: plane.stride,
            };
        }

        raw
    }
}

fn check(call: &'static str, code: i32) -> BackendResult<()> {
    if code == TOPS_SUCCESS {
        Ok(())
    } else {
        Err(BackendError::Status { call, code })
    }
}

struct Functions {
    get_lib_version: unsafe extern "C" fn(*mut u32, *mut u32, *mut u32) -> i32,
    dec_get_caps: unsafe extern "C" fn(u32, u32, u32, *mut RawCaps) -> i32,
    dec_create: unsafe extern "C" fn(*mut u64, *const RawCreateInfo) -> i32,
    dec_set_params: unsafe extern "C" fn(u64, *const RawParams) -> i32,
    decode_stream: unsafe extern "C" fn(u64, *const RawStream, i32) -> i32,
    dec_frame_map: unsafe extern "C" fn(u64, *mut RawFrame) -> i32,
    dec_frame_unmap: unsafe extern "C" fn(u64, *const RawFrame) -> i32,
    dec_destroy: unsafe extern "C" fn(u64) -> i32,
    set_device: unsafe extern "C" fn(i32) -> i32,
    ext_malloc_with_flags: unsafe extern "C" fn(*mut *mut c_void, usize, u32) -> i32,
    malloc: unsafe extern "C" fn(*mut *mut c_void, usize) -> i32,
    free: unsafe extern "C" fn(*mut c_void) -> i32,
    pointer_get_attributes: unsafe extern "C" fn(*mut RawPointerAttribute, *const c_void) -> i32,
    memcpy_htod: unsafe extern "C" fn(u64, *const c_void, usize) -> i32,
    memcpy_dtod: unsafe extern "C" fn(u64, u64, usize) -> i32,
    memcpy_dtoh: unsafe extern "C" fn(*mut c_void, u64, usize) -> i32,
}

/// Looks up `name` in `lib` and copies the function pointer out of it.
///
/// # Safety
///
/// `T` must match the signature of the symbol, and the pointer must not be used after `lib` is
/// unloaded.
unsafe fn symbol<T: Copy>(lib: &Library, name: &'static str) -> BackendResult<T> {
    let cname = format!("{}\0", name);
    match lib.get::<T>(cname.as_bytes()) {
        Ok(sym) => Ok(*sym),
        Err(e) => {
            log::error!("failed to resolve {}: {}", name, e);
            Err(BackendError::MissingSymbol(name))
        }
    }
}

fn open(name: &str) -> BackendResult<Library> {
    // SAFETY: the vendor libraries do not run initialization code with preconditions.
    unsafe { Library::new(name) }.map_err(|e| {
        log::error!("failed to load {}: {}", name, e);
        BackendError::Other(anyhow!("cannot load {}: {}", name, e))
    })
}

static LIBRARY: Mutex<Weak<TopsLibrary>> = Mutex::new(Weak::new());

/// The vendor libraries and the functions resolved from them.
pub struct TopsLibrary {
    fns: Functions,
    // Dropped after `fns`, which points into them.
    _codec: Library,
    _runtime: Library,
}

impl TopsLibrary {
    /// Returns the process-wide library instance, loading it if no one holds it.
    pub fn acquire() -> BackendResult<Arc<Self>> {
        let mut slot = LIBRARY.lock().unwrap();
        if let Some(lib) = slot.upgrade() {
            return Ok(lib);
        }

        let lib = Arc::new(Self::load()?);
        *slot = Arc::downgrade(&lib);
        log::debug!("loaded {} and {}", CODEC_LIBRARY, RUNTIME_LIBRARY);

        Ok(lib)
    }

    fn load() -> BackendResult<Self> {
        let codec = open(CODEC_LIBRARY)?;
        let runtime = open(RUNTIME_LIBRARY)?;

        // SAFETY: the signatures match the vendor headers, and `fns` never outlives the
        // libraries it is resolved from.
        let fns = unsafe {
            Functions {
                get_lib_version: symbol(&codec, "topscodecGetLibVersion")?,
                dec_get_caps: symbol(&codec, "topscodecDecGetCaps")?,
                dec_create: symbol(&codec, "topscodecDecCreate")?,
                dec_set_params: symbol(&codec, "topscodecDecSetParams")?,
                decode_stream: symbol(&codec, "topscodecDecodeStream")?,
                dec_frame_map: symbol(&codec, "topscodecDecFrameMap")?,
                dec_frame_unmap: symbol(&codec, "topscodecDecFrameUnMap")?,
                dec_destroy: symbol(&codec, "topscodecDecDestroy")?,
                set_device: symbol(&runtime, "topsSetDevice")?,
                ext_malloc_with_flags: symbol(&runtime, "topsExtMallocWithFlags")?,
                malloc: symbol(&runtime, "topsMalloc")?,
                free: symbol(&runtime, "topsFree")?,
                pointer_get_attributes: symbol(&runtime, "topsPointerGetAttributes")?,
                memcpy_htod: symbol(&runtime, "topsMemcpyHtoD")?,
                memcpy_dtod: symbol(&runtime, "topsMemcpyDtoD")?,
                memcpy_dtoh: symbol(&runtime, "topsMemcpyDtoH")?,
            }
        };

        Ok(Self {
            fns,
            _codec: codec,
            _runtime: runtime,
        })
    }
}

/// Device memory allocated through the vendor runtime.
pub struct TopsMemory {
    lib: Arc<TopsLibrary>,
}

impl DeviceMemory for TopsMemory {
    fn alloc(&self, size: usize, kind: MemoryKind) -> BackendResult<u64> {
        let mut ptr = std::ptr::null_mut();
        // SAFETY: `ptr` is a valid out pointer.
        let code = unsafe {
            match kind {
                MemoryKind::Device => (self.lib.fns.malloc)(&mut ptr, size),
                MemoryKind::HostAccessible => (self.lib.fns.ext_malloc_with_flags)(
                    &mut ptr,
                    size,
                    TOPS_MALLOC_HOST_ACCESSIBLE,
                ),
            }
        };
        check("topsMalloc", code)?;

        Ok(ptr as u64)
    }

    fn free(&self, addr: u64) -> BackendResult<()> {
        // SAFETY: `addr` was returned by `alloc` and is freed only once by its owner.
        check("topsFree", unsafe { (self.lib.fns.free)(addr as *mut c_void) })
    }

    fn device_pointer(&self, addr: u64) -> BackendResult<u64> {
        let mut attr = RawPointerAttribute::default();
        // SAFETY: `attr` is a valid out pointer.
        let code =
            unsafe { (self.lib.fns.pointer_get_attributes)(&mut attr, addr as *const c_void) };
        check("topsPointerGetAttributes", code)?;

        Ok(attr.device_pointer as u64)
    }

    fn copy(&self, transfer: Transfer<'_>) -> BackendResult<()> {
        let fns = &self.lib.fns;
        // SAFETY: host slices are valid for their length, and device addresses come from live
        // allocations that the caller checked are large enough.
        match transfer {
            Transfer::HostToDevice { dst, src } => check("topsMemcpyHtoD", unsafe {
                (fns.memcpy_htod)(dst, src.as_ptr() as *const c_void, src.len())
            }),
            Transfer::DeviceToDevice { dst, src, size } => {
                check("topsMemcpyDtoD", unsafe { (fns.memcpy_dtod)(dst, src, size) })
            }
            Transfer::DeviceToHost { dst, src } => check("topsMemcpyDtoH", unsafe {
                (fns.memcpy_dtoh)(dst.as_mut_ptr() as *mut c_void, src, dst.len())
            }),
        }
    }
}

/// Backend for one accelerator card.
pub struct TopsBackend {
    lib: Arc<TopsLibrary>,
    memory: Arc<TopsMemory>,
}

impl TopsBackend {
    /// Loads the vendor libraries if needed and selects `card_id` for the calling thread.
    pub fn new(card_id: u32) -> BackendResult<Self> {
        let lib = TopsLibrary::acquire()?;
        // SAFETY: plain value argument.
        check("topsSetDevice", unsafe {
            (lib.fns.set_device)(card_id as i32)
        })?;

        Ok(Self {
            memory: Arc::new(TopsMemory {
                lib: Arc::clone(&lib),
            }),
            lib,
        })
    }
}

impl DecoderBackend for TopsBackend {
    type Session = TopsSession;

    fn memory(&self) -> Arc<dyn DeviceMemory> {
        Arc::clone(&self.memory) as Arc<dyn DeviceMemory>
    }

    fn version(&self) -> BackendResult<LibVersion> {
        let mut version = LibVersion::default();
        // SAFETY: the three out pointers are valid.
        let code = unsafe {
            (self.lib.fns.get_lib_version)(
                &mut version.major,
                &mut version.minor,
                &mut version.patch,
            )
        };
        check("topscodecGetLibVersion", code)?;

        Ok(version)
    }

    fn capabilities(
        &self,
        codec: EncodedFormat,
        card_id: u32,
        device_id: u32,
    ) -> BackendResult<Capabilities> {
        let mut caps = RawCaps::default();
        // SAFETY: `caps` is a valid out pointer.
        let code =
            unsafe { (self.lib.fns.dec_get_caps)(codec_id(codec), card_id, device_id, &mut caps) };
        check("topscodecDecGetCaps", code)?;

        Ok(caps.into())
    }

    fn create_session(
        &self,
        info: &CreateInfo,
        events: Option<EventSink>,
    ) -> BackendResult<TopsSession> {
        let context = events.map(|sink| Box::new(CallbackContext { sink }));

        let mut raw = RawCreateInfo {
            device_id: info.card_id,
            session_id: info.device_id,
            hw_ctx_id: info.hw_ctx_id,
            codec: codec_id(info.codec),
            stream_buf_size: info.stream_buf_size,
            run_mode: match info.run_mode {
                RunMode::Async => 0,
                RunMode::Sync => 1,
            },
            send_mode: match info.send_mode {
                SendMode::Stream => 0,
                SendMode::Frame => 1,
            },
            frame_callback: None,
            user_data: std::ptr::null_mut(),
            reserved: [0; 16],
        };
        raw.reserved[9] = SWITCH_FRAMES_MODE;
        raw.reserved[10] = info.switch_frames;
        if let Some(context) = &context {
            raw.frame_callback = Some(on_session_event);
            raw.user_data = context.as_ref() as *const CallbackContext as *mut c_void;
        }

        let mut handle = 0u64;
        // SAFETY: `raw` and `handle` are valid for the call, and `user_data` stays alive until
        // the session is destroyed.
        let code = unsafe { (self.lib.fns.dec_create)(&mut handle, &raw) };
        if code != TOPSCODEC_SUCCESS {
            log::error!("topscodecDecCreate failed: {}", code);
            return Err(BackendError::Status {
                call: "topscodecDecCreate",
                code,
            });
        }
        log::debug!(
            "created session {:#x} on card {} device {} hw context {}",
            handle,
            info.card_id,
            info.device_id,
            info.hw_ctx_id
        );

        Ok(TopsSession {
            lib: Arc::clone(&self.lib),
            handle,
            call_lock: Mutex::new(()),
            _context: context,
        })
    }
}

struct CallbackContext {
    sink: EventSink,
}

unsafe extern "C" fn on_session_event(
    user_data: *mut c_void,
    event: u32,
    frame: *const RawFrame,
) -> i32 {
    if user_data.is_null() {
        return -1;
    }
    // SAFETY: `user_data` is the context registered with the session, which outlives it.
    let context = unsafe { &*(user_data as *const CallbackContext) };

    let event = match RawEvent::n(event) {
        // SAFETY: the frame is valid for the duration of the callback.
        Some(RawEvent::FrameReady) if !frame.is_null() => {
            SessionEvent::FrameReady(WireFrame::from(unsafe { &*frame }))
        }
        Some(RawEvent::FrameReady) => {
            log::warn!("frame event without a frame");
            return -1;
        }
        Some(RawEvent::OutOfMemory) => SessionEvent::Fatal(FatalEvent::OutOfMemory),
        Some(RawEvent::StreamCorrupt) => SessionEvent::Fatal(FatalEvent::StreamCorrupt),
        Some(RawEvent::StreamNotSupported) => SessionEvent::Fatal(FatalEvent::StreamNotSupported),
        Some(RawEvent::BufferOverflow) => SessionEvent::Fatal(FatalEvent::BufferOverflow),
        Some(RawEvent::Fatal) => SessionEvent::Fatal(FatalEvent::Fatal),
        None => {
            log::warn!("unknown session event {}", event);
            return -1;
        }
    };

    // Unwinding into the vendor thread is undefined behavior.
    match std::panic::catch_unwind(AssertUnwindSafe(|| (context.sink)(event))) {
        Ok(()) => TOPSCODEC_SUCCESS,
        Err(_) => {
            log::error!("session event handler panicked");
            -1
        }
    }
}

/// A decode session of the vendor library.
pub struct TopsSession {
    lib: Arc<TopsLibrary>,
    handle: u64,
    /// Serializes submissions and maps. Unmaps are not serialized, since the last reference to a
    /// frame may be dropped from within the event callback of a submission.
    call_lock: Mutex<()>,
    /// Passed as user data to the callback. Must outlive the session handle.
    _context: Option<Box<CallbackContext>>,
}

impl DecoderSession for TopsSession {
    fn set_params(&self, params: &SessionParams) -> BackendResult<()> {
        let raw = RawParams::from(params);
        let _guard = self.call_lock.lock().unwrap();
        // SAFETY: `raw` is valid for the call.
        let code = unsafe { (self.lib.fns.dec_set_params)(self.handle, &raw) };
        if code != TOPSCODEC_SUCCESS {
            log::error!("topscodecDecSetParams failed: {}", code);
        }
        check("topscodecDecSetParams", code)
    }

    fn decode_stream(&self, stream: &WireStream) -> BackendResult<()> {
        let raw = RawStream::from(stream);
        let _guard = self.call_lock.lock().unwrap();
        // SAFETY: `raw` is valid for the call. A zero timeout makes the call non-blocking.
        match unsafe { (self.lib.fns.decode_stream)(self.handle, &raw, 0) } {
            TOPSCODEC_SUCCESS => Ok(()),
            TOPSCODEC_ERROR_TIMEOUT => Err(BackendError::Busy),
            code => Err(BackendError::Status {
                call: "topscodecDecodeStream",
                code,
            }),
        }
    }

    fn map_frame(&self) -> BackendResult<WireFrame> {
        let mut raw = RawFrame::default();
        let _guard = self.call_lock.lock().unwrap();
        // SAFETY: `raw` is a valid out pointer.
        match unsafe { (self.lib.fns.dec_frame_map)(self.handle, &mut raw) } {
            TOPSCODEC_SUCCESS => Ok(WireFrame::from(&raw)),
            TOPSCODEC_ERROR_BUFFER_EMPTY => Err(BackendError::BufferEmpty),
            code => Err(BackendError::Status {
                call: "topscodecDecFrameMap",
                code,
            }),
        }
    }

    fn unmap_frame(&self, frame: &WireFrame) -> BackendResult<()> {
        let raw = RawFrame::from(frame);
        // SAFETY: `raw` describes a frame mapped from this session.
        let code = unsafe { (self.lib.fns.dec_frame_unmap)(self.handle, &raw) };
        check("topscodecDecFrameUnMap", code)
    }
}

impl Drop for TopsSession {
    fn drop(&mut self) {
        // SAFETY: the handle is valid and not used after this point. The callback context is
        // dropped after the session is destroyed. The last reference is never released from the
        // callback, since the frame source is closed before the session is dropped.
        let code = unsafe { (self.lib.fns.dec_destroy)(self.handle) };
        if code != TOPSCODEC_SUCCESS {
            log::error!("failed to destroy session {:#x}: {}", self.handle, code);
        } else {
            log::debug!("destroyed session {:#x}", self.handle);
        }
    }
}
