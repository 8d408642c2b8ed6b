// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Shared code for decoder backends.
//!
//! A backend is a provider of device memory and hardware decode sessions. The decoder only talks
//! to the accelerator through the traits defined here, so it can be driven either by the vendor
//! library or by an in-memory implementation in tests.

#[cfg(test)]
pub(crate) mod dummy;
#[cfg(feature = "topscodec")]
pub mod topscodec;
pub mod wire;

use std::sync::Arc;

use thiserror::Error;

use crate::backend::wire::Capabilities;
use crate::backend::wire::CreateInfo;
use crate::backend::wire::LibVersion;
use crate::backend::wire::SessionParams;
use crate::backend::wire::WireFrame;
use crate::backend::wire::WireStream;
use crate::EncodedFormat;

/// Error returned by backend methods.
#[derive(Error, Debug)]
pub enum BackendError {
    /// The session cannot take the stream right now. Submitting the same stream again later is
    /// expected to succeed.
    #[error("the decode session is busy, try again later")]
    Busy,
    /// No decoded frame is available yet.
    #[error("no decoded frame available")]
    BufferEmpty,
    #[error("{call} failed with status {code}")]
    Status { call: &'static str, code: i32 },
    #[error("symbol {0} missing from the vendor library")]
    MissingSymbol(&'static str),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Kind of device memory to allocate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryKind {
    /// Memory only the device can access.
    Device,
    /// Device memory that is also mapped in the host address space. The returned address is the
    /// host one; its device-side address is obtained with [`DeviceMemory::device_pointer`].
    HostAccessible,
}

/// A memory transfer between the host and the device.
#[derive(Debug)]
pub enum Transfer<'a> {
    HostToDevice { dst: u64, src: &'a [u8] },
    DeviceToDevice { dst: u64, src: u64, size: usize },
    DeviceToHost { dst: &'a mut [u8], src: u64 },
}

impl Transfer<'_> {
    pub fn size(&self) -> usize {
        match self {
            Transfer::HostToDevice { src, .. } => src.len(),
            Transfer::DeviceToDevice { size, .. } => *size,
            Transfer::DeviceToHost { dst, .. } => dst.len(),
        }
    }
}

/// Device runtime memory primitives. All calls are synchronous.
pub trait DeviceMemory: Send + Sync {
    /// Allocates `size` bytes and returns their address.
    fn alloc(&self, size: usize, kind: MemoryKind) -> BackendResult<u64>;

    /// Frees an allocation previously returned by `alloc`.
    fn free(&self, addr: u64) -> BackendResult<()>;

    /// Returns the device-side address of the host-accessible allocation at `addr`.
    fn device_pointer(&self, addr: u64) -> BackendResult<u64>;

    fn copy(&self, transfer: Transfer<'_>) -> BackendResult<()>;
}

/// Fatal conditions reported asynchronously by a session. None of them is recoverable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FatalEvent {
    OutOfMemory,
    StreamCorrupt,
    StreamNotSupported,
    BufferOverflow,
    Fatal,
}

impl std::fmt::Display for FatalEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FatalEvent::OutOfMemory => "device out of memory",
            FatalEvent::StreamCorrupt => "stream corrupted",
            FatalEvent::StreamNotSupported => "stream not supported",
            FatalEvent::BufferOverflow => "buffer overflow",
            FatalEvent::Fatal => "fatal device error",
        };
        f.write_str(s)
    }
}

/// Events delivered by a session to the sink registered at creation time.
#[derive(Debug)]
pub enum SessionEvent {
    /// A decoded frame is available. It is already mapped and must be unmapped through the
    /// session that produced it.
    FrameReady(WireFrame),
    Fatal(FatalEvent),
}

/// Callback invoked from a vendor thread whenever the session has an event to report.
pub type EventSink = Arc<dyn Fn(SessionEvent) + Send + Sync>;

/// A hardware decode session. The session is destroyed when the value is dropped.
///
/// A session is not re-entrant: callers must not have more than one `decode_stream` or
/// `map_frame` call in flight at a time. Implementations still need to be `Sync` since frames are
/// unmapped from whatever thread drops them.
pub trait DecoderSession: Send + Sync {
    fn set_params(&self, params: &SessionParams) -> BackendResult<()>;

    /// Submits `stream` without blocking. Returns [`BackendError::Busy`] if the session cannot
    /// accept it yet.
    fn decode_stream(&self, stream: &WireStream) -> BackendResult<()>;

    /// Maps the next decoded frame. Returns [`BackendError::BufferEmpty`] if none is ready.
    fn map_frame(&self) -> BackendResult<WireFrame>;

    /// Returns a mapped frame to the session's output pool.
    fn unmap_frame(&self, frame: &WireFrame) -> BackendResult<()>;
}

/// Provider of device memory and decode sessions.
pub trait DecoderBackend {
    type Session: DecoderSession + 'static;

    fn memory(&self) -> Arc<dyn DeviceMemory>;

    fn version(&self) -> BackendResult<LibVersion>;

    fn capabilities(
        &self,
        codec: EncodedFormat,
        card_id: u32,
        device_id: u32,
    ) -> BackendResult<Capabilities>;

    /// Creates a session. If `events` is set, decoded frames and fatal errors are delivered
    /// through it instead of being polled with [`DecoderSession::map_frame`].
    fn create_session(
        &self,
        info: &CreateInfo,
        events: Option<EventSink>,
    ) -> BackendResult<Self::Session>;
}
