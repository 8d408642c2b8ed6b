// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Decoding of compressed packets into [`DecodedFrame`]s.
//!
//! [`stateful::StatefulDecoder`] is the entry point. It owns a decode session and exposes the
//! one-frame-per-call interface hosts expect, while frames produced out of lockstep with the
//! submitted packets wait in a [`ReadyFramesQueue`].

pub mod config;
pub(crate) mod feeder;
pub mod props;
pub(crate) mod source;
pub mod stateful;

use std::collections::VecDeque;
use std::sync::Mutex;

use bytes::Bytes;
use nix::errno::Errno;
use thiserror::Error;

use crate::backend::BackendError;
use crate::backend::FatalEvent;
use crate::backoff::RetryExhausted;
use crate::decoder::config::ConfigError;
use crate::decoder::stateful::DecoderState;
use crate::memory::MemoryError;
use crate::translation::TranslationError;
use crate::video_frame::DecodedFrame;
use crate::video_frame::FrameProperties;
use crate::video_frame::SideData;

/// Error returned by the decoder.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    Translation(#[from] TranslationError),
    #[error("decode session failed: {0}")]
    Fatal(FatalEvent),
    #[error(transparent)]
    RetryExhausted(#[from] RetryExhausted),
    #[error("operation not allowed in state {0:?}")]
    InvalidState(DecoderState),
    #[error("the decoder is closed")]
    Closed,
}

impl DecodeError {
    /// Host-facing error code for this error.
    pub fn errno(&self) -> Errno {
        match self {
            DecodeError::Config(_) | DecodeError::InvalidState(_) | DecodeError::Closed => {
                Errno::EINVAL
            }
            DecodeError::Backend(_) | DecodeError::Memory(_) => Errno::EPERM,
            DecodeError::Translation(TranslationError::PacketTooLarge { .. }) => Errno::EINVAL,
            DecodeError::Translation(TranslationError::Memory(_)) => Errno::EPERM,
            DecodeError::Translation(_) => Errno::EFAULT,
            DecodeError::Fatal(_) => Errno::EIO,
            DecodeError::RetryExhausted(_) => Errno::ETIMEDOUT,
        }
    }

    /// Whether the error leaves the session unusable until it is closed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DecodeError::Backend(_) | DecodeError::Fatal(_) | DecodeError::RetryExhausted(_)
        )
    }
}

/// A compressed packet and the properties to attach to the frame decoded from it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Packet {
    pub data: Bytes,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub duration: i64,
    /// Byte position in the container, -1 if unknown.
    pub pos: i64,
    pub key: bool,
    pub opaque: Option<u64>,
    pub side_data: Vec<SideData>,
}

impl Packet {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            pos: -1,
            ..Default::default()
        }
    }

    /// An empty packet, signaling the end of the stream.
    pub fn end_of_stream() -> Self {
        Self::new(Bytes::new())
    }

    pub fn with_pts(mut self, pts: i64) -> Self {
        self.pts = Some(pts);
        self
    }

    pub fn keyframe(mut self) -> Self {
        self.key = true;
        self
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.data.is_empty()
    }

    /// Snapshot of the properties to graft on the frame produced by this packet.
    pub fn properties(&self) -> FrameProperties {
        FrameProperties {
            pts: self.pts,
            dts: self.dts,
            duration: self.duration,
            pos: self.pos,
            opaque: self.opaque,
            side_data: self.side_data.clone(),
        }
    }
}

pub enum PacketPoll {
    Packet(Packet),
    /// No packet is available right now.
    Again,
    EndOfStream,
}

/// Where the decoder pulls its input from.
pub trait PacketSource {
    fn next_packet(&mut self) -> PacketPoll;
}

impl PacketSource for VecDeque<Packet> {
    fn next_packet(&mut self) -> PacketPoll {
        match self.pop_front() {
            Some(packet) => PacketPoll::Packet(packet),
            None => PacketPoll::EndOfStream,
        }
    }
}

/// Result of [`stateful::StatefulDecoder::receive_frame`].
#[derive(Debug)]
pub enum ReceiveStatus {
    Frame(DecodedFrame),
    /// No frame yet, call again.
    Again,
    EndOfStream,
}

/// Counters kept over the life of a decoder.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DecoderStats {
    pub packets_submitted: u64,
    pub frames_decoded: u64,
    pub frames_queued: usize,
}

#[derive(Default)]
struct QueueState {
    frames: VecDeque<DecodedFrame>,
    /// Set once the decoder is closed. Frames pushed afterwards are released right away.
    closed: bool,
}

/// A queue where decoded frames wait until the client retrieves them. Frames may be pushed from
/// a vendor callback thread while the client thread pops them.
pub struct ReadyFramesQueue {
    /// Queue of all the frames waiting to be sent to the client.
    state: Mutex<QueueState>,
    /// Number of frames beyond which frames are not pulled from the device opportunistically.
    capacity: usize,
}

impl ReadyFramesQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Default::default(),
            capacity,
        }
    }

    /// Push `frame` to the back of the queue.
    pub fn push(&self, frame: DecodedFrame) {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            drop(state);
            log::debug!("ready queue closed, releasing frame {:?}", frame.pts());
            return;
        }
        state.frames.push_back(frame);
    }

    /// Returns the oldest frame, if any.
    pub fn pop(&self) -> Option<DecodedFrame> {
        self.state.lock().unwrap().frames.pop_front()
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Releases all the queued frames and rejects further pushes. Returns how many frames were
    /// released.
    pub fn close(&self) -> usize {
        let frames = {
            let mut state = self.state.lock().unwrap();
            state.closed = true;
            std::mem::take(&mut state.frames)
        };
        frames.len()
    }
}
