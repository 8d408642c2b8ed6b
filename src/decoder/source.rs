// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Retrieval of decoded frames from a session.
//!
//! Frames are either polled out of the session ([`PollingSource`]) or pushed by the session from a
//! vendor thread ([`CallbackSource`]). Both paths hand every mapped frame to the same
//! [`FrameSink`], which translates it, attaches the properties of its packet and queues it for the
//! client.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;
use std::sync::RwLock;
use std::sync::Weak;

use crate::backend::wire::WireFrame;
use crate::backend::BackendError;
use crate::backend::DecoderSession;
use crate::backend::EventSink;
use crate::backend::FatalEvent;
use crate::backend::SessionEvent;
use crate::decoder::props;
use crate::decoder::props::PendingProperties;
use crate::decoder::DecodeError;
use crate::decoder::ReadyFramesQueue;
use crate::translation::TranslationError;
use crate::translation::Translator;
use crate::video_frame::MappedFrame;

/// Status of a session, shared with the thread delivering its events.
#[derive(Default)]
pub(crate) struct SharedStatus {
    /// The end of stream has been submitted.
    draining: AtomicBool,
    /// The session returned its end of stream sentinel.
    eos: AtomicBool,
    fatal: Mutex<Option<FatalEvent>>,
    /// Error raised on the callback thread, reported by the next client call.
    deferred: Mutex<Option<DecodeError>>,
}

impl SharedStatus {
    pub(crate) fn set_draining(&self, draining: bool) {
        self.draining.store(draining, Ordering::SeqCst);
    }

    pub(crate) fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    pub(crate) fn is_eos(&self) -> bool {
        self.eos.load(Ordering::SeqCst)
    }

    pub(crate) fn set_fatal(&self, event: FatalEvent) {
        self.fatal.lock().unwrap().get_or_insert(event);
    }

    pub(crate) fn fatal(&self) -> Option<FatalEvent> {
        *self.fatal.lock().unwrap()
    }

    pub(crate) fn defer(&self, error: DecodeError) {
        let mut deferred = self.deferred.lock().unwrap();
        match *deferred {
            Some(_) => log::warn!("dropping error, one is already pending: {}", error),
            None => *deferred = Some(error),
        }
    }

    pub(crate) fn take_deferred(&self) -> Option<DecodeError> {
        self.deferred.lock().unwrap().take()
    }

    /// Clears the draining state, for a new session. A fatal event is kept, and so is an error
    /// not reported yet.
    pub(crate) fn reset(&self) {
        self.draining.store(false, Ordering::SeqCst);
        self.eos.store(false, Ordering::SeqCst);
    }
}

/// What became of a frame handed to [`FrameSink::deliver`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Delivery {
    Queued,
    EndOfStream,
    /// An end of stream sentinel received outside of a drain.
    Ignored,
}

/// Destination of every frame a session produces.
pub(crate) struct FrameSink {
    pub(crate) translator: Translator,
    pub(crate) props: PendingProperties,
    pub(crate) ready: ReadyFramesQueue,
    pub(crate) status: SharedStatus,
    pub(crate) packets_submitted: AtomicU64,
    pub(crate) frames_decoded: AtomicU64,
}

impl FrameSink {
    pub(crate) fn new(translator: Translator, ready_queue_capacity: usize) -> Self {
        Self {
            translator,
            props: PendingProperties::new(),
            ready: ReadyFramesQueue::new(ready_queue_capacity),
            status: Default::default(),
            packets_submitted: AtomicU64::new(0),
            frames_decoded: AtomicU64::new(0),
        }
    }

    pub(crate) fn deliver(&self, mapped: MappedFrame) -> Result<Delivery, TranslationError> {
        if mapped.wire().is_eos_sentinel() {
            if !self.status.is_draining() {
                log::warn!(
                    "ignoring zero-sized frame {} received outside of a drain",
                    mapped.wire().id
                );
                return Ok(Delivery::Ignored);
            }

            if let Err(e) = mapped.unmap() {
                log::warn!("failed to unmap end of stream frame: {}", e);
            }
            log::debug!("end of stream reached");
            self.status.eos.store(true, Ordering::SeqCst);
            return Ok(Delivery::EndOfStream);
        }

        // The frame's packet entry is consumed even if the frame cannot be translated, so the
        // following frames stay matched with their own packets.
        let packet_props = self.props.take_next();
        let mut frame = match self.translator.wire_to_frame(mapped) {
            Ok(frame) => frame,
            Err(e) => {
                if let Some(dropped) = packet_props {
                    log::warn!("dropping properties of packet with pts {:?}", dropped.pts);
                }
                return Err(e);
            }
        };
        props::attach(&mut frame, packet_props);
        let decoded = self.frames_decoded.fetch_add(1, Ordering::SeqCst) + 1;
        log::trace!(
            "frame #{} {:?} pts {:?}",
            decoded,
            frame.picture_type(),
            frame.pts()
        );
        self.ready.push(frame);

        Ok(Delivery::Queued)
    }
}

/// Outcome of a [`FrameSource::try_retrieve`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Retrieved {
    /// A frame was added to the ready queue.
    Frame,
    /// No frame is ready yet.
    Empty,
    /// The session has returned all its frames.
    EndOfStream,
}

/// Moves decoded frames from a session into the ready queue.
pub trait FrameSource: Send + Sync {
    /// Tries to retrieve one frame, without blocking.
    fn try_retrieve(&self) -> Result<Retrieved, DecodeError>;

    /// Stops taking frames from the session. Once this returns, no other thread is delivering
    /// frames through this source, so the session can be destroyed from the calling thread.
    fn close(&self) {}
}

/// Wraps a mapped frame so it is unmapped through `session` once released.
fn map_through<S: DecoderSession + 'static>(
    session: Arc<S>,
    frame: WireFrame,
) -> MappedFrame {
    MappedFrame::new(frame, move |frame| session.unmap_frame(frame))
}

/// Frame source asking the session for frames.
pub(crate) struct PollingSource<S> {
    session: Arc<S>,
    sink: Arc<FrameSink>,
}

impl<S: DecoderSession + 'static> PollingSource<S> {
    pub(crate) fn new(session: Arc<S>, sink: Arc<FrameSink>) -> Self {
        Self { session, sink }
    }
}

impl<S: DecoderSession + 'static> FrameSource for PollingSource<S> {
    fn try_retrieve(&self) -> Result<Retrieved, DecodeError> {
        let frame = match self.session.map_frame() {
            Ok(frame) => frame,
            Err(BackendError::BufferEmpty) => return Ok(Retrieved::Empty),
            Err(e) => {
                log::error!("failed to map frame: {}", e);
                return Err(e.into());
            }
        };

        let mapped = map_through(Arc::clone(&self.session), frame);
        Ok(match self.sink.deliver(mapped)? {
            Delivery::Queued => Retrieved::Frame,
            Delivery::EndOfStream => Retrieved::EndOfStream,
            Delivery::Ignored => Retrieved::Empty,
        })
    }
}

struct CallbackState<S> {
    /// Set once the session is created. Weak so the session does not keep itself alive through
    /// its own event sink.
    session: OnceLock<Weak<S>>,
    sink: Arc<FrameSink>,
    /// Held for reading while an event is handled. Set once the source is closed, after which
    /// events are dropped without touching the session.
    closed: RwLock<bool>,
}

impl<S: DecoderSession + 'static> CallbackState<S> {
    fn on_event(&self, event: SessionEvent) {
        let closed = self.closed.read().unwrap();
        if *closed {
            match event {
                // Left mapped, the session reclaims it when destroyed.
                SessionEvent::FrameReady(frame) => {
                    log::debug!("dropping frame {} delivered after close", frame.id)
                }
                SessionEvent::Fatal(event) => {
                    log::debug!("ignoring event after close: {}", event)
                }
            }
            return;
        }

        match event {
            SessionEvent::FrameReady(frame) => {
                let session = match self.session.get().and_then(Weak::upgrade) {
                    Some(session) => session,
                    None => {
                        log::warn!("frame {} delivered without a live session", frame.id);
                        return;
                    }
                };

                let mapped = map_through(session, frame);
                if let Err(e) = self.sink.deliver(mapped) {
                    log::error!("failed to process decoded frame: {}", e);
                    self.sink.status.defer(e.into());
                }
            }
            SessionEvent::Fatal(event) => {
                log::error!("decode session reported: {}", event);
                self.sink.status.set_fatal(event);
            }
        }
    }
}

/// Frame source fed by the session's event callback.
pub(crate) struct CallbackSource<S> {
    state: Arc<CallbackState<S>>,
}

impl<S: DecoderSession + 'static> CallbackSource<S> {
    pub(crate) fn new(sink: Arc<FrameSink>) -> Self {
        Self {
            state: Arc::new(CallbackState {
                session: OnceLock::new(),
                sink,
                closed: RwLock::new(false),
            }),
        }
    }

    /// Returns the sink to register when creating the session.
    pub(crate) fn event_sink(&self) -> EventSink {
        let state = Arc::clone(&self.state);
        Arc::new(move |event| state.on_event(event))
    }

    /// Binds the created session, so delivered frames can be unmapped through it.
    pub(crate) fn attach(&self, session: &Arc<S>) {
        if self.state.session.set(Arc::downgrade(session)).is_err() {
            log::warn!("callback source already attached to a session");
        }
    }
}

impl<S: DecoderSession + 'static> FrameSource for CallbackSource<S> {
    fn try_retrieve(&self) -> Result<Retrieved, DecodeError> {
        let status = &self.state.sink.status;
        if let Some(error) = status.take_deferred() {
            return Err(error);
        }
        if let Some(event) = status.fatal() {
            return Err(DecodeError::Fatal(event));
        }

        // Frames are queued by the callback, nothing to pull.
        Ok(if status.is_eos() {
            Retrieved::EndOfStream
        } else {
            Retrieved::Empty
        })
    }

    fn close(&self) {
        // Waits for the events being handled, which may hold references to the session.
        *self.state.closed.write().unwrap() = true;
    }
}
