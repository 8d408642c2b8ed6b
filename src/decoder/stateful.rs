// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A decoder driving one hardware decode session.
//!
//! The session takes compressed packets and returns decoded frames on its own schedule. This
//! module hides that behind a pull interface: every call to [`StatefulDecoder::receive_frame`]
//! returns at most one frame, feeding a new packet from the client's [`PacketSource`] when no
//! frame is waiting.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::backend::wire::Capabilities;
use crate::backend::DecoderBackend;
use crate::backend::DecoderSession;
use crate::decoder::config::resolve;
use crate::decoder::config::DecoderOptions;
use crate::decoder::config::ResolvedConfig;
use crate::decoder::config::StreamParams;
use crate::decoder::feeder::StreamFeeder;
use crate::decoder::source::CallbackSource;
use crate::decoder::source::FrameSink;
use crate::decoder::source::FrameSource;
use crate::decoder::source::PollingSource;
use crate::decoder::source::Retrieved;
use crate::decoder::DecodeError;
use crate::decoder::DecoderStats;
use crate::decoder::Packet;
use crate::decoder::PacketPoll;
use crate::decoder::PacketSource;
use crate::decoder::ReceiveStatus;
use crate::memory::StreamBuffer;
use crate::translation::Translator;
use crate::DecodedFormat;
use crate::Resolution;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DecoderState {
    #[default]
    Uninitialized,
    /// The configuration is being validated and the session created.
    Configuring,
    /// Packets are being decoded.
    Ready,
    /// The end of stream has been submitted, remaining frames are being returned.
    Draining,
    /// All frames have been returned. Only a flush brings the decoder back to `Ready`.
    EosReached,
    /// The session hit an unrecoverable error and must be closed.
    Failed,
    Closed,
}

struct ActiveSession<S> {
    session: Arc<S>,
    feeder: StreamFeeder<S>,
    source: Box<dyn FrameSource>,
}

pub struct StatefulDecoder<B: DecoderBackend> {
    backend: B,
    params: StreamParams,
    options: DecoderOptions,
    config: ResolvedConfig,
    caps: Capabilities,
    sink: Arc<FrameSink>,
    active: Option<ActiveSession<B::Session>>,
    state: DecoderState,
}

impl<B: DecoderBackend> StatefulDecoder<B> {
    /// Validates `options` against the device capabilities and opens a decode session for
    /// `params`. Nothing is left allocated on failure.
    pub fn new(
        backend: B,
        params: StreamParams,
        options: DecoderOptions,
    ) -> Result<Self, DecodeError> {
        match backend.version() {
            Ok(version) => log::debug!("topscodec library version {}", version),
            Err(e) => log::warn!("failed to query the library version: {}", e),
        }

        let caps = backend.capabilities(params.codec, options.card_id, options.device_id)?;
        log::debug!("{:?} capabilities: {:?}", params.codec, caps);

        let config = resolve(&params, &options, &caps).map_err(|e| {
            log::error!("rejecting decoder configuration: {}", e);
            e
        })?;
        log::debug!("create info: {:?}", config.create_info);
        log::debug!("session params: {:?}", config.params);

        let translator = Translator::new(
            backend.memory(),
            options.zero_copy,
            options.pkt_timebase,
            params.field_order.is_interlaced(),
        );
        let sink = Arc::new(FrameSink::new(translator, options.ready_queue_capacity));

        let mut decoder = Self {
            backend,
            params,
            options,
            config,
            caps,
            sink,
            active: None,
            state: DecoderState::Configuring,
        };
        decoder.active = Some(decoder.open_session()?);
        decoder.state = DecoderState::Ready;

        Ok(decoder)
    }

    fn open_session(&self) -> Result<ActiveSession<B::Session>, DecodeError> {
        let stream = StreamBuffer::new(self.backend.memory(), self.config.stream_buffer_size)?;

        let (session, source): (Arc<B::Session>, Box<dyn FrameSource>) =
            if self.options.async_callback {
                let source = CallbackSource::<B::Session>::new(Arc::clone(&self.sink));
                let session = Arc::new(
                    self.backend
                        .create_session(&self.config.create_info, Some(source.event_sink()))?,
                );
                source.attach(&session);
                (session, Box::new(source))
            } else {
                let session = Arc::new(
                    self.backend
                        .create_session(&self.config.create_info, None)?,
                );
                let source = PollingSource::new(Arc::clone(&session), Arc::clone(&self.sink));
                (session, Box::new(source))
            };
        session.set_params(&self.config.params)?;

        let feeder = StreamFeeder::new(
            Arc::clone(&session),
            stream,
            Arc::clone(&self.sink),
            self.params.extradata.clone(),
            self.options.backoff.clone(),
        );
        log::debug!(
            "session opened, {} output buffers",
            self.config.params.output_buf_num
        );

        Ok(ActiveSession {
            session,
            feeder,
            source,
        })
    }

    /// Releases the session resources. Frames still held by the client keep the session itself
    /// alive until they are dropped.
    fn teardown(&mut self) {
        let Some(ActiveSession {
            session,
            feeder,
            source,
        }) = self.active.take()
        else {
            return;
        };

        source.close();
        drop(source);
        let stream = feeder.into_stream_buffer();
        let users = Arc::strong_count(&session) - 1;
        if users > 0 {
            log::debug!(
                "{} frames still reference the session, destroying it once they are released",
                users
            );
        }
        drop(session);
        drop(stream);
    }

    /// Returns the next decoded frame.
    ///
    /// Queued frames are returned first. Otherwise, while the end of stream has not been reached,
    /// a packet is taken from `packets` and submitted, and one attempt is made at retrieving a
    /// frame. [`ReceiveStatus::Again`] means the call should be repeated.
    pub fn receive_frame(
        &mut self,
        packets: &mut dyn PacketSource,
    ) -> Result<ReceiveStatus, DecodeError> {
        match self.state {
            DecoderState::Ready | DecoderState::Draining | DecoderState::EosReached => (),
            DecoderState::Closed => return Err(DecodeError::Closed),
            state => return Err(DecodeError::InvalidState(state)),
        }

        let result = self.receive(packets);
        if let Err(e) = &result {
            if e.is_fatal() {
                log::error!("decode session failed: {}", e);
                self.state = DecoderState::Failed;
            } else {
                log::warn!("failed to receive frame: {}", e);
            }
        }

        result
    }

    fn receive(&mut self, packets: &mut dyn PacketSource) -> Result<ReceiveStatus, DecodeError> {
        if let Some(event) = self.sink.status.fatal() {
            return Err(DecodeError::Fatal(event));
        }
        if let Some(error) = self.sink.status.take_deferred() {
            return Err(error);
        }

        if let Some(status) = self.pop_ready() {
            return Ok(status);
        }

        if self.state == DecoderState::Ready {
            match packets.next_packet() {
                PacketPoll::Packet(packet) => self.feed(&packet)?,
                PacketPoll::EndOfStream => self.feed(&Packet::end_of_stream())?,
                PacketPoll::Again => (),
            }
        }

        let active = self.active.as_ref().ok_or(DecodeError::Closed)?;
        active.source.try_retrieve()?;

        Ok(self.pop_ready().unwrap_or(ReceiveStatus::Again))
    }

    /// Returns the oldest queued frame, or the end of stream once the last frame is gone.
    fn pop_ready(&mut self) -> Option<ReceiveStatus> {
        // The end of stream is flagged after the last frame is queued, so read it first.
        let eos = self.sink.status.is_eos();
        if let Some(frame) = self.sink.ready.pop() {
            return Some(ReceiveStatus::Frame(frame));
        }

        if eos || self.state == DecoderState::EosReached {
            if self.state != DecoderState::EosReached {
                log::debug!("all frames returned");
            }
            self.state = DecoderState::EosReached;
            return Some(ReceiveStatus::EndOfStream);
        }

        None
    }

    fn feed(&mut self, packet: &Packet) -> Result<(), DecodeError> {
        let active = self.active.as_mut().ok_or(DecodeError::Closed)?;

        let eos = packet.is_end_of_stream();
        // Frames may come out of the callback as soon as the end of stream is submitted.
        if eos {
            self.sink.status.set_draining(true);
            self.state = DecoderState::Draining;
        }

        let result = active.feeder.feed(packet, active.source.as_ref());
        if result.is_err() && eos {
            self.sink.status.set_draining(false);
            self.state = DecoderState::Ready;
        }

        result
    }

    /// Retrieves every remaining frame into the ready queue.
    fn drain(&mut self) -> Result<(), DecodeError> {
        if self.state == DecoderState::Ready {
            self.feed(&Packet::end_of_stream())?;
        }

        let active = self.active.as_ref().ok_or(DecodeError::Closed)?;
        let mut backoff = self.options.backoff.clone();
        backoff.reset();
        while self.state != DecoderState::EosReached && !self.sink.status.is_eos() {
            if let Some(event) = self.sink.status.fatal() {
                return Err(DecodeError::Fatal(event));
            }

            match active.source.try_retrieve()? {
                Retrieved::Frame => backoff.reset(),
                Retrieved::Empty => backoff.wait()?,
                Retrieved::EndOfStream => break,
            }
        }
        self.state = DecoderState::EosReached;

        Ok(())
    }

    /// Drains the session and replaces it with a new one using the same configuration. Frames
    /// drained from the old session stay queued for [`Self::receive_frame`].
    ///
    /// Does nothing if the decoder has failed or is closed.
    pub fn flush(&mut self) {
        match self.state {
            DecoderState::Ready | DecoderState::Draining | DecoderState::EosReached => (),
            state => {
                log::debug!("not flushing in state {:?}", state);
                return;
            }
        }

        if let Err(e) = self.drain() {
            if e.is_fatal() {
                log::error!("failed to drain the session: {}", e);
                self.teardown();
                self.state = DecoderState::Failed;
                return;
            }
            log::warn!("error while draining the session, reporting it next: {}", e);
            self.sink.status.defer(e);
        }

        self.teardown();
        self.sink.props.clear();
        self.sink.status.reset();

        self.state = DecoderState::Configuring;
        match self.open_session() {
            Ok(active) => {
                self.active = Some(active);
                self.state = DecoderState::Ready;
                log::debug!(
                    "session recreated, {} frames queued",
                    self.sink.ready.len()
                );
            }
            Err(e) => {
                log::error!("failed to recreate the session: {}", e);
                self.state = DecoderState::Failed;
            }
        }
    }

    /// Destroys the session and releases all queued frames. Calling it again has no effect.
    pub fn close(&mut self) -> Result<(), DecodeError> {
        if self.state == DecoderState::Closed {
            return Ok(());
        }

        self.teardown();
        let released = self.sink.ready.close();
        self.sink.props.clear();
        if let Some(error) = self.sink.status.take_deferred() {
            log::warn!("discarding unreported error: {}", error);
        }
        log::debug!("decoder closed, released {} queued frames", released);
        self.state = DecoderState::Closed;

        Ok(())
    }

    pub fn state(&self) -> DecoderState {
        self.state
    }

    pub fn stats(&self) -> DecoderStats {
        DecoderStats {
            packets_submitted: self.sink.packets_submitted.load(Ordering::SeqCst),
            frames_decoded: self.sink.frames_decoded.load(Ordering::SeqCst),
            frames_queued: self.sink.ready.len(),
        }
    }

    /// Resolution of the frames after post-processing.
    pub fn output_resolution(&self) -> Resolution {
        self.config.output_resolution
    }

    pub fn output_format(&self) -> DecodedFormat {
        self.config.output_format
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }
}

impl<B: DecoderBackend> Drop for StatefulDecoder<B> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("failed to close decoder: {}", e);
        }
    }
}
