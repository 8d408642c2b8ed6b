// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Submission of compressed packets to a session.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;

use crate::backend::wire::WireStream;
use crate::backend::BackendError;
use crate::backend::DecoderSession;
use crate::backoff::Backoff;
use crate::decoder::source::FrameSink;
use crate::decoder::source::FrameSource;
use crate::decoder::DecodeError;
use crate::decoder::Packet;
use crate::memory::StreamBuffer;

/// Stages packets in the session's stream buffer and submits them, waiting for the session to
/// accept each one before moving to the next.
pub(crate) struct StreamFeeder<S> {
    session: Arc<S>,
    stream: StreamBuffer,
    sink: Arc<FrameSink>,
    /// Codec headers, submitted once before the first packet.
    extradata: Bytes,
    extradata_sent: bool,
    backoff: Backoff,
}

impl<S: DecoderSession> StreamFeeder<S> {
    pub(crate) fn new(
        session: Arc<S>,
        stream: StreamBuffer,
        sink: Arc<FrameSink>,
        extradata: Bytes,
        backoff: Backoff,
    ) -> Self {
        Self {
            session,
            stream,
            sink,
            extradata,
            extradata_sent: false,
            backoff,
        }
    }

    /// Submits `packet`, retrying for as long as the session is busy. An empty packet signals the
    /// end of the stream.
    ///
    /// While the session is busy, frames are pulled from `source` into the ready queue if it has
    /// room, since a session with all its output buffers in use stops taking input.
    pub(crate) fn feed(
        &mut self,
        packet: &Packet,
        source: &dyn FrameSource,
    ) -> Result<(), DecodeError> {
        if !self.extradata_sent {
            if !self.extradata.is_empty() {
                let header = Packet::new(self.extradata.clone()).with_pts(0);
                let wire = self.sink.translator.packet_to_wire(&header, &self.stream)?;
                log::debug!("submitting {} bytes of codec headers", wire.data_len);
                self.submit(&wire, source)?;
            }
            self.extradata_sent = true;
        }

        let wire = self.sink.translator.packet_to_wire(packet, &self.stream)?;
        let tracked = !packet.is_end_of_stream();
        // A frame may come out of the callback before `decode_stream` returns, so its properties
        // have to be queued first.
        if tracked {
            self.sink.props.on_feed_accepted(packet.properties());
        }

        if let Err(e) = self.submit(&wire, source) {
            if tracked {
                self.sink.props.withdraw_last();
            }
            return Err(e);
        }

        if tracked {
            let submitted = self.sink.packets_submitted.fetch_add(1, Ordering::SeqCst) + 1;
            log::trace!(
                "packet #{} submitted, {} bytes pts {}",
                submitted,
                wire.data_len,
                wire.pts
            );
        } else {
            log::debug!("end of stream submitted");
        }

        Ok(())
    }

    fn submit(&mut self, wire: &WireStream, source: &dyn FrameSource) -> Result<(), DecodeError> {
        self.backoff.reset();
        loop {
            match self.session.decode_stream(wire) {
                Ok(()) => return Ok(()),
                Err(BackendError::Busy) => {
                    log::trace!(
                        "session busy, attempt {} of {:?}",
                        self.backoff.attempts() + 1,
                        self.backoff.retry_policy().max_attempts
                    );
                    if !self.sink.ready.is_full() {
                        source.try_retrieve()?;
                    }
                    self.backoff.wait()?;
                }
                Err(e) => {
                    log::error!("failed to submit stream: {}", e);
                    return Err(e.into());
                }
            }
        }
    }

    /// Gives the stream buffer back, so it can be released after the session.
    pub(crate) fn into_stream_buffer(self) -> StreamBuffer {
        self.stream
    }
}
