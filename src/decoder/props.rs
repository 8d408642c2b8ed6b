// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Correlation of decoded frames with the packets that produced them.
//!
//! The accelerator does not tell which packet a frame comes from, so the properties of each
//! submitted packet are queued and handed to frames in order. This assumes frames come out in
//! submission order, which holds for the supported codecs as long as no frames are dropped by
//! frame sampling. Nothing checks it: a frame retrieved while the queue is empty simply keeps the
//! properties reported by the device.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::video_frame::DecodedFrame;
use crate::video_frame::FrameProperties;

#[derive(Default)]
pub struct PendingProperties {
    queue: Mutex<VecDeque<FrameProperties>>,
}

impl PendingProperties {
    pub fn new() -> Self {
        Default::default()
    }

    /// Records the properties of a packet taken by the session.
    pub fn on_feed_accepted(&self, props: FrameProperties) {
        self.queue.lock().unwrap().push_back(props);
    }

    /// Removes the properties recorded last, for a packet the session ended up rejecting.
    pub fn withdraw_last(&self) -> Option<FrameProperties> {
        self.queue.lock().unwrap().pop_back()
    }

    /// Removes the oldest pending properties. Every frame coming out of the session consumes one
    /// entry, whether it can be returned to the client or not.
    pub fn take_next(&self) -> Option<FrameProperties> {
        self.queue.lock().unwrap().pop_front()
    }

    /// Moves the oldest pending properties onto `frame`. Returns `false` and leaves `frame`
    /// untouched if there were none.
    pub fn on_frame_retrieved(&self, frame: &mut DecodedFrame) -> bool {
        attach(frame, self.take_next())
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.queue.lock().unwrap().clear();
    }
}

/// Copies `props` onto `frame`, if any.
pub(crate) fn attach(frame: &mut DecodedFrame, props: Option<FrameProperties>) -> bool {
    match props {
        Some(props) => {
            *frame.props_mut() = props;
            true
        }
        None => {
            log::debug!("no pending packet properties for frame {:?}", frame.pts());
            false
        }
    }
}
