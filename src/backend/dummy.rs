// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This file contains a dummy backend whose only purpose is to let the decoder
//! run so we can test it in isolation.
//!
//! Device memory is backed by host vectors. A session "decodes" every submitted stream into one
//! frame whose planes are filled from the first byte of the payload, and can be scripted to report
//! itself busy, hold frames back, deliver them from another thread, or fail.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread::JoinHandle;

use bytes::Bytes;

use crate::backend::wire::Capabilities;
use crate::backend::wire::CreateInfo;
use crate::backend::wire::LibVersion;
use crate::backend::wire::PictureType;
use crate::backend::wire::SessionParams;
use crate::backend::wire::StreamType;
use crate::backend::wire::WireFrame;
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
use crate::translation::decoded_format;
use crate::utils::align_up;
use crate::EncodedFormat;
use crate::Resolution;

/// Bit set in the host address of host-accessible allocations.
const HOST_ALIAS: u64 = 1 << 40;
const FIRST_ADDR: u64 = 0x10_0000;
const ADDR_ALIGNMENT: usize = 256;

fn status(call: &'static str) -> BackendError {
    BackendError::Status { call, code: -1 }
}

#[derive(Default)]
struct MemoryState {
    allocations: BTreeMap<u64, Vec<u8>>,
    next_addr: u64,
    fail_allocations: bool,
}

#[derive(Default)]
pub(crate) struct DummyMemory {
    state: Mutex<MemoryState>,
}

impl DummyMemory {
    /// Runs `f` on the `len` bytes at `addr`, which can point anywhere inside an allocation.
    fn with_bytes<R>(
        &self,
        addr: u64,
        len: usize,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> BackendResult<R> {
        let addr = addr & !HOST_ALIAS;
        let mut state = self.state.lock().unwrap();
        let (base, data) = state
            .allocations
            .range_mut(..=addr)
            .next_back()
            .ok_or_else(|| status("memory access"))?;
        let offset = (addr - base) as usize;
        if offset + len > data.len() {
            return Err(status("memory access"));
        }

        Ok(f(&mut data[offset..offset + len]))
    }
}

impl DeviceMemory for DummyMemory {
    fn alloc(&self, size: usize, kind: MemoryKind) -> BackendResult<u64> {
        let mut state = self.state.lock().unwrap();
        if state.fail_allocations {
            return Err(status("topsMalloc"));
        }

        let addr = state.next_addr.max(FIRST_ADDR);
        state.next_addr = addr + align_up(size.max(1), ADDR_ALIGNMENT) as u64;
        state.allocations.insert(addr, vec![0u8; size]);

        Ok(match kind {
            MemoryKind::Device => addr,
            MemoryKind::HostAccessible => addr | HOST_ALIAS,
        })
    }

    fn free(&self, addr: u64) -> BackendResult<()> {
        let mut state = self.state.lock().unwrap();
        match state.allocations.remove(&(addr & !HOST_ALIAS)) {
            Some(_) => Ok(()),
            None => Err(status("topsFree")),
        }
    }

    fn device_pointer(&self, addr: u64) -> BackendResult<u64> {
        let state = self.state.lock().unwrap();
        let addr = addr & !HOST_ALIAS;
        if state.allocations.contains_key(&addr) {
            Ok(addr)
        } else {
            Err(status("topsPointerGetAttributes"))
        }
    }

    fn copy(&self, transfer: Transfer<'_>) -> BackendResult<()> {
        match transfer {
            Transfer::HostToDevice { dst, src } => {
                self.with_bytes(dst, src.len(), |d| d.copy_from_slice(src))
            }
            Transfer::DeviceToDevice { dst, src, size } => {
                let data = self.with_bytes(src, size, |s| s.to_vec())?;
                self.with_bytes(dst, size, |d| d.copy_from_slice(&data))
            }
            Transfer::DeviceToHost { dst, src } => {
                let len = dst.len();
                self.with_bytes(src, len, |s| dst.copy_from_slice(s))
            }
        }
    }
}

/// A stream submitted to a dummy session.
#[derive(Clone, Debug)]
pub(crate) struct Submission {
    pub(crate) payload: Vec<u8>,
    pub(crate) stream: WireStream,
    /// Whether the session took the stream, as opposed to reporting itself busy.
    pub(crate) accepted: bool,
}

struct OutstandingFrame {
    session: u64,
    planes: Vec<u64>,
}

struct DeviceState {
    caps: Capabilities,
    version: LibVersion,
    frame_resolution: Resolution,
    header_payload: Option<Bytes>,
    /// Number of upcoming submissions to reject as busy.
    busy: u32,
    busy_forever: bool,
    /// Frames a session keeps to itself until the end of stream or until more frames come in.
    hold_frames: usize,
    /// Report busy while that many frames wait to be mapped.
    stall_when_ready: Option<usize>,
    threaded_callback: bool,
    fatal: Option<FatalEvent>,

    next_session_id: u64,
    next_frame_id: u64,
    sessions_created: usize,
    sessions_destroyed: usize,
    sessions_destroyed_in_callback: usize,
    create_infos: Vec<CreateInfo>,
    params: Vec<SessionParams>,
    submissions: Vec<Submission>,
    maps: usize,
    unmaps: usize,
    bad_unmaps: usize,
    outstanding: BTreeMap<u64, OutstandingFrame>,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            caps: Capabilities {
                supported: true,
                max_resolution: Resolution::from((4096, 2304)),
                min_resolution: Resolution::from((16, 16)),
                output_formats: vec![],
            },
            version: LibVersion {
                major: 1,
                minor: 0,
                patch: 0,
            },
            frame_resolution: Resolution::from((16, 16)),
            header_payload: None,
            busy: 0,
            busy_forever: false,
            hold_frames: 0,
            stall_when_ready: None,
            threaded_callback: false,
            fatal: None,
            next_session_id: 0,
            next_frame_id: 1,
            sessions_created: 0,
            sessions_destroyed: 0,
            sessions_destroyed_in_callback: 0,
            create_infos: vec![],
            params: vec![],
            submissions: vec![],
            maps: 0,
            unmaps: 0,
            bad_unmaps: 0,
            outstanding: BTreeMap::new(),
        }
    }
}

struct DeviceInner {
    memory: Arc<DummyMemory>,
    state: Mutex<DeviceState>,
}

/// Dummy device, usable as a backend for any codec. Clones share the same device.
#[derive(Clone)]
pub(crate) struct DummyDevice {
    inner: Arc<DeviceInner>,
}

impl DummyDevice {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(DeviceInner {
                memory: Default::default(),
                state: Default::default(),
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, DeviceState> {
        self.inner.state.lock().unwrap()
    }

    pub(crate) fn live_allocations(&self) -> usize {
        self.inner.memory.state.lock().unwrap().allocations.len()
    }

    pub(crate) fn fail_allocations(&self, fail: bool) {
        self.inner.memory.state.lock().unwrap().fail_allocations = fail;
    }

    pub(crate) fn read_device(&self, addr: u64, len: usize) -> Vec<u8> {
        self.inner
            .memory
            .with_bytes(addr, len, |data| data.to_vec())
            .unwrap()
    }

    pub(crate) fn write_device(&self, addr: u64, data: &[u8]) {
        self.inner
            .memory
            .with_bytes(addr, data.len(), |dst| dst.copy_from_slice(data))
            .unwrap()
    }

    pub(crate) fn set_caps(&self, caps: Capabilities) {
        self.state().caps = caps;
    }

    pub(crate) fn set_frame_resolution(&self, resolution: Resolution) {
        self.state().frame_resolution = resolution;
    }

    /// Streams carrying exactly `payload` are taken as codec headers and produce no frame.
    pub(crate) fn set_header_payload(&self, payload: impl Into<Bytes>) {
        self.state().header_payload = Some(payload.into());
    }

    pub(crate) fn queue_busy(&self, count: u32) {
        self.state().busy += count;
    }

    pub(crate) fn set_busy_forever(&self, busy: bool) {
        self.state().busy_forever = busy;
    }

    pub(crate) fn hold_frames(&self, count: usize) {
        self.state().hold_frames = count;
    }

    pub(crate) fn stall_when_ready(&self, count: usize) {
        self.state().stall_when_ready = Some(count);
    }

    /// Deliver callback events from a dedicated thread instead of from `decode_stream`.
    pub(crate) fn set_threaded_callback(&self, threaded: bool) {
        self.state().threaded_callback = threaded;
    }

    /// Makes the next submission fail with `event`.
    pub(crate) fn inject_fatal(&self, event: FatalEvent) {
        self.state().fatal = Some(event);
    }

    pub(crate) fn sessions_created(&self) -> usize {
        self.state().sessions_created
    }

    pub(crate) fn sessions_destroyed(&self) -> usize {
        self.state().sessions_destroyed
    }

    /// Sessions whose last reference was dropped by their own callback thread.
    pub(crate) fn sessions_destroyed_in_callback(&self) -> usize {
        self.state().sessions_destroyed_in_callback
    }

    pub(crate) fn create_infos(&self) -> Vec<CreateInfo> {
        self.state().create_infos.clone()
    }

    pub(crate) fn params(&self) -> Vec<SessionParams> {
        self.state().params.clone()
    }

    pub(crate) fn submissions(&self) -> Vec<Submission> {
        self.state().submissions.clone()
    }

    /// Payloads of the streams the sessions took, in order.
    pub(crate) fn accepted_payloads(&self) -> Vec<Vec<u8>> {
        self.state()
            .submissions
            .iter()
            .filter(|s| s.accepted)
            .map(|s| s.payload.clone())
            .collect()
    }

    pub(crate) fn maps(&self) -> usize {
        self.state().maps
    }

    pub(crate) fn unmaps(&self) -> usize {
        self.state().unmaps
    }

    pub(crate) fn bad_unmaps(&self) -> usize {
        self.state().bad_unmaps
    }

    /// Frames mapped and not yet unmapped.
    pub(crate) fn outstanding_frames(&self) -> usize {
        self.state().outstanding.len()
    }

    fn free_planes(&self, planes: &[u64]) {
        for addr in planes {
            if let Err(e) = self.inner.memory.free(*addr) {
                log::warn!("failed to free frame plane at {:#x}: {}", addr, e);
            }
        }
    }

    /// Allocates a frame "decoded" from `payload`.
    fn decode(
        &self,
        state: &mut DeviceState,
        params: &SessionParams,
        stream: &WireStream,
        payload: &[u8],
    ) -> BackendResult<WireFrame> {
        let format = decoded_format(params.pixel_format);
        let resolution = state.frame_resolution;
        let fill = payload.first().copied().unwrap_or(0);

        let mut planes = vec![];
        for (i, (stride, lines)) in format
            .linesizes(resolution.width)
            .into_iter()
            .zip(format.plane_heights(resolution.height))
            .enumerate()
        {
            let addr = self.inner.memory.alloc(stride * lines, MemoryKind::Device)?;
            self.inner.memory.with_bytes(addr, stride * lines, |data| {
                data.fill(fill.wrapping_add(i as u8))
            })?;
            planes.push(WirePlane {
                dev_addr: addr,
                stride: stride as u32,
            });
        }

        let id = state.next_frame_id;
        state.next_frame_id += 1;

        Ok(WireFrame {
            id,
            width: resolution.width,
            height: resolution.height,
            pixel_format: params.pixel_format,
            color_space: params.color_space,
            pic_type: match stream.stream_type {
                StreamType::I | StreamType::Idr => PictureType::Idr,
                _ => PictureType::P,
            },
            pts: stream.pts,
            planes,
        })
    }

    fn eos_sentinel(state: &mut DeviceState) -> WireFrame {
        let id = state.next_frame_id;
        state.next_frame_id += 1;
        WireFrame {
            id,
            ..Default::default()
        }
    }

    fn mark_mapped(state: &mut DeviceState, session: u64, frame: &WireFrame) {
        state.maps += 1;
        state.outstanding.insert(
            frame.id,
            OutstandingFrame {
                session,
                planes: frame.planes.iter().map(|p| p.dev_addr).collect(),
            },
        );
    }
}

impl DecoderBackend for DummyDevice {
    type Session = DummySession;

    fn memory(&self) -> Arc<dyn DeviceMemory> {
        Arc::clone(&self.inner.memory) as Arc<dyn DeviceMemory>
    }

    fn version(&self) -> BackendResult<LibVersion> {
        Ok(self.state().version)
    }

    fn capabilities(
        &self,
        _codec: EncodedFormat,
        _card_id: u32,
        _device_id: u32,
    ) -> BackendResult<Capabilities> {
        Ok(self.state().caps.clone())
    }

    fn create_session(
        &self,
        info: &CreateInfo,
        events: Option<EventSink>,
    ) -> BackendResult<DummySession> {
        let (id, threaded) = {
            let mut state = self.state();
            state.sessions_created += 1;
            state.create_infos.push(info.clone());
            state.next_session_id += 1;
            (state.next_session_id, state.threaded_callback)
        };

        let worker = match &events {
            Some(sink) if threaded => {
                let (tx, rx) = mpsc::channel::<SessionEvent>();
                let sink = Arc::clone(sink);
                let handle = std::thread::Builder::new()
                    .name(format!("dummy-session-{}", id))
                    .spawn(move || {
                        for event in rx {
                            sink(event);
                        }
                    })
                    .map_err(|e| BackendError::Other(e.into()))?;
                Some(Worker { tx, handle })
            }
            _ => None,
        };

        Ok(DummySession {
            id,
            device: self.clone(),
            events,
            worker: Mutex::new(worker),
            state: Default::default(),
        })
    }
}

struct Worker {
    tx: mpsc::Sender<SessionEvent>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct SessionState {
    params: SessionParams,
    /// Decoded frames not yet visible to the client.
    held: VecDeque<WireFrame>,
    /// Decoded frames waiting to be mapped.
    ready: VecDeque<WireFrame>,
}

pub(crate) struct DummySession {
    id: u64,
    device: DummyDevice,
    events: Option<EventSink>,
    worker: Mutex<Option<Worker>>,
    state: Mutex<SessionState>,
}

impl DummySession {
    fn dispatch(&self, events: Vec<SessionEvent>) {
        let Some(sink) = &self.events else {
            return;
        };

        let worker = self.worker.lock().unwrap();
        for event in events {
            match worker.as_ref() {
                Some(worker) => {
                    if worker.tx.send(event).is_err() {
                        log::warn!("dummy session worker is gone");
                    }
                }
                None => sink(event),
            }
        }
    }
}

impl DecoderSession for DummySession {
    fn set_params(&self, params: &SessionParams) -> BackendResult<()> {
        self.state.lock().unwrap().params = params.clone();
        self.device.state().params.push(params.clone());
        Ok(())
    }

    fn decode_stream(&self, stream: &WireStream) -> BackendResult<()> {
        let payload = if stream.is_end_of_stream() {
            vec![]
        } else {
            self.device.inner.memory.with_bytes(
                stream.mem_addr + stream.data_offset as u64,
                stream.data_len as usize,
                |data| data.to_vec(),
            )?
        };

        let mut session = self.state.lock().unwrap();
        let mut device = self.device.state();

        let stalled = device
            .stall_when_ready
            .map(|count| session.ready.len() >= count)
            .unwrap_or(false);
        if device.busy > 0 || device.busy_forever || stalled {
            device.busy = device.busy.saturating_sub(1);
            device.submissions.push(Submission {
                payload,
                stream: stream.clone(),
                accepted: false,
            });
            return Err(BackendError::Busy);
        }

        let mut events = vec![];
        if let Some(event) = device.fatal.take() {
            if self.events.is_none() {
                return Err(BackendError::Status {
                    call: "topscodecDecodeStream",
                    code: -(event as i32) - 1,
                });
            }
            events.push(SessionEvent::Fatal(event));
        }

        device.submissions.push(Submission {
            payload: payload.clone(),
            stream: stream.clone(),
            accepted: true,
        });

        if stream.is_end_of_stream() {
            while let Some(frame) = session.held.pop_front() {
                session.ready.push_back(frame);
            }
            let sentinel = DummyDevice::eos_sentinel(&mut device);
            session.ready.push_back(sentinel);
        } else if device.header_payload.as_deref() != Some(&payload[..]) {
            let frame = self
                .device
                .decode(&mut device, &session.params, stream, &payload)?;
            session.held.push_back(frame);
            while session.held.len() > device.hold_frames {
                if let Some(frame) = session.held.pop_front() {
                    session.ready.push_back(frame);
                }
            }
        }

        if self.events.is_some() {
            while let Some(frame) = session.ready.pop_front() {
                DummyDevice::mark_mapped(&mut device, self.id, &frame);
                events.push(SessionEvent::FrameReady(frame));
            }
        }

        drop(device);
        drop(session);
        self.dispatch(events);

        Ok(())
    }

    fn map_frame(&self) -> BackendResult<WireFrame> {
        let mut session = self.state.lock().unwrap();
        let frame = session.ready.pop_front().ok_or(BackendError::BufferEmpty)?;
        DummyDevice::mark_mapped(&mut self.device.state(), self.id, &frame);
        Ok(frame)
    }

    fn unmap_frame(&self, frame: &WireFrame) -> BackendResult<()> {
        let released = {
            let mut device = self.device.state();
            match device.outstanding.remove(&frame.id) {
                Some(outstanding) => {
                    device.unmaps += 1;
                    outstanding.planes
                }
                None => {
                    device.bad_unmaps += 1;
                    return Err(BackendError::Status {
                        call: "topscodecDecFrameUnMap",
                        code: -1,
                    });
                }
            }
        };

        self.device.free_planes(&released);
        Ok(())
    }
}

impl Drop for DummySession {
    fn drop(&mut self) {
        let mut in_callback = false;
        if let Some(Worker { tx, handle }) = self.worker.get_mut().unwrap().take() {
            drop(tx);
            if handle.thread().id() == std::thread::current().id() {
                // A real session cannot be destroyed from its own callback.
                log::error!("dummy session {} destroyed from its callback thread", self.id);
                in_callback = true;
            } else if handle.join().is_err() {
                log::warn!("dummy session worker panicked");
            }
        }

        let state = self.state.get_mut().unwrap();
        let mut planes: Vec<u64> = state
            .held
            .drain(..)
            .chain(state.ready.drain(..))
            .flat_map(|f| f.planes.into_iter().map(|p| p.dev_addr))
            .collect();

        let mut device = self.device.state();
        let reclaimed: Vec<u64> = device
            .outstanding
            .iter()
            .filter(|(_, f)| f.session == self.id)
            .map(|(id, _)| *id)
            .collect();
        for id in reclaimed {
            if let Some(frame) = device.outstanding.remove(&id) {
                log::debug!("reclaiming frame {} still mapped at destruction", id);
                planes.extend(frame.planes);
            }
        }
        device.sessions_destroyed += 1;
        if in_callback {
            device.sessions_destroyed_in_callback += 1;
        }
        drop(device);

        self.device.free_planes(&planes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(device: &DummyDevice, payload: &[u8], pts: u64) -> WireStream {
        let memory = device.memory();
        let addr = memory.alloc(payload.len(), MemoryKind::Device).unwrap();
        device.write_device(addr, payload);
        WireStream {
            mem_addr: addr,
            alloc_len: payload.len() as u32,
            data_len: payload.len() as u32,
            pts,
            ..Default::default()
        }
    }

    #[test]
    fn host_alias() {
        let device = DummyDevice::new();
        let memory = device.memory();

        let host = memory.alloc(16, MemoryKind::HostAccessible).unwrap();
        let dev = memory.device_pointer(host).unwrap();
        assert_ne!(host, dev);
        memory
            .copy(Transfer::HostToDevice {
                dst: host + 4,
                src: &[9, 8],
            })
            .unwrap();
        assert_eq!(device.read_device(dev + 4, 2), vec![9, 8]);

        memory.free(host).unwrap();
        assert!(memory.free(host).is_err());
        assert_eq!(device.live_allocations(), 0);
    }

    #[test]
    fn held_frames_come_out_at_end_of_stream() {
        let device = DummyDevice::new();
        device.hold_frames(2);
        let session = device.create_session(&create_info(), None).unwrap();

        for pts in 0..2 {
            session.decode_stream(&stream(&device, &[1], pts)).unwrap();
        }
        assert!(matches!(session.map_frame(), Err(BackendError::BufferEmpty)));

        session.decode_stream(&WireStream::default()).unwrap();
        let frames: Vec<_> = (0..3).map(|_| session.map_frame().unwrap()).collect();
        assert_eq!(frames[0].pts, 0);
        assert_eq!(frames[1].pts, 1);
        assert!(frames[2].is_eos_sentinel());

        for frame in &frames {
            session.unmap_frame(frame).unwrap();
        }
        assert!(session.unmap_frame(&frames[0]).is_err());
        assert_eq!(device.bad_unmaps(), 1);
    }

    #[test]
    fn destruction_reclaims_frames() {
        let device = DummyDevice::new();
        let session = device.create_session(&create_info(), None).unwrap();
        let input = stream(&device, &[1], 0);
        let live = device.live_allocations();

        session.decode_stream(&input).unwrap();
        session.decode_stream(&input).unwrap();
        let _mapped = session.map_frame().unwrap();
        assert!(device.live_allocations() > live);

        drop(session);
        assert_eq!(device.live_allocations(), live);
        assert_eq!(device.sessions_destroyed(), 1);
    }

    fn create_info() -> CreateInfo {
        CreateInfo {
            card_id: 0,
            device_id: 0,
            hw_ctx_id: 0,
            codec: EncodedFormat::H264,
            stream_buf_size: 4096,
            run_mode: Default::default(),
            send_mode: Default::default(),
            switch_frames: 0,
        }
    }
}
