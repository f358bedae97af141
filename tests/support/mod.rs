//! Shared helpers for the integration tests: a simulated USB host stack and real descriptors.

#![allow(dead_code)]


use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Condvar, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use uvc_host::{
    transport::{
        Completion, DataTransfer, DeviceInfo, IsoPacket, SetupPacket, TransferStatus,
        TransportEvent,
    },
    Error, ErrorKind, Result, TransferType, Transport, VideoFrame,
};

const SET_CUR: u8 = 0x01;
const GET_CUR: u8 = 0x81;
const GET_MIN: u8 = 0x82;
const GET_MAX: u8 = 0x83;

const PROBE: u16 = 1;
const COMMIT: u16 = 2;

const OFFSET_FRAME_INDEX: usize = 3;
const OFFSET_MAX_VIDEO_FRAME_SIZE: usize = 18;
const OFFSET_MAX_PAYLOAD: usize = 22;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Builds a payload with a two byte header.
pub fn payload(fid: bool, eof: bool, data: &[u8]) -> Vec<u8> {
    let mut info = 0x80;
    if fid {
        info |= 0x01;
    }
    if eof {
        info |= 0x02;
    }
    let mut packet = vec![2, info];
    packet.extend_from_slice(data);
    packet
}

struct SimDevice {
    info: DeviceInfo,
    config: Vec<u8>,
    attached: bool,
}

#[derive(Default)]
struct State {
    registered: bool,
    devices: Vec<SimDevice>,
    /// Last probe written per (address, interface).
    probes: HashMap<(u8, u16), Vec<u8>>,
    commits: Vec<(u8, u16, Vec<u8>)>,
    requests: Vec<(u8, SetupPacket)>,
    claims: Vec<(u8, u8)>,
    releases: Vec<(u8, u8)>,
    alt_settings: Vec<(u8, u8, u8)>,
    halts_cleared: Vec<(u8, u8)>,
    pending: VecDeque<(u8, DataTransfer)>,
    payloads: HashMap<(u8, u8), VecDeque<Vec<u8>>>,
    events: VecDeque<TransportEvent>,
    frame_index_override: Option<u8>,
    payload_range: (u32, u32),
    max_video_frame_size: u32,
}

/// A USB host stack with scripted devices.
///
/// Probe requests are echoed back, GET_MIN/GET_MAX report a 512..=3072 byte payload range, and
/// data transfers stay pending until payloads are queued with [`SimTransport::push_payloads`].
pub struct SimTransport {
    state: Mutex<State>,
    changed: Condvar,
}

impl SimTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                payload_range: (512, 3072),
                max_video_frame_size: 64 * 1024,
                ..State::default()
            }),
            changed: Condvar::new(),
        })
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Plugs in a device. Returns its address.
    pub fn attach(&self, address: u8, (vendor_id, product_id): (u16, u16), config: &[u8]) -> u8 {
        let mut state = self.state();
        state.devices.push(SimDevice {
            info: DeviceInfo {
                address,
                vendor_id,
                product_id,
            },
            config: config.to_vec(),
            attached: true,
        });
        state.events.push_back(TransportEvent::DeviceAttached(address));
        self.changed.notify_all();
        address
    }

    /// Unplugs a device. Its pending transfers complete with [`TransferStatus::NoDevice`].
    pub fn detach(&self, address: u8) {
        let mut state = self.state();
        for dev in state.devices.iter_mut().filter(|d| d.info.address == address) {
            dev.attached = false;
        }
        let pending = std::mem::take(&mut state.pending);
        for (addr, transfer) in pending {
            if addr == address {
                state
                    .events
                    .push_back(TransportEvent::TransferDone(Completion::empty(
                        transfer,
                        TransferStatus::NoDevice,
                    )));
            } else {
                state.pending.push_back((addr, transfer));
            }
        }
        state.events.push_back(TransportEvent::DeviceGone(address));
        self.changed.notify_all();
    }

    /// Queues payload chunks for an endpoint. Isochronous transfers carry one chunk per packet
    /// slot. Bulk transfers take chunks until one ends in a short packet (its length is not a
    /// multiple of the packet size) or the buffer is full; a chunk that does not fit continues in
    /// the next transfer.
    pub fn push_payloads(&self, address: u8, endpoint: u8, payloads: Vec<Vec<u8>>) {
        let mut state = self.state();
        state
            .payloads
            .entry((address, endpoint))
            .or_default()
            .extend(payloads);
        self.changed.notify_all();
    }

    /// Makes the device answer every probe with this frame index.
    pub fn override_frame_index(&self, index: u8) {
        self.state().frame_index_override = Some(index);
    }

    pub fn set_payload_range(&self, min: u32, max: u32) {
        self.state().payload_range = (min, max);
    }

    pub fn set_max_video_frame_size(&self, size: u32) {
        self.state().max_video_frame_size = size;
    }

    pub fn is_registered(&self) -> bool {
        self.state().registered
    }

    pub fn claims(&self) -> Vec<(u8, u8)> {
        self.state().claims.clone()
    }

    pub fn releases(&self) -> Vec<(u8, u8)> {
        self.state().releases.clone()
    }

    pub fn alt_settings(&self) -> Vec<(u8, u8, u8)> {
        self.state().alt_settings.clone()
    }

    pub fn halts_cleared(&self) -> Vec<(u8, u8)> {
        self.state().halts_cleared.clone()
    }

    /// Committed probe payloads as `(address, interface, data)`.
    pub fn commits(&self) -> Vec<(u8, u16, Vec<u8>)> {
        self.state().commits.clone()
    }

    pub fn requests(&self) -> Vec<(u8, SetupPacket)> {
        self.state().requests.clone()
    }

    /// Number of data transfers currently held by the host stack.
    pub fn pending(&self) -> usize {
        self.state().pending.len()
    }

    /// Payloads not yet picked up by a transfer.
    pub fn queued_payloads(&self) -> usize {
        self.state().payloads.values().map(|q| q.len()).sum()
    }

    pub fn pending_transfers(&self) -> Vec<(u8, u8, TransferType, usize)> {
        self.state()
            .pending
            .iter()
            .map(|(addr, t)| (*addr, t.endpoint, t.kind, t.buffer.len()))
            .collect()
    }

    fn attached(state: &State, address: u8) -> Result<&SimDevice> {
        state
            .devices
            .iter()
            .find(|d| d.attached && d.info.address == address)
            .ok_or_else(|| Error::new(ErrorKind::NotFound, format!("no device {}", address)))
    }

    /// Completes pending transfers for which payloads are queued.
    fn run_transfers(state: &mut State) {
        let pending = std::mem::take(&mut state.pending);
        for (address, mut transfer) in pending {
            let queue = match state.payloads.get_mut(&(address, transfer.endpoint)) {
                Some(queue) if !queue.is_empty() => queue,
                _ => {
                    state.pending.push_back((address, transfer));
                    continue;
                }
            };

            let completion = if transfer.kind == TransferType::Isochronous {
                let mut iso_packets = Vec::with_capacity(transfer.num_packets);
                for slot in 0..transfer.num_packets {
                    let start = slot * transfer.packet_size;
                    let actual_length = match queue.pop_front() {
                        Some(data) => {
                            let len = data.len().min(transfer.packet_size);
                            transfer.buffer[start..start + len].copy_from_slice(&data[..len]);
                            len
                        }
                        None => 0,
                    };
                    iso_packets.push(IsoPacket {
                        status: TransferStatus::Completed,
                        actual_length,
                    });
                }
                Completion {
                    id: transfer.id,
                    endpoint: transfer.endpoint,
                    status: TransferStatus::Completed,
                    actual_length: 0,
                    iso_packets,
                    packet_size: transfer.packet_size,
                    buffer: transfer.buffer,
                }
            } else {
                let mut len = 0;
                while len < transfer.buffer.len() {
                    let chunk = match queue.pop_front() {
                        Some(chunk) => chunk,
                        None => break,
                    };
                    let take = chunk.len().min(transfer.buffer.len() - len);
                    transfer.buffer[len..len + take].copy_from_slice(&chunk[..take]);
                    len += take;
                    if take < chunk.len() {
                        queue.push_front(chunk[take..].to_vec());
                        break;
                    }
                    if chunk.is_empty() || chunk.len() % transfer.packet_size.max(1) != 0 {
                        break;
                    }
                }
                Completion {
                    id: transfer.id,
                    endpoint: transfer.endpoint,
                    status: TransferStatus::Completed,
                    actual_length: len,
                    iso_packets: Vec::new(),
                    packet_size: transfer.packet_size,
                    buffer: transfer.buffer,
                }
            };
            state
                .events
                .push_back(TransportEvent::TransferDone(completion));
        }
    }
}

impl Transport for SimTransport {
    fn register_client(&self) -> Result<()> {
        let mut state = self.state();
        if state.registered {
            return Err(Error::new(ErrorKind::InvalidState, "already registered"));
        }
        state.registered = true;
        Ok(())
    }

    fn deregister_client(&self) -> Result<()> {
        self.state().registered = false;
        Ok(())
    }

    fn devices(&self) -> Result<Vec<DeviceInfo>> {
        Ok(self
            .state()
            .devices
            .iter()
            .filter(|d| d.attached)
            .map(|d| d.info)
            .collect())
    }

    fn config_descriptor(&self, address: u8) -> Result<Vec<u8>> {
        let state = self.state();
        Ok(Self::attached(&state, address)?.config.clone())
    }

    fn control_transfer(
        &self,
        address: u8,
        setup: SetupPacket,
        data: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize> {
        let mut state = self.state();
        Self::attached(&state, address)?;
        state.requests.push((address, setup));

        let key = (address, setup.index);
        let control = setup.value >> 8;
        let len = usize::from(setup.length).min(data.len());
        match (setup.request, control) {
            (SET_CUR, PROBE) => {
                state.probes.insert(key, data[..len].to_vec());
            }
            (SET_CUR, COMMIT) => state.commits.push((address, setup.index, data[..len].to_vec())),
            (GET_CUR, PROBE) | (GET_MIN, PROBE) | (GET_MAX, PROBE) => {
                let mut probe = state.probes.get(&key).cloned().unwrap_or_default();
                probe.resize(len, 0);
                if let Some(index) = state.frame_index_override {
                    probe[OFFSET_FRAME_INDEX] = index;
                }
                let frame_size =
                    &mut probe[OFFSET_MAX_VIDEO_FRAME_SIZE..OFFSET_MAX_VIDEO_FRAME_SIZE + 4];
                if frame_size.iter().all(|&b| b == 0) {
                    frame_size.copy_from_slice(&state.max_video_frame_size.to_le_bytes());
                }
                let (min, max) = state.payload_range;
                let payload = match setup.request {
                    GET_MIN => Some(min),
                    GET_MAX => Some(max),
                    _ => None,
                };
                if let Some(payload) = payload {
                    probe[OFFSET_MAX_PAYLOAD..OFFSET_MAX_PAYLOAD + 4]
                        .copy_from_slice(&payload.to_le_bytes());
                }
                data[..len].copy_from_slice(&probe);
            }
            other => {
                return Err(Error::new(
                    ErrorKind::Transport,
                    format!("unexpected control request {:?}", other),
                ))
            }
        }
        Ok(len)
    }

    fn claim_interface(&self, address: u8, interface: u8) -> Result<()> {
        let mut state = self.state();
        Self::attached(&state, address)?;
        state.claims.push((address, interface));
        Ok(())
    }

    fn release_interface(&self, address: u8, interface: u8) -> Result<()> {
        self.state().releases.push((address, interface));
        Ok(())
    }

    fn set_alternate_setting(&self, address: u8, interface: u8, alt_setting: u8) -> Result<()> {
        let mut state = self.state();
        if alt_setting != 0 {
            Self::attached(&state, address)?;
        }
        state.alt_settings.push((address, interface, alt_setting));
        Ok(())
    }

    fn clear_halt(&self, address: u8, endpoint: u8) -> Result<()> {
        self.state().halts_cleared.push((address, endpoint));
        Ok(())
    }

    fn submit(&self, address: u8, transfer: DataTransfer) -> Result<()> {
        let mut state = self.state();
        Self::attached(&state, address)?;
        state.pending.push_back((address, transfer));
        self.changed.notify_all();
        Ok(())
    }

    fn cancel_transfers(&self, address: u8, endpoint: u8) -> Result<()> {
        let mut state = self.state();
        let pending = std::mem::take(&mut state.pending);
        for (addr, transfer) in pending {
            if addr == address && transfer.endpoint == endpoint {
                state
                    .events
                    .push_back(TransportEvent::TransferDone(Completion::empty(
                        transfer,
                        TransferStatus::Cancelled,
                    )));
            } else {
                state.pending.push_back((addr, transfer));
            }
        }
        self.changed.notify_all();
        Ok(())
    }

    fn poll_events(&self, timeout: Duration) -> Result<Vec<TransportEvent>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state();
        loop {
            Self::run_transfers(&mut state);
            if !state.events.is_empty() {
                return Ok(state.events.drain(..).collect());
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            state = self.changed.wait_timeout(state, deadline - now).unwrap().0;
        }
    }
}

/// Frames and events recorded by stream callbacks.
#[derive(Default)]
pub struct Recorder {
    frames: Mutex<Vec<RecordedFrame>>,
    held: Mutex<Vec<VideoFrame>>,
    events: Mutex<Vec<uvc_host::StreamEvent>>,
    new_frame: Condvar,
    new_event: Condvar,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedFrame {
    pub data: Vec<u8>,
    pub sequence: u64,
    pub incomplete: bool,
}

impl RecordedFrame {
    fn of(frame: &VideoFrame) -> Self {
        Self {
            data: frame.data().to_vec(),
            sequence: frame.sequence(),
            incomplete: frame.is_incomplete(),
        }
    }
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Records frames and drops them, returning their buffers right away.
    pub fn on_frame(self: &Arc<Self>) -> impl FnMut(VideoFrame) + Send + 'static {
        let this = self.clone();
        move |frame| this.record(RecordedFrame::of(&frame))
    }

    /// Records frames and keeps them until [`Recorder::take_held`].
    pub fn holding(self: &Arc<Self>) -> impl FnMut(VideoFrame) + Send + 'static {
        let this = self.clone();
        move |frame| {
            let recorded = RecordedFrame::of(&frame);
            this.held.lock().unwrap().push(frame);
            this.record(recorded);
        }
    }

    fn record(&self, frame: RecordedFrame) {
        self.frames.lock().unwrap().push(frame);
        self.new_frame.notify_all();
    }

    pub fn take_held(&self) -> Vec<VideoFrame> {
        std::mem::take(&mut *self.held.lock().unwrap())
    }

    pub fn on_event(self: &Arc<Self>) -> impl FnMut(uvc_host::StreamEvent) + Send + 'static {
        let this = self.clone();
        move |event| {
            this.events.lock().unwrap().push(event);
            this.new_event.notify_all();
        }
    }

    pub fn frames(&self) -> Vec<RecordedFrame> {
        self.frames.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<uvc_host::StreamEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Waits until at least `count` frames were recorded.
    pub fn wait_frames(&self, count: usize, timeout: Duration) -> Vec<RecordedFrame> {
        let deadline = Instant::now() + timeout;
        let mut frames = self.frames.lock().unwrap();
        while frames.len() < count {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            frames = self.new_frame.wait_timeout(frames, deadline - now).unwrap().0;
        }
        frames.clone()
    }

    /// Waits until an event satisfying `pred` was recorded.
    pub fn wait_event(
        &self,
        timeout: Duration,
        pred: impl Fn(&uvc_host::StreamEvent) -> bool,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        let mut events = self.events.lock().unwrap();
        loop {
            if events.iter().any(&pred) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            events = self.new_event.wait_timeout(events, deadline - now).unwrap().0;
        }
    }
}
