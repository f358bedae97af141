//! Video stream sessions.
//!
//! A session is created by [`UvcHost::stream_open`][crate::UvcHost::stream_open] and owns
//! everything one running stream needs: the claimed interface and alternate setting, the frame
//! buffer pool and the data transfers in flight. Frames are delivered to the frame callback from
//! whichever thread processes transfer completions.

use std::{
    fmt, mem,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak},
};

use crate::{
    descriptor::{Endpoint, FormatIndex, FrameIndex, FrameInterval, FrameIntervals, TransferType},
    error::{err, Action, ErrorKind, ResultExt},
    host::OpenDevice,
    payload::{return_buffer, Flow, FrameSink, FreeList, Reassembler},
    probe::Negotiated,
    resolve::{Encoding, ResolvedFrame, StreamFormatRequest},
    transport::{Completion, DataTransfer, TransferId, TransferStatus, Transport},
    Result,
};

/// Called with every complete frame.
///
/// The frame owns one of the stream's frame buffers. Dropping it, or passing it to
/// [`UvcHost::frame_return`][crate::UvcHost::frame_return], hands the buffer back; frames kept
/// past the callback make the stream skip frames once all buffers are taken. The callback runs
/// on the thread that processes USB events and must not call back into the stream API for its
/// own stream.
pub type FrameCallback = Box<dyn FnMut(VideoFrame) + Send>;

/// Called with [`StreamEvent`]s. Same restrictions as [`FrameCallback`].
pub type EventCallback = Box<dyn FnMut(StreamEvent) + Send>;

/// Identifies an open stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle(pub(crate) u32);

impl StreamHandle {
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream #{}", self.0)
    }
}

/// The format a stream is running with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamFormat {
    pub encoding: Encoding,
    pub width: u16,
    pub height: u16,
    pub fps: f32,
    /// Size of the frame buffers, the largest frame that is delivered without truncation.
    pub max_frame_size: u32,
}

impl fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}x{}@{:.2}",
            self.encoding, self.width, self.height, self.fps
        )
    }
}

/// A reassembled video frame.
pub struct VideoFrame {
    pub(crate) data: Vec<u8>,
    pub(crate) stream: StreamHandle,
    pub(crate) sequence: u64,
    pub(crate) pts: Option<u32>,
    pub(crate) incomplete: bool,
    pub(crate) format: StreamFormat,
    pub(crate) pool: Weak<FreeList>,
}

impl VideoFrame {
    /// The frame payload. Compressed formats are passed through undecoded.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The stream the frame was received on.
    pub fn stream(&self) -> StreamHandle {
        self.stream
    }

    /// Number of frames delivered on this stream before this one.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Presentation time stamp from the payload headers, in device clock units.
    pub fn pts(&self) -> Option<u32> {
        self.pts
    }

    /// Whether the frame was truncated because it did not fit into the frame buffer.
    pub fn is_incomplete(&self) -> bool {
        self.incomplete
    }

    pub fn format(&self) -> &StreamFormat {
        &self.format
    }
}

impl Drop for VideoFrame {
    fn drop(&mut self) {
        return_buffer(&self.pool, mem::take(&mut self.data));
    }
}

impl fmt::Debug for VideoFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VideoFrame")
            .field("stream", &self.stream)
            .field("len", &self.data.len())
            .field("sequence", &self.sequence)
            .field("pts", &self.pts)
            .field("incomplete", &self.incomplete)
            .field("format", &self.format)
            .finish()
    }
}

/// Asynchronous stream notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum StreamEvent {
    /// A data transfer failed. The transfer is resubmitted.
    TransferError(TransferStatus),
    /// The device was unplugged. The stream stays open until it is closed.
    DeviceDisconnected,
    /// A frame was dropped because the device flagged an error or packets were lost.
    FrameError,
    /// A frame did not fit into its buffer and was delivered truncated.
    FrameOverflow { needed: usize, capacity: usize },
    /// All frame buffers were held by the application when a frame started. The frame was
    /// skipped.
    FrameBufferUnderflow,
}

/// Buffer sizes of an open stream, as returned by
/// [`UvcHost::buf_info`][crate::UvcHost::buf_info].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
    /// Largest frame the device said it will send for the current format (`dwMaxVideoFrameSize`).
    pub max_video_frame_size: u32,
    /// Size of each frame buffer.
    pub frame_buffer_size: usize,
    pub frame_buffers: usize,
    /// Bytes per payload committed with the device (`dwMaxPayloadTransferSize`).
    pub max_payload_size: u32,
}

/// One frame descriptor of a device, as returned by
/// [`UvcHost::frame_list`][crate::UvcHost::frame_list].
#[derive(Debug, Clone, PartialEq)]
pub struct FrameInfo {
    pub encoding: Encoding,
    pub format_index: FormatIndex,
    pub frame_index: FrameIndex,
    pub width: u16,
    pub height: u16,
    pub default_interval: FrameInterval,
    pub intervals: FrameIntervals,
}

/// Parameters of a stream to open.
pub struct StreamConfig {
    pub(crate) address: Option<u8>,
    pub(crate) vendor_id: Option<u16>,
    pub(crate) product_id: Option<u16>,
    pub(crate) uvc_stream_index: usize,
    pub(crate) format: StreamFormatRequest,
    pub(crate) frame_buffers: usize,
    pub(crate) frame_size: Option<usize>,
    pub(crate) transfers: usize,
    pub(crate) transfer_size: usize,
    pub(crate) max_payload_size: Option<u32>,
    pub(crate) on_frame: FrameCallback,
    pub(crate) on_event: Option<EventCallback>,
}

impl StreamConfig {
    pub const DEFAULT_FRAME_BUFFERS: usize = 3;
    pub const DEFAULT_TRANSFERS: usize = 3;
    pub const DEFAULT_TRANSFER_SIZE: usize = 10 * 1024;

    /// Creates a config for a stream of `format` on any video device.
    pub fn new<F>(format: StreamFormatRequest, on_frame: F) -> Self
    where
        F: FnMut(VideoFrame) + Send + 'static,
    {
        Self {
            address: None,
            vendor_id: None,
            product_id: None,
            uvc_stream_index: 0,
            format,
            frame_buffers: Self::DEFAULT_FRAME_BUFFERS,
            frame_size: None,
            transfers: Self::DEFAULT_TRANSFERS,
            transfer_size: Self::DEFAULT_TRANSFER_SIZE,
            max_payload_size: None,
            on_frame: Box::new(on_frame),
            on_event: None,
        }
    }

    /// Only open the device at this bus address.
    pub fn address(mut self, address: u8) -> Self {
        self.address = Some(address);
        self
    }

    pub fn vendor_id(mut self, vendor_id: u16) -> Self {
        self.vendor_id = Some(vendor_id);
        self
    }

    pub fn product_id(mut self, product_id: u16) -> Self {
        self.product_id = Some(product_id);
        self
    }

    /// Selects the video function of devices that have more than one camera.
    pub fn uvc_stream_index(mut self, index: usize) -> Self {
        self.uvc_stream_index = index;
        self
    }

    pub fn frame_buffers(mut self, count: usize) -> Self {
        self.frame_buffers = count;
        self
    }

    /// Overrides the frame buffer size, which otherwise is the size negotiated with the device.
    pub fn frame_size(mut self, bytes: usize) -> Self {
        self.frame_size = Some(bytes);
        self
    }

    /// Number of data transfers kept in flight.
    pub fn transfers(mut self, count: usize) -> Self {
        self.transfers = count;
        self
    }

    /// Buffer size of each data transfer.
    pub fn transfer_size(mut self, bytes: usize) -> Self {
        self.transfer_size = bytes;
        self
    }

    /// Bandwidth budget in bytes per (micro)frame. Defaults to the largest the interface offers.
    pub fn max_payload_size(mut self, bytes: u32) -> Self {
        self.max_payload_size = Some(bytes);
        self
    }

    pub fn on_event<F>(mut self, on_event: F) -> Self
    where
        F: FnMut(StreamEvent) + Send + 'static,
    {
        self.on_event = Some(Box::new(on_event));
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        self.format.validate()?;
        if self.frame_buffers == 0 || self.transfers == 0 || self.transfer_size == 0 {
            return err(
                ErrorKind::InvalidArgument,
                "frame buffer and transfer counts and sizes must be non-zero",
                Action::OpeningDevice,
            );
        }
        if self.frame_size == Some(0) {
            return err(
                ErrorKind::InvalidArgument,
                "frame size override must be non-zero",
                Action::OpeningDevice,
            );
        }
        Ok(())
    }

    pub(crate) fn matches(&self, address: u8, vendor_id: u16, product_id: u16) -> bool {
        self.address.map_or(true, |a| a == address)
            && self.vendor_id.map_or(true, |v| v == vendor_id)
            && self.product_id.map_or(true, |p| p == product_id)
    }
}

impl fmt::Debug for StreamConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamConfig")
            .field("address", &self.address)
            .field("vendor_id", &self.vendor_id)
            .field("product_id", &self.product_id)
            .field("uvc_stream_index", &self.uvc_stream_index)
            .field("format", &self.format)
            .field("frame_buffers", &self.frame_buffers)
            .field("frame_size", &self.frame_size)
            .field("transfers", &self.transfers)
            .field("transfer_size", &self.transfer_size)
            .field("max_payload_size", &self.max_payload_size)
            .finish()
    }
}

/// Builds the [`StreamFormat`] reported for a negotiated stream.
pub(crate) fn stream_format(
    resolved: &ResolvedFrame<'_>,
    negotiated: &Negotiated,
    frame_size: usize,
) -> StreamFormat {
    StreamFormat {
        encoding: Encoding::from(resolved.format.kind()),
        width: resolved.frame.width(),
        height: resolved.frame.height(),
        fps: negotiated.interval.fps(),
        max_frame_size: frame_size as u32,
    }
}

/// Frame buffer size for a stream: the caller's override, else what the device negotiated, else
/// what the frame descriptor declares, else a 16 bit per pixel estimate.
pub(crate) fn frame_buffer_size(
    resolved: &ResolvedFrame<'_>,
    negotiated: &Negotiated,
    requested: Option<usize>,
) -> usize {
    if let Some(size) = requested {
        return size;
    }
    if negotiated.max_video_frame_size != 0 {
        return negotiated.max_video_frame_size as usize;
    }
    if let Some(size) = resolved.frame.max_video_frame_buffer_size() {
        log::warn!("device negotiated no frame size, using descriptor value {}", size);
        return size as usize;
    }
    let size = usize::from(resolved.frame.width()) * usize::from(resolved.frame.height()) * 2;
    log::warn!("device declares no frame size, assuming {} bytes", size);
    size
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionState {
    Opening,
    Streaming,
    Paused,
    Closing,
}

pub(crate) struct Callbacks {
    pub(crate) on_frame: FrameCallback,
    pub(crate) on_event: Option<EventCallback>,
}

impl FrameSink for Callbacks {
    fn frame(&mut self, frame: VideoFrame) {
        (self.on_frame)(frame);
    }

    fn event(&mut self, event: StreamEvent) {
        match &mut self.on_event {
            Some(on_event) => on_event(event),
            None => log::debug!("unhandled stream event: {:?}", event),
        }
    }
}

/// Stream parameters committed with the device and the alternate setting that carries them.
pub(crate) struct Agreement {
    pub(crate) alt_setting: u8,
    pub(crate) endpoint: Endpoint,
    pub(crate) negotiated: Negotiated,
    pub(crate) format: StreamFormat,
}

/// What a session negotiates with, copied out so that negotiation runs without the session lock.
pub(crate) struct NegotiationParams {
    pub(crate) handle: StreamHandle,
    pub(crate) device: Arc<OpenDevice>,
    pub(crate) interface: u8,
    pub(crate) request: StreamFormatRequest,
    pub(crate) budget: Option<u32>,
    pub(crate) transfer_size: usize,
    pub(crate) frame_size: Option<usize>,
    pub(crate) frame_buffers: usize,
    pub(crate) isochronous: bool,
}

/// Runtime state of one stream.
pub(crate) struct Session {
    pub(crate) handle: StreamHandle,
    pub(crate) device: Arc<OpenDevice>,
    pub(crate) interface: u8,
    pub(crate) alt_setting: u8,
    pub(crate) endpoint: Endpoint,
    pub(crate) request: StreamFormatRequest,
    /// Bandwidth budget from the config. The interface's largest setting if `None`.
    pub(crate) budget: Option<u32>,
    pub(crate) negotiated: Negotiated,
    pub(crate) frame_size: Option<usize>,
    pub(crate) state: SessionState,
    pub(crate) reassembler: Reassembler,
    pub(crate) callbacks: Callbacks,
    pub(crate) transfers: usize,
    pub(crate) transfer_size: usize,
    pub(crate) in_flight: usize,
}

impl Session {
    pub(crate) fn address(&self) -> u8 {
        self.device.address()
    }

    pub(crate) fn is_isochronous(&self) -> bool {
        self.endpoint.transfer_type() == TransferType::Isochronous
    }

    /// Allocates and submits all transfer slots.
    pub(crate) fn submit_all(&mut self, transport: &dyn Transport) -> Result<()> {
        for slot in 0..self.transfers {
            let transfer = self.allocate_transfer(slot as u16)?;
            transport
                .submit(self.address(), transfer)
                .during(Action::SubmittingTransfer)?;
            self.in_flight += 1;
        }
        log::trace!(
            "{}: {} transfers of {} bytes submitted",
            self.handle,
            self.transfers,
            self.transfer_size
        );
        Ok(())
    }

    fn allocate_transfer(&self, slot: u16) -> Result<DataTransfer> {
        let (len, packet_size, num_packets) = if self.is_isochronous() {
            let packet_size = self.endpoint.effective_size() as usize;
            let num_packets = (self.transfer_size / packet_size).max(1);
            (num_packets * packet_size, packet_size, num_packets)
        } else {
            // A transfer holds at least one whole payload.
            (
                self.transfer_size
                    .max(self.negotiated.max_payload_size as usize),
                self.endpoint.packet_size() as usize,
                0,
            )
        };

        let mut buffer = Vec::new();
        if buffer.try_reserve_exact(len).is_err() {
            return err(
                ErrorKind::NoMemory,
                format!("failed to allocate a {} byte transfer buffer", len),
                Action::AllocatingBuffers,
            );
        }
        buffer.resize(len, 0);

        Ok(DataTransfer {
            id: TransferId::new(self.handle.0, slot),
            endpoint: self.endpoint.address(),
            kind: self.endpoint.transfer_type(),
            buffer,
            packet_size,
            num_packets,
        })
    }

    /// Processes a finished transfer and resubmits it if the stream is still running.
    pub(crate) fn complete(&mut self, transport: &dyn Transport, completion: Completion) {
        self.in_flight = self.in_flight.saturating_sub(1);
        log::trace!(
            "{}: transfer {:?} done: {:?}",
            self.handle,
            completion.id,
            completion.status
        );

        if self.state != SessionState::Streaming {
            return;
        }

        match completion.status {
            TransferStatus::Completed => {
                let Session {
                    reassembler,
                    callbacks,
                    ..
                } = self;
                if reassembler.completion(&completion, callbacks) == Flow::Stop {
                    return;
                }
            }
            TransferStatus::Cancelled | TransferStatus::NoDevice => return,
            status => {
                log::warn!("{}: transfer failed: {:?}", self.handle, status);
                self.callbacks.event(StreamEvent::TransferError(status));
            }
        }

        let transfer = DataTransfer {
            id: completion.id,
            endpoint: completion.endpoint,
            kind: self.endpoint.transfer_type(),
            num_packets: if self.is_isochronous() {
                completion.buffer.len() / completion.packet_size.max(1)
            } else {
                0
            },
            packet_size: completion.packet_size,
            buffer: completion.buffer,
        };
        match transport.submit(self.address(), transfer) {
            Ok(()) => self.in_flight += 1,
            Err(e) => {
                log::error!("{}: failed to resubmit transfer: {}", self.handle, e);
                self.callbacks
                    .event(StreamEvent::TransferError(TransferStatus::Error));
            }
        }
    }

    pub(crate) fn params(&self) -> NegotiationParams {
        NegotiationParams {
            handle: self.handle,
            device: self.device.clone(),
            interface: self.interface,
            request: self.request,
            budget: self.budget,
            transfer_size: self.transfer_size,
            frame_size: self.frame_size,
            frame_buffers: self.reassembler.pool().len(),
            isochronous: self.is_isochronous(),
        }
    }

    /// Takes over the parameters of a new negotiation. The frame buffers stay as they are.
    pub(crate) fn apply(&mut self, agreed: &Agreement) {
        self.alt_setting = agreed.alt_setting;
        self.endpoint = agreed.endpoint;
        self.negotiated = agreed.negotiated;
        self.reassembler
            .set_max_payload(agreed.negotiated.max_payload_size);
    }

    pub(crate) fn buffer_info(&self) -> BufferInfo {
        let pool = self.reassembler.pool();
        BufferInfo {
            max_video_frame_size: self.negotiated.max_video_frame_size,
            frame_buffer_size: pool.capacity(),
            frame_buffers: pool.len(),
            max_payload_size: self.negotiated.max_payload_size,
        }
    }

    pub(crate) fn device_gone(&mut self) {
        if matches!(self.state, SessionState::Streaming | SessionState::Opening) {
            self.state = SessionState::Paused;
        }
        log::info!("{}: device disconnected", self.handle);
        self.callbacks.event(StreamEvent::DeviceDisconnected);
    }
}

/// A session plus the condition its closer waits on for transfers to drain.
pub(crate) struct SessionCell {
    session: Mutex<Session>,
    drained: Condvar,
}

impl SessionCell {
    pub(crate) fn new(session: Session) -> Self {
        Self {
            session: Mutex::new(session),
            drained: Condvar::new(),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn complete(&self, transport: &dyn Transport, completion: Completion) {
        let mut session = self.lock();
        session.complete(transport, completion);
        if session.in_flight == 0 {
            self.drained.notify_all();
        }
    }

    /// Waits for a completion to be processed, or for `timeout` to elapse.
    pub(crate) fn wait<'a>(
        &self,
        guard: MutexGuard<'a, Session>,
        timeout: std::time::Duration,
    ) -> MutexGuard<'a, Session> {
        match self.drained.wait_timeout(guard, timeout) {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        }
    }
}
