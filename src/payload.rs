//! Payload headers and frame reassembly (2.4.3.3)
//!
//! Every video payload starts with a header whose `bmHeaderInfo` carries a frame ID bit that
//! toggles at each new frame, an end-of-frame bit and an error bit. A frame ends when the frame
//! ID toggles or when a payload has the end-of-frame bit set.

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use bitflags::bitflags;
use byteorder::{ByteOrder, LittleEndian};

use crate::{
    error::{err, Action, ErrorKind},
    stream::{StreamEvent, StreamFormat, StreamHandle, VideoFrame},
    transport::{Completion, TransferStatus},
    Result,
};

bitflags! {
    pub struct HeaderInfo: u8 {
        /// Frame ID. Toggles at the start of each frame.
        const FID = 1 << 0;
        /// End of frame.
        const EOF = 1 << 1;
        const PTS = 1 << 2;
        const SCR = 1 << 3;
        /// Payload-specific bit. Meaning depends on the format.
        const PAYLOAD_SPECIFIC = 1 << 4;
        const STILL = 1 << 5;
        const ERR = 1 << 6;
        /// End of header. Set on the last header of a chain.
        const EOH = 1 << 7;
    }
}

/// Source clock reference: the device clock at the time the payload was sent, plus the USB
/// frame number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceClock {
    pub stc: u32,
    pub sof: u16,
}

/// A decoded payload header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadHeader {
    len: usize,
    info: HeaderInfo,
    pts: Option<u32>,
    scr: Option<SourceClock>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderError {
    /// `bHeaderLength` is below the minimum of 2.
    TooShort(u8),
    /// `bHeaderLength` runs past the end of the packet.
    PastEnd { header: u8, packet: usize },
}

impl fmt::Display for HeaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderError::TooShort(len) => write!(f, "payload header length {} is too short", len),
            HeaderError::PastEnd { header, packet } => write!(
                f,
                "payload header length {} exceeds packet length {}",
                header, packet
            ),
        }
    }
}

impl PayloadHeader {
    /// Parses the header at the start of a non-empty payload.
    pub fn parse(packet: &[u8]) -> std::result::Result<Self, HeaderError> {
        let len = packet.first().copied().unwrap_or(0);
        if len < 2 {
            return Err(HeaderError::TooShort(len));
        }
        if usize::from(len) > packet.len() {
            return Err(HeaderError::PastEnd {
                header: len,
                packet: packet.len(),
            });
        }
        let header = &packet[..usize::from(len)];
        let info = HeaderInfo::from_bits_truncate(header[1]);

        // Optional fields are only read if the declared length covers them.
        let mut rest = &header[2..];
        let mut pts = None;
        if info.contains(HeaderInfo::PTS) && rest.len() >= 4 {
            pts = Some(LittleEndian::read_u32(rest));
            rest = &rest[4..];
        }
        let mut scr = None;
        if info.contains(HeaderInfo::SCR) && rest.len() >= 6 {
            scr = Some(SourceClock {
                stc: LittleEndian::read_u32(rest),
                sof: LittleEndian::read_u16(&rest[4..]) & 0x07ff,
            });
        }

        Ok(Self {
            len: usize::from(len),
            info,
            pts,
            scr,
        })
    }

    /// Length of the header, i.e. the offset of the payload data.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn info(&self) -> HeaderInfo {
        self.info
    }

    pub fn frame_id(&self) -> bool {
        self.info.contains(HeaderInfo::FID)
    }

    pub fn end_of_frame(&self) -> bool {
        self.info.contains(HeaderInfo::EOF)
    }

    pub fn error(&self) -> bool {
        self.info.contains(HeaderInfo::ERR)
    }

    /// Presentation time stamp in device clock units.
    pub fn pts(&self) -> Option<u32> {
        self.pts
    }

    pub fn scr(&self) -> Option<SourceClock> {
        self.scr
    }
}

/// Receives the output of a [`Reassembler`].
pub(crate) trait FrameSink {
    fn frame(&mut self, frame: VideoFrame);
    fn event(&mut self, event: StreamEvent);
}

/// Empty frame buffers of one session.
pub(crate) type FreeList = Mutex<Vec<Vec<u8>>>;

/// Frame buffers of one session.
///
/// A buffer leaves the free list when a frame starts and comes back when the [`VideoFrame`]
/// holding it is dropped, so buffers kept by the application are unavailable until then.
pub(crate) struct FramePool {
    free: Arc<FreeList>,
    capacity: usize,
    count: usize,
}

impl FramePool {
    pub(crate) fn new(count: usize, capacity: usize) -> Result<Self> {
        if count == 0 || capacity == 0 {
            return err(
                ErrorKind::InvalidArgument,
                format!("cannot allocate {} frame buffers of {} bytes", count, capacity),
                Action::AllocatingBuffers,
            );
        }
        let mut buffers = Vec::new();
        if buffers.try_reserve_exact(count).is_err() {
            return err(
                ErrorKind::NoMemory,
                format!("failed to allocate {} frame buffers", count),
                Action::AllocatingBuffers,
            );
        }
        for _ in 0..count {
            let mut buf = Vec::new();
            if buf.try_reserve_exact(capacity).is_err() {
                return err(
                    ErrorKind::NoMemory,
                    format!("failed to allocate a {} byte frame buffer", capacity),
                    Action::AllocatingBuffers,
                );
            }
            buffers.push(buf);
        }
        Ok(Self {
            free: Arc::new(Mutex::new(buffers)),
            capacity,
            count,
        })
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn len(&self) -> usize {
        self.count
    }

    /// Number of buffers not held by a frame.
    pub(crate) fn available(&self) -> usize {
        lock(&self.free).len()
    }

    fn take(&self) -> Option<Vec<u8>> {
        lock(&self.free).pop()
    }

    fn put(&self, mut buf: Vec<u8>) {
        buf.clear();
        lock(&self.free).push(buf);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Hands a frame buffer back to the pool it came from. Buffers of a pool that was replaced or
/// whose stream was closed are freed.
pub(crate) fn return_buffer(pool: &Weak<FreeList>, mut buf: Vec<u8>) {
    if let Some(free) = pool.upgrade() {
        buf.clear();
        lock(&free).push(buf);
    }
}

/// What to do with the rest of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    /// The transfer was cancelled or the device is gone.
    Stop,
}

/// A bulk payload whose data continues in the next transfer.
#[derive(Debug, Clone, Copy)]
struct Continuation {
    end_of_frame: bool,
    /// Payload bytes received so far, header included.
    received: usize,
}

/// Turns payloads into frames.
pub(crate) struct Reassembler {
    stream: StreamHandle,
    pool: FramePool,
    format: StreamFormat,
    /// Negotiated payload size. A bulk payload ends at a short transfer or at this size.
    max_payload: usize,
    current: Option<Vec<u8>>,
    continuation: Option<Continuation>,
    last_fid: Option<bool>,
    /// The current frame is broken and will be dropped when it ends.
    errored: bool,
    /// No buffer was free when the current frame started, its data is discarded.
    skipping: bool,
    /// Bytes the current frame would have needed without truncation.
    overflow: Option<usize>,
    pts: Option<u32>,
    sequence: u64,
}

impl Reassembler {
    pub(crate) fn new(
        stream: StreamHandle,
        pool: FramePool,
        format: StreamFormat,
        max_payload: u32,
    ) -> Self {
        Self {
            stream,
            pool,
            format,
            max_payload: max_payload as usize,
            current: None,
            continuation: None,
            last_fid: None,
            errored: false,
            skipping: false,
            overflow: None,
            pts: None,
            sequence: 0,
        }
    }

    pub(crate) fn format(&self) -> &StreamFormat {
        &self.format
    }

    pub(crate) fn pool(&self) -> &FramePool {
        &self.pool
    }

    pub(crate) fn set_max_payload(&mut self, max_payload: u32) {
        self.max_payload = max_payload as usize;
    }

    /// Switches to a new format and buffer pool. Frames still held by the application free their
    /// buffers instead of returning them.
    pub(crate) fn replace(&mut self, pool: FramePool, format: StreamFormat, max_payload: u32) {
        self.reset();
        self.pool = pool;
        self.format = format;
        self.max_payload = max_payload as usize;
    }

    /// Drops the frame in progress, e.g. when the stream is stopped.
    pub(crate) fn reset(&mut self) {
        if let Some(buf) = self.current.take() {
            self.pool.put(buf);
        }
        self.continuation = None;
        self.last_fid = None;
        self.errored = false;
        self.skipping = false;
        self.overflow = None;
        self.pts = None;
    }

    /// Processes the payloads carried by a successful data transfer.
    pub(crate) fn completion(&mut self, completion: &Completion, sink: &mut dyn FrameSink) -> Flow {
        if completion.iso_packets.is_empty() {
            let len = completion.actual_length.min(completion.buffer.len());
            self.bulk(&completion.buffer[..len], completion.buffer.len(), sink);
            return Flow::Continue;
        }

        for (i, packet) in completion.iso_packets.iter().enumerate() {
            match packet.status {
                TransferStatus::Completed => {
                    let start = i * completion.packet_size;
                    let end = (start + packet.actual_length).min(completion.buffer.len());
                    if start < end {
                        self.payload(&completion.buffer[start..end], sink);
                    }
                }
                TransferStatus::Skipped | TransferStatus::TimedOut => {}
                TransferStatus::Cancelled | TransferStatus::NoDevice => return Flow::Stop,
                status => {
                    log::trace!("isochronous packet {} failed: {:?}", i, status);
                    self.errored = true;
                }
            }
        }
        Flow::Continue
    }

    /// Processes one bulk transfer of `capacity` bytes that received `data`.
    ///
    /// A payload may span several transfers. It ends with a short transfer or once the
    /// negotiated payload size has been received, and only then does a new header follow.
    fn bulk(&mut self, data: &[u8], capacity: usize, sink: &mut dyn FrameSink) {
        let (end_of_frame, received) = match self.continuation.take() {
            Some(cont) => {
                self.append(data, sink);
                (cont.end_of_frame, cont.received + data.len())
            }
            None => {
                if data.is_empty() {
                    return;
                }
                let header = match self.header(data, sink) {
                    Some(header) => header,
                    None => return,
                };
                self.append(&data[header.len()..], sink);
                (header.end_of_frame(), data.len())
            }
        };

        let short = data.len() < capacity;
        if short || (self.max_payload != 0 && received >= self.max_payload) {
            if end_of_frame {
                self.end_frame(sink);
            }
        } else {
            self.continuation = Some(Continuation {
                end_of_frame,
                received,
            });
        }
    }

    /// Processes one payload (header and data).
    pub(crate) fn payload(&mut self, packet: &[u8], sink: &mut dyn FrameSink) {
        if packet.is_empty() {
            return;
        }
        if let Some(header) = self.header(packet, sink) {
            self.append(&packet[header.len()..], sink);
            if header.end_of_frame() {
                self.end_frame(sink);
            }
        }
    }

    /// Parses a payload header and applies its frame ID and error bits.
    fn header(&mut self, packet: &[u8], sink: &mut dyn FrameSink) -> Option<PayloadHeader> {
        let header = match PayloadHeader::parse(packet) {
            Ok(header) => header,
            Err(e) => {
                log::warn!("dropping payload: {}", e);
                self.errored = true;
                return None;
            }
        };

        let fid = header.frame_id();
        if self.last_fid.map_or(false, |last| last != fid) {
            self.end_frame(sink);
        }
        self.last_fid = Some(fid);

        if header.error() {
            if !self.errored {
                log::debug!("device flagged payload error, dropping frame");
            }
            self.errored = true;
            if let Some(buf) = &mut self.current {
                buf.clear();
            }
        }
        if let Some(pts) = header.pts() {
            self.pts = Some(pts);
        }
        Some(header)
    }

    fn append(&mut self, data: &[u8], sink: &mut dyn FrameSink) {
        if data.is_empty() || self.errored || self.skipping {
            return;
        }
        if self.current.is_none() {
            match self.pool.take() {
                Some(buf) => self.current = Some(buf),
                None => {
                    log::debug!("{}: no free frame buffer, skipping frame", self.stream);
                    self.skipping = true;
                    sink.event(StreamEvent::FrameBufferUnderflow);
                    return;
                }
            }
        }

        let capacity = self.pool.capacity();
        let overflow = self.overflow;
        let buf = match &mut self.current {
            Some(buf) => buf,
            None => return,
        };
        let room = capacity.saturating_sub(buf.len());
        if data.len() <= room && overflow.is_none() {
            buf.extend_from_slice(data);
            return;
        }

        let fits = room.min(data.len());
        buf.extend_from_slice(&data[..fits]);
        self.overflow = Some(overflow.unwrap_or(capacity) + data.len() - fits);
    }

    fn end_frame(&mut self, sink: &mut dyn FrameSink) {
        let buf = self.current.take();
        if self.errored {
            sink.event(StreamEvent::FrameError);
            if let Some(buf) = buf {
                self.pool.put(buf);
            }
        } else if let Some(buf) = buf {
            if buf.is_empty() {
                self.pool.put(buf);
            } else {
                if let Some(needed) = self.overflow {
                    log::warn!(
                        "frame of {} bytes truncated to {} byte buffer",
                        needed,
                        self.pool.capacity()
                    );
                    sink.event(StreamEvent::FrameOverflow {
                        needed,
                        capacity: self.pool.capacity(),
                    });
                }
                let frame = VideoFrame {
                    data: buf,
                    stream: self.stream,
                    sequence: self.sequence,
                    pts: self.pts,
                    incomplete: self.overflow.is_some(),
                    format: self.format,
                    pool: Arc::downgrade(&self.pool.free),
                };
                self.sequence += 1;
                sink.frame(frame);
            }
        }

        self.errored = false;
        self.skipping = false;
        self.overflow = None;
        self.pts = None;
    }
}
