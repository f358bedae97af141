//! Video Probe and Commit Controls (4.3.1.1)
//!
//! A stream format is locked in with the device by an exchange on the default control pipe:
//!
//! ```text
//! SET_CUR(probe) -> GET_CUR(probe) -> GET_MAX(probe) -> GET_MIN(probe)
//!   -> SET_CUR(probe, clamped payload size) -> GET_CUR(probe) -> SET_CUR(commit)
//! ```
//!
//! The device may round any value it is sent, so every `SET_CUR` is followed by a `GET_CUR` and
//! the device's answer is what gets committed.

use std::{
    fmt, mem,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use zerocopy::{AsBytes, FromBytes};

use crate::{
    descriptor::{FormatIndex, FrameIndex, FrameInterval},
    error::{err, Action, ErrorKind, ResultExt},
    resolve::ResolvedFrame,
    transport::{SetupPacket, Transport},
    util::BcdVersion,
    Result,
};

const REQ_TYPE_SET: u8 = 0b0010_0001;
const REQ_TYPE_GET: u8 = 0b1010_0001;

/// Probe/commit payload lengths for UVC 1.0, 1.1 and 1.5.
const LEN_UVC10: usize = 26;
const LEN_UVC11: usize = 34;
const LEN_UVC15: usize = mem::size_of::<ProbeCommitControls>();

/// `bmHint`: keep `dwFrameInterval` fixed.
const HINT_FRAME_INTERVAL: u16 = 1 << 0;

#[derive(Default, AsBytes, FromBytes, Debug, Clone, Copy)]
#[repr(C, packed)]
#[allow(non_snake_case)]
struct ProbeCommitControls {
    bmHint: u16,
    bFormatIndex: u8,
    bFrameIndex: u8,
    dwFrameInterval: u32,
    wKeyFrameRate: u16,
    wPFrameRate: u16,
    wCompQuality: u16,
    wCompWindowSize: u16,
    wDelay: u16,
    dwMaxVideoFrameSize: u32,
    dwMaxPayloadTransferSize: u32,
    dwClockFrequency: u32,
    bmFramingInfo: u8,
    bPreferedVersion: u8, // (sic)
    bMinVersion: u8,
    bMaxVersion: u8,
    bUsage: u8,
    bBitDepthLuma: u8,
    bmSettings: u8,
    bMaxNumberOfRefFramesPlus1: u8,
    bmRateControlModes: u16,
    bmLayoutPerStream: u64,
}

impl ProbeCommitControls {
    /// Converts between wire (little endian) and host byte order. The conversion is its own
    /// inverse.
    fn swap_le(self) -> Self {
        Self {
            bmHint: { self.bmHint }.to_le(),
            dwFrameInterval: { self.dwFrameInterval }.to_le(),
            wKeyFrameRate: { self.wKeyFrameRate }.to_le(),
            wPFrameRate: { self.wPFrameRate }.to_le(),
            wCompQuality: { self.wCompQuality }.to_le(),
            wCompWindowSize: { self.wCompWindowSize }.to_le(),
            wDelay: { self.wDelay }.to_le(),
            dwMaxVideoFrameSize: { self.dwMaxVideoFrameSize }.to_le(),
            dwMaxPayloadTransferSize: { self.dwMaxPayloadTransferSize }.to_le(),
            dwClockFrequency: { self.dwClockFrequency }.to_le(),
            bmRateControlModes: { self.bmRateControlModes }.to_le(),
            bmLayoutPerStream: { self.bmLayoutPerStream }.to_le(),
            ..self
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Request {
    SetCur = 0x01,
    GetCur = 0x81,
    GetMin = 0x82,
    GetMax = 0x83,
}

/// Controls associated with Video Streaming Interfaces.
#[derive(Debug, Clone, Copy)]
enum StreamingControl {
    Probe = 0x01,
    Commit = 0x02,
}

/// Steps of one negotiation attempt, logged as they are entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProbeState {
    ProbeSetCur,
    ProbeGetCur,
    ProbeGetMax,
    ProbeGetMin,
    ProbeSetClamped,
    ProbeGetFinal,
    CommitSetCur,
    Committed,
}

/// Length of the probe/commit payload for a given `bcdUVC`.
pub(crate) fn control_length(version: BcdVersion) -> usize {
    match version.raw() {
        v if v < 0x0110 => LEN_UVC10,
        v if v < 0x0150 => LEN_UVC11,
        _ => LEN_UVC15,
    }
}

/// Stream parameters committed to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Negotiated {
    pub format_index: FormatIndex,
    pub frame_index: FrameIndex,
    pub interval: FrameInterval,
    /// Bytes the device sends per (micro)frame at most.
    pub max_payload_size: u32,
    /// Largest frame the device will produce. Zero if the device did not say.
    pub max_video_frame_size: u32,
}

/// The default control pipe of one device.
///
/// All sessions on the device share it, and its transfer buffer is locked for a whole
/// negotiation so that two sessions cannot interleave their exchanges.
pub(crate) struct ControlPipe {
    address: u8,
    timeout: Duration,
    buf: Mutex<[u8; LEN_UVC15]>,
}

impl ControlPipe {
    pub(crate) fn new(address: u8, timeout: Duration) -> Self {
        Self {
            address,
            timeout,
            buf: Mutex::new([0; LEN_UVC15]),
        }
    }

    /// Runs probe and commit for `resolved`, asking for `payload_size` bytes per (micro)frame.
    pub(crate) fn negotiate(
        &self,
        transport: &dyn Transport,
        resolved: &ResolvedFrame<'_>,
        payload_size: u32,
    ) -> Result<Negotiated> {
        let mut buf = self.buf.lock().unwrap_or_else(PoisonError::into_inner);
        let mut exchange = Exchange {
            transport,
            address: self.address,
            interface: resolved.interface.number(),
            len: control_length(resolved.interface.uvc_version()),
            timeout: self.timeout,
            buf: &mut *buf,
        };
        exchange.run(resolved, payload_size)
    }
}

struct Exchange<'a> {
    transport: &'a dyn Transport,
    address: u8,
    interface: u8,
    len: usize,
    timeout: Duration,
    buf: &'a mut [u8; LEN_UVC15],
}

impl Exchange<'_> {
    fn run(&mut self, resolved: &ResolvedFrame<'_>, payload_size: u32) -> Result<Negotiated> {
        let format_index = resolved.format.index();
        let frame_index = resolved.frame.index();
        let proposal = ProbeCommitControls {
            bmHint: HINT_FRAME_INTERVAL,
            bFormatIndex: format_index.raw(),
            bFrameIndex: frame_index.raw(),
            dwFrameInterval: resolved.interval.raw(),
            dwMaxPayloadTransferSize: payload_size,
            ..Default::default()
        };
        log::debug!(
            "interface {}: negotiating {}x{} {} at {:?}, {} byte payloads",
            self.interface,
            resolved.frame.width(),
            resolved.frame.height(),
            resolved.format.kind(),
            resolved.interval,
            payload_size,
        );

        self.enter(ProbeState::ProbeSetCur);
        self.set(StreamingControl::Probe, &proposal)?;
        self.enter(ProbeState::ProbeGetCur);
        let mut current = self.get(Request::GetCur, StreamingControl::Probe)?;
        self.check_indices(&current, format_index, frame_index)?;

        self.enter(ProbeState::ProbeGetMax);
        let max = self.get(Request::GetMax, StreamingControl::Probe)?;
        self.enter(ProbeState::ProbeGetMin);
        let min = self.get(Request::GetMin, StreamingControl::Probe)?;

        let (lo, hi) = (min.dwMaxPayloadTransferSize, max.dwMaxPayloadTransferSize);
        if hi != 0 {
            if lo > hi {
                return err(
                    ErrorKind::Protocol,
                    format!("device reports payload size range {}..{}", lo, hi),
                    Action::StreamNegotiation,
                );
            }
            let clamped = payload_size.clamp(lo, hi);
            if clamped != payload_size {
                log::debug!(
                    "payload size {} clamped to {} (device range {}..={})",
                    payload_size,
                    clamped,
                    lo,
                    hi
                );
            }
            current.dwMaxPayloadTransferSize = clamped;
        }

        self.enter(ProbeState::ProbeSetClamped);
        self.set(StreamingControl::Probe, &current)?;
        self.enter(ProbeState::ProbeGetFinal);
        let fin = self.get(Request::GetCur, StreamingControl::Probe)?;
        self.check_indices(&fin, format_index, frame_index)?;

        let interval = fin.dwFrameInterval;
        if interval != resolved.interval.raw() {
            log::warn!(
                "device adjusted frame interval from {} to {}",
                resolved.interval.raw(),
                interval
            );
        }

        self.enter(ProbeState::CommitSetCur);
        self.set(StreamingControl::Commit, &fin)?;
        self.enter(ProbeState::Committed);

        let negotiated = Negotiated {
            format_index,
            frame_index,
            interval: FrameInterval::from_raw(interval),
            max_payload_size: fin.dwMaxPayloadTransferSize,
            max_video_frame_size: fin.dwMaxVideoFrameSize,
        };
        log::debug!("committed parameters: {:?}", negotiated);
        Ok(negotiated)
    }

    fn enter(&self, state: ProbeState) {
        log::trace!("interface {}: {:?}", self.interface, state);
    }

    fn check_indices(
        &self,
        controls: &ProbeCommitControls,
        format: FormatIndex,
        frame: FrameIndex,
    ) -> Result<()> {
        let (got_format, got_frame) = (controls.bFormatIndex, controls.bFrameIndex);
        if got_format != format.raw() || got_frame != frame.raw() {
            return err(
                ErrorKind::Protocol,
                format!(
                    "device answered probe with format {} frame {}, expected format {} frame {}",
                    got_format,
                    got_frame,
                    format.raw(),
                    frame.raw()
                ),
                Action::StreamNegotiation,
            );
        }
        Ok(())
    }

    fn set(&mut self, control: StreamingControl, controls: &ProbeCommitControls) -> Result<()> {
        log::trace!("{:?}({:?})", Request::SetCur, control);
        self.buf.copy_from_slice(controls.swap_le().as_bytes());
        let len = self.len;
        let bytes = self.transfer(REQ_TYPE_SET, Request::SetCur, control)?;
        if bytes != len {
            return err(
                ErrorKind::Protocol,
                format!("{:?}({:?}): wrote {} of {} bytes", Request::SetCur, control, bytes, len),
                Action::StreamNegotiation,
            );
        }
        Ok(())
    }

    fn get(&mut self, request: Request, control: StreamingControl) -> Result<ProbeCommitControls> {
        log::trace!("{:?}({:?})", request, control);
        self.buf.fill(0);
        let bytes = self.transfer(REQ_TYPE_GET, request, control)?;
        if bytes < LEN_UVC10 {
            return err(
                ErrorKind::Protocol,
                format!("{:?}({:?}): short response of {} bytes", request, control, bytes),
                Action::StreamNegotiation,
            );
        }
        // Fields past the response keep their zero value.
        match ProbeCommitControls::read_from(&self.buf[..]) {
            Some(controls) => Ok(controls.swap_le()),
            None => err(
                ErrorKind::Protocol,
                "malformed probe response",
                Action::StreamNegotiation,
            ),
        }
    }

    fn transfer(&mut self, request_type: u8, request: Request, control: StreamingControl) -> Result<usize> {
        let setup = SetupPacket {
            request_type,
            request: request as u8,
            value: (control as u16) << 8,
            index: self.interface.into(),
            length: self.len as u16,
        };
        self.transport
            .control_transfer(self.address, setup, &mut self.buf[..self.len], self.timeout)
            .during(Action::StreamNegotiation)
    }
}

impl fmt::Display for Negotiated {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "format {} frame {} at {:?}, {} byte payloads, {} byte frames",
            self.format_index.raw(),
            self.frame_index.raw(),
            self.interval,
            self.max_payload_size,
            self.max_video_frame_size
        )
    }
}
