//! Descriptor index of a UVC device.
//!
//! [`build_index`] walks a raw configuration descriptor once and produces a [`DeviceIndex`]: one
//! [`VideoFunction`] per Video Control interface, each with its [`Topology`] and its
//! [`StreamingInterface`]s. Streaming interfaces carry their [`Format`]s, [`Frame`]s and
//! [`AltSetting`]s in declaration order.
//!
//! Only the numeric fields are copied out of the descriptor blob; the index does not borrow it.

pub(crate) mod parse;
mod topology;

use std::{fmt, time::Duration};

use bitflags::bitflags;
use uuid::Uuid;

use crate::util::BcdVersion;

pub use parse::{build_index, records, DescriptorRecord, ParseError};
pub use topology::*;

/// Structured view of a device's configuration descriptor.
#[derive(Debug, Clone)]
pub struct DeviceIndex {
    pub(crate) total_length: u16,
    pub(crate) functions: Vec<VideoFunction>,
}

impl DeviceIndex {
    /// The `wTotalLength` of the configuration the index was built from.
    pub fn total_length(&self) -> u16 {
        self.total_length
    }

    /// Video functions in descriptor order. The position of a function in this list is its
    /// `uvc_stream_index`.
    pub fn functions(&self) -> &[VideoFunction] {
        &self.functions
    }

    pub fn function(&self, uvc_stream_index: usize) -> Option<&VideoFunction> {
        self.functions.get(uvc_stream_index)
    }

    pub fn streaming_interfaces(&self) -> impl Iterator<Item = &StreamingInterface> {
        self.functions.iter().flat_map(|f| f.streaming.iter())
    }

    pub fn streaming_interface(&self, number: u8) -> Option<&StreamingInterface> {
        self.streaming_interfaces().find(|i| i.number == number)
    }
}

/// One UVC function: a Video Control interface and the streaming interfaces it lists.
#[derive(Debug, Clone)]
pub struct VideoFunction {
    pub(crate) control_interface: u8,
    pub(crate) interrupt_endpoint: Option<Endpoint>,
    pub(crate) topology: Topology,
    pub(crate) streaming: Vec<StreamingInterface>,
}

impl VideoFunction {
    pub fn control_interface(&self) -> u8 {
        self.control_interface
    }

    /// The optional status interrupt endpoint of the Video Control interface.
    pub fn interrupt_endpoint(&self) -> Option<&Endpoint> {
        self.interrupt_endpoint.as_ref()
    }

    pub fn uvc_version(&self) -> BcdVersion {
        self.topology.header.uvc_version
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn streaming_interfaces(&self) -> &[StreamingInterface] {
        &self.streaming
    }
}

/// A Video Streaming interface with all of its alternate settings.
#[derive(Debug, Clone)]
pub struct StreamingInterface {
    pub(crate) number: u8,
    pub(crate) uvc_version: BcdVersion,
    pub(crate) header: Option<InputHeader>,
    pub(crate) formats: Vec<Format>,
    pub(crate) alt_settings: Vec<AltSetting>,
}

impl StreamingInterface {
    /// The `bInterfaceNumber` of this interface.
    pub fn number(&self) -> u8 {
        self.number
    }

    /// `bcdUVC` of the owning Video Control interface.
    pub fn uvc_version(&self) -> BcdVersion {
        self.uvc_version
    }

    pub fn input_header(&self) -> Option<&InputHeader> {
        self.header.as_ref()
    }

    pub fn formats(&self) -> &[Format] {
        &self.formats
    }

    /// All alternate settings, including the zero-bandwidth one.
    pub fn alt_settings(&self) -> &[AltSetting] {
        &self.alt_settings
    }

    pub fn format_by_index(&self, index: FormatIndex) -> Option<&Format> {
        self.formats.iter().find(|f| f.index == index)
    }

    /// Transfer type of the video data endpoint, taken from the first alternate setting that
    /// has one.
    pub fn transfer_type(&self) -> Option<TransferType> {
        self.alt_settings
            .iter()
            .find_map(|alt| alt.endpoint.as_ref())
            .map(|ep| ep.transfer_type)
    }
}

/// Contents of the `VS_INPUT_HEADER` descriptor.
#[derive(Debug, Clone)]
pub struct InputHeader {
    pub(crate) num_formats: u8,
    pub(crate) endpoint_address: u8,
    pub(crate) info: InputInterfaceInfo,
    pub(crate) terminal_link: TermId,
    pub(crate) still_capture_method: StillCaptureMethod,
    pub(crate) trigger_support: bool,
}

impl InputHeader {
    pub fn num_formats(&self) -> u8 {
        self.num_formats
    }

    pub fn endpoint_address(&self) -> u8 {
        self.endpoint_address
    }

    pub fn info(&self) -> InputInterfaceInfo {
        self.info
    }

    /// The output terminal this interface is connected to.
    pub fn terminal_link(&self) -> TermId {
        self.terminal_link
    }

    pub fn still_capture_method(&self) -> StillCaptureMethod {
        self.still_capture_method
    }

    pub fn trigger_support(&self) -> bool {
        self.trigger_support
    }
}

bitflags! {
    pub struct InputInterfaceInfo: u8 {
        const DYNAMIC_FORMAT_CHANGE_SUPPORTED = 1 << 0;
    }
}

primitive_enum! {
    pub enum StillCaptureMethod: u8 {
        None = 0,
        Method1 = 1,
        Method2 = 2,
        Method3 = 3,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FormatIndex(pub(crate) u8);

impl FormatIndex {
    pub fn raw(self) -> u8 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameIndex(pub(crate) u8);

impl FrameIndex {
    pub fn raw(self) -> u8 {
        self.0
    }
}

/// A video format and the frames declared for it.
#[derive(Debug, Clone)]
pub struct Format {
    pub(crate) index: FormatIndex,
    pub(crate) kind: FormatKind,
    pub(crate) num_frame_descriptors: u8,
    pub(crate) default_frame: FrameIndex,
    pub(crate) interlace_flags: InterlaceFlags,
    pub(crate) frames: Vec<Frame>,
}

impl Format {
    pub fn index(&self) -> FormatIndex {
        self.index
    }

    pub fn kind(&self) -> &FormatKind {
        &self.kind
    }

    pub fn interlace_flags(&self) -> InterlaceFlags {
        self.interlace_flags
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn frame_by_index(&self, index: FrameIndex) -> Option<&Frame> {
        self.frames.iter().find(|f| f.index == index)
    }

    /// The frame named by `bDefaultFrameIndex`, or the first frame if that index does not exist.
    pub fn default_frame(&self) -> Option<&Frame> {
        self.frame_by_index(self.default_frame)
            .or_else(|| self.frames.first())
    }
}

/// Encoding of a [`Format`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatKind {
    Mjpeg,
    Uncompressed {
        guid: Uuid,
        fourcc: FourCc,
        bits_per_pixel: u8,
    },
    FrameBased {
        guid: Uuid,
        fourcc: FourCc,
        bits_per_pixel: u8,
    },
}

impl FormatKind {
    pub fn fourcc(&self) -> Option<FourCc> {
        match self {
            FormatKind::Mjpeg => None,
            FormatKind::Uncompressed { fourcc, .. } | FormatKind::FrameBased { fourcc, .. } => {
                Some(*fourcc)
            }
        }
    }
}

impl fmt::Display for FormatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormatKind::Mjpeg => f.write_str("MJPEG"),
            FormatKind::Uncompressed { fourcc, .. } => write!(f, "{} (uncompressed)", fourcc),
            FormatKind::FrameBased { fourcc, .. } => write!(f, "{} (frame based)", fourcc),
        }
    }
}

/// A four-character code, the first four bytes of a format GUID as sent on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCc(pub [u8; 4]);

impl FourCc {
    pub const YUY2: FourCc = FourCc(*b"YUY2");
    pub const NV12: FourCc = FourCc(*b"NV12");
    pub const H264: FourCc = FourCc(*b"H264");
    pub const H265: FourCc = FourCc(*b"H265");

    pub(crate) fn from_guid(guid: &Uuid) -> Self {
        FourCc(guid.as_fields().0.to_le_bytes())
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in &self.0 {
            if b.is_ascii_graphic() || b == b' ' {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "\\x{:02x}", b)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FourCc(\"{}\")", self)
    }
}

bitflags! {
    pub struct InterlaceFlags: u8 {
        const INTERLACED = 1 << 0;
        const SINGLE_FIELD_PER_FRAME = 1 << 1;
        const FIELD_1_FIRST = 1 << 2;
        const FIELD_PATTERN_MASK = 0b110000;
    }
}

/// One resolution of a [`Format`].
#[derive(Debug, Clone)]
pub struct Frame {
    pub(crate) index: FrameIndex,
    pub(crate) capabilities: FrameCapabilities,
    pub(crate) width: u16,
    pub(crate) height: u16,
    pub(crate) min_bit_rate: u32,
    pub(crate) max_bit_rate: u32,
    /// Zero for frame-based formats, which do not declare it.
    pub(crate) max_video_frame_buffer_size: u32,
    pub(crate) default_interval: FrameInterval,
    pub(crate) intervals: FrameIntervals,
}

impl Frame {
    pub fn index(&self) -> FrameIndex {
        self.index
    }

    pub fn capabilities(&self) -> FrameCapabilities {
        self.capabilities
    }

    pub fn width(&self) -> u16 {
        self.width
    }

    pub fn height(&self) -> u16 {
        self.height
    }

    pub fn bit_rate_range(&self) -> (u32, u32) {
        (self.min_bit_rate, self.max_bit_rate)
    }

    pub fn max_video_frame_buffer_size(&self) -> Option<u32> {
        match self.max_video_frame_buffer_size {
            0 => None,
            n => Some(n),
        }
    }

    pub fn default_interval(&self) -> FrameInterval {
        self.default_interval
    }

    pub fn intervals(&self) -> &FrameIntervals {
        &self.intervals
    }
}

bitflags! {
    pub struct FrameCapabilities: u8 {
        const STILL_IMAGE_SUPPORTED = 1 << 0;
        const FIXED_FRAME_RATE = 1 << 1;
    }
}

/// A frame interval in units of 100 ns, the resolution UVC uses on the wire.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameInterval(u32);

impl FrameInterval {
    const UNITS_PER_SEC: f64 = 10_000_000.0;

    pub const fn from_raw(units_100ns: u32) -> Self {
        Self(units_100ns)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn as_duration(self) -> Duration {
        Duration::from_nanos(u64::from(self.0) * 100)
    }

    /// Frames per second, or 0 for a zero interval.
    pub fn fps(self) -> f32 {
        if self.0 == 0 {
            0.0
        } else {
            (Self::UNITS_PER_SEC / f64::from(self.0)) as f32
        }
    }

    /// Whether this interval is within one 100 ns unit of `1 / fps`.
    ///
    /// Devices disagree on whether `1 / fps` is truncated or rounded (15 fps is 666666 on some
    /// devices and 666667 on others), so an exact comparison would reject valid requests.
    pub fn matches_fps(self, fps: f32) -> bool {
        match Self::exact_units(fps) {
            Some(target) => (f64::from(self.0) - target).abs() <= 1.0,
            None => false,
        }
    }

    fn exact_units(fps: f32) -> Option<f64> {
        if fps.is_finite() && fps > 0.0 {
            Some(Self::UNITS_PER_SEC / f64::from(fps))
        } else {
            None
        }
    }
}

impl fmt::Debug for FrameInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x100ns ({:.2} fps)", self.0, self.fps())
    }
}

/// Frame intervals supported by a [`Frame`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameIntervals {
    Discrete(Vec<FrameInterval>),
    Continuous {
        min: FrameInterval,
        max: FrameInterval,
        step: FrameInterval,
    },
}

impl FrameIntervals {
    /// Finds the supported interval that matches `fps`.
    ///
    /// The returned value is the device's own interval, which is what has to be sent in a probe.
    pub fn find(&self, fps: f32) -> Option<FrameInterval> {
        match self {
            FrameIntervals::Discrete(list) => list.iter().copied().find(|i| i.matches_fps(fps)),
            FrameIntervals::Continuous { min, max, step } => {
                let target = FrameInterval::exact_units(fps)?;
                let (min, max, step) = (f64::from(min.0), f64::from(max.0), f64::from(step.0));
                if target < min - 1.0 || target > max + 1.0 {
                    return None;
                }
                let candidate = if step == 0.0 {
                    min
                } else {
                    min + ((target - min) / step).round() * step
                };
                if candidate <= max && (candidate - target).abs() <= 1.0 {
                    Some(FrameInterval(candidate as u32))
                } else {
                    None
                }
            }
        }
    }
}

/// One alternate setting of a streaming interface.
#[derive(Debug, Clone)]
pub struct AltSetting {
    pub(crate) number: u8,
    pub(crate) endpoint: Option<Endpoint>,
}

impl AltSetting {
    pub fn number(&self) -> u8 {
        self.number
    }

    /// The video data endpoint. `None` for the zero-bandwidth setting of isochronous interfaces.
    pub fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    /// Effective bytes per (micro)frame, 0 if there is no endpoint.
    pub fn effective_size(&self) -> u32 {
        self.endpoint.as_ref().map_or(0, |ep| ep.effective_size())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub(crate) address: u8,
    pub(crate) transfer_type: TransferType,
    pub(crate) max_packet_size: u16,
    pub(crate) interval: u8,
}

impl Endpoint {
    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn is_in(&self) -> bool {
        self.address & 0x80 != 0
    }

    pub fn transfer_type(&self) -> TransferType {
        self.transfer_type
    }

    /// Raw `wMaxPacketSize`, including the additional-transaction bits.
    pub fn max_packet_size(&self) -> u16 {
        self.max_packet_size
    }

    /// Bytes per packet (bits 0..10 of `wMaxPacketSize`).
    pub fn packet_size(&self) -> u32 {
        u32::from(self.max_packet_size & 0x7ff)
    }

    /// Packets per (micro)frame (bits 11..12 of `wMaxPacketSize`, plus one).
    pub fn transactions_per_microframe(&self) -> u32 {
        u32::from((self.max_packet_size >> 11) & 0b11) + 1
    }

    /// Bytes per (micro)frame.
    pub fn effective_size(&self) -> u32 {
        self.packet_size() * self.transactions_per_microframe()
    }

    pub fn interval(&self) -> u8 {
        self.interval
    }
}

primitive_enum! {
    pub enum TransferType: u8 {
        Control = 0,
        Isochronous = 1,
        Bulk = 2,
        Interrupt = 3,
    }
}
