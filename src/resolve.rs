//! Format resolution and bandwidth selection.
//!
//! These are pure queries on a [`DeviceIndex`]: they map a [`StreamFormatRequest`] onto concrete
//! descriptors and never talk to the device.

use std::fmt;

use crate::{
    descriptor::{
        AltSetting, DeviceIndex, FourCc, Format, FormatKind, Frame, FrameInterval,
        StreamingInterface, TransferType,
    },
    error::{err, Action, ErrorKind},
    stream::StreamFormat,
    util::BcdVersion,
    Result,
};

/// The encoding a caller asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// Whatever the device declares first.
    Any,
    Mjpeg,
    Uncompressed(FourCc),
    FrameBased(FourCc),
}

impl Encoding {
    pub const YUY2: Encoding = Encoding::Uncompressed(FourCc::YUY2);
    pub const NV12: Encoding = Encoding::Uncompressed(FourCc::NV12);
    pub const H264: Encoding = Encoding::FrameBased(FourCc::H264);
    pub const H265: Encoding = Encoding::FrameBased(FourCc::H265);

    pub fn matches(&self, kind: &FormatKind) -> bool {
        match (self, kind) {
            (Encoding::Any, _) => true,
            (Encoding::Mjpeg, FormatKind::Mjpeg) => true,
            (Encoding::Uncompressed(want), FormatKind::Uncompressed { fourcc, .. }) => {
                want == fourcc
            }
            (Encoding::FrameBased(want), FormatKind::FrameBased { fourcc, .. }) => want == fourcc,
            _ => false,
        }
    }
}

impl From<&FormatKind> for Encoding {
    fn from(kind: &FormatKind) -> Self {
        match kind {
            FormatKind::Mjpeg => Encoding::Mjpeg,
            FormatKind::Uncompressed { fourcc, .. } => Encoding::Uncompressed(*fourcc),
            FormatKind::FrameBased { fourcc, .. } => Encoding::FrameBased(*fourcc),
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Encoding::Any => f.write_str("any"),
            Encoding::Mjpeg => f.write_str("MJPEG"),
            Encoding::Uncompressed(fourcc) | Encoding::FrameBased(fourcc) => {
                write!(f, "{}", fourcc)
            }
        }
    }
}

/// A requested stream format.
///
/// `width == 0 && height == 0` selects a format's default frame, `fps == 0.0` selects a frame's
/// default interval, and [`Encoding::Any`] accepts every format.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamFormatRequest {
    pub width: u16,
    pub height: u16,
    pub fps: f32,
    pub encoding: Encoding,
}

impl StreamFormatRequest {
    pub fn new(width: u16, height: u16, fps: f32, encoding: Encoding) -> Self {
        Self {
            width,
            height,
            fps,
            encoding,
        }
    }

    /// The device's default format, frame, and interval.
    pub fn device_default() -> Self {
        Self::new(0, 0, 0.0, Encoding::Any)
    }

    fn any_resolution(&self) -> bool {
        self.width == 0 && self.height == 0
    }

    /// Fills the resolution and encoding wildcards from the format a stream runs with. A zero
    /// frame rate still selects the default interval of the resulting frame.
    pub(crate) fn or_current(self, current: &StreamFormat) -> Self {
        let (width, height) = if self.any_resolution() {
            (current.width, current.height)
        } else {
            (self.width, self.height)
        };
        let encoding = match self.encoding {
            Encoding::Any => current.encoding,
            encoding => encoding,
        };
        Self::new(width, height, self.fps, encoding)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !self.fps.is_finite() || self.fps < 0.0 {
            return err(
                ErrorKind::InvalidArgument,
                format!("invalid frame rate {}", self.fps),
                Action::ResolvingFormat,
            );
        }
        if (self.width == 0) != (self.height == 0) {
            return err(
                ErrorKind::InvalidArgument,
                format!("invalid resolution {}x{}", self.width, self.height),
                Action::ResolvingFormat,
            );
        }
        Ok(())
    }
}

impl fmt::Display for StreamFormatRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}@{} {}",
            self.width, self.height, self.fps, self.encoding
        )
    }
}

/// A format/frame pair matching a [`StreamFormatRequest`].
#[derive(Debug, Clone, Copy)]
pub struct ResolvedFrame<'a> {
    pub interface: &'a StreamingInterface,
    pub format: &'a Format,
    pub frame: &'a Frame,
    /// The matching interval as declared by the device.
    pub interval: FrameInterval,
}

impl StreamingInterface {
    /// Finds the first format and frame of this interface matching `req`.
    pub fn find_frame(&self, req: &StreamFormatRequest) -> Option<ResolvedFrame<'_>> {
        for format in self.formats.iter().filter(|f| req.encoding.matches(&f.kind)) {
            let candidates: Box<dyn Iterator<Item = &Frame> + '_> = if req.any_resolution() {
                Box::new(format.default_frame().into_iter())
            } else {
                Box::new(
                    format
                        .frames
                        .iter()
                        .filter(|f| f.width == req.width && f.height == req.height),
                )
            };

            for frame in candidates {
                let interval = if req.fps == 0.0 {
                    Some(frame.default_interval)
                } else {
                    frame.intervals.find(req.fps)
                };
                if let Some(interval) = interval {
                    return Some(ResolvedFrame {
                        interface: self,
                        format,
                        frame,
                        interval,
                    });
                }
            }
        }
        None
    }

    /// Picks the alternate setting for a per-(micro)frame byte budget.
    ///
    /// Isochronous settings are compared by effective size: the largest one not exceeding
    /// `requested_bytes` wins, and a budget below the smallest setting gets the smallest one. A
    /// budget above the largest setting is an error. Bulk interfaces have a single streaming
    /// setting, which is returned for any budget.
    pub fn select_alt_setting(&self, requested_bytes: u32) -> Result<&AltSetting> {
        let mut candidates = self
            .alt_settings
            .iter()
            .filter(|alt| {
                alt.endpoint.as_ref().map_or(false, |ep| {
                    ep.is_in()
                        && matches!(
                            ep.transfer_type,
                            TransferType::Isochronous | TransferType::Bulk
                        )
                })
            })
            .collect::<Vec<_>>();

        if let Some(&bulk) = candidates
            .iter()
            .find(|alt| alt.endpoint.map(|ep| ep.transfer_type) == Some(TransferType::Bulk))
        {
            return Ok(bulk);
        }

        candidates.retain(|alt| alt.effective_size() > 0);
        candidates.sort_by_key(|alt| alt.effective_size());

        let (smallest, largest) = match (candidates.first(), candidates.last()) {
            (Some(s), Some(l)) => (*s, *l),
            _ => {
                return err(
                    ErrorKind::NotFound,
                    format!("interface {} has no streaming endpoint", self.number),
                    Action::SelectingBandwidth,
                )
            }
        };

        if requested_bytes > largest.effective_size() {
            return err(
                ErrorKind::NotFound,
                format!(
                    "interface {} offers at most {} bytes per microframe, {} requested",
                    self.number,
                    largest.effective_size(),
                    requested_bytes
                ),
                Action::SelectingBandwidth,
            );
        }

        let size = candidates
            .iter()
            .rev()
            .map(|alt| alt.effective_size())
            .find(|&size| size <= requested_bytes)
            .unwrap_or_else(|| smallest.effective_size());
        // Among settings of equal size, the first one declared wins.
        let selected = candidates
            .iter()
            .copied()
            .find(|alt| alt.effective_size() == size)
            .unwrap_or(largest);

        log::debug!(
            "interface {}: {} bytes requested, selected alt {} ({} bytes)",
            self.number,
            requested_bytes,
            selected.number,
            selected.effective_size()
        );
        Ok(selected)
    }

    /// The smallest isochronous alternate setting that carries payloads of `bytes`.
    pub fn alt_setting_for_payload(&self, bytes: u32) -> Result<&AltSetting> {
        let fitting = self
            .alt_settings
            .iter()
            .filter(|alt| {
                alt.endpoint
                    .map_or(false, |ep| ep.transfer_type == TransferType::Isochronous)
                    && alt.effective_size() >= bytes
            })
            .min_by_key(|alt| alt.effective_size());
        match fitting {
            Some(alt) => Ok(alt),
            None => err(
                ErrorKind::NotFound,
                format!(
                    "interface {} has no alternate setting for {} byte payloads",
                    self.number, bytes
                ),
                Action::SelectingBandwidth,
            ),
        }
    }

    /// The largest streaming alternate setting.
    pub(crate) fn max_bandwidth(&self) -> u32 {
        self.alt_settings
            .iter()
            .map(|alt| alt.effective_size())
            .max()
            .unwrap_or(0)
    }
}

impl DeviceIndex {
    /// Finds the streaming interface of function `uvc_stream_index` that supports `req`.
    ///
    /// Returns the interface number and the function's `bcdUVC`.
    pub fn resolve_interface(
        &self,
        uvc_stream_index: usize,
        req: &StreamFormatRequest,
    ) -> Result<(u8, BcdVersion)> {
        let function = match self.function(uvc_stream_index) {
            Some(function) => function,
            None => {
                return err(
                    ErrorKind::NotFound,
                    format!(
                        "device has {} video function(s), index {} requested",
                        self.functions.len(),
                        uvc_stream_index
                    ),
                    Action::ResolvingFormat,
                )
            }
        };

        match function
            .streaming
            .iter()
            .find(|intf| intf.find_frame(req).is_some())
        {
            Some(intf) => Ok((intf.number, intf.uvc_version)),
            None => err(
                ErrorKind::NotFound,
                format!("format {} is not supported", req),
                Action::ResolvingFormat,
            ),
        }
    }

    /// Finds the format and frame matching `req` on streaming interface `interface`.
    pub fn resolve_frame(&self, interface: u8, req: &StreamFormatRequest) -> Result<ResolvedFrame<'_>> {
        let intf = self.streaming_interface_or_err(interface)?;
        match intf.find_frame(req) {
            Some(resolved) => Ok(resolved),
            None => err(
                ErrorKind::NotFound,
                format!("interface {} does not support {}", interface, req),
                Action::ResolvingFormat,
            ),
        }
    }

    /// Finds the alternate setting of `interface` for a byte budget, see
    /// [`StreamingInterface::select_alt_setting`].
    pub fn resolve_alt_setting(&self, interface: u8, requested_bytes: u32) -> Result<&AltSetting> {
        self.streaming_interface_or_err(interface)?
            .select_alt_setting(requested_bytes)
    }

    fn streaming_interface_or_err(&self, interface: u8) -> Result<&StreamingInterface> {
        match self.streaming_interface(interface) {
            Some(intf) => Ok(intf),
            None => err(
                ErrorKind::NotFound,
                format!("no streaming interface {}", interface),
                Action::ResolvingFormat,
            ),
        }
    }
}
