//! Video Control topology.
//!
//! A UVC function is a graph of:
//! - *Input Terminals*, which provide video data to the function (usually the camera sensor).
//! - *Output Terminals*, which transfer video data away from the function (usually a streaming
//!   interface).
//! - *Units*, which sit between terminals and process or reroute video data.

use std::num::NonZeroU8;

use bitflags::bitflags;
use uuid::Uuid;

use crate::util::BcdVersion;

/// Identifies a video data source (either a [`Unit`], or an input [`Terminal`]).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SourceId(NonZeroU8);

impl SourceId {
    pub(crate) fn new(raw: u8) -> Option<Self> {
        NonZeroU8::new(raw).map(Self)
    }

    pub fn raw(self) -> u8 {
        self.0.get()
    }
}

/// Identifies a [`Terminal`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TermId(NonZeroU8);

impl TermId {
    pub(crate) fn new(raw: u8) -> Option<Self> {
        NonZeroU8::new(raw).map(Self)
    }

    pub fn raw(self) -> u8 {
        self.0.get()
    }
}

/// Identifies a [`Unit`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UnitId(NonZeroU8);

impl UnitId {
    pub(crate) fn new(raw: u8) -> Option<Self> {
        NonZeroU8::new(raw).map(Self)
    }

    pub fn raw(self) -> u8 {
        self.0.get()
    }
}

/// The function topology as reported by the Video Control interface descriptors.
#[derive(Debug, Clone)]
pub struct Topology {
    pub(crate) header: ControlHeader,
    pub(crate) terminals: Vec<Terminal>,
    pub(crate) units: Vec<Unit>,
}

impl Topology {
    pub fn header(&self) -> &ControlHeader {
        &self.header
    }

    pub fn terminals(&self) -> &[Terminal] {
        &self.terminals
    }

    pub fn units(&self) -> &[Unit] {
        &self.units
    }

    pub fn terminal(&self, id: TermId) -> Option<&Terminal> {
        self.terminals.iter().find(|t| t.id == id)
    }

    /// The first camera input terminal, if the function has one.
    pub fn camera(&self) -> Option<&Terminal> {
        self.terminals
            .iter()
            .find(|t| matches!(t.kind, TerminalKind::Camera { .. }))
    }
}

/// The `VC_HEADER` descriptor.
#[derive(Debug, Clone)]
pub struct ControlHeader {
    pub(crate) uvc_version: BcdVersion,
    pub(crate) clock_freq_hz: u32,
    pub(crate) streaming_interfaces: Vec<u8>,
}

impl ControlHeader {
    pub fn uvc_version(&self) -> BcdVersion {
        self.uvc_version
    }

    /// Device clock frequency. Deprecated since UVC 1.1 and often zero.
    pub fn clock_freq_hz(&self) -> u32 {
        self.clock_freq_hz
    }

    /// Interface numbers of the streaming interfaces belonging to this function.
    pub fn streaming_interfaces(&self) -> &[u8] {
        &self.streaming_interfaces
    }
}

#[derive(Debug, Clone)]
pub struct Terminal {
    pub(crate) id: TermId,
    pub(crate) terminal_type: u16,
    pub(crate) kind: TerminalKind,
}

impl Terminal {
    pub fn id(&self) -> TermId {
        self.id
    }

    /// Raw `wTerminalType`.
    pub fn terminal_type(&self) -> u16 {
        self.terminal_type
    }

    pub fn kind(&self) -> &TerminalKind {
        &self.kind
    }
}

#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum TerminalKind {
    Camera { controls: CameraControls },
    Input,
    Output { source: SourceId },
}

pub(crate) const TERMINAL_TYPE_CAMERA: u16 = 0x0201;

bitflags! {
    pub struct CameraControls: u32 {
        const SCANNING_MODE = 1 << 0;
        const AUTO_EXPOSURE_MODE = 1 << 1;
        const AUTO_EXPOSURE_PRIORITY = 1 << 2;
        const EXPOSURE_TIME_ABS = 1 << 3;
        const EXPOSURE_TIME_REL = 1 << 4;
        const FOCUS_ABS = 1 << 5;
        const FOCUS_REL = 1 << 6;
        const IRIS_ABS = 1 << 7;
        const IRIS_REL = 1 << 8;
        const ZOOM_ABS = 1 << 9;
        const ZOOM_REL = 1 << 10;
        const PAN_TILT_ABS = 1 << 11;
        const PAN_TILT_REL = 1 << 12;
        const ROLL_ABS = 1 << 13;
        const ROLL_REL = 1 << 14;

        const FOCUS_AUTO = 1 << 17;
        const PRIVACY = 1 << 18;
        const FOCUS_SIMPLE = 1 << 19;
        const WINDOW = 1 << 20;
        const REGION_OF_INTEREST = 1 << 21;
    }
}

#[derive(Debug, Clone)]
pub struct Unit {
    pub(crate) id: UnitId,
    pub(crate) kind: UnitKind,
}

impl Unit {
    pub fn id(&self) -> UnitId {
        self.id
    }

    pub fn kind(&self) -> &UnitKind {
        &self.kind
    }
}

#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum UnitKind {
    Selector {
        inputs: Vec<SourceId>,
    },
    Processing {
        source: SourceId,
        controls: ProcessingUnitControls,
    },
    Extension {
        guid: Uuid,
        inputs: Vec<SourceId>,
    },
    Encoding {
        source: SourceId,
    },
}

bitflags! {
    pub struct ProcessingUnitControls: u32 {
        const BRIGHTNESS                     = 1 << 0;
        const CONTRAST                       = 1 << 1;
        const HUE                            = 1 << 2;
        const SATURATION                     = 1 << 3;
        const SHARPNESS                      = 1 << 4;
        const GAMMA                          = 1 << 5;
        const WHITE_BALANCE_TEMPERATURE      = 1 << 6;
        const WHITE_BALANCE_COMPONENT        = 1 << 7;
        const BACKLIGHT_COMPENSATION         = 1 << 8;
        const GAIN                           = 1 << 9;
        const POWER_LINE_FREQUENCY           = 1 << 10;
        const HUE_AUTO                       = 1 << 11;
        const WHITE_BALANCE_TEMPERATURE_AUTO = 1 << 12;
        const WHITE_BALANCE_COMPONENT_AUTO   = 1 << 13;
        const DIGITAL_MULTIPLIER             = 1 << 14;
        const DIGITAL_MULTIPLIER_LIMIT       = 1 << 15;
        const ANALOG_VIDEO_STANDARD          = 1 << 16;
        const ANALOG_VIDEO_LOCK_STATUS       = 1 << 17;
        const CONTRAST_AUTO                  = 1 << 18;
    }
}
