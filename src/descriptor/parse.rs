use std::{fmt, io};

use byteorder::{ReadBytesExt, LE};
use zerocopy::FromBytes;

use crate::util::{io_err_res, split_descriptors, BcdVersion, BytesExt};

use super::*;

const DESC_TYPE_CONFIG: u8 = 0x02;
const DESC_TYPE_INTERFACE: u8 = 0x04;
const DESC_TYPE_ENDPOINT: u8 = 0x05;
const DESC_TYPE_IAD: u8 = 0x0B;
/// The value of `bDescriptorType` of all class-specific interface descriptors.
const DESC_TYPE_CS_INTERFACE: u8 = 0x24;

const CONFIG_DESC_LEN: usize = 9;

const VIDEO_CLASS: u8 = 0x0E;
const VIDEO_SUBCLASS_CONTROL: u8 = 1;
const VIDEO_SUBCLASS_STREAMING: u8 = 2;

const CONTROL_DESC_SUBTYPE_HEADER: u8 = 0x01;
const CONTROL_DESC_SUBTYPE_INPUT_TERM: u8 = 0x02;
const CONTROL_DESC_SUBTYPE_OUTPUT_TERMINAL: u8 = 0x03;
const CONTROL_DESC_SUBTYPE_SELECTOR_UNIT: u8 = 0x04;
const CONTROL_DESC_SUBTYPE_PROCESSING_UNIT: u8 = 0x05;
const CONTROL_DESC_SUBTYPE_EXTENSION_UNIT: u8 = 0x06;
const CONTROL_DESC_SUBTYPE_ENCODING_UNIT: u8 = 0x07;

const STREAM_DESC_SUBTYPE_INPUT_HEADER: u8 = 0x01;
const STREAM_DESC_SUBTYPE_FORMAT_UNCOMPRESSED: u8 = 0x04;
const STREAM_DESC_SUBTYPE_FRAME_UNCOMPRESSED: u8 = 0x05;
const STREAM_DESC_SUBTYPE_FORMAT_MJPEG: u8 = 0x06;
const STREAM_DESC_SUBTYPE_FRAME_MJPEG: u8 = 0x07;
const STREAM_DESC_SUBTYPE_FORMAT_MPEG2TS: u8 = 0x0A;
const STREAM_DESC_SUBTYPE_FORMAT_DV: u8 = 0x0C;
const STREAM_DESC_SUBTYPE_FORMAT_FRAME_BASED: u8 = 0x10;
const STREAM_DESC_SUBTYPE_FRAME_FRAME_BASED: u8 = 0x11;
const STREAM_DESC_SUBTYPE_FORMAT_STREAM_BASED: u8 = 0x12;
const STREAM_DESC_SUBTYPE_FORMAT_H264: u8 = 0x13;
const STREAM_DESC_SUBTYPE_FORMAT_H264_SIMULCAST: u8 = 0x15;
const STREAM_DESC_SUBTYPE_FORMAT_VP8: u8 = 0x16;
const STREAM_DESC_SUBTYPE_FORMAT_VP8_SIMULCAST: u8 = 0x18;

/// Failure to turn a configuration descriptor into a [`DeviceIndex`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// A descriptor claims more bytes than the buffer holds.
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },
    /// A structurally required field or descriptor is missing or invalid.
    Malformed { offset: usize, reason: String },
}

impl ParseError {
    fn malformed(offset: usize, reason: impl Into<String>) -> Self {
        ParseError::Malformed {
            offset,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::Truncated {
                offset,
                needed,
                available,
            } => write!(
                f,
                "descriptor at offset {} needs {} bytes, but only {} are available",
                offset, needed, available
            ),
            ParseError::Malformed { offset, reason } => {
                write!(f, "malformed descriptor at offset {}: {}", offset, reason)
            }
        }
    }
}

impl std::error::Error for ParseError {}

/// A single descriptor of a configuration, interpreted according to where it appears.
///
/// Class-specific descriptors are only interpreted inside Video Control and Video Streaming
/// interfaces; anything else is passed through as [`DescriptorRecord::Unknown`].
#[derive(Debug)]
pub enum DescriptorRecord<'a> {
    Config {
        total_length: u16,
        num_interfaces: u8,
    },
    Association {
        first_interface: u8,
        interface_count: u8,
        function_class: u8,
        function_subclass: u8,
    },
    Interface {
        number: u8,
        alt_setting: u8,
        class: u8,
        subclass: u8,
    },
    Endpoint(Endpoint),
    ControlHeader(ControlHeader),
    Terminal(Terminal),
    Unit(Unit),
    InputHeader(InputHeader),
    /// A format without its frames; those follow as [`DescriptorRecord::Frame`]s.
    Format(Format),
    /// A format this library cannot stream (DV, MPEG-2 TS, ...). Its frames are skipped.
    UnsupportedFormat {
        subtype: u8,
    },
    Frame(Frame),
    Unknown {
        descriptor_type: u8,
        data: &'a [u8],
    },
}

#[derive(Debug, FromBytes)]
#[repr(C)]
#[allow(non_snake_case)]
struct ConfigDescriptor {
    bLength: u8,
    bDescriptorType: u8,
    wTotalLength: [u8; 2],
    bNumInterfaces: u8,
    bConfigurationValue: u8,
    iConfiguration: u8,
    bmAttributes: u8,
    bMaxPower: u8,
}

#[derive(Debug, FromBytes)]
#[repr(C)]
#[allow(non_snake_case)]
struct InterfaceAssociationDescriptor {
    bLength: u8,
    bDescriptorType: u8,
    bFirstInterface: u8,
    bInterfaceCount: u8,
    bFunctionClass: u8,
    bFunctionSubClass: u8,
    bFunctionProtocol: u8,
    iFunction: u8,
}

#[derive(Debug, FromBytes)]
#[repr(C)]
#[allow(non_snake_case)]
struct InterfaceDescriptor {
    bLength: u8,
    bDescriptorType: u8,
    bInterfaceNumber: u8,
    bAlternateSetting: u8,
    bNumEndpoints: u8,
    bInterfaceClass: u8,
    bInterfaceSubClass: u8,
    bInterfaceProtocol: u8,
    iInterface: u8,
}

#[derive(Debug, FromBytes)]
#[repr(C)]
#[allow(non_snake_case)]
struct EndpointDescriptor {
    bLength: u8,
    bDescriptorType: u8,
    bEndpointAddress: u8,
    bmAttributes: u8,
    wMaxPacketSize: [u8; 2],
    bInterval: u8,
}

/// Reads the `wTotalLength` of a configuration descriptor and checks it against the buffer.
pub(crate) fn config_total_length(raw: &[u8]) -> Result<usize, ParseError> {
    let header = ConfigDescriptor::read_from_prefix(raw).ok_or(ParseError::Truncated {
        offset: 0,
        needed: CONFIG_DESC_LEN,
        available: raw.len(),
    })?;
    if header.bDescriptorType != DESC_TYPE_CONFIG {
        return Err(ParseError::malformed(
            0,
            format!(
                "expected a configuration descriptor, found type {:#04x}",
                header.bDescriptorType
            ),
        ));
    }

    let total = usize::from(u16::from_le_bytes(header.wTotalLength));
    if total < CONFIG_DESC_LEN {
        return Err(ParseError::malformed(
            0,
            format!("wTotalLength {} is too small", total),
        ));
    }
    if total > raw.len() {
        return Err(ParseError::Truncated {
            offset: 0,
            needed: total,
            available: raw.len(),
        });
    }
    Ok(total)
}

/// Iterates over the descriptors of a configuration descriptor blob.
///
/// The walk ends at `wTotalLength` when `raw` starts with a configuration descriptor, and at the
/// end of `raw` otherwise. A descriptor overrunning the buffer ends the walk.
pub fn records(raw: &[u8]) -> impl Iterator<Item = Result<DescriptorRecord<'_>, ParseError>> {
    located_records(raw).map(|res| res.map(|(_, record)| record))
}

/// Like [`records`], but also yields the byte offset of every record.
fn located_records(
    raw: &[u8],
) -> impl Iterator<Item = Result<(usize, DescriptorRecord<'_>), ParseError>> {
    let raw = match config_total_length(raw) {
        Ok(total) => &raw[..total],
        Err(_) => raw,
    };
    let mut interface = None;
    split_descriptors(raw).map(move |res| {
        let (offset, ty, data) = res?;
        let record = parse_record(offset, ty, data, interface)?;
        if let DescriptorRecord::Interface {
            class, subclass, ..
        } = &record
        {
            interface = Some((*class, *subclass));
        }
        Ok((offset, record))
    })
}

fn parse_record(
    offset: usize,
    ty: u8,
    data: &[u8],
    interface: Option<(u8, u8)>,
) -> Result<DescriptorRecord<'_>, ParseError> {
    let too_short = || ParseError::malformed(offset, format!("descriptor type {:#04x} too short", ty));

    let record = match ty {
        DESC_TYPE_CONFIG => {
            let desc = ConfigDescriptor::read_from_prefix(data).ok_or_else(too_short)?;
            DescriptorRecord::Config {
                total_length: u16::from_le_bytes(desc.wTotalLength),
                num_interfaces: desc.bNumInterfaces,
            }
        }
        DESC_TYPE_IAD => {
            let iad = InterfaceAssociationDescriptor::read_from_prefix(data).ok_or_else(too_short)?;
            DescriptorRecord::Association {
                first_interface: iad.bFirstInterface,
                interface_count: iad.bInterfaceCount,
                function_class: iad.bFunctionClass,
                function_subclass: iad.bFunctionSubClass,
            }
        }
        DESC_TYPE_INTERFACE => {
            let desc = InterfaceDescriptor::read_from_prefix(data).ok_or_else(too_short)?;
            DescriptorRecord::Interface {
                number: desc.bInterfaceNumber,
                alt_setting: desc.bAlternateSetting,
                class: desc.bInterfaceClass,
                subclass: desc.bInterfaceSubClass,
            }
        }
        DESC_TYPE_ENDPOINT => {
            let desc = EndpointDescriptor::read_from_prefix(data).ok_or_else(too_short)?;
            let transfer_type = TransferType::from_raw(desc.bmAttributes & 0b11)
                .unwrap_or(TransferType::Control);
            DescriptorRecord::Endpoint(Endpoint {
                address: desc.bEndpointAddress,
                transfer_type,
                max_packet_size: u16::from_le_bytes(desc.wMaxPacketSize),
                interval: desc.bInterval,
            })
        }
        DESC_TYPE_CS_INTERFACE => {
            let body = &data[2..];
            let parsed = match interface {
                Some((VIDEO_CLASS, VIDEO_SUBCLASS_CONTROL)) => {
                    with_zero_padding(body, parse_control_descriptor)
                }
                Some((VIDEO_CLASS, VIDEO_SUBCLASS_STREAMING)) => {
                    with_zero_padding(body, parse_streaming_descriptor)
                }
                _ => Ok(None),
            };
            match parsed {
                Ok(Some(record)) => record,
                Ok(None) => DescriptorRecord::Unknown {
                    descriptor_type: ty,
                    data,
                },
                Err(e) => return Err(ParseError::malformed(offset, e.to_string())),
            }
        }
        _ => DescriptorRecord::Unknown {
            descriptor_type: ty,
            data,
        },
    };
    Ok(record)
}

/// Runs `parse` on `raw`, retrying with extra zero bytes if the descriptor is too short.
///
/// Some devices declare a `bLength` shorter than the fixed layout of the descriptor subtype.
/// `bLength` is authoritative for where the next descriptor starts, the missing fields read as 0.
fn with_zero_padding(
    raw: &[u8],
    parse: fn(&[u8]) -> io::Result<Option<DescriptorRecord<'static>>>,
) -> io::Result<Option<DescriptorRecord<'static>>> {
    match parse(raw) {
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            log::warn!("UVC descriptor too short, please report a bug to the device manufacturer");
            log::debug!("retrying with 100 extra zero bytes");
            log::debug!("descriptor data: {:02x?}", raw);

            let mut buf = vec![0; raw.len() + 100];
            buf[..raw.len()].copy_from_slice(raw);

            parse(&buf)
        }
        res => res,
    }
}

fn read_sources(raw: &mut &[u8], count: u8) -> io::Result<Vec<SourceId>> {
    (0..count)
        .map(|_| raw.read_nonzero_source_id())
        .collect::<io::Result<Vec<_>>>()
}

fn parse_control_descriptor(mut raw: &[u8]) -> io::Result<Option<DescriptorRecord<'static>>> {
    let subtype = raw.read_u8()?;
    let record = match subtype {
        CONTROL_DESC_SUBTYPE_HEADER => DescriptorRecord::ControlHeader(ControlHeader {
            uvc_version: BcdVersion(raw.read_u16::<LE>()?),
            clock_freq_hz: {
                let _total_len = raw.read_u16::<LE>()?;
                raw.read_u32::<LE>()?
            },
            streaming_interfaces: {
                let count = raw.read_u8()?;
                (0..count)
                    .map(|_| raw.read_u8())
                    .collect::<io::Result<Vec<_>>>()?
            },
        }),
        CONTROL_DESC_SUBTYPE_INPUT_TERM => {
            let id = raw.read_nonzero_term_id()?;
            let terminal_type = raw.read_u16::<LE>()?;
            let _assoc = raw.read_u8()?;
            let _string = raw.read_u8()?;
            let kind = if terminal_type == TERMINAL_TYPE_CAMERA {
                let _objective_focal_length_min = raw.read_u16::<LE>()?;
                let _objective_focal_length_max = raw.read_u16::<LE>()?;
                let _ocular_focal_length = raw.read_u16::<LE>()?;
                TerminalKind::Camera {
                    controls: CameraControls::from_bits_truncate(
                        raw.read_length_prefixed_bitmask()?,
                    ),
                }
            } else {
                TerminalKind::Input
            };
            DescriptorRecord::Terminal(Terminal {
                id,
                terminal_type,
                kind,
            })
        }
        CONTROL_DESC_SUBTYPE_OUTPUT_TERMINAL => {
            let id = raw.read_nonzero_term_id()?;
            let terminal_type = raw.read_u16::<LE>()?;
            let _assoc = raw.read_u8()?;
            DescriptorRecord::Terminal(Terminal {
                id,
                terminal_type,
                kind: TerminalKind::Output {
                    source: raw.read_nonzero_source_id()?,
                },
            })
        }
        CONTROL_DESC_SUBTYPE_SELECTOR_UNIT => {
            let id = raw.read_nonzero_unit_id()?;
            let num = raw.read_u8()?;
            DescriptorRecord::Unit(Unit {
                id,
                kind: UnitKind::Selector {
                    inputs: read_sources(&mut raw, num)?,
                },
            })
        }
        CONTROL_DESC_SUBTYPE_PROCESSING_UNIT => {
            // Older Leap Motion firmware declares this descriptor one byte short. Only the
            // fields up to `bmControls` are read, so that is not a problem here.
            let id = raw.read_nonzero_unit_id()?;
            let source = raw.read_nonzero_source_id()?;
            let _max_multiplier = raw.read_u16::<LE>()?;
            DescriptorRecord::Unit(Unit {
                id,
                kind: UnitKind::Processing {
                    source,
                    controls: ProcessingUnitControls::from_bits_truncate(
                        raw.read_length_prefixed_bitmask()?,
                    ),
                },
            })
        }
        CONTROL_DESC_SUBTYPE_EXTENSION_UNIT => {
            let id = raw.read_nonzero_unit_id()?;
            let guid = raw.read_guid()?;
            let _num_controls = raw.read_u8()?;
            let count = raw.read_u8()?;
            DescriptorRecord::Unit(Unit {
                id,
                kind: UnitKind::Extension {
                    guid,
                    inputs: read_sources(&mut raw, count)?,
                },
            })
        }
        CONTROL_DESC_SUBTYPE_ENCODING_UNIT => {
            let id = raw.read_nonzero_unit_id()?;
            DescriptorRecord::Unit(Unit {
                id,
                kind: UnitKind::Encoding {
                    source: raw.read_nonzero_source_id()?,
                },
            })
        }
        _ => {
            log::debug!("skipping VC descriptor subtype {:#04x}", subtype);
            return Ok(None);
        }
    };
    Ok(Some(record))
}

fn parse_streaming_descriptor(mut raw: &[u8]) -> io::Result<Option<DescriptorRecord<'static>>> {
    let subtype = raw.read_u8()?;
    let record = match subtype {
        STREAM_DESC_SUBTYPE_INPUT_HEADER => {
            let num_formats = raw.read_u8()?;
            let _total_length = raw.read_u16::<LE>()?;
            DescriptorRecord::InputHeader(InputHeader {
                num_formats,
                endpoint_address: raw.read_u8()?,
                info: InputInterfaceInfo::from_bits_truncate(raw.read_u8()?),
                terminal_link: raw.read_nonzero_term_id()?,
                still_capture_method: {
                    let raw = raw.read_u8()?;
                    StillCaptureMethod::from_raw(raw).unwrap_or_else(|| {
                        log::warn!("invalid value {} for `bStillCaptureMethod`", raw);
                        StillCaptureMethod::None
                    })
                },
                trigger_support: raw.read_u8()? == 1,
            })
        }
        STREAM_DESC_SUBTYPE_FORMAT_UNCOMPRESSED | STREAM_DESC_SUBTYPE_FORMAT_FRAME_BASED => {
            let index = FormatIndex(raw.read_u8()?);
            let num_frame_descriptors = raw.read_u8()?;
            let guid = raw.read_guid()?;
            let fourcc = FourCc::from_guid(&guid);
            let bits_per_pixel = raw.read_u8()?;
            let kind = if subtype == STREAM_DESC_SUBTYPE_FORMAT_UNCOMPRESSED {
                FormatKind::Uncompressed {
                    guid,
                    fourcc,
                    bits_per_pixel,
                }
            } else {
                FormatKind::FrameBased {
                    guid,
                    fourcc,
                    bits_per_pixel,
                }
            };
            let default_frame = FrameIndex(raw.read_u8()?);
            let _aspect_ratio_x = raw.read_u8()?;
            let _aspect_ratio_y = raw.read_u8()?;
            DescriptorRecord::Format(Format {
                index,
                kind,
                num_frame_descriptors,
                default_frame,
                interlace_flags: InterlaceFlags::from_bits_truncate(raw.read_u8()?),
                frames: Vec::new(),
            })
        }
        STREAM_DESC_SUBTYPE_FORMAT_MJPEG => {
            let index = FormatIndex(raw.read_u8()?);
            let num_frame_descriptors = raw.read_u8()?;
            let _flags = raw.read_u8()?;
            let default_frame = FrameIndex(raw.read_u8()?);
            let _aspect_ratio_x = raw.read_u8()?;
            let _aspect_ratio_y = raw.read_u8()?;
            DescriptorRecord::Format(Format {
                index,
                kind: FormatKind::Mjpeg,
                num_frame_descriptors,
                default_frame,
                interlace_flags: InterlaceFlags::from_bits_truncate(raw.read_u8()?),
                frames: Vec::new(),
            })
        }
        STREAM_DESC_SUBTYPE_FRAME_UNCOMPRESSED
        | STREAM_DESC_SUBTYPE_FRAME_MJPEG
        | STREAM_DESC_SUBTYPE_FRAME_FRAME_BASED => {
            let index = FrameIndex(raw.read_u8()?);
            let capabilities = FrameCapabilities::from_bits_truncate(raw.read_u8()?);
            let width = raw.read_u16::<LE>()?;
            let height = raw.read_u16::<LE>()?;
            let min_bit_rate = raw.read_u32::<LE>()?;
            let max_bit_rate = raw.read_u32::<LE>()?;
            let frame_based = subtype == STREAM_DESC_SUBTYPE_FRAME_FRAME_BASED;
            let max_video_frame_buffer_size = if frame_based {
                0
            } else {
                raw.read_u32::<LE>()?
            };
            let default_interval = raw.read_interval()?;
            let interval_type = raw.read_u8()?;
            if frame_based {
                let _bytes_per_line = raw.read_u32::<LE>()?;
            }
            let intervals = match interval_type {
                0 => FrameIntervals::Continuous {
                    min: raw.read_interval()?,
                    max: raw.read_interval()?,
                    step: raw.read_interval()?,
                },
                n => {
                    let mut list = (0..n)
                        .map(|_| raw.read_interval())
                        .collect::<io::Result<Vec<_>>>()?;
                    let declared = list.len();
                    list.retain(|i| i.raw() != 0);
                    if list.len() != declared {
                        log::warn!(
                            "frame {} ({}x{}) lists {} zero frame intervals, ignoring them",
                            index.0,
                            width,
                            height,
                            declared - list.len()
                        );
                    }
                    FrameIntervals::Discrete(list)
                }
            };
            if width == 0 || height == 0 {
                return io_err_res(format!("frame {} has a zero dimension", index.0));
            }
            DescriptorRecord::Frame(Frame {
                index,
                capabilities,
                width,
                height,
                min_bit_rate,
                max_bit_rate,
                max_video_frame_buffer_size,
                default_interval,
                intervals,
            })
        }
        STREAM_DESC_SUBTYPE_FORMAT_MPEG2TS
        | STREAM_DESC_SUBTYPE_FORMAT_DV
        | STREAM_DESC_SUBTYPE_FORMAT_STREAM_BASED
        | STREAM_DESC_SUBTYPE_FORMAT_H264
        | STREAM_DESC_SUBTYPE_FORMAT_H264_SIMULCAST
        | STREAM_DESC_SUBTYPE_FORMAT_VP8
        | STREAM_DESC_SUBTYPE_FORMAT_VP8_SIMULCAST => {
            DescriptorRecord::UnsupportedFormat { subtype }
        }
        _ => {
            log::trace!("skipping VS descriptor subtype {:#04x}", subtype);
            return Ok(None);
        }
    };
    Ok(Some(record))
}

/// Builds a [`DeviceIndex`] from a raw configuration descriptor.
///
/// `raw` must start with the configuration descriptor. Bytes past `wTotalLength` are ignored.
pub fn build_index(raw: &[u8]) -> Result<DeviceIndex, ParseError> {
    let total = config_total_length(raw)?;
    let mut builder = IndexBuilder::default();
    for record in located_records(&raw[..total]) {
        let (offset, record) = record?;
        builder.push(record, offset)?;
    }
    let index = builder.finish(total as u16)?;

    log::debug!(
        "descriptor index: {} video function(s), {} streaming interface(s)",
        index.functions.len(),
        index.streaming_interfaces().count()
    );
    Ok(index)
}

enum Current {
    None,
    Control(usize),
    Streaming(usize),
    Other,
}

impl Default for Current {
    fn default() -> Self {
        Current::None
    }
}

struct PendingFunction {
    offset: usize,
    interface: u8,
    interrupt_endpoint: Option<Endpoint>,
    header: Option<ControlHeader>,
    terminals: Vec<Terminal>,
    units: Vec<Unit>,
}

struct PendingStreaming {
    desc: StreamingInterface,
    /// The function that was being described when this interface first appeared.
    preceding_function: Option<usize>,
}

#[derive(Default)]
struct IndexBuilder {
    functions: Vec<PendingFunction>,
    streaming: Vec<PendingStreaming>,
    current: Current,
    /// Streaming interface and offset of the last format, until it is checked for frames.
    open_format: Option<(usize, usize)>,
    skip_frames: bool,
}

impl IndexBuilder {
    fn push(&mut self, record: DescriptorRecord<'_>, offset: usize) -> Result<(), ParseError> {
        match record {
            DescriptorRecord::Config { .. } => {}
            DescriptorRecord::Association {
                first_interface,
                interface_count,
                function_class,
                function_subclass,
            } => {
                log::trace!(
                    "IAD: interfaces {}..{}, class {:#04x}/{:#04x}",
                    first_interface,
                    u16::from(first_interface) + u16::from(interface_count),
                    function_class,
                    function_subclass
                );
            }
            DescriptorRecord::Interface {
                number,
                alt_setting,
                class,
                subclass,
            } => {
                self.close_format()?;
                self.skip_frames = false;
                self.current = match (class, subclass) {
                    (VIDEO_CLASS, VIDEO_SUBCLASS_CONTROL) => {
                        match self.functions.iter().position(|f| f.interface == number) {
                            Some(i) => Current::Control(i),
                            None => {
                                self.functions.push(PendingFunction {
                                    offset,
                                    interface: number,
                                    interrupt_endpoint: None,
                                    header: None,
                                    terminals: Vec::new(),
                                    units: Vec::new(),
                                });
                                Current::Control(self.functions.len() - 1)
                            }
                        }
                    }
                    (VIDEO_CLASS, VIDEO_SUBCLASS_STREAMING) => {
                        let i = match self.streaming.iter().position(|s| s.desc.number == number)
                        {
                            Some(i) => i,
                            None => {
                                self.streaming.push(PendingStreaming {
                                    desc: StreamingInterface {
                                        number,
                                        uvc_version: BcdVersion(0),
                                        header: None,
                                        formats: Vec::new(),
                                        alt_settings: Vec::new(),
                                    },
                                    preceding_function: self.functions.len().checked_sub(1),
                                });
                                self.streaming.len() - 1
                            }
                        };
                        self.streaming[i].desc.alt_settings.push(AltSetting {
                            number: alt_setting,
                            endpoint: None,
                        });
                        Current::Streaming(i)
                    }
                    (VIDEO_CLASS, _) => {
                        log::warn!(
                            "interface {} uses unexpected video subclass {}, ignoring it",
                            number,
                            subclass
                        );
                        Current::Other
                    }
                    _ => Current::Other,
                };
            }
            DescriptorRecord::Endpoint(ep) => match self.current {
                Current::Control(i) => {
                    if ep.transfer_type == TransferType::Interrupt {
                        self.functions[i].interrupt_endpoint = Some(ep);
                    } else {
                        log::warn!(
                            "control interface has {:?} endpoint {:#04x}, only interrupt EPs are allowed",
                            ep.transfer_type,
                            ep.address
                        );
                    }
                }
                Current::Streaming(i) => {
                    let intf = &mut self.streaming[i].desc;
                    // `Current::Streaming` is only set right after pushing an alt setting.
                    if let Some(alt) = intf.alt_settings.last_mut() {
                        match alt.endpoint {
                            None => alt.endpoint = Some(ep),
                            Some(_) => log::debug!(
                                "ignoring extra endpoint {:#04x} in interface {} alt {}",
                                ep.address,
                                intf.number,
                                alt.number
                            ),
                        }
                    }
                }
                Current::None | Current::Other => {}
            },
            DescriptorRecord::ControlHeader(header) => {
                let func = self.control(offset)?;
                if func.header.is_some() {
                    return Err(ParseError::malformed(offset, "duplicate VC_HEADER descriptor"));
                }
                func.header = Some(header);
            }
            DescriptorRecord::Terminal(terminal) => self.control(offset)?.terminals.push(terminal),
            DescriptorRecord::Unit(unit) => self.control(offset)?.units.push(unit),
            DescriptorRecord::InputHeader(header) => {
                let intf = self.streaming(offset)?;
                if intf.header.is_some() {
                    return Err(ParseError::malformed(
                        offset,
                        "duplicate input header descriptor",
                    ));
                }
                intf.header = Some(header);
            }
            DescriptorRecord::Format(format) => {
                self.close_format()?;
                if format.num_frame_descriptors == 0 {
                    return Err(ParseError::malformed(
                        offset,
                        format!("format {} declares no frames", format.index.0),
                    ));
                }
                let i = match self.current {
                    Current::Streaming(i) => i,
                    _ => {
                        return Err(ParseError::malformed(
                            offset,
                            "format descriptor outside of a Video Streaming interface",
                        ))
                    }
                };
                self.streaming[i].desc.formats.push(format);
                self.open_format = Some((i, offset));
                self.skip_frames = false;
            }
            DescriptorRecord::UnsupportedFormat { subtype } => {
                self.close_format()?;
                log::debug!("skipping unsupported format (subtype {:#04x})", subtype);
                self.skip_frames = true;
            }
            DescriptorRecord::Frame(frame) => {
                if self.skip_frames {
                    return Ok(());
                }
                if self.open_format.is_none() {
                    return Err(ParseError::malformed(
                        offset,
                        "frame descriptor without a preceding format descriptor",
                    ));
                }
                let intf = self.streaming(offset)?;
                if let Some(format) = intf.formats.last_mut() {
                    format.frames.push(frame);
                }
            }
            DescriptorRecord::Unknown {
                descriptor_type, ..
            } => {
                log::trace!("skipping descriptor of type {:#04x}", descriptor_type);
            }
        }
        Ok(())
    }

    fn control(&mut self, offset: usize) -> Result<&mut PendingFunction, ParseError> {
        match self.current {
            Current::Control(i) => Ok(&mut self.functions[i]),
            _ => Err(ParseError::malformed(
                offset,
                "Video Control descriptor outside of a Video Control interface",
            )),
        }
    }

    fn streaming(&mut self, offset: usize) -> Result<&mut StreamingInterface, ParseError> {
        match self.current {
            Current::Streaming(i) => Ok(&mut self.streaming[i].desc),
            _ => Err(ParseError::malformed(
                offset,
                "Video Streaming descriptor outside of a Video Streaming interface",
            )),
        }
    }

    /// Checks that the last format got at least one frame.
    fn close_format(&mut self) -> Result<(), ParseError> {
        let (i, offset) = match self.open_format.take() {
            Some(open) => open,
            None => return Ok(()),
        };
        if let Some(format) = self.streaming[i].desc.formats.last() {
            if format.frames.is_empty() {
                return Err(ParseError::malformed(
                    offset,
                    format!("format {} has no frame descriptors", format.index.0),
                ));
            }
            if format.frames.len() != usize::from(format.num_frame_descriptors) {
                log::warn!(
                    "format {} declares {} frames, found {}",
                    format.index.0,
                    format.num_frame_descriptors,
                    format.frames.len()
                );
            }
        }
        Ok(())
    }

    fn finish(mut self, total_length: u16) -> Result<DeviceIndex, ParseError> {
        self.close_format()?;

        let mut streaming = self.streaming;
        let mut functions = Vec::with_capacity(self.functions.len());
        for func in self.functions {
            let header = func.header.ok_or_else(|| {
                ParseError::malformed(
                    func.offset,
                    format!("Video Control interface {} has no VC_HEADER", func.interface),
                )
            })?;

            let mut members = Vec::new();
            for &number in &header.streaming_interfaces {
                match streaming.iter().position(|s| s.desc.number == number) {
                    Some(pos) => members.push(streaming.remove(pos).desc),
                    None => log::warn!(
                        "VC_HEADER of interface {} lists missing streaming interface {}",
                        func.interface,
                        number
                    ),
                }
            }

            functions.push(VideoFunction {
                control_interface: func.interface,
                interrupt_endpoint: func.interrupt_endpoint,
                topology: Topology {
                    header,
                    terminals: func.terminals,
                    units: func.units,
                },
                streaming: members,
            });
        }

        // Streaming interfaces no VC_HEADER lists belong to the function they follow.
        for orphan in streaming {
            let func = orphan
                .preceding_function
                .and_then(|i| functions.get_mut(i))
                .ok_or_else(|| {
                    ParseError::malformed(
                        0,
                        format!(
                            "streaming interface {} does not belong to any video function",
                            orphan.desc.number
                        ),
                    )
                })?;
            log::warn!(
                "streaming interface {} is not listed in VC_HEADER of interface {}",
                orphan.desc.number,
                func.control_interface
            );
            func.streaming.push(orphan.desc);
        }

        for func in &mut functions {
            let version = func.topology.header.uvc_version;
            for intf in &mut func.streaming {
                intf.uvc_version = version;
            }
        }

        Ok(DeviceIndex {
            total_length,
            functions,
        })
    }
}
