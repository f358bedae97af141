//! Host-side USB Video Class driver core.
//!
//! [`UvcHost`] drives UVC cameras through a [`Transport`], which provides enumeration, control
//! transfers and asynchronous data transfers. [`UvcHost::usb`] uses the libusb-backed
//! [`usb::RusbTransport`].
//!
//! Opening a stream goes through the following steps:
//! - the device's configuration descriptor is parsed into a [`DeviceIndex`],
//! - the requested [`StreamFormatRequest`] is resolved to a format and frame descriptor,
//! - an alternate setting that fits the bandwidth budget is selected,
//! - stream parameters are negotiated with the device using the probe/commit controls,
//! - data transfers are submitted and their payloads reassembled into frames, which are passed to
//!   the frame callback of the [`StreamConfig`]. Each [`VideoFrame`] owns a buffer of the
//!   stream's pool until it is dropped.
//!
//! Identifiers taken from descriptors are wrapped in small `Copy` newtypes ([`FormatIndex`],
//! [`FrameIndex`]) that are only meaningful together with the interface they came from.

#[macro_use]
mod util;
pub mod descriptor;
pub mod detect;
mod error;
mod host;
pub mod payload;
mod probe;
mod resolve;
mod stream;
pub mod transport;
pub mod usb;

pub use descriptor::{
    DeviceIndex, Format, FormatIndex, FormatKind, FourCc, Frame, FrameIndex, FrameInterval,
    FrameIntervals, ParseError, StreamingInterface, TransferType, VideoFunction,
};
pub use error::{Error, ErrorKind};
pub use host::{DriverEvent, DriverEventCallback, HostConfig, UvcHost};
pub use probe::Negotiated;
pub use resolve::{Encoding, ResolvedFrame, StreamFormatRequest};
pub use stream::{
    BufferInfo, EventCallback, FrameCallback, FrameInfo, StreamConfig, StreamEvent,
    StreamFormat, StreamHandle, VideoFrame,
};
pub use transport::Transport;
pub use util::BcdVersion;

pub type Result<T> = std::result::Result<T, Error>;
