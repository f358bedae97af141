//! The interface between this driver and a USB host stack.
//!
//! The driver never touches USB hardware itself. Everything it needs from the host stack goes
//! through [`Transport`]: enumeration, descriptors, interface management, control transfers,
//! and asynchronous data transfers whose completions are reported by [`Transport::poll_events`].
//!
//! [`crate::usb::RusbTransport`] implements this on top of libusb.

use std::{fmt, time::Duration};

use crate::{descriptor::TransferType, Result};

/// Vendor and product of an attached device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceInfo {
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
}

/// The setup stage of a control transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    /// Whether the data stage goes from the device to the host.
    pub fn is_in(&self) -> bool {
        self.request_type & 0x80 != 0
    }
}

/// Identifies one in-flight data transfer: the stream that submitted it, and its slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferId {
    stream: u32,
    slot: u16,
}

impl TransferId {
    pub(crate) fn new(stream: u32, slot: u16) -> Self {
        Self { stream, slot }
    }

    pub fn stream(&self) -> u32 {
        self.stream
    }

    pub fn slot(&self) -> u16 {
        self.slot
    }
}

impl fmt::Debug for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.stream, self.slot)
    }
}

/// A data transfer handed to the host stack.
///
/// The buffer moves into the transport and comes back in the matching [`Completion`].
#[derive(Debug)]
pub struct DataTransfer {
    pub id: TransferId,
    pub endpoint: u8,
    pub kind: TransferType,
    pub buffer: Vec<u8>,
    /// Size of one isochronous packet slot within `buffer`. Unused for bulk transfers.
    pub packet_size: usize,
    /// Number of isochronous packets. Zero for bulk transfers.
    pub num_packets: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    Error,
    TimedOut,
    Cancelled,
    Stall,
    NoDevice,
    Overflow,
    Skipped,
}

/// Result of one isochronous packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsoPacket {
    pub status: TransferStatus,
    pub actual_length: usize,
}

/// A finished data transfer, returned with its buffer.
#[derive(Debug)]
pub struct Completion {
    pub id: TransferId,
    pub endpoint: u8,
    pub status: TransferStatus,
    pub buffer: Vec<u8>,
    /// Received bytes for bulk transfers.
    pub actual_length: usize,
    /// Per-packet results for isochronous transfers. Packet `i` starts at `i * packet_size`.
    pub iso_packets: Vec<IsoPacket>,
    pub packet_size: usize,
}

impl Completion {
    /// A completion for `transfer` carrying no data, e.g. after cancellation.
    pub fn empty(transfer: DataTransfer, status: TransferStatus) -> Self {
        Completion {
            id: transfer.id,
            endpoint: transfer.endpoint,
            status,
            buffer: transfer.buffer,
            actual_length: 0,
            iso_packets: Vec::new(),
            packet_size: transfer.packet_size,
        }
    }
}

#[derive(Debug)]
pub enum TransportEvent {
    DeviceAttached(u8),
    DeviceGone(u8),
    TransferDone(Completion),
}

/// Capabilities the driver needs from a USB host stack.
///
/// Devices are addressed by their bus address. Implementations must complete every submitted
/// transfer exactly once, including cancelled ones and those pending when a device disappears.
pub trait Transport: Send + Sync {
    /// Registers the driver as a client of the host stack. Called once per install.
    fn register_client(&self) -> Result<()>;

    fn deregister_client(&self) -> Result<()>;

    /// Currently attached devices.
    fn devices(&self) -> Result<Vec<DeviceInfo>>;

    /// The raw active configuration descriptor, including all subordinate descriptors.
    fn config_descriptor(&self, address: u8) -> Result<Vec<u8>>;

    /// Performs a control transfer on the default pipe and returns the number of data bytes
    /// transferred. `data` must be `setup.length` bytes long.
    fn control_transfer(
        &self,
        address: u8,
        setup: SetupPacket,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize>;

    fn claim_interface(&self, address: u8, interface: u8) -> Result<()>;

    fn release_interface(&self, address: u8, interface: u8) -> Result<()>;

    fn set_alternate_setting(&self, address: u8, interface: u8, alt_setting: u8) -> Result<()>;

    fn clear_halt(&self, address: u8, endpoint: u8) -> Result<()>;

    /// Queues a data transfer. On success it is reported through [`Transport::poll_events`].
    fn submit(&self, address: u8, transfer: DataTransfer) -> Result<()>;

    /// Cancels all transfers queued on `endpoint`. They complete with
    /// [`TransferStatus::Cancelled`].
    fn cancel_transfers(&self, address: u8, endpoint: u8) -> Result<()>;

    /// Waits up to `timeout` for host events.
    fn poll_events(&self, timeout: Duration) -> Result<Vec<TransportEvent>>;
}
