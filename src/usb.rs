//! [`Transport`] implementation on top of libusb.
//!
//! libusb's synchronous API is used throughout. Bulk data transfers are queued by
//! [`Transport::submit`] and performed one after another inside [`Transport::poll_events`], so
//! they complete on whichever thread polls. Isochronous transfers need libusb's asynchronous API
//! and are rejected.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock},
    thread,
    time::{Duration, Instant},
};

use rusb::{Context, Device, DeviceHandle, UsbContext};

use crate::{
    descriptor::TransferType,
    error::{err, Action, Error, ErrorKind, ResultExt},
    transport::{
        Completion, DataTransfer, DeviceInfo, SetupPacket, TransferStatus, Transport,
        TransportEvent,
    },
    Result,
};

const REQ_GET_DESCRIPTOR: u8 = 0x06;
const DESC_TYPE_CONFIG: u16 = 0x02;
const CONFIG_DESC_LEN: usize = 9;

/// Timeout of the descriptor reads done while opening a device.
const DESCRIPTOR_TIMEOUT: Duration = Duration::from_millis(1000);

/// Upper bound for a single bulk read inside `poll_events`.
const BULK_SLICE: Duration = Duration::from_millis(20);

/// How often the device list is compared against the previous one for attach/detach events.
const RESCAN_INTERVAL: Duration = Duration::from_secs(1);

type Handle = Arc<RwLock<DeviceHandle<Context>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Scan {
    known: HashSet<u8>,
    last: Option<Instant>,
}

pub struct RusbTransport {
    context: Context,
    handles: Mutex<HashMap<u8, Handle>>,
    pending: Mutex<VecDeque<(u8, DataTransfer)>>,
    events: Mutex<VecDeque<TransportEvent>>,
    scan: Mutex<Scan>,
}

impl RusbTransport {
    pub fn new() -> Result<Self> {
        let context = Context::new().during(Action::Installing)?;
        Ok(Self {
            context,
            handles: Mutex::new(HashMap::new()),
            pending: Mutex::new(VecDeque::new()),
            events: Mutex::new(VecDeque::new()),
            scan: Mutex::new(Scan {
                known: HashSet::new(),
                last: None,
            }),
        })
    }

    fn device(&self, address: u8) -> Result<Device<Context>> {
        let list = self.context.devices().during(Action::EnumeratingDevices)?;
        let found = list.iter().find(|dev| dev.address() == address);
        match found {
            Some(dev) => Ok(dev),
            None => err(
                ErrorKind::NotFound,
                format!("no USB device at address {}", address),
                Action::OpeningDevice,
            ),
        }
    }

    fn handle(&self, address: u8) -> Result<Handle> {
        let mut handles = lock(&self.handles);
        if let Some(handle) = handles.get(&address) {
            return Ok(handle.clone());
        }

        let device = self.device(address)?;
        let mut usb = device.open().during(Action::OpeningDevice)?;
        if let Err(e) = usb.set_auto_detach_kernel_driver(true) {
            log::warn!("set_auto_detach_kernel_driver failed: {}", e);
        }
        log::debug!(
            "opened Bus {:03} Device {:03}",
            device.bus_number(),
            device.address()
        );

        let handle = Arc::new(RwLock::new(usb));
        handles.insert(address, handle.clone());
        Ok(handle)
    }

    fn with_usb<T>(
        &self,
        address: u8,
        mut cb: impl FnMut(&DeviceHandle<Context>) -> rusb::Result<T>,
    ) -> Result<T> {
        let handle = self.handle(address)?;
        let usb = handle.read().unwrap_or_else(PoisonError::into_inner);

        // Some devices time out on one of the first transfers after being opened. Retrying once
        // works around that.
        match cb(&usb) {
            Err(rusb::Error::Timeout) => {
                log::warn!("USB timeout, retrying request");
                Ok(cb(&usb)?)
            }
            other => Ok(other?),
        }
    }

    fn with_usb_mut<T>(
        &self,
        address: u8,
        cb: impl FnOnce(&mut DeviceHandle<Context>) -> rusb::Result<T>,
    ) -> Result<T> {
        let handle = self.handle(address)?;
        let mut usb = handle.write().unwrap_or_else(PoisonError::into_inner);
        Ok(cb(&mut usb)?)
    }

    /// Compares the device list with the previous scan and queues attach/detach events.
    fn rescan(&self) -> Result<()> {
        let mut scan = lock(&self.scan);
        if scan.last.map_or(false, |last| last.elapsed() < RESCAN_INTERVAL) {
            return Ok(());
        }
        scan.last = Some(Instant::now());

        let current = self
            .context
            .devices()
            .during(Action::PollingEvents)?
            .iter()
            .map(|dev| dev.address())
            .collect::<HashSet<_>>();

        let mut events = lock(&self.events);
        for &address in current.difference(&scan.known) {
            events.push_back(TransportEvent::DeviceAttached(address));
        }
        for &address in scan.known.difference(&current) {
            events.push_back(TransportEvent::DeviceGone(address));
            lock(&self.handles).remove(&address);

            let mut pending = lock(&self.pending);
            let (gone, keep) = pending
                .drain(..)
                .partition::<VecDeque<_>, _>(|(addr, _)| *addr == address);
            *pending = keep;
            for (_, transfer) in gone {
                events.push_back(TransportEvent::TransferDone(Completion::empty(
                    transfer,
                    TransferStatus::NoDevice,
                )));
            }
        }
        scan.known = current;
        Ok(())
    }

    /// Performs one queued bulk transfer. Returns `false` if the queue was empty.
    fn run_pending(&self) -> bool {
        let next = lock(&self.pending).pop_front();
        let (address, mut transfer) = match next {
            Some(next) => next,
            None => return false,
        };

        let endpoint = transfer.endpoint;
        let handle = match self.handle(address) {
            Ok(handle) => handle,
            Err(e) => {
                log::debug!("device {} unavailable: {}", address, e);
                lock(&self.events).push_back(TransportEvent::TransferDone(Completion::empty(
                    transfer,
                    TransferStatus::NoDevice,
                )));
                return true;
            }
        };
        let res = handle
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .read_bulk(endpoint, &mut transfer.buffer, BULK_SLICE);

        let status = match res {
            Ok(len) => {
                let completion = Completion {
                    id: transfer.id,
                    endpoint,
                    status: TransferStatus::Completed,
                    buffer: transfer.buffer,
                    actual_length: len,
                    iso_packets: Vec::new(),
                    packet_size: transfer.packet_size,
                };
                lock(&self.events).push_back(TransportEvent::TransferDone(completion));
                return true;
            }
            // Nothing arrived in this slice, keep the transfer queued.
            Err(rusb::Error::Timeout) => {
                lock(&self.pending).push_back((address, transfer));
                return true;
            }
            Err(e) => {
                log::debug!("bulk read on {:#04x} failed: {}", endpoint, e);
                match e {
                    rusb::Error::Pipe => TransferStatus::Stall,
                    rusb::Error::NoDevice => TransferStatus::NoDevice,
                    rusb::Error::Overflow => TransferStatus::Overflow,
                    _ => TransferStatus::Error,
                }
            }
        };
        lock(&self.events).push_back(TransportEvent::TransferDone(Completion::empty(
            transfer, status,
        )));
        true
    }
}

impl Transport for RusbTransport {
    fn register_client(&self) -> Result<()> {
        let mut scan = lock(&self.scan);
        scan.known.clear();
        scan.last = None;
        Ok(())
    }

    fn deregister_client(&self) -> Result<()> {
        lock(&self.handles).clear();
        lock(&self.events).clear();
        Ok(())
    }

    fn devices(&self) -> Result<Vec<DeviceInfo>> {
        let list = self.context.devices().during(Action::EnumeratingDevices)?;
        let mut devices = Vec::new();
        for dev in list.iter() {
            let desc = match dev.device_descriptor() {
                Ok(desc) => desc,
                Err(e) => {
                    log::debug!("{:?}: {}", dev, e);
                    continue;
                }
            };
            log::trace!(
                "Bus {:03} Device {:03} {:04x}:{:04x}",
                dev.bus_number(),
                dev.address(),
                desc.vendor_id(),
                desc.product_id(),
            );
            devices.push(DeviceInfo {
                address: dev.address(),
                vendor_id: desc.vendor_id(),
                product_id: desc.product_id(),
            });
        }
        Ok(devices)
    }

    fn config_descriptor(&self, address: u8) -> Result<Vec<u8>> {
        let value = DESC_TYPE_CONFIG << 8;
        let mut header = [0; CONFIG_DESC_LEN];
        let len = self.with_usb(address, |usb| {
            usb.read_control(
                rusb::request_type(
                    rusb::Direction::In,
                    rusb::RequestType::Standard,
                    rusb::Recipient::Device,
                ),
                REQ_GET_DESCRIPTOR,
                value,
                0,
                &mut header,
                DESCRIPTOR_TIMEOUT,
            )
        })?;
        if len < 4 {
            return err(
                ErrorKind::Protocol,
                format!("configuration descriptor read returned {} bytes", len),
                Action::OpeningDevice,
            );
        }

        let total = usize::from(u16::from_le_bytes([header[2], header[3]]));
        let mut raw = vec![0; total];
        let len = self.with_usb(address, |usb| {
            usb.read_control(
                rusb::request_type(
                    rusb::Direction::In,
                    rusb::RequestType::Standard,
                    rusb::Recipient::Device,
                ),
                REQ_GET_DESCRIPTOR,
                value,
                0,
                &mut raw,
                DESCRIPTOR_TIMEOUT,
            )
        })?;
        raw.truncate(len);
        Ok(raw)
    }

    fn control_transfer(
        &self,
        address: u8,
        setup: SetupPacket,
        data: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        log::trace!("control transfer on device {}: {:?}", address, setup);
        let len = usize::from(setup.length).min(data.len());
        if setup.is_in() {
            self.with_usb(address, |usb| {
                usb.read_control(
                    setup.request_type,
                    setup.request,
                    setup.value,
                    setup.index,
                    &mut data[..len],
                    timeout,
                )
            })
        } else {
            self.with_usb(address, |usb| {
                usb.write_control(
                    setup.request_type,
                    setup.request,
                    setup.value,
                    setup.index,
                    &data[..len],
                    timeout,
                )
            })
        }
    }

    fn claim_interface(&self, address: u8, interface: u8) -> Result<()> {
        self.with_usb_mut(address, |usb| usb.claim_interface(interface))
    }

    fn release_interface(&self, address: u8, interface: u8) -> Result<()> {
        self.with_usb_mut(address, |usb| usb.release_interface(interface))
    }

    fn set_alternate_setting(&self, address: u8, interface: u8, alt_setting: u8) -> Result<()> {
        self.with_usb_mut(address, |usb| {
            usb.set_alternate_setting(interface, alt_setting)
        })
    }

    fn clear_halt(&self, address: u8, endpoint: u8) -> Result<()> {
        self.with_usb_mut(address, |usb| usb.clear_halt(endpoint))
    }

    fn submit(&self, address: u8, transfer: DataTransfer) -> Result<()> {
        if transfer.kind != TransferType::Bulk {
            return Err(Error::new(
                ErrorKind::Transport,
                format!(
                    "{:?} transfers are not supported by the libusb backend",
                    transfer.kind
                ),
            ));
        }
        lock(&self.pending).push_back((address, transfer));
        Ok(())
    }

    fn cancel_transfers(&self, address: u8, endpoint: u8) -> Result<()> {
        let mut pending = lock(&self.pending);
        let (cancelled, keep) = pending
            .drain(..)
            .partition::<VecDeque<_>, _>(|(addr, t)| *addr == address && t.endpoint == endpoint);
        *pending = keep;
        drop(pending);

        let mut events = lock(&self.events);
        for (_, transfer) in cancelled {
            events.push_back(TransportEvent::TransferDone(Completion::empty(
                transfer,
                TransferStatus::Cancelled,
            )));
        }
        Ok(())
    }

    fn poll_events(&self, timeout: Duration) -> Result<Vec<TransportEvent>> {
        let deadline = Instant::now() + timeout;
        self.rescan()?;
        loop {
            let busy = self.run_pending();
            let events = lock(&self.events).drain(..).collect::<Vec<_>>();
            if !events.is_empty() {
                return Ok(events);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            if !busy {
                thread::sleep((deadline - now).min(BULK_SLICE));
            }
        }
    }
}
