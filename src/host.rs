//! The driver context.
//!
//! [`UvcHost`] moves between two states: uninstalled and installed. Installing registers the
//! driver with the USB host stack and, unless configured otherwise, starts a worker thread that
//! processes host events (attach/detach notifications and transfer completions). Without the
//! worker, the caller drives event processing with [`UvcHost::handle_events`].

use std::{
    collections::{HashMap, HashSet},
    fmt, mem,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crate::{
    descriptor::{build_index, AltSetting, DeviceIndex, StreamingInterface, TransferType},
    detect,
    error::{err, Action, Error, ErrorKind, ResultExt},
    payload::{FramePool, Reassembler},
    probe::ControlPipe,
    resolve::{ResolvedFrame, StreamFormatRequest},
    stream::{
        frame_buffer_size, stream_format, Agreement, BufferInfo, Callbacks, FrameInfo,
        NegotiationParams, Session, SessionCell, SessionState, StreamConfig, StreamFormat,
        StreamHandle, VideoFrame,
    },
    transport::{DeviceInfo, Transport, TransportEvent},
    Result,
};

/// Interval at which `stream_open` looks for a matching device.
const DEVICE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How long closing a stream waits for cancelled transfers to come back.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Called for driver-level events.
pub type DriverEventCallback = Box<dyn FnMut(DriverEvent) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum DriverEvent {
    /// A video function was found on a newly attached device. Devices with several cameras
    /// produce one event per function.
    DeviceConnected {
        address: u8,
        uvc_stream_index: usize,
        /// Number of frame descriptors of the function's first streaming interface.
        frame_count: usize,
    },
}

/// Install-time configuration.
pub struct HostConfig {
    background_worker: bool,
    event_poll_interval: Duration,
    control_timeout: Duration,
    on_driver_event: Option<DriverEventCallback>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            background_worker: true,
            event_poll_interval: Duration::from_millis(100),
            control_timeout: Duration::from_secs(5),
            on_driver_event: None,
        }
    }
}

impl HostConfig {
    /// Whether to process host events on a dedicated thread. If disabled, the application has
    /// to call [`UvcHost::handle_events`] regularly.
    pub fn background_worker(mut self, enable: bool) -> Self {
        self.background_worker = enable;
        self
    }

    /// How long the worker thread blocks waiting for host events per iteration.
    pub fn event_poll_interval(mut self, interval: Duration) -> Self {
        self.event_poll_interval = interval;
        self
    }

    /// Timeout of every control transfer.
    pub fn control_timeout(mut self, timeout: Duration) -> Self {
        self.control_timeout = timeout;
        self
    }

    pub fn on_driver_event<F>(mut self, on_event: F) -> Self
    where
        F: FnMut(DriverEvent) + Send + 'static,
    {
        self.on_driver_event = Some(Box::new(on_event));
        self
    }
}

impl fmt::Debug for HostConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostConfig")
            .field("background_worker", &self.background_worker)
            .field("event_poll_interval", &self.event_poll_interval)
            .field("control_timeout", &self.control_timeout)
            .finish()
    }
}

/// A device with at least one open stream (or one being opened).
pub(crate) struct OpenDevice {
    info: DeviceInfo,
    index: DeviceIndex,
    control: ControlPipe,
    claimed: Mutex<HashSet<u8>>,
}

impl OpenDevice {
    pub(crate) fn address(&self) -> u8 {
        self.info.address
    }

    pub(crate) fn index(&self) -> &DeviceIndex {
        &self.index
    }

    pub(crate) fn control(&self) -> &ControlPipe {
        &self.control
    }
}

struct DeviceEntry {
    device: Arc<OpenDevice>,
    users: usize,
}

/// State shared between the API and the worker thread.
struct Shared {
    transport: Arc<dyn Transport>,
    background_worker: bool,
    event_poll_interval: Duration,
    control_timeout: Duration,
    on_driver_event: Mutex<Option<DriverEventCallback>>,
    devices: Mutex<HashMap<u8, DeviceEntry>>,
    sessions: Mutex<HashMap<u32, Arc<SessionCell>>>,
    /// `stream_open` calls in progress.
    opening: AtomicUsize,
    next_handle: AtomicU32,
    stop: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Installed {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

enum DriverState {
    Uninstalled,
    Installed(Installed),
}

/// The UVC host driver.
pub struct UvcHost {
    transport: Arc<dyn Transport>,
    state: Mutex<DriverState>,
}

impl UvcHost {
    /// Creates an uninstalled driver on top of `transport`.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            state: Mutex::new(DriverState::Uninstalled),
        }
    }

    /// Creates an uninstalled driver using libusb.
    pub fn usb() -> Result<Self> {
        let transport = crate::usb::RusbTransport::new().during(Action::Installing)?;
        Ok(Self::new(Arc::new(transport)))
    }

    pub fn is_installed(&self) -> bool {
        matches!(*lock(&self.state), DriverState::Installed(_))
    }

    pub fn install(&self, config: HostConfig) -> Result<()> {
        let mut state = lock(&self.state);
        if let DriverState::Installed(_) = *state {
            return err(
                ErrorKind::InvalidState,
                "driver is already installed",
                Action::Installing,
            );
        }

        self.transport.register_client().during(Action::Installing)?;

        let shared = Arc::new(Shared {
            transport: self.transport.clone(),
            background_worker: config.background_worker,
            event_poll_interval: config.event_poll_interval,
            control_timeout: config.control_timeout,
            on_driver_event: Mutex::new(config.on_driver_event),
            devices: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            opening: AtomicUsize::new(0),
            next_handle: AtomicU32::new(1),
            stop: AtomicBool::new(false),
        });

        let worker = if config.background_worker {
            let worker_shared = shared.clone();
            let spawned = thread::Builder::new()
                .name("uvc-events".into())
                .spawn(move || worker_shared.run_worker());
            match spawned {
                Ok(handle) => Some(handle),
                Err(e) => {
                    if let Err(e) = self.transport.deregister_client() {
                        log::warn!("failed to deregister after worker spawn failure: {}", e);
                    }
                    return Err(Error::with_action(e, Action::Installing));
                }
            }
        } else {
            None
        };

        *state = DriverState::Installed(Installed { shared, worker });
        log::debug!("driver installed ({})", config_summary(&state));
        Ok(())
    }

    /// Uninstalls the driver. Fails if any stream is still open or being opened.
    pub fn uninstall(&self) -> Result<()> {
        let mut state = lock(&self.state);
        match &*state {
            DriverState::Uninstalled => {
                return err(
                    ErrorKind::InvalidState,
                    "driver is not installed",
                    Action::Uninstalling,
                )
            }
            DriverState::Installed(installed) => {
                let open = lock(&installed.shared.sessions).len();
                let opening = installed.shared.opening.load(Ordering::SeqCst);
                if open + opening != 0 {
                    return err(
                        ErrorKind::InvalidState,
                        format!("{} stream(s) open, {} being opened", open, opening),
                        Action::Uninstalling,
                    );
                }
            }
        }

        if let DriverState::Installed(installed) = mem::replace(&mut *state, DriverState::Uninstalled)
        {
            installed.stop_worker();
        }
        self.transport
            .deregister_client()
            .during(Action::Uninstalling)?;
        log::debug!("driver uninstalled");
        Ok(())
    }

    fn shared(&self, action: Action) -> Result<Arc<Shared>> {
        match &*lock(&self.state) {
            DriverState::Installed(installed) => Ok(installed.shared.clone()),
            DriverState::Uninstalled => {
                err(ErrorKind::InvalidState, "driver is not installed", action)
            }
        }
    }

    /// Processes pending host events, waiting up to `timeout` for one to arrive.
    ///
    /// Only needed if the driver was installed without a background worker.
    pub fn handle_events(&self, timeout: Duration) -> Result<()> {
        self.shared(Action::PollingEvents)?.poll(timeout)
    }

    /// Opens and starts a video stream.
    ///
    /// Waits up to `timeout` for a device matching `config` to be attached. When this returns,
    /// the format is committed and data transfers are running.
    pub fn stream_open(&self, config: StreamConfig, timeout: Duration) -> Result<StreamHandle> {
        let opening = self.begin_open()?;
        config.validate()?;
        let shared = &*opening.shared;
        let (lease, interface) = shared.find_device(&config, timeout)?;
        shared.open_stream(lease, interface, config)
    }

    /// Registers a `stream_open` in progress. The state lock orders this against `uninstall`.
    fn begin_open(&self) -> Result<OpenInProgress> {
        match &*lock(&self.state) {
            DriverState::Installed(installed) => {
                installed.shared.opening.fetch_add(1, Ordering::SeqCst);
                Ok(OpenInProgress {
                    shared: installed.shared.clone(),
                })
            }
            DriverState::Uninstalled => err(
                ErrorKind::InvalidState,
                "driver is not installed",
                Action::OpeningDevice,
            ),
        }
    }

    /// Stops and closes a stream. Closing an unknown or already closed stream does nothing.
    pub fn stream_close(&self, handle: StreamHandle) -> Result<()> {
        let shared = self.shared(Action::ClosingStream)?;
        let cell = match lock(&shared.sessions).get(&handle.0) {
            Some(cell) => cell.clone(),
            None => return Ok(()),
        };
        shared.teardown(handle, &cell);
        log::info!("{} closed", handle);
        Ok(())
    }

    /// Suspends a running stream. The interface stays claimed.
    pub fn stream_stop(&self, handle: StreamHandle) -> Result<()> {
        let shared = self.shared(Action::StoppingStream)?;
        let cell = shared.session(handle, Action::StoppingStream)?;
        shared.stop_stream(&cell)
    }

    /// Restarts a stopped stream, negotiating its format again.
    pub fn stream_start(&self, handle: StreamHandle) -> Result<()> {
        let shared = self.shared(Action::StartingStream)?;
        let cell = shared.session(handle, Action::StartingStream)?;
        shared.start_stream(&cell)
    }

    /// Changes the format of an open stream.
    ///
    /// A zero resolution keeps the current one and [`Encoding::Any`][crate::Encoding::Any] keeps
    /// the current encoding. A zero frame rate selects the default of the resulting frame. A
    /// running stream is stopped for the change and restarted afterwards. Frames still held from
    /// before the change free their buffers when dropped.
    pub fn stream_format_select(
        &self,
        handle: StreamHandle,
        request: StreamFormatRequest,
    ) -> Result<()> {
        let shared = self.shared(Action::SelectingFormat)?;
        request.validate()?;
        let cell = shared.session(handle, Action::SelectingFormat)?;
        shared.select_format(&cell, request)
    }

    /// The format `handle` is running with.
    pub fn stream_format(&self, handle: StreamHandle) -> Result<StreamFormat> {
        let shared = self.shared(Action::QueryingStream)?;
        let cell = shared.session(handle, Action::QueryingStream)?;
        let session = cell.lock();
        Ok(*session.reassembler.format())
    }

    /// Buffer sizes of `handle`, including the largest frame the device announced.
    pub fn buf_info(&self, handle: StreamHandle) -> Result<BufferInfo> {
        let shared = self.shared(Action::QueryingStream)?;
        let cell = shared.session(handle, Action::QueryingStream)?;
        let info = cell.lock().buffer_info();
        Ok(info)
    }

    /// Hands back a frame kept past the frame callback.
    ///
    /// Dropping the frame does the same. This additionally checks that the frame came from
    /// `handle`; a frame from another stream is still released, to its own stream.
    pub fn frame_return(&self, handle: StreamHandle, frame: VideoFrame) -> Result<()> {
        if frame.stream() != handle {
            return err(
                ErrorKind::InvalidArgument,
                format!("frame of {} returned to {}", frame.stream(), handle),
                Action::ReturningFrame,
            );
        }
        log::trace!("{}: frame {} returned", handle, frame.sequence());
        Ok(())
    }

    /// Lists the frames offered by video function `uvc_stream_index` of the device at `address`.
    pub fn frame_list(&self, address: u8, uvc_stream_index: usize) -> Result<Vec<FrameInfo>> {
        let shared = self.shared(Action::ResolvingFormat)?;
        let index = shared.device_index(address)?;
        let function = match index.function(uvc_stream_index) {
            Some(function) => function,
            None => {
                return err(
                    ErrorKind::NotFound,
                    format!(
                        "device {} has no video function {}",
                        address, uvc_stream_index
                    ),
                    Action::ResolvingFormat,
                )
            }
        };

        let frames = function
            .streaming_interfaces()
            .first()
            .into_iter()
            .flat_map(|intf| intf.formats())
            .flat_map(|format| {
                format.frames().iter().map(move |frame| FrameInfo {
                    encoding: format.kind().into(),
                    format_index: format.index(),
                    frame_index: frame.index(),
                    width: frame.width(),
                    height: frame.height(),
                    default_interval: frame.default_interval(),
                    intervals: frame.intervals().clone(),
                })
            })
            .collect();
        Ok(frames)
    }

    /// Builds the descriptor index of the device at `address`.
    pub fn device_index(&self, address: u8) -> Result<DeviceIndex> {
        self.shared(Action::ReadingDescriptors)?.device_index(address)
    }
}

impl Drop for UvcHost {
    fn drop(&mut self) {
        let state = match self.state.get_mut() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let DriverState::Installed(installed) = mem::replace(state, DriverState::Uninstalled) {
            installed.stop_worker();
            if let Err(e) = self.transport.deregister_client() {
                log::warn!("failed to deregister on drop: {}", e);
            }
        }
    }
}

impl fmt::Debug for UvcHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UvcHost")
            .field("installed", &self.is_installed())
            .finish()
    }
}

fn config_summary(state: &DriverState) -> &'static str {
    match state {
        DriverState::Installed(Installed {
            worker: Some(_), ..
        }) => "background worker",
        DriverState::Installed(_) => "caller-driven events",
        DriverState::Uninstalled => "uninstalled",
    }
}

impl Installed {
    fn stop_worker(self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(worker) = self.worker {
            if worker.join().is_err() {
                log::error!("event worker panicked");
            }
        }
    }
}

/// A `stream_open` in progress. Uninstalling fails while one exists.
struct OpenInProgress {
    shared: Arc<Shared>,
}

impl Drop for OpenInProgress {
    fn drop(&mut self) {
        self.shared.opening.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Picks the alternate setting for a bandwidth budget and the payload size to propose with it.
/// Without a budget the interface's largest setting is used.
fn select_bandwidth(
    intf: &StreamingInterface,
    budget: Option<u32>,
    transfer_size: usize,
) -> Result<(&AltSetting, u32)> {
    let alt = intf.select_alt_setting(budget.unwrap_or_else(|| intf.max_bandwidth()))?;
    let isochronous = match alt.endpoint() {
        Some(endpoint) => endpoint.transfer_type() == TransferType::Isochronous,
        None => {
            return err(
                ErrorKind::NotFound,
                format!("interface {} has no streaming endpoint", intf.number()),
                Action::SelectingBandwidth,
            )
        }
    };
    let payload_size = if isochronous {
        alt.effective_size()
    } else {
        budget.unwrap_or(transfer_size as u32)
    };
    Ok((alt, payload_size))
}

/// Undoes a device lookup unless disarmed.
struct DeviceLease<'a> {
    shared: &'a Shared,
    device: Arc<OpenDevice>,
    armed: bool,
}

impl DeviceLease<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for DeviceLease<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.release_device(self.device.address());
        }
    }
}

/// Releases a claimed interface on the error path of `stream_open`.
struct InterfaceClaim<'a> {
    shared: &'a Shared,
    device: &'a OpenDevice,
    interface: u8,
    alt_selected: bool,
    armed: bool,
}

impl<'a> InterfaceClaim<'a> {
    fn claim(shared: &'a Shared, device: &'a OpenDevice, interface: u8) -> Result<Self> {
        if !lock(&device.claimed).insert(interface) {
            return err(
                ErrorKind::InvalidState,
                format!(
                    "interface {} of device {} is already streaming",
                    interface,
                    device.address()
                ),
                Action::ClaimingInterface,
            );
        }
        if let Err(e) = shared
            .transport
            .claim_interface(device.address(), interface)
            .during(Action::ClaimingInterface)
        {
            lock(&device.claimed).remove(&interface);
            return Err(e);
        }
        Ok(Self {
            shared,
            device,
            interface,
            alt_selected: false,
            armed: true,
        })
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for InterfaceClaim<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.shared
                .release_interface(self.device, self.interface, self.alt_selected);
        }
    }
}

impl Shared {
    fn run_worker(&self) {
        log::debug!("event worker started");
        while !self.stop.load(Ordering::Acquire) {
            if let Err(e) = self.poll(self.event_poll_interval) {
                log::error!("{}", e);
                thread::sleep(self.event_poll_interval);
            }
        }
        log::debug!("event worker stopped");
    }

    fn poll(&self, timeout: Duration) -> Result<()> {
        let events = self
            .transport
            .poll_events(timeout)
            .during(Action::PollingEvents)?;
        for event in events {
            self.dispatch(event);
        }
        Ok(())
    }

    fn dispatch(&self, event: TransportEvent) {
        match event {
            TransportEvent::TransferDone(completion) => {
                let cell = lock(&self.sessions).get(&completion.id.stream()).cloned();
                match cell {
                    Some(cell) => cell.complete(&*self.transport, completion),
                    None => log::trace!("completion for closed stream: {:?}", completion.id),
                }
            }
            TransportEvent::DeviceAttached(address) => self.device_attached(address),
            TransportEvent::DeviceGone(address) => {
                log::info!("device {} disconnected", address);
                let cells = lock(&self.sessions).values().cloned().collect::<Vec<_>>();
                for cell in cells {
                    let mut session = cell.lock();
                    if session.address() == address {
                        session.device_gone();
                    }
                }
            }
        }
    }

    fn device_attached(&self, address: u8) {
        log::debug!("device {} attached", address);
        let mut on_event = lock(&self.on_driver_event);
        let on_event = match &mut *on_event {
            Some(on_event) => on_event,
            None => return,
        };

        let raw = match self.transport.config_descriptor(address) {
            Ok(raw) => raw,
            Err(e) => {
                log::warn!("device {}: {}", address, e);
                return;
            }
        };
        if !detect::is_video_device(&raw) {
            return;
        }
        log::debug!(
            "device {}: {} video function(s)",
            address,
            detect::video_function_count(&raw)
        );
        let index = match build_index(&raw) {
            Ok(index) => index,
            Err(e) => {
                log::warn!("device {}: malformed descriptors: {}", address, e);
                return;
            }
        };

        for (uvc_stream_index, function) in index.functions().iter().enumerate() {
            let frame_count = function
                .streaming_interfaces()
                .first()
                .map_or(0, |intf| intf.formats().iter().map(|f| f.frames().len()).sum());
            on_event(DriverEvent::DeviceConnected {
                address,
                uvc_stream_index,
                frame_count,
            });
        }
    }

    fn device_index(&self, address: u8) -> Result<DeviceIndex> {
        if let Some(entry) = lock(&self.devices).get(&address) {
            return Ok(entry.device.index.clone());
        }
        let raw = self
            .transport
            .config_descriptor(address)
            .during(Action::ReadingDescriptors)?;
        build_index(&raw).during(Action::ParsingDescriptors)
    }

    /// Returns the open device at `info.address`, reading its descriptors on first use. Returns
    /// `None` for devices without a video function.
    fn acquire_device(&self, info: DeviceInfo) -> Result<Option<DeviceLease<'_>>> {
        let mut devices = lock(&self.devices);
        if let Some(entry) = devices.get_mut(&info.address) {
            entry.users += 1;
            return Ok(Some(DeviceLease {
                shared: self,
                device: entry.device.clone(),
                armed: true,
            }));
        }

        let raw = self
            .transport
            .config_descriptor(info.address)
            .during(Action::OpeningDevice)?;
        if !detect::is_video_device(&raw) {
            log::trace!("device {} is not a video device", info.address);
            return Ok(None);
        }
        let index = build_index(&raw).during(Action::ParsingDescriptors)?;
        log::debug!(
            "device {} ({:04x}:{:04x}): {} video function(s)",
            info.address,
            info.vendor_id,
            info.product_id,
            index.functions().len()
        );

        let device = Arc::new(OpenDevice {
            info,
            index,
            control: ControlPipe::new(info.address, self.control_timeout),
            claimed: Mutex::new(HashSet::new()),
        });
        devices.insert(
            info.address,
            DeviceEntry {
                device: device.clone(),
                users: 1,
            },
        );
        Ok(Some(DeviceLease {
            shared: self,
            device,
            armed: true,
        }))
    }

    fn release_device(&self, address: u8) {
        let mut devices = lock(&self.devices);
        if let Some(entry) = devices.get_mut(&address) {
            entry.users -= 1;
            if entry.users == 0 {
                devices.remove(&address);
                log::trace!("device {} released", address);
            }
        }
    }

    fn release_interface(&self, device: &OpenDevice, interface: u8, reset_alt: bool) {
        let address = device.address();
        if reset_alt {
            if let Err(e) = self.transport.set_alternate_setting(address, interface, 0) {
                log::warn!("device {}: failed to select alt setting 0: {}", address, e);
            }
        }
        if let Err(e) = self.transport.release_interface(address, interface) {
            log::warn!("device {}: failed to release interface {}: {}", address, interface, e);
        }
        lock(&device.claimed).remove(&interface);
    }

    /// Looks for an attached device matching `config` whose descriptors support the requested
    /// format, polling until `timeout` has elapsed.
    fn find_device(
        &self,
        config: &StreamConfig,
        timeout: Duration,
    ) -> Result<(DeviceLease<'_>, u8)> {
        let deadline = Instant::now() + timeout;
        loop {
            let mut last_err = None;
            let devices = self
                .transport
                .devices()
                .during(Action::EnumeratingDevices)?;
            for info in devices
                .into_iter()
                .filter(|d| config.matches(d.address, d.vendor_id, d.product_id))
            {
                let lease = match self.acquire_device(info) {
                    Ok(Some(lease)) => lease,
                    Ok(None) => continue,
                    Err(e) => {
                        log::debug!("skipping device {}: {}", info.address, e);
                        last_err = Some(e);
                        continue;
                    }
                };
                match lease
                    .device
                    .index
                    .resolve_interface(config.uvc_stream_index, &config.format)
                {
                    Ok((interface, version)) => {
                        log::debug!(
                            "device {}: using interface {} (UVC {})",
                            info.address,
                            interface,
                            version
                        );
                        return Ok((lease, interface));
                    }
                    Err(e) if e.is_not_found() => last_err = Some(e),
                    Err(e) => return Err(e),
                }
            }

            if Instant::now() >= deadline {
                return match last_err {
                    Some(e) => Err(e),
                    None => err(
                        ErrorKind::NotFound,
                        "no matching video device is attached",
                        Action::OpeningDevice,
                    ),
                };
            }
            thread::sleep(DEVICE_POLL_INTERVAL);
        }
    }

    fn open_stream(
        &self,
        lease: DeviceLease<'_>,
        interface: u8,
        config: StreamConfig,
    ) -> Result<StreamHandle> {
        let device = lease.device.clone();
        let address = device.address();
        let resolved = device.index.resolve_frame(interface, &config.format)?;
        let (alt, payload_size) =
            select_bandwidth(resolved.interface, config.max_payload_size, config.transfer_size)?;

        let mut claim = InterfaceClaim::claim(self, &device, interface)?;

        let agreed = self.negotiate(&device, &resolved, alt, payload_size, config.frame_size)?;
        if agreed.endpoint.transfer_type() == TransferType::Isochronous {
            self.transport
                .set_alternate_setting(address, interface, agreed.alt_setting)
                .during(Action::StartingStream)?;
            claim.alt_selected = true;
        }

        let pool = FramePool::new(config.frame_buffers, agreed.format.max_frame_size as usize)?;
        let handle = StreamHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));

        let session = Session {
            handle,
            device: device.clone(),
            interface,
            alt_setting: agreed.alt_setting,
            endpoint: agreed.endpoint,
            request: config.format,
            budget: config.max_payload_size,
            negotiated: agreed.negotiated,
            frame_size: config.frame_size,
            state: SessionState::Opening,
            reassembler: Reassembler::new(
                handle,
                pool,
                agreed.format,
                agreed.negotiated.max_payload_size,
            ),
            callbacks: Callbacks {
                on_frame: config.on_frame,
                on_event: config.on_event,
            },
            transfers: config.transfers,
            transfer_size: config.transfer_size,
            in_flight: 0,
        };
        let cell = Arc::new(SessionCell::new(session));
        lock(&self.sessions).insert(handle.0, cell.clone());

        // The session now owns the claim and the device reference.
        claim.disarm();
        lease.disarm();

        let submitted = {
            let mut session = cell.lock();
            let res = session.submit_all(&*self.transport);
            if res.is_ok() {
                session.state = SessionState::Streaming;
            }
            res
        };
        if let Err(e) = submitted {
            self.teardown(handle, &cell);
            return Err(e);
        }

        log::info!(
            "{} open on device {} interface {} alt {}: {} ({})",
            handle,
            address,
            interface,
            agreed.alt_setting,
            agreed.format,
            agreed.negotiated
        );
        Ok(handle)
    }

    /// Runs probe/commit for `resolved`. If the device commits to larger payloads than `alt`
    /// carries, the smallest isochronous setting that fits is used instead.
    fn negotiate<'a>(
        &self,
        device: &OpenDevice,
        resolved: &ResolvedFrame<'a>,
        alt: &'a AltSetting,
        payload_size: u32,
        frame_size: Option<usize>,
    ) -> Result<Agreement> {
        let negotiated = device
            .control()
            .negotiate(&*self.transport, resolved, payload_size)?;

        let isochronous =
            alt.endpoint().map(|ep| ep.transfer_type()) == Some(TransferType::Isochronous);
        let alt = if isochronous && negotiated.max_payload_size > alt.effective_size() {
            let fitting = resolved
                .interface
                .alt_setting_for_payload(negotiated.max_payload_size)?;
            log::warn!(
                "device {}: {} byte payloads committed, alt setting {} carries {}, using alt setting {} ({} bytes)",
                device.address(),
                negotiated.max_payload_size,
                alt.number(),
                alt.effective_size(),
                fitting.number(),
                fitting.effective_size()
            );
            fitting
        } else {
            alt
        };
        let endpoint = match alt.endpoint() {
            Some(endpoint) => *endpoint,
            None => {
                return err(
                    ErrorKind::NotFound,
                    format!("alt setting {} has no streaming endpoint", alt.number()),
                    Action::SelectingBandwidth,
                )
            }
        };

        let frame_size = frame_buffer_size(resolved, &negotiated, frame_size);
        Ok(Agreement {
            alt_setting: alt.number(),
            endpoint,
            negotiated,
            format: stream_format(resolved, &negotiated, frame_size),
        })
    }

    /// Resolves `request` on the session's interface and negotiates it.
    fn agree(&self, params: &NegotiationParams, request: &StreamFormatRequest) -> Result<Agreement> {
        let resolved = params
            .device
            .index()
            .resolve_frame(params.interface, request)?;
        let (alt, payload_size) =
            select_bandwidth(resolved.interface, params.budget, params.transfer_size)?;
        self.negotiate(
            &params.device,
            &resolved,
            alt,
            payload_size,
            params.frame_size,
        )
    }

    fn session(&self, handle: StreamHandle, action: Action) -> Result<Arc<SessionCell>> {
        match lock(&self.sessions).get(&handle.0) {
            Some(cell) => Ok(cell.clone()),
            None => err(
                ErrorKind::NotFound,
                format!("{} is not open", handle),
                action,
            ),
        }
    }

    /// Cancels the transfers of a session and waits for them to come back.
    fn cancel_and_drain(&self, cell: &SessionCell) {
        let (address, endpoint, handle) = {
            let session = cell.lock();
            (
                session.address(),
                session.endpoint.address(),
                session.handle,
            )
        };
        if let Err(e) = self.transport.cancel_transfers(address, endpoint) {
            log::warn!("{}: failed to cancel transfers: {}", handle, e);
        }

        let deadline = Instant::now() + DRAIN_TIMEOUT;
        loop {
            let now = Instant::now();
            let session = cell.lock();
            if session.in_flight == 0 {
                return;
            }
            if now >= deadline {
                log::warn!(
                    "{}: {} transfer(s) did not complete after cancellation",
                    handle,
                    session.in_flight
                );
                return;
            }

            if self.background_worker {
                drop(cell.wait(session, deadline - now));
            } else {
                drop(session);
                if let Err(e) = self.poll(self.event_poll_interval.min(deadline - now)) {
                    log::warn!("{}: {}", handle, e);
                    thread::sleep(DEVICE_POLL_INTERVAL);
                }
            }
        }
    }

    /// Stops a session and frees everything it holds. Safe to call on a failed open.
    fn teardown(&self, handle: StreamHandle, cell: &SessionCell) {
        {
            let mut session = cell.lock();
            if session.state == SessionState::Closing {
                return;
            }
            session.state = SessionState::Closing;
        }
        self.cancel_and_drain(cell);

        let (device, interface, isochronous) = {
            let session = cell.lock();
            (
                session.device.clone(),
                session.interface,
                session.is_isochronous(),
            )
        };
        self.release_interface(&device, interface, isochronous);
        lock(&self.sessions).remove(&handle.0);
        self.release_device(device.address());
    }

    fn stop_stream(&self, cell: &SessionCell) -> Result<()> {
        {
            let mut session = cell.lock();
            if session.state != SessionState::Streaming {
                return Ok(());
            }
            session.state = SessionState::Paused;
            session.reassembler.reset();
        }
        self.cancel_and_drain(cell);

        let session = cell.lock();
        let address = session.address();
        if session.is_isochronous() {
            self.transport
                .set_alternate_setting(address, session.interface, 0)
                .during(Action::StoppingStream)?;
        } else {
            self.transport
                .clear_halt(address, session.endpoint.address())
                .during(Action::StoppingStream)?;
        }
        log::info!("{} stopped", session.handle);
        Ok(())
    }

    fn start_stream(&self, cell: &SessionCell) -> Result<()> {
        let params = {
            let mut session = cell.lock();
            match session.state {
                SessionState::Streaming => return Ok(()),
                SessionState::Paused => {}
                state => {
                    return err(
                        ErrorKind::InvalidState,
                        format!("{} cannot be started while {:?}", session.handle, state),
                        Action::StartingStream,
                    )
                }
            }
            if session.in_flight != 0 {
                return err(
                    ErrorKind::InvalidState,
                    format!("{} still has transfers in flight", session.handle),
                    Action::StartingStream,
                );
            }
            session.state = SessionState::Opening;
            session.params()
        };

        let agreed = self
            .agree(&params, &params.request)
            .and_then(|agreed| {
                if params.isochronous {
                    self.transport
                        .set_alternate_setting(
                            params.device.address(),
                            params.interface,
                            agreed.alt_setting,
                        )
                        .during(Action::StartingStream)?;
                }
                Ok(agreed)
            });

        let mut session = self.relock(cell, params.handle, Action::StartingStream)?;
        let agreed = match agreed {
            Ok(agreed) => agreed,
            Err(e) => {
                session.state = SessionState::Paused;
                return Err(e);
            }
        };
        session.apply(&agreed);
        if let Err(e) = session.submit_all(&*self.transport) {
            session.state = SessionState::Paused;
            drop(session);
            self.cancel_and_drain(cell);
            return Err(e);
        }
        session.state = SessionState::Streaming;
        log::info!("{} started on alt setting {}", params.handle, session.alt_setting);
        Ok(())
    }

    fn select_format(&self, cell: &SessionCell, request: StreamFormatRequest) -> Result<()> {
        let was_streaming = cell.lock().state == SessionState::Streaming;
        if was_streaming {
            self.stop_stream(cell)?;
        }

        let (params, request) = {
            let mut session = cell.lock();
            if session.state != SessionState::Paused {
                return err(
                    ErrorKind::InvalidState,
                    format!(
                        "{} cannot change format while {:?}",
                        session.handle, session.state
                    ),
                    Action::SelectingFormat,
                );
            }
            session.state = SessionState::Opening;
            let request = request.or_current(session.reassembler.format());
            (session.params(), request)
        };

        let prepared = self.agree(&params, &request).and_then(|agreed| {
            let pool = FramePool::new(params.frame_buffers, agreed.format.max_frame_size as usize)?;
            Ok((agreed, pool))
        });

        {
            let mut session = self.relock(cell, params.handle, Action::SelectingFormat)?;
            session.state = SessionState::Paused;
            match prepared {
                Ok((agreed, pool)) => {
                    session.request = request;
                    session.apply(&agreed);
                    session.reassembler.replace(
                        pool,
                        agreed.format,
                        agreed.negotiated.max_payload_size,
                    );
                    log::info!(
                        "{} switched to {} ({})",
                        params.handle,
                        agreed.format,
                        agreed.negotiated
                    );
                }
                Err(e) => {
                    drop(session);
                    if was_streaming {
                        if let Err(restart) = self.start_stream(cell) {
                            log::warn!(
                                "{}: failed to restart with the previous format: {}",
                                params.handle,
                                restart
                            );
                        }
                    }
                    return Err(e);
                }
            }
        }

        if was_streaming {
            self.start_stream(cell)?;
        }
        Ok(())
    }

    /// Locks a session again after negotiating without the lock. Fails if it was closed or lost
    /// its device in the meantime.
    fn relock<'a>(
        &self,
        cell: &'a SessionCell,
        handle: StreamHandle,
        action: Action,
    ) -> Result<MutexGuard<'a, Session>> {
        let session = cell.lock();
        if session.state != SessionState::Opening {
            return err(
                ErrorKind::InvalidState,
                format!("{} was closed or disconnected meanwhile", handle),
                action,
            );
        }
        Ok(session)
    }
}
