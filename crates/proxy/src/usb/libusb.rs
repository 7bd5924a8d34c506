//! libusb-backed host stack
//!
//! Synchronous requests go through `rusb`. Asynchronous transfers use the raw
//! libusb transfer API: the completion callback only queues the transfer's
//! token, and the transfer is read back and freed when the event loop drains
//! that queue after its non-blocking event pass. Hot-plug notifications take
//! the same route through a second queue.

use std::collections::HashMap;
use std::os::raw::{c_int, c_void};
use std::ptr::{self, NonNull};
use std::time::Duration;

use async_channel::{Receiver, Sender};
use rusb::constants::*;
use rusb::ffi::{
    libusb_alloc_transfer, libusb_cancel_transfer, libusb_free_pollfds, libusb_free_transfer,
    libusb_get_pollfds, libusb_iso_packet_descriptor, libusb_submit_transfer, libusb_transfer,
};
use rusb::{Context, Device, DeviceHandle, Hotplug, HotplugBuilder, Registration, UsbContext};
use tracing::{debug, info, warn};

use super::descriptors::DeviceDescriptors;
use super::host::{
    HostCompletion, HostDevice, HostIsoPacket, HostStack, HostStatus, HostTransfer,
    HostTransferKind, HotplugEvent, PortAddress, SubmitError, TransferToken, WaitFd,
};
use crate::error::{ProxyError, Result};

const STRING_TIMEOUT: Duration = Duration::from_secs(1);
const GET_DESCRIPTOR: u8 = 0x06;
const STRING_DESCRIPTOR: u16 = 0x03;

fn port_address<T: UsbContext>(device: &Device<T>) -> PortAddress {
    PortAddress {
        bus: device.bus_number(),
        port: device.port_number(),
    }
}

/// Forwards libusb hot-plug callbacks to the event loop
struct HotplugForwarder {
    events: Sender<HotplugEvent<Device<Context>>>,
}

impl Hotplug<Context> for HotplugForwarder {
    fn device_arrived(&mut self, device: Device<Context>) {
        debug!(
            "Hot-plug callback: device arrived (bus={}, port={})",
            device.bus_number(),
            device.port_number()
        );
        if self.events.try_send(HotplugEvent::Arrived(device)).is_err() {
            warn!("Hot-plug queue closed, arrival dropped");
        }
    }

    fn device_left(&mut self, device: Device<Context>) {
        debug!(
            "Hot-plug callback: device left (bus={}, port={})",
            device.bus_number(),
            device.port_number()
        );
        if self
            .events
            .try_send(HotplugEvent::Left(port_address(&device)))
            .is_err()
        {
            warn!("Hot-plug queue closed, departure dropped");
        }
    }
}

/// libusb context with a hot-plug registration for one vendor/product pair
pub struct LibusbStack {
    context: Context,
    hotplug: Receiver<HotplugEvent<Device<Context>>>,
    _registration: Registration<Context>,
}

impl LibusbStack {
    /// Create the context and register for hot-plug, enumerating devices
    /// that are already present
    pub fn new(vendor_id: u16, product_id: u16) -> Result<Self> {
        if !rusb::has_hotplug() {
            return Err(ProxyError::Usb(rusb::Error::NotSupported));
        }

        let context = Context::new()?;
        let (sender, hotplug) = async_channel::unbounded();
        let callback: Box<dyn Hotplug<Context>> = Box::new(HotplugForwarder { events: sender });
        let registration = HotplugBuilder::new()
            .vendor_id(vendor_id)
            .product_id(product_id)
            .enumerate(true)
            .register(&context, callback)?;
        debug!("Hot-plug callbacks registered");

        Ok(Self {
            context,
            hotplug,
            _registration: registration,
        })
    }
}

impl HostStack for LibusbStack {
    type Device = LibusbDevice;
    type Candidate = Device<Context>;

    fn candidate_address(&self, candidate: &Device<Context>) -> PortAddress {
        port_address(candidate)
    }

    fn open(&self, candidate: Device<Context>) -> rusb::Result<LibusbDevice> {
        let handle = candidate.open()?;
        Ok(LibusbDevice::new(
            handle,
            port_address(&candidate),
            candidate.speed(),
        ))
    }

    fn wait_fds(&self) -> rusb::Result<Vec<WaitFd>> {
        // SAFETY: the context outlives this call; the list is walked up to
        // its terminating null entry and released with libusb_free_pollfds.
        unsafe {
            let list = libusb_get_pollfds(self.context.as_raw());
            if list.is_null() {
                return Err(rusb::Error::Other);
            }
            let mut fds = Vec::new();
            let mut cursor = list;
            while !(*cursor).is_null() {
                let pollfd = &**cursor;
                fds.push(WaitFd {
                    fd: pollfd.fd,
                    readable: pollfd.events & nix::libc::POLLIN != 0,
                    writable: pollfd.events & nix::libc::POLLOUT != 0,
                });
                cursor = cursor.add(1);
            }
            libusb_free_pollfds(list);
            Ok(fds)
        }
    }

    fn next_timeout(&self) -> rusb::Result<Option<Duration>> {
        self.context.next_timeout()
    }

    fn handle_events(&self) -> rusb::Result<()> {
        self.context.handle_events(Some(Duration::ZERO))
    }

    fn has_pending_hotplug(&self) -> bool {
        !self.hotplug.is_empty()
    }

    fn drain_hotplug(&mut self) -> Vec<HotplugEvent<Device<Context>>> {
        let mut events = Vec::new();
        while let Ok(event) = self.hotplug.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Owned by the libusb transfer through `user_data`
struct CallbackData {
    token: TransferToken,
    done: Sender<TransferToken>,
}

extern "system" fn transfer_done(transfer: *mut libusb_transfer) {
    // SAFETY: user_data points at the CallbackData boxed next to this
    // transfer, which lives until the transfer is drained or leaked.
    let data = unsafe { &*((*transfer).user_data as *const CallbackData) };
    let _ = data.done.try_send(data.token);
}

/// A submitted transfer and the memory libusb writes into
struct InFlight {
    transfer: NonNull<libusb_transfer>,
    buffer: Vec<u8>,
    iso_packets: usize,
    callback: Box<CallbackData>,
}

/// # Safety
/// `transfer` must point at a live transfer allocated by libusb.
unsafe fn iso_descriptors(transfer: *mut libusb_transfer) -> *mut libusb_iso_packet_descriptor {
    // SAFETY: only computes the address of the trailing descriptor array.
    unsafe { ptr::addr_of_mut!((*transfer).iso_packet_desc) as *mut libusb_iso_packet_descriptor }
}

impl InFlight {
    /// Read the results and free the libusb transfer. Only called once the
    /// completion callback has fired.
    fn finish(self) -> HostCompletion {
        let raw = self.transfer.as_ptr();
        // SAFETY: the callback has run, so libusb no longer touches the
        // transfer; it was allocated with `iso_packets` descriptors.
        unsafe {
            let descriptors = iso_descriptors(raw);
            let iso_packets = (0..self.iso_packets)
                .map(|i| {
                    let desc = &*descriptors.add(i);
                    HostIsoPacket {
                        status: host_status(desc.status),
                        actual_length: desc.actual_length,
                    }
                })
                .collect();
            let completion = HostCompletion {
                token: self.callback.token,
                status: host_status((*raw).status),
                actual_length: (*raw).actual_length.max(0) as u32,
                buffer: self.buffer,
                iso_packets,
            };
            libusb_free_transfer(raw);
            completion
        }
    }
}

/// One opened device and its in-flight asynchronous transfers
pub struct LibusbDevice {
    handle: DeviceHandle<Context>,
    address: PortAddress,
    speed: rusb::Speed,
    in_flight: HashMap<TransferToken, InFlight>,
    done_sender: Sender<TransferToken>,
    done: Receiver<TransferToken>,
}

impl LibusbDevice {
    fn new(handle: DeviceHandle<Context>, address: PortAddress, speed: rusb::Speed) -> Self {
        let (done_sender, done) = async_channel::unbounded();
        Self {
            handle,
            address,
            speed,
            in_flight: HashMap::new(),
            done_sender,
            done,
        }
    }
}

impl HostDevice for LibusbDevice {
    fn port_address(&self) -> PortAddress {
        self.address
    }

    fn speed(&self) -> rusb::Speed {
        self.speed
    }

    fn descriptors(&self) -> rusb::Result<DeviceDescriptors> {
        DeviceDescriptors::read(&self.handle.device())
    }

    fn read_string_descriptor(&mut self, index: u8, language: u16) -> rusb::Result<Vec<u8>> {
        let mut buf = [0u8; 255];
        let request_type = rusb::request_type(
            rusb::Direction::In,
            rusb::RequestType::Standard,
            rusb::Recipient::Device,
        );
        let len = self.handle.read_control(
            request_type,
            GET_DESCRIPTOR,
            (STRING_DESCRIPTOR << 8) | u16::from(index),
            language,
            &mut buf,
            STRING_TIMEOUT,
        )?;
        Ok(buf[..len].to_vec())
    }

    fn active_interfaces(&self) -> rusb::Result<Vec<u8>> {
        match self.handle.device().active_config_descriptor() {
            Ok(config) => Ok(config.interfaces().map(|i| i.number()).collect()),
            // Unconfigured
            Err(rusb::Error::NotFound) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    fn detach_kernel_driver(&mut self, interface: u8) -> rusb::Result<()> {
        self.handle.detach_kernel_driver(interface)
    }

    fn claim_interface(&mut self, interface: u8) -> rusb::Result<()> {
        self.handle.claim_interface(interface)
    }

    fn release_interface(&mut self, interface: u8) -> rusb::Result<()> {
        self.handle.release_interface(interface)
    }

    fn set_configuration(&mut self, value: Option<u8>) -> rusb::Result<()> {
        match value {
            Some(value) => self.handle.set_active_configuration(value),
            None => self.handle.unconfigure(),
        }
    }

    fn set_alternate_setting(&mut self, interface: u8, alt_setting: u8) -> rusb::Result<()> {
        self.handle.set_alternate_setting(interface, alt_setting)
    }

    fn clear_halt(&mut self, endpoint: u8) -> rusb::Result<()> {
        self.handle.clear_halt(endpoint)
    }

    fn reset(&mut self) -> rusb::Result<()> {
        self.handle.reset()
    }

    fn submit(&mut self, transfer: HostTransfer) -> std::result::Result<(), SubmitError> {
        let HostTransfer {
            token,
            endpoint,
            kind,
            mut buffer,
        } = transfer;

        let (transfer_type, packet_lengths): (u8, &[u32]) = match &kind {
            HostTransferKind::Control => (LIBUSB_TRANSFER_TYPE_CONTROL, &[]),
            HostTransferKind::Isochronous { packet_lengths } => {
                (LIBUSB_TRANSFER_TYPE_ISOCHRONOUS, packet_lengths)
            }
            HostTransferKind::Bulk => (LIBUSB_TRANSFER_TYPE_BULK, &[]),
            HostTransferKind::Interrupt => (LIBUSB_TRANSFER_TYPE_INTERRUPT, &[]),
        };
        let iso_packets = packet_lengths.len();

        // SAFETY: plain allocation; null is handled below.
        let raw = unsafe { libusb_alloc_transfer(iso_packets as c_int) };
        let Some(raw) = NonNull::new(raw) else {
            return Err(SubmitError {
                error: rusb::Error::NoMem,
                transfer: HostTransfer {
                    token,
                    endpoint,
                    kind,
                    buffer,
                },
            });
        };

        let callback = Box::new(CallbackData {
            token,
            done: self.done_sender.clone(),
        });

        // SAFETY: `raw` was just allocated with `iso_packets` descriptors.
        // The buffer and callback data are heap allocations kept in the
        // in-flight map until the transfer is drained, so the pointers stay
        // valid while libusb holds them.
        let rc = unsafe {
            let t = raw.as_ptr();
            (*t).dev_handle = self.handle.as_raw();
            (*t).flags = 0;
            (*t).endpoint = endpoint;
            (*t).transfer_type = transfer_type;
            (*t).timeout = 0;
            (*t).length = buffer.len() as c_int;
            (*t).callback = transfer_done;
            (*t).user_data = &*callback as *const CallbackData as *mut c_void;
            (*t).buffer = buffer.as_mut_ptr();
            (*t).num_iso_packets = iso_packets as c_int;
            let descriptors = iso_descriptors(t);
            for (i, &length) in packet_lengths.iter().enumerate() {
                let desc = &mut *descriptors.add(i);
                desc.length = length;
                desc.actual_length = 0;
                desc.status = 0;
            }
            libusb_submit_transfer(t)
        };

        if rc != 0 {
            // SAFETY: libusb rejected the transfer and holds no reference.
            unsafe { libusb_free_transfer(raw.as_ptr()) };
            return Err(SubmitError {
                error: error_from_code(rc),
                transfer: HostTransfer {
                    token,
                    endpoint,
                    kind,
                    buffer,
                },
            });
        }

        self.in_flight.insert(
            token,
            InFlight {
                transfer: raw,
                buffer,
                iso_packets,
                callback,
            },
        );
        Ok(())
    }

    fn cancel(&mut self, token: TransferToken) -> rusb::Result<()> {
        let Some(entry) = self.in_flight.get(&token) else {
            return Err(rusb::Error::NotFound);
        };
        // SAFETY: the transfer is in flight and not yet freed.
        match unsafe { libusb_cancel_transfer(entry.transfer.as_ptr()) } {
            0 => Ok(()),
            // Already completed; its callback is queued
            LIBUSB_ERROR_NOT_FOUND => Ok(()),
            rc => Err(error_from_code(rc)),
        }
    }

    fn drain_completions(&mut self) -> Vec<HostCompletion> {
        let mut completions = Vec::new();
        while let Ok(token) = self.done.try_recv() {
            match self.in_flight.remove(&token) {
                Some(entry) => completions.push(entry.finish()),
                None => warn!("Completion for unknown transfer {:?}", token),
            }
        }
        completions
    }

    fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

impl Drop for LibusbDevice {
    fn drop(&mut self) {
        if self.in_flight.is_empty() {
            info!("Closing device at {}", self.address);
            return;
        }
        // libusb may still write into these; leaking is the only safe option
        warn!(
            "Closing device at {} with {} transfers in flight",
            self.address,
            self.in_flight.len()
        );
        for (_, entry) in self.in_flight.drain() {
            std::mem::forget(entry.buffer);
            Box::leak(entry.callback);
        }
    }
}

/// Map a libusb transfer status code
pub fn host_status(code: c_int) -> HostStatus {
    match code {
        LIBUSB_TRANSFER_COMPLETED => HostStatus::Completed,
        LIBUSB_TRANSFER_ERROR => HostStatus::Error,
        LIBUSB_TRANSFER_TIMED_OUT => HostStatus::TimedOut,
        LIBUSB_TRANSFER_CANCELLED => HostStatus::Cancelled,
        LIBUSB_TRANSFER_STALL => HostStatus::Stall,
        LIBUSB_TRANSFER_NO_DEVICE => HostStatus::NoDevice,
        LIBUSB_TRANSFER_OVERFLOW => HostStatus::Overflow,
        other => HostStatus::Unknown(other),
    }
}

/// Map a libusb error code
pub fn error_from_code(code: c_int) -> rusb::Error {
    match code {
        LIBUSB_ERROR_IO => rusb::Error::Io,
        LIBUSB_ERROR_INVALID_PARAM => rusb::Error::InvalidParam,
        LIBUSB_ERROR_ACCESS => rusb::Error::Access,
        LIBUSB_ERROR_NO_DEVICE => rusb::Error::NoDevice,
        LIBUSB_ERROR_NOT_FOUND => rusb::Error::NotFound,
        LIBUSB_ERROR_BUSY => rusb::Error::Busy,
        LIBUSB_ERROR_TIMEOUT => rusb::Error::Timeout,
        LIBUSB_ERROR_OVERFLOW => rusb::Error::Overflow,
        LIBUSB_ERROR_PIPE => rusb::Error::Pipe,
        LIBUSB_ERROR_INTERRUPTED => rusb::Error::Interrupted,
        LIBUSB_ERROR_NO_MEM => rusb::Error::NoMem,
        LIBUSB_ERROR_NOT_SUPPORTED => rusb::Error::NotSupported,
        _ => rusb::Error::Other,
    }
}
