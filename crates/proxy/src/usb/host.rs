//! Host USB stack boundary
//!
//! The proxy talks to real hardware only through [`HostStack`] and
//! [`HostDevice`]. Production code backs them with libusb; tests use the
//! in-memory fakes in `crate::testing`.

use std::fmt;
use std::os::fd::RawFd;
use std::time::Duration;

use super::descriptors::DeviceDescriptors;

/// Handle tying a submitted transfer to its completion. Tokens increase
/// monotonically per device and are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferToken(pub u64);

/// Physical location of a device: bus number and root/hub port number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortAddress {
    pub bus: u8,
    pub port: u8,
}

impl fmt::Display for PortAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.bus, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostTransferKind {
    /// Buffer starts with the 8-byte setup packet
    Control,
    Isochronous { packet_lengths: Vec<u32> },
    Bulk,
    Interrupt,
}

#[derive(Debug)]
pub struct HostTransfer {
    pub token: TransferToken,
    /// Endpoint address including the direction bit
    pub endpoint: u8,
    pub kind: HostTransferKind,
    pub buffer: Vec<u8>,
}

/// Transfer status as reported by the host stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostStatus {
    Completed,
    Error,
    TimedOut,
    Cancelled,
    Stall,
    NoDevice,
    Overflow,
    Unknown(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostIsoPacket {
    pub status: HostStatus,
    pub actual_length: u32,
}

#[derive(Debug)]
pub struct HostCompletion {
    pub token: TransferToken,
    pub status: HostStatus,
    /// Bytes moved, excluding the setup packet for control transfers
    pub actual_length: u32,
    pub buffer: Vec<u8>,
    pub iso_packets: Vec<HostIsoPacket>,
}

/// A transfer the host stack refused, handed back so its buffer survives
#[derive(Debug)]
pub struct SubmitError {
    pub error: rusb::Error,
    pub transfer: HostTransfer,
}

/// One opened real device
pub trait HostDevice {
    fn port_address(&self) -> PortAddress;

    fn speed(&self) -> rusb::Speed;

    /// Device descriptor plus every configuration, fully read
    fn descriptors(&self) -> rusb::Result<DeviceDescriptors>;

    /// Raw GET_DESCRIPTOR(STRING) response, header included
    fn read_string_descriptor(&mut self, index: u8, language: u16) -> rusb::Result<Vec<u8>>;

    /// Interface numbers of the currently selected configuration
    fn active_interfaces(&self) -> rusb::Result<Vec<u8>>;

    fn detach_kernel_driver(&mut self, interface: u8) -> rusb::Result<()>;

    fn claim_interface(&mut self, interface: u8) -> rusb::Result<()>;

    fn release_interface(&mut self, interface: u8) -> rusb::Result<()>;

    /// Select a configuration, or none
    fn set_configuration(&mut self, value: Option<u8>) -> rusb::Result<()>;

    fn set_alternate_setting(&mut self, interface: u8, alt_setting: u8) -> rusb::Result<()>;

    fn clear_halt(&mut self, endpoint: u8) -> rusb::Result<()>;

    fn reset(&mut self) -> rusb::Result<()>;

    /// Start an asynchronous transfer
    fn submit(&mut self, transfer: HostTransfer) -> Result<(), SubmitError>;

    /// Ask for a transfer to be cancelled; its completion still arrives
    fn cancel(&mut self, token: TransferToken) -> rusb::Result<()>;

    /// Completions delivered since the last call, in delivery order
    fn drain_completions(&mut self) -> Vec<HostCompletion>;

    /// Transfers submitted but not yet drained
    fn in_flight(&self) -> usize;
}

/// Hot-plug notification
#[derive(Debug)]
pub enum HotplugEvent<T> {
    Arrived(T),
    Left(PortAddress),
}

/// Descriptor the event loop must watch on behalf of the host stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitFd {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
}

/// The host stack context
pub trait HostStack {
    type Device: HostDevice;
    /// A device announced by hot-plug but not opened yet
    type Candidate;

    fn candidate_address(&self, candidate: &Self::Candidate) -> PortAddress;

    fn open(&self, candidate: Self::Candidate) -> rusb::Result<Self::Device>;

    fn wait_fds(&self) -> rusb::Result<Vec<WaitFd>>;

    /// Deadline of the stack's next internal timer, if one is armed
    fn next_timeout(&self) -> rusb::Result<Option<Duration>>;

    /// Process pending events without blocking
    fn handle_events(&self) -> rusb::Result<()>;

    fn has_pending_hotplug(&self) -> bool;

    fn drain_hotplug(&mut self) -> Vec<HotplugEvent<Self::Candidate>>;
}
