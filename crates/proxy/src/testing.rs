//! In-memory fakes for the host stack and the virtual port

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::Read;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::time::Duration;

use gadget::{
    Direction, EndpointCaps, GadgetError, GadgetEvent, GadgetRequest, IsoSync, IsoUsage,
    RequestId, RequestSink, Speed, TransferKind, UrbStatus, VirtualPort,
};

use crate::usb::descriptors::DeviceDescriptor;
use crate::usb::host::{HostIsoPacket, SubmitError, WaitFd};
use crate::usb::{
    ConfigDescriptor, DeviceDescriptors, EndpointDescriptor, HostCompletion, HostDevice,
    HostStack, HostStatus, HostTransfer, HostTransferKind, HotplugEvent, InterfaceDescriptor,
    PortAddress, TransferToken,
};

/// Observable state behind a [`FakeDevice`]
pub struct FakeState {
    pub address: PortAddress,
    pub speed: rusb::Speed,
    pub descriptors: rusb::Result<DeviceDescriptors>,
    pub strings: HashMap<(u8, u16), rusb::Result<Vec<u8>>>,
    pub string_reads: Vec<(u8, u16)>,
    pub active_interfaces: Vec<u8>,
    /// Every synchronous call, formatted as "name args"
    pub calls: Vec<String>,
    pub failures: HashMap<String, rusb::Error>,
    pub pending: BTreeMap<TransferToken, HostTransfer>,
    pub cancelled: Vec<TransferToken>,
    pub completions: VecDeque<HostCompletion>,
    pub submit_error: Option<rusb::Error>,
    pub open: bool,
}

impl FakeState {
    pub fn set_string(&mut self, index: u8, language: u16, reply: rusb::Result<Vec<u8>>) {
        self.strings.insert((index, language), reply);
    }

    pub fn fail(&mut self, call: &str, error: rusb::Error) {
        self.failures.insert(call.to_string(), error);
    }

    pub fn submitted_endpoints(&self) -> Vec<u8> {
        self.pending.values().map(|t| t.endpoint).collect()
    }

    /// Finish a pending transfer; `data` is what the device sent back
    pub fn complete(&mut self, token: TransferToken, status: HostStatus, data: &[u8]) {
        let Some(mut transfer) = self.pending.remove(&token) else {
            panic!("transfer {:?} is not pending", token);
        };
        let start = if transfer.kind == HostTransferKind::Control {
            8
        } else {
            0
        };
        if transfer.buffer.len() < start + data.len() {
            transfer.buffer.resize(start + data.len(), 0);
        }
        transfer.buffer[start..start + data.len()].copy_from_slice(data);
        self.completions.push_back(HostCompletion {
            token,
            status,
            actual_length: data.len() as u32,
            buffer: transfer.buffer,
            iso_packets: Vec::new(),
        });
    }

    pub fn complete_iso(&mut self, token: TransferToken, packets: Vec<(HostStatus, u32)>) {
        let Some(transfer) = self.pending.remove(&token) else {
            panic!("transfer {:?} is not pending", token);
        };
        self.completions.push_back(HostCompletion {
            token,
            status: HostStatus::Completed,
            actual_length: 0,
            buffer: transfer.buffer,
            iso_packets: packets
                .into_iter()
                .map(|(status, actual_length)| HostIsoPacket {
                    status,
                    actual_length,
                })
                .collect(),
        });
    }

    /// Complete every pending transfer as cancelled
    pub fn cancel_all_pending(&mut self) {
        let tokens: Vec<TransferToken> = self.pending.keys().copied().collect();
        for token in tokens {
            self.complete(token, HostStatus::Cancelled, &[]);
        }
    }

    fn call(&mut self, call: String) -> rusb::Result<()> {
        let result = match self.failures.get(&call) {
            Some(error) => Err(*error),
            None => Ok(()),
        };
        self.calls.push(call);
        result
    }
}

pub struct FakeDevice {
    pub state: Rc<RefCell<FakeState>>,
}

impl FakeDevice {
    pub fn new() -> Self {
        Self::at(PortAddress { bus: 1, port: 1 })
    }

    pub fn at(address: PortAddress) -> Self {
        Self {
            state: Rc::new(RefCell::new(FakeState {
                address,
                speed: rusb::Speed::High,
                descriptors: Ok(sample_descriptors()),
                strings: HashMap::new(),
                string_reads: Vec::new(),
                active_interfaces: vec![0, 1],
                calls: Vec::new(),
                failures: HashMap::new(),
                pending: BTreeMap::new(),
                cancelled: Vec::new(),
                completions: VecDeque::new(),
                submit_error: None,
                open: true,
            })),
        }
    }
}

impl Drop for FakeDevice {
    fn drop(&mut self) {
        self.state.borrow_mut().open = false;
    }
}

impl HostDevice for FakeDevice {
    fn port_address(&self) -> PortAddress {
        self.state.borrow().address
    }

    fn speed(&self) -> rusb::Speed {
        self.state.borrow().speed
    }

    fn descriptors(&self) -> rusb::Result<DeviceDescriptors> {
        self.state.borrow().descriptors.clone()
    }

    fn read_string_descriptor(&mut self, index: u8, language: u16) -> rusb::Result<Vec<u8>> {
        let mut state = self.state.borrow_mut();
        state.string_reads.push((index, language));
        state
            .strings
            .get(&(index, language))
            .cloned()
            .unwrap_or(Err(rusb::Error::Pipe))
    }

    fn active_interfaces(&self) -> rusb::Result<Vec<u8>> {
        Ok(self.state.borrow().active_interfaces.clone())
    }

    fn detach_kernel_driver(&mut self, interface: u8) -> rusb::Result<()> {
        self.state
            .borrow_mut()
            .call(format!("detach_kernel_driver {}", interface))
    }

    fn claim_interface(&mut self, interface: u8) -> rusb::Result<()> {
        self.state
            .borrow_mut()
            .call(format!("claim_interface {}", interface))
    }

    fn release_interface(&mut self, interface: u8) -> rusb::Result<()> {
        self.state
            .borrow_mut()
            .call(format!("release_interface {}", interface))
    }

    fn set_configuration(&mut self, value: Option<u8>) -> rusb::Result<()> {
        self.state
            .borrow_mut()
            .call(format!("set_configuration {:?}", value))
    }

    fn set_alternate_setting(&mut self, interface: u8, alt_setting: u8) -> rusb::Result<()> {
        self.state
            .borrow_mut()
            .call(format!("set_alternate_setting {} {}", interface, alt_setting))
    }

    fn clear_halt(&mut self, endpoint: u8) -> rusb::Result<()> {
        self.state
            .borrow_mut()
            .call(format!("clear_halt {:#04x}", endpoint))
    }

    fn reset(&mut self) -> rusb::Result<()> {
        self.state.borrow_mut().call("reset".to_string())
    }

    fn submit(&mut self, transfer: HostTransfer) -> Result<(), SubmitError> {
        let mut state = self.state.borrow_mut();
        if let Some(error) = state.submit_error {
            return Err(SubmitError { error, transfer });
        }
        state.pending.insert(transfer.token, transfer);
        Ok(())
    }

    fn cancel(&mut self, token: TransferToken) -> rusb::Result<()> {
        self.state.borrow_mut().cancelled.push(token);
        Ok(())
    }

    fn drain_completions(&mut self) -> Vec<HostCompletion> {
        self.state.borrow_mut().completions.drain(..).collect()
    }

    fn in_flight(&self) -> usize {
        let state = self.state.borrow();
        state.pending.len() + state.completions.len()
    }
}

/// Host stack whose hot-plug queue is filled by the test
#[derive(Default)]
pub struct FakeStack {
    pub hotplug: VecDeque<HotplugEvent<FakeDevice>>,
    pub open_error: Option<rusb::Error>,
    pub timeout: Option<Duration>,
    pub event_passes: Cell<usize>,
    /// Devices handed out by `open`, for completing their transfers
    pub opened: RefCell<Vec<Rc<RefCell<FakeState>>>>,
}

impl FakeStack {
    pub fn arrive(&mut self, device: FakeDevice) -> Rc<RefCell<FakeState>> {
        let state = device.state.clone();
        self.hotplug.push_back(HotplugEvent::Arrived(device));
        state
    }

    pub fn leave(&mut self, address: PortAddress) {
        self.hotplug.push_back(HotplugEvent::Left(address));
    }
}

impl HostStack for FakeStack {
    type Device = FakeDevice;
    type Candidate = FakeDevice;

    fn candidate_address(&self, candidate: &FakeDevice) -> PortAddress {
        candidate.port_address()
    }

    fn open(&self, candidate: FakeDevice) -> rusb::Result<FakeDevice> {
        if let Some(error) = self.open_error {
            return Err(error);
        }
        self.opened.borrow_mut().push(candidate.state.clone());
        Ok(candidate)
    }

    fn wait_fds(&self) -> rusb::Result<Vec<WaitFd>> {
        Ok(Vec::new())
    }

    fn next_timeout(&self) -> rusb::Result<Option<Duration>> {
        Ok(self.timeout)
    }

    fn handle_events(&self) -> rusb::Result<()> {
        self.event_passes.set(self.event_passes.get() + 1);
        Ok(())
    }

    fn has_pending_hotplug(&self) -> bool {
        !self.hotplug.is_empty()
    }

    fn drain_hotplug(&mut self) -> Vec<HotplugEvent<FakeDevice>> {
        self.hotplug.drain(..).collect()
    }
}

/// What a sink saw of one finished request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedRequest {
    pub id: RequestId,
    pub status: UrbStatus,
    pub actual_length: u32,
    pub data: Vec<u8>,
    pub iso: Vec<(UrbStatus, u32)>,
}

impl CompletedRequest {
    fn from_request(request: &GadgetRequest) -> Self {
        Self {
            id: request.id,
            status: request.status,
            actual_length: request.actual_length,
            data: request.buffer.clone(),
            iso: request
                .iso_packets
                .iter()
                .map(|p| (p.status, p.actual_length))
                .collect(),
        }
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub completed: Vec<CompletedRequest>,
    pub destroyed: Vec<RequestId>,
}

impl RequestSink for RecordingSink {
    fn complete(&mut self, request: &GadgetRequest) {
        self.completed.push(CompletedRequest::from_request(request));
    }

    fn destroy(&mut self, request: GadgetRequest) {
        self.destroyed.push(request.id);
    }
}

/// Observable state behind a [`FakePort`]
#[derive(Default)]
pub struct PortState {
    pub attached: Option<Speed>,
    pub attach_error: bool,
    pub calls: Vec<String>,
    pub events: VecDeque<Result<GadgetEvent, String>>,
    pub completed: Vec<CompletedRequest>,
    pub destroyed: Vec<RequestId>,
}

/// Virtual port backed by a socket pair; the test writes to `peer` to make
/// the port's wait descriptor readable
pub struct FakePort {
    pub state: Rc<RefCell<PortState>>,
    bus: Option<u8>,
    socket: UnixStream,
    pub peer: UnixStream,
}

impl FakePort {
    pub fn new(bus: Option<u8>) -> Self {
        let (socket, peer) = UnixStream::pair().expect("socket pair");
        socket.set_nonblocking(true).expect("nonblocking");
        Self {
            state: Rc::new(RefCell::new(PortState::default())),
            bus,
            socket,
            peer,
        }
    }
}

impl RequestSink for FakePort {
    fn complete(&mut self, request: &GadgetRequest) {
        self.state
            .borrow_mut()
            .completed
            .push(CompletedRequest::from_request(request));
    }

    fn destroy(&mut self, request: GadgetRequest) {
        self.state.borrow_mut().destroyed.push(request.id);
    }
}

impl VirtualPort for FakePort {
    fn bus_number(&self) -> Option<u8> {
        self.bus
    }

    fn attach(&mut self, speed: Speed) -> gadget::Result<()> {
        let mut state = self.state.borrow_mut();
        state.calls.push(format!("attach {}", speed));
        if state.attach_error {
            return Err(GadgetError::Protocol("attach refused".to_string()));
        }
        state.attached = Some(speed);
        Ok(())
    }

    fn detach(&mut self) -> gadget::Result<()> {
        let mut state = self.state.borrow_mut();
        state.calls.push("detach".to_string());
        state.attached = None;
        Ok(())
    }

    fn wait_fd(&self) -> Option<RawFd> {
        self.state
            .borrow()
            .attached
            .map(|_| self.socket.as_raw_fd())
    }

    fn fetch_event(&mut self) -> gadget::Result<Option<GadgetEvent>> {
        let mut byte = [0u8; 1];
        let _ = (&self.socket).read(&mut byte);
        match self.state.borrow_mut().events.pop_front() {
            Some(Ok(event)) => Ok(Some(event)),
            Some(Err(message)) => Err(GadgetError::Protocol(message)),
            None => Ok(None),
        }
    }
}

pub fn bulk_caps(address: u8, direction: Direction) -> EndpointCaps {
    EndpointCaps {
        address,
        direction,
        kind: TransferKind::Bulk,
        sync: IsoSync::None,
        usage: IsoUsage::Data,
        max_packet_size: 512,
        interval: 0,
        descriptors: None,
    }
}

pub fn data_request(id: u32, endpoint: u8, direction_in: bool, length: usize) -> GadgetRequest {
    GadgetRequest {
        id: RequestId(id),
        endpoint,
        direction_in,
        setup: [0; 8],
        transfer_length: length as u32,
        buffer: if direction_in {
            vec![0; length]
        } else {
            vec![0x5a; length]
        },
        iso_packets: Vec::new(),
        status: UrbStatus::Completed,
        actual_length: 0,
    }
}

pub fn control_request(id: u32, setup: [u8; 8], length: usize) -> GadgetRequest {
    GadgetRequest {
        id: RequestId(id),
        endpoint: 0,
        direction_in: setup[0] & 0x80 != 0,
        setup,
        transfer_length: length as u32,
        buffer: vec![0; length],
        iso_packets: Vec::new(),
        status: UrbStatus::Completed,
        actual_length: 0,
    }
}

/// Raw string descriptor for `text`
pub fn string_descriptor(text: &str) -> Vec<u8> {
    let units: Vec<u16> = text.encode_utf16().collect();
    let mut bytes = vec![(2 + units.len() * 2) as u8, 0x03];
    for unit in units {
        bytes.extend_from_slice(&unit.to_le_bytes());
    }
    bytes
}

fn endpoint(address: u8, attributes: u8) -> EndpointDescriptor {
    EndpointDescriptor {
        address,
        attributes,
        max_packet_size: 512,
        interval: 0,
        extra: Vec::new(),
    }
}

fn interface(number: u8, alt_setting: u8, endpoints: Vec<EndpointDescriptor>) -> InterfaceDescriptor {
    InterfaceDescriptor {
        number,
        alt_setting,
        class: 0xff,
        subclass: 0,
        protocol: 0,
        description: 0,
        extra: Vec::new(),
        endpoints,
    }
}

/// One configuration: interface 0 with bulk 0x81/0x02, interface 1 with an
/// empty alt 0 and an isochronous 0x83 in alt 1
pub fn sample_descriptors() -> DeviceDescriptors {
    DeviceDescriptors {
        device: DeviceDescriptor {
            bcd_usb: 0x0200,
            bcd_device: 0x0100,
            class: 0,
            subclass: 0,
            protocol: 0,
            max_packet_size0: 64,
            vendor_id: 0x1234,
            product_id: 0x5678,
            manufacturer: 1,
            product: 2,
            serial_number: 0,
        },
        configs: vec![ConfigDescriptor {
            number: 1,
            attributes: 0x80,
            max_power: 50,
            description: 0,
            extra: Vec::new(),
            interfaces: vec![
                interface(0, 0, vec![endpoint(0x81, 0x02), endpoint(0x02, 0x02)]),
                interface(1, 0, vec![]),
                interface(1, 1, vec![endpoint(0x83, 0x05)]),
            ],
        }],
    }
}
