//! Device lifecycle manager
//!
//! A fixed arena of slots, one per virtual port. Each slot walks
//! Empty → Opened → Bridged → Attached and back to Empty. Devices torn down
//! with transfers still in flight are retired rather than closed: they stay
//! open until every cancelled transfer has come back through the unowned
//! completion path.

use std::fmt;
use std::mem;
use std::os::fd::RawFd;
use std::thread;
use std::time::{Duration, Instant};

use gadget::{GadgetRequest, RequestSink, Speed, VirtualPort};
use tracing::{debug, info, warn};

use crate::bridge::{self, DeviceContext};
use crate::error::{ProxyError, Result};
use crate::strings::read_string_tables;
use crate::translate::{ProxyGadget, build_gadget};
use crate::usb::{HostDevice, HostStack, HotplugEvent, PortAddress};

/// Upper bound on waiting for retired devices at shutdown
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(1);
const SHUTDOWN_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Empty,
    /// Real device open, no gadget yet
    Opened,
    /// Gadget built, virtual side not informed
    Bridged,
    /// Virtual side informed of the link speed
    Attached,
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SlotState::Empty => "empty",
            SlotState::Opened => "opened",
            SlotState::Bridged => "bridged",
            SlotState::Attached => "attached",
        };
        f.write_str(name)
    }
}

struct Bridged<D> {
    ctx: DeviceContext<D>,
    gadget: ProxyGadget<D>,
    address: PortAddress,
    /// Hot-plug reported the device gone; torn down on the next pass
    departed: bool,
}

enum Occupant<D> {
    Empty,
    Opened(D),
    Bridged(Bridged<D>),
    Attached(Bridged<D>),
}

impl<D: HostDevice> Occupant<D> {
    fn state(&self) -> SlotState {
        match self {
            Occupant::Empty => SlotState::Empty,
            Occupant::Opened(_) => SlotState::Opened,
            Occupant::Bridged(_) => SlotState::Bridged,
            Occupant::Attached(_) => SlotState::Attached,
        }
    }

    fn address(&self) -> Option<PortAddress> {
        match self {
            Occupant::Empty => None,
            Occupant::Opened(device) => Some(device.port_address()),
            Occupant::Bridged(b) | Occupant::Attached(b) => Some(b.address),
        }
    }

    fn bridged_mut(&mut self) -> Option<&mut Bridged<D>> {
        match self {
            Occupant::Bridged(b) | Occupant::Attached(b) => Some(b),
            _ => None,
        }
    }
}

struct Slot<D, P> {
    port: P,
    occupant: Occupant<D>,
}

/// Receives requests from retired devices; all of them are severed, so
/// anything arriving here is unexpected
struct DiscardSink;

impl RequestSink for DiscardSink {
    fn complete(&mut self, request: &GadgetRequest) {
        warn!("Dropping completion of {} from a retired device", request.id);
    }
}

pub struct SlotManager<D, P> {
    slots: Vec<Slot<D, P>>,
    excluded_bus: Option<u8>,
    settle: Duration,
    strict_speed: bool,
    retired: Vec<DeviceContext<D>>,
}

impl<D: HostDevice, P: VirtualPort> SlotManager<D, P> {
    /// One slot per port. The virtual controller's own bus is taken from the
    /// first port and excluded from hot-plug.
    pub fn new(ports: Vec<P>, settle: Duration, strict_speed: bool) -> Self {
        let excluded_bus = ports.first().and_then(|p| p.bus_number());
        if let Some(bus) = excluded_bus {
            debug!("Ignoring devices on virtual bus {}", bus);
        }
        Self {
            slots: ports
                .into_iter()
                .map(|port| Slot {
                    port,
                    occupant: Occupant::Empty,
                })
                .collect(),
            excluded_bus,
            settle,
            strict_speed,
            retired: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn state(&self, index: usize) -> SlotState {
        self.slots[index].occupant.state()
    }

    #[cfg(test)]
    pub fn port(&self, index: usize) -> &P {
        &self.slots[index].port
    }

    /// Torn-down devices still waiting for cancelled transfers
    pub fn retired(&self) -> usize {
        self.retired.len()
    }

    /// Apply every queued hot-plug notification
    pub fn handle_hotplug<S>(&mut self, stack: &mut S)
    where
        S: HostStack<Device = D>,
    {
        for event in stack.drain_hotplug() {
            match event {
                HotplugEvent::Arrived(candidate) => self.arrive(stack, candidate),
                HotplugEvent::Left(address) => self.depart(address),
            }
        }
    }

    fn arrive<S>(&mut self, stack: &S, candidate: S::Candidate)
    where
        S: HostStack<Device = D>,
    {
        let address = stack.candidate_address(&candidate);
        if Some(address.bus) == self.excluded_bus {
            debug!("Skipping {} on the virtual bus", address);
            return;
        }

        let Some(index) = self
            .slots
            .iter()
            .position(|s| matches!(s.occupant, Occupant::Empty))
        else {
            warn!("No free slot for device at {}", address);
            return;
        };

        match stack.open(candidate) {
            Ok(device) => {
                info!("slot {}: opened device at {}", index, address);
                self.slots[index].occupant = Occupant::Opened(device);
                if !self.settle.is_zero() {
                    thread::sleep(self.settle);
                }
            }
            Err(e) => warn!("Failed to open device at {}: {}", address, e),
        }
    }

    fn depart(&mut self, address: PortAddress) {
        let Some(index) = self
            .slots
            .iter()
            .position(|s| s.occupant.address() == Some(address))
        else {
            debug!("Departure of untracked device at {}", address);
            return;
        };

        info!("slot {}: device at {} left", index, address);
        let occupant = &mut self.slots[index].occupant;
        match occupant.bridged_mut() {
            Some(bridged) => bridged.departed = true,
            None => *occupant = Occupant::Empty,
        }
    }

    /// Tear down every slot whose device has left
    pub fn retire_departed(&mut self) {
        for index in 0..self.slots.len() {
            let departed = self.slots[index]
                .occupant
                .bridged_mut()
                .is_some_and(|b| b.departed);
            if departed {
                self.teardown(index);
            }
        }
    }

    /// Build the gadget of every opened device
    pub fn bridge_opened(&mut self) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            let Occupant::Opened(_) = slot.occupant else {
                continue;
            };
            let Occupant::Opened(device) = mem::replace(&mut slot.occupant, Occupant::Empty)
            else {
                continue;
            };

            let address = device.port_address();
            let mut ctx = DeviceContext::new(device);
            match Self::translate(&mut ctx) {
                Ok(gadget) => {
                    info!("slot {}: gadget built for {}", index, address);
                    slot.occupant = Occupant::Bridged(Bridged {
                        ctx,
                        gadget,
                        address,
                        departed: false,
                    });
                }
                Err(e) => {
                    warn!("slot {}: cannot mirror device at {}: {}", index, address, e);
                    Self::retire(&mut self.retired, ctx);
                }
            }
        }
    }

    fn translate(ctx: &mut DeviceContext<D>) -> Result<ProxyGadget<D>> {
        let descriptors = ctx.host.descriptors()?;
        let string_tables = read_string_tables(&mut ctx.host);
        build_gadget(ctx, &descriptors, string_tables)
    }

    /// Inform the virtual side of every bridged device
    pub fn attach_bridged(&mut self) {
        for index in 0..self.slots.len() {
            let slot = &mut self.slots[index];
            let Occupant::Bridged(bridged) = &mut slot.occupant else {
                continue;
            };
            if bridged.departed {
                continue;
            }

            let result = map_speed(bridged.ctx.host.speed(), self.strict_speed).and_then(|speed| {
                slot.port.attach(speed)?;
                Ok(speed)
            });
            match result {
                Ok(speed) => {
                    info!("slot {}: attached at {} speed", index, speed);
                    let Occupant::Bridged(mut bridged) =
                        mem::replace(&mut slot.occupant, Occupant::Empty)
                    else {
                        continue;
                    };
                    bridged.gadget.power(&mut bridged.ctx, true);
                    slot.occupant = Occupant::Attached(bridged);
                }
                Err(e) => {
                    warn!("slot {}: attach failed: {}", index, e);
                    self.teardown(index);
                }
            }
        }
    }

    /// One lifecycle pass: drop departed devices, then bridge and attach new
    /// ones
    pub fn reconcile(&mut self) {
        self.retire_departed();
        self.bridge_opened();
        self.attach_bridged();
    }

    fn teardown(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        let (bridged, attached) = match mem::replace(&mut slot.occupant, Occupant::Empty) {
            Occupant::Bridged(b) => (b, false),
            Occupant::Attached(b) => (b, true),
            Occupant::Opened(device) => {
                info!("slot {}: closing {}", index, device.port_address());
                return;
            }
            Occupant::Empty => return,
        };

        let Bridged {
            mut ctx,
            mut gadget,
            address,
            ..
        } = bridged;
        info!("slot {}: tearing down {}", index, address);

        if attached {
            gadget.power(&mut ctx, false);
        }
        gadget.destroy(&mut ctx);
        ctx.return_severed(&mut slot.port);
        if attached && let Err(e) = slot.port.detach() {
            warn!("slot {}: detach failed: {}", index, e);
        }

        Self::retire(&mut self.retired, ctx);
    }

    fn retire(retired: &mut Vec<DeviceContext<D>>, ctx: DeviceContext<D>) {
        let address = ctx.host.port_address();
        if ctx.transfers.is_empty() {
            debug!("Closed device at {}", address);
            return;
        }
        debug!(
            "Device at {} retired with {} transfers in flight ({} unowned)",
            address,
            ctx.transfers.len(),
            ctx.transfers.unowned()
        );
        retired.push(ctx);
    }

    /// Event descriptors of every attached slot
    pub fn wait_fds(&self) -> Vec<(usize, RawFd)> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| matches!(s.occupant, Occupant::Attached(_)))
            .filter_map(|(i, s)| s.port.wait_fd().map(|fd| (i, fd)))
            .collect()
    }

    /// Fetch one virtual-side event for `index` and deliver it. A fetch
    /// failure is fatal.
    pub fn fetch_and_dispatch(&mut self, index: usize) -> Result<()> {
        let Slot { port, occupant } = &mut self.slots[index];
        let event = port
            .fetch_event()
            .map_err(|e| ProxyError::EventLoop(format!("slot {}: {}", index, e)))?;
        let Some(event) = event else {
            return Ok(());
        };

        match occupant {
            Occupant::Attached(bridged) => {
                bridged.gadget.handle_event(&mut bridged.ctx, event, port);
            }
            _ => debug!("slot {}: dropping event for detached port", index),
        }
        Ok(())
    }

    /// Deliver host completions of every live and retired device
    pub fn complete_transfers(&mut self) {
        for slot in &mut self.slots {
            if let Some(bridged) = slot.occupant.bridged_mut() {
                bridge::complete_transfers(&mut bridged.ctx, &mut slot.port);
            }
        }

        self.retired.retain_mut(|ctx| {
            bridge::complete_transfers(ctx, &mut DiscardSink);
            if ctx.transfers.is_empty() {
                debug!("Retired device at {} drained", ctx.host.port_address());
                false
            } else {
                true
            }
        });
    }

    /// Tear every slot down and give retired devices a bounded time to drain
    pub fn shutdown<S>(&mut self, stack: &S)
    where
        S: HostStack<Device = D>,
    {
        for index in 0..self.slots.len() {
            self.teardown(index);
        }

        let deadline = Instant::now() + SHUTDOWN_DRAIN;
        while !self.retired.is_empty() && Instant::now() < deadline {
            if let Err(e) = stack.handle_events() {
                warn!("Event pass during shutdown: {}", e);
                break;
            }
            self.complete_transfers();
            thread::sleep(SHUTDOWN_POLL);
        }

        if !self.retired.is_empty() {
            warn!(
                "{} devices still had transfers in flight at exit",
                self.retired.len()
            );
        }
        self.retired.clear();
    }
}

/// Map the negotiated link speed onto what the virtual port supports
pub fn map_speed(speed: rusb::Speed, strict: bool) -> Result<Speed> {
    match speed {
        rusb::Speed::Low => Ok(Speed::Low),
        rusb::Speed::Full => Ok(Speed::Full),
        rusb::Speed::High => Ok(Speed::High),
        other if strict => Err(ProxyError::UnsupportedSpeed(other)),
        other => {
            warn!("Link speed {:?} is not supported, attaching as high speed", other);
            Ok(Speed::High)
        }
    }
}
