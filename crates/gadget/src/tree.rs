//! Gadget tree and virtual-side event dispatch

use tracing::{debug, info, warn};

use crate::caps::{ConfigCaps, DeviceCaps, Direction, EndpointCaps, InterfaceCaps, TransferKind};
use crate::error::{GadgetError, Result};
use crate::ops::{ConfigOps, EndpointOps, GadgetOps, InterfaceOps};
use crate::port::GadgetEvent;
use crate::request::{GadgetRequest, RequestId, RequestSink, UrbStatus};

const REQ_CLEAR_FEATURE: u8 = 0x01;
const REQ_SET_FEATURE: u8 = 0x03;
const REQ_SET_ADDRESS: u8 = 0x05;
const REQ_SET_CONFIGURATION: u8 = 0x09;
const REQ_SET_INTERFACE: u8 = 0x0b;

const RT_STANDARD_DEVICE_OUT: u8 = 0x00;
const RT_STANDARD_INTERFACE_OUT: u8 = 0x01;
const RT_STANDARD_ENDPOINT_OUT: u8 = 0x02;
const RT_HUB_PORT_OUT: u8 = 0x23;

const FEATURE_ENDPOINT_HALT: u16 = 0;
const FEATURE_PORT_RESET: u16 = 4;

pub struct GadgetEndpoint<C> {
    caps: EndpointCaps,
    ops: Box<dyn EndpointOps<C>>,
    enabled: bool,
}

impl<C> GadgetEndpoint<C> {
    pub fn new(caps: EndpointCaps, ops: Box<dyn EndpointOps<C>>) -> Result<Self> {
        if caps.address > 15 {
            return Err(GadgetError::InvalidEndpoint(caps.address));
        }
        Ok(Self {
            caps,
            ops,
            enabled: false,
        })
    }

    pub fn caps(&self) -> &EndpointCaps {
        &self.caps
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, ctx: &mut C, on: bool) {
        if self.enabled == on {
            return;
        }
        self.enabled = on;
        self.ops.enable(ctx, &self.caps, on);
    }

    pub fn enqueue(&mut self, ctx: &mut C, request: GadgetRequest, sink: &mut dyn RequestSink) {
        self.ops.enqueue(ctx, &self.caps, request, sink);
    }

    pub fn dequeue(&mut self, ctx: &mut C, id: RequestId) {
        self.ops.dequeue(ctx, &self.caps, id);
    }

    pub fn clear_stall(&mut self, ctx: &mut C) -> UrbStatus {
        self.ops.clear_stall(ctx, &self.caps)
    }

    pub fn destroy(mut self, ctx: &mut C) {
        self.ops.destroy(ctx, &self.caps);
    }
}

pub struct GadgetInterface<C> {
    caps: InterfaceCaps,
    endpoints: Vec<GadgetEndpoint<C>>,
    ops: Box<dyn InterfaceOps<C>>,
    enabled: bool,
}

impl<C> GadgetInterface<C> {
    /// Build an interface owning `endpoints`. On failure the endpoints are
    /// destroyed in reverse order before the error is returned.
    pub fn new(
        ctx: &mut C,
        caps: InterfaceCaps,
        endpoints: Vec<GadgetEndpoint<C>>,
        ops: Box<dyn InterfaceOps<C>>,
    ) -> Result<Self> {
        let mut error = None;
        for (i, ep) in endpoints.iter().enumerate() {
            if ep.caps.address == 0 {
                error = Some(GadgetError::InvalidEndpoint(0));
            } else if endpoints[..i]
                .iter()
                .any(|other| other.caps.address == ep.caps.address)
            {
                error = Some(GadgetError::DuplicateEndpoint(ep.caps.address));
            }
            if error.is_some() {
                break;
            }
        }

        if let Some(error) = error {
            destroy_all(ctx, endpoints, GadgetEndpoint::destroy);
            return Err(error);
        }

        Ok(Self {
            caps,
            endpoints,
            ops,
            enabled: false,
        })
    }

    pub fn caps(&self) -> &InterfaceCaps {
        &self.caps
    }

    pub fn endpoints(&self) -> &[GadgetEndpoint<C>] {
        &self.endpoints
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn set_enabled(&mut self, ctx: &mut C, on: bool) {
        if on {
            self.ops.enable(ctx, &self.caps, true);
            for ep in &mut self.endpoints {
                ep.set_enabled(ctx, true);
            }
        } else {
            for ep in &mut self.endpoints {
                ep.set_enabled(ctx, false);
            }
            self.ops.enable(ctx, &self.caps, false);
        }
        self.enabled = on;
    }

    pub fn destroy(mut self, ctx: &mut C) {
        destroy_all(ctx, std::mem::take(&mut self.endpoints), GadgetEndpoint::destroy);
        self.ops.destroy(ctx, &self.caps);
    }
}

pub struct GadgetConfig<C> {
    caps: ConfigCaps,
    interfaces: Vec<GadgetInterface<C>>,
    ops: Box<dyn ConfigOps<C>>,
}

impl<C> GadgetConfig<C> {
    /// Build a configuration owning `interfaces` (one entry per interface
    /// number and alternate setting pair).
    pub fn new(
        ctx: &mut C,
        caps: ConfigCaps,
        interfaces: Vec<GadgetInterface<C>>,
        ops: Box<dyn ConfigOps<C>>,
    ) -> Result<Self> {
        let duplicate = interfaces.iter().enumerate().find_map(|(i, iface)| {
            interfaces[..i]
                .iter()
                .any(|other| {
                    other.caps.number == iface.caps.number
                        && other.caps.alt_setting == iface.caps.alt_setting
                })
                .then_some(GadgetError::DuplicateInterface {
                    number: iface.caps.number,
                    alt_setting: iface.caps.alt_setting,
                })
        });

        if let Some(error) = duplicate {
            destroy_all(ctx, interfaces, GadgetInterface::destroy);
            return Err(error);
        }

        Ok(Self {
            caps,
            interfaces,
            ops,
        })
    }

    pub fn caps(&self) -> &ConfigCaps {
        &self.caps
    }

    pub fn interfaces(&self) -> &[GadgetInterface<C>] {
        &self.interfaces
    }

    /// Index of the alternate setting selected for each interface number on
    /// activation: setting 0 when present, otherwise the first listed
    fn default_alt_settings(&self) -> Vec<usize> {
        let mut chosen: Vec<usize> = Vec::new();
        for (i, iface) in self.interfaces.iter().enumerate() {
            match chosen
                .iter_mut()
                .find(|j| self.interfaces[**j].caps.number == iface.caps.number)
            {
                Some(j) => {
                    if iface.caps.alt_setting == 0 {
                        *j = i;
                    }
                }
                None => chosen.push(i),
            }
        }
        chosen
    }

    pub fn destroy(mut self, ctx: &mut C) {
        destroy_all(ctx, std::mem::take(&mut self.interfaces), GadgetInterface::destroy);
        self.ops.destroy(ctx, &self.caps);
    }
}

/// A virtual device: capability tree plus the state the virtual host
/// controller drives through standard requests
pub struct Gadget<C> {
    caps: DeviceCaps,
    endpoint0: GadgetEndpoint<C>,
    configs: Vec<GadgetConfig<C>>,
    ops: Box<dyn GadgetOps<C>>,
    address: u16,
    active: Option<usize>,
    active_alts: Vec<usize>,
}

impl<C> Gadget<C> {
    pub fn new(
        ctx: &mut C,
        caps: DeviceCaps,
        endpoint0: GadgetEndpoint<C>,
        configs: Vec<GadgetConfig<C>>,
        ops: Box<dyn GadgetOps<C>>,
    ) -> Result<Self> {
        let ep0 = &endpoint0.caps;
        let mut error = None;
        if ep0.address != 0 || ep0.kind != TransferKind::Control || ep0.direction != Direction::BOTH
        {
            error = Some(GadgetError::InvalidEndpointZero);
        } else if let Some(config) = configs.iter().enumerate().find_map(|(i, c)| {
            configs[..i]
                .iter()
                .any(|other| other.caps.number == c.caps.number)
                .then_some(c.caps.number)
        }) {
            error = Some(GadgetError::DuplicateConfig(config));
        }

        if let Some(error) = error {
            destroy_all(ctx, configs, GadgetConfig::destroy);
            endpoint0.destroy(ctx);
            return Err(error);
        }

        let mut gadget = Self {
            caps,
            endpoint0,
            configs,
            ops,
            address: 0,
            active: None,
            active_alts: Vec::new(),
        };
        gadget.endpoint0.set_enabled(ctx, true);
        Ok(gadget)
    }

    pub fn caps(&self) -> &DeviceCaps {
        &self.caps
    }

    pub fn endpoint0(&self) -> &GadgetEndpoint<C> {
        &self.endpoint0
    }

    pub fn configs(&self) -> &[GadgetConfig<C>] {
        &self.configs
    }

    pub fn address(&self) -> u16 {
        self.address
    }

    /// Value of the active configuration, if any
    pub fn active_configuration(&self) -> Option<u8> {
        self.active.map(|i| self.configs[i].caps.number)
    }

    /// (interface number, alternate setting) pairs currently selected
    pub fn active_alt_settings(&self) -> Vec<(u8, u8)> {
        let Some(index) = self.active else {
            return Vec::new();
        };
        let config = &self.configs[index];
        self.active_alts
            .iter()
            .map(|&i| {
                let caps = &config.interfaces[i].caps;
                (caps.number, caps.alt_setting)
            })
            .collect()
    }

    pub fn power(&mut self, ctx: &mut C, on: bool) {
        self.ops.power(ctx, on);
    }

    /// Deliver one virtual-side event
    pub fn handle_event(&mut self, ctx: &mut C, event: GadgetEvent, sink: &mut dyn RequestSink) {
        match event {
            GadgetEvent::Submit(request) => self.submit(ctx, request, sink),
            GadgetEvent::Unlink {
                id,
                endpoint,
                direction_in,
            } => match self.endpoint_mut(endpoint, direction_in) {
                Some(ep) => ep.dequeue(ctx, id),
                None => debug!("Unlink {} for inactive endpoint {}", id, endpoint),
            },
        }
    }

    fn submit(&mut self, ctx: &mut C, request: GadgetRequest, sink: &mut dyn RequestSink) {
        if request.endpoint != 0 {
            match self.endpoint_mut(request.endpoint, request.direction_in) {
                Some(ep) => ep.enqueue(ctx, request, sink),
                None => {
                    warn!(
                        "Request {} for inactive endpoint {} ({})",
                        request.id,
                        request.endpoint,
                        if request.direction_in { "IN" } else { "OUT" }
                    );
                    request.finish_with(UrbStatus::Stall, sink);
                }
            }
            return;
        }

        let setup = request.setup_packet();
        match (setup.request_type, setup.request) {
            (RT_STANDARD_DEVICE_OUT, REQ_SET_ADDRESS) => {
                self.address = setup.value;
                self.ops.set_address(ctx, setup.value);
                request.finish_with(UrbStatus::Completed, sink);
            }
            (RT_STANDARD_DEVICE_OUT, REQ_SET_CONFIGURATION) => {
                let status = self.set_configuration(ctx, setup.value as u8);
                request.finish_with(status, sink);
            }
            (RT_STANDARD_INTERFACE_OUT, REQ_SET_INTERFACE) => {
                let status = self.set_interface(ctx, setup.index as u8, setup.value as u8);
                request.finish_with(status, sink);
            }
            (RT_STANDARD_ENDPOINT_OUT, REQ_CLEAR_FEATURE)
                if setup.value == FEATURE_ENDPOINT_HALT =>
            {
                let status = self.clear_halt(ctx, setup.index as u8);
                request.finish_with(status, sink);
            }
            (RT_HUB_PORT_OUT, REQ_SET_FEATURE) if setup.value == FEATURE_PORT_RESET => {
                self.reset(ctx);
                request.finish_with(UrbStatus::Completed, sink);
            }
            _ => self.endpoint0.enqueue(ctx, request, sink),
        }
    }

    /// Select configuration `value`; 0 leaves the device unconfigured
    pub fn set_configuration(&mut self, ctx: &mut C, value: u8) -> UrbStatus {
        let target = if value == 0 {
            None
        } else {
            match self.configs.iter().position(|c| c.caps.number == value) {
                Some(index) => Some(index),
                None => {
                    warn!("Host selected unknown configuration {}", value);
                    return UrbStatus::Stall;
                }
            }
        };

        self.deconfigure(ctx);

        if let Some(index) = target {
            info!("Activating configuration {}", value);
            let config = &mut self.configs[index];
            config.ops.enable(ctx, &config.caps, true);
            let alts = config.default_alt_settings();
            for &i in &alts {
                config.interfaces[i].set_enabled(ctx, true);
            }
            self.active = Some(index);
            self.active_alts = alts;
        }

        UrbStatus::Completed
    }

    /// Switch interface `number` to alternate setting `alt_setting`
    pub fn set_interface(&mut self, ctx: &mut C, number: u8, alt_setting: u8) -> UrbStatus {
        let Some(index) = self.active else {
            warn!("SET_INTERFACE {} while unconfigured", number);
            return UrbStatus::Stall;
        };
        let config = &mut self.configs[index];
        let Some(target) = config
            .interfaces
            .iter()
            .position(|i| i.caps.number == number && i.caps.alt_setting == alt_setting)
        else {
            warn!(
                "Interface {} has no alternate setting {}",
                number, alt_setting
            );
            return UrbStatus::Stall;
        };

        match self
            .active_alts
            .iter()
            .position(|&j| config.interfaces[j].caps.number == number)
        {
            Some(slot) => {
                let previous = self.active_alts[slot];
                config.interfaces[previous].set_enabled(ctx, false);
                self.active_alts[slot] = target;
            }
            None => self.active_alts.push(target),
        }
        config.interfaces[target].set_enabled(ctx, true);

        UrbStatus::Completed
    }

    fn clear_halt(&mut self, ctx: &mut C, wire_address: u8) -> UrbStatus {
        match self.endpoint_mut(wire_address & 0x0f, wire_address & 0x80 != 0) {
            Some(ep) => ep.clear_stall(ctx),
            None => {
                warn!("CLEAR_FEATURE(HALT) for inactive endpoint {:#04x}", wire_address);
                UrbStatus::Stall
            }
        }
    }

    /// Bus reset: the device returns to the default, unconfigured state
    pub fn reset(&mut self, ctx: &mut C) {
        self.ops.reset(ctx, true);
        self.deconfigure(ctx);
        self.address = 0;
        self.ops.reset(ctx, false);
    }

    fn deconfigure(&mut self, ctx: &mut C) {
        let Some(index) = self.active.take() else {
            return;
        };
        let config = &mut self.configs[index];
        for i in std::mem::take(&mut self.active_alts) {
            config.interfaces[i].set_enabled(ctx, false);
        }
        config.ops.enable(ctx, &config.caps, false);
    }

    fn endpoint_mut(&mut self, number: u8, direction_in: bool) -> Option<&mut GadgetEndpoint<C>> {
        if number == 0 {
            return Some(&mut self.endpoint0);
        }
        let direction = if direction_in {
            Direction::IN
        } else {
            Direction::OUT
        };
        let config = self.configs.get_mut(self.active?)?;
        let alts = &self.active_alts;
        config
            .interfaces
            .iter_mut()
            .enumerate()
            .filter(|(i, _)| alts.contains(i))
            .flat_map(|(_, iface)| iface.endpoints.iter_mut())
            .find(|ep| {
                ep.enabled && ep.caps.address == number && ep.caps.direction.contains(direction)
            })
    }

    /// Tear the tree down, children first
    pub fn destroy(mut self, ctx: &mut C) {
        destroy_all(ctx, std::mem::take(&mut self.configs), GadgetConfig::destroy);
        self.endpoint0.destroy(ctx);
        self.ops.destroy(ctx);
    }
}

/// Destroy `items` in reverse construction order
fn destroy_all<C, T>(ctx: &mut C, items: Vec<T>, destroy: fn(T, &mut C)) {
    for item in items.into_iter().rev() {
        destroy(item, ctx);
    }
}
