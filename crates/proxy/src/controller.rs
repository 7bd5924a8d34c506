//! Gadget controller: configuration, interface and device-level operations
//! carried out on the real device

use gadget::{ConfigCaps, ConfigOps, GadgetOps, InterfaceCaps, InterfaceOps};
use tracing::{debug, info, warn};

use crate::bridge::DeviceContext;
use crate::usb::HostDevice;

/// Selects configurations and claims their interfaces
#[derive(Debug, Default)]
pub struct ConfigController;

impl ConfigController {
    fn active_interfaces<D: HostDevice>(host: &D, step: &str) -> Vec<u8> {
        host.active_interfaces().unwrap_or_else(|e| {
            warn!("active configuration ({}): {}", step, e);
            Vec::new()
        })
    }

    fn detach_kernel_drivers<D: HostDevice>(host: &mut D, interfaces: &[u8]) {
        for &interface in interfaces {
            match host.detach_kernel_driver(interface) {
                Ok(()) | Err(rusb::Error::NotFound) => {}
                Err(e) => warn!("detach_kernel_driver({}): {}", interface, e),
            }
        }
    }
}

impl<D: HostDevice> ConfigOps<DeviceContext<D>> for ConfigController {
    fn enable(&mut self, ctx: &mut DeviceContext<D>, caps: &ConfigCaps, on: bool) {
        info!("config {} enable {}", caps.number, on);
        let host = &mut ctx.host;

        if on {
            let current = Self::active_interfaces(host, "before select");
            Self::detach_kernel_drivers(host, &current);

            if let Err(e) = host.set_configuration(Some(caps.number)) {
                warn!("set_configuration({}): {}", caps.number, e);
                return;
            }

            // The selected configuration may expose different interfaces
            let selected = Self::active_interfaces(host, "after select");
            Self::detach_kernel_drivers(host, &selected);
            for interface in selected {
                if let Err(e) = host.claim_interface(interface) {
                    warn!("claim_interface({}): {}", interface, e);
                }
            }
        } else {
            for interface in Self::active_interfaces(host, "release") {
                if let Err(e) = host.release_interface(interface) {
                    warn!("release_interface({}): {}", interface, e);
                }
            }
            if let Err(e) = host.set_configuration(None) {
                warn!("set_configuration(none): {}", e);
            }
        }
    }

    fn destroy(&mut self, _ctx: &mut DeviceContext<D>, caps: &ConfigCaps) {
        debug!("config {} destroy", caps.number);
    }
}

/// Selects alternate settings; disabling happens through deconfiguration
#[derive(Debug, Default)]
pub struct InterfaceController;

impl<D: HostDevice> InterfaceOps<DeviceContext<D>> for InterfaceController {
    fn enable(&mut self, ctx: &mut DeviceContext<D>, caps: &InterfaceCaps, on: bool) {
        debug!(
            "interface ({}, {}) enable {}",
            caps.number, caps.alt_setting, on
        );
        if !on {
            return;
        }
        if let Err(e) = ctx
            .host
            .set_alternate_setting(caps.number, caps.alt_setting)
        {
            warn!(
                "set_alternate_setting({}, {}): {}",
                caps.number, caps.alt_setting, e
            );
        }
    }

    fn destroy(&mut self, _ctx: &mut DeviceContext<D>, caps: &InterfaceCaps) {
        debug!("interface ({}, {}) destroy", caps.number, caps.alt_setting);
    }
}

/// Device-level operations. Power and addressing are owned by the host
/// controller the real device sits on, so only reset reaches hardware.
#[derive(Debug, Default)]
pub struct DeviceController;

impl<D: HostDevice> GadgetOps<DeviceContext<D>> for DeviceController {
    fn reset(&mut self, ctx: &mut DeviceContext<D>, starting: bool) {
        info!("gadget reset {}", if starting { "start" } else { "finish" });
        if starting {
            return;
        }
        if let Err(e) = ctx.host.reset() {
            warn!("reset_device: {}", e);
        }
    }

    fn power(&mut self, _ctx: &mut DeviceContext<D>, on: bool) {
        info!("gadget power {}", on);
    }

    fn set_address(&mut self, _ctx: &mut DeviceContext<D>, address: u16) {
        info!("gadget set_address {}", address);
    }

    fn destroy(&mut self, _ctx: &mut DeviceContext<D>) {
        debug!("gadget destroy");
    }
}
