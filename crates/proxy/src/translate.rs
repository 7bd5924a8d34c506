//! Descriptor translator
//!
//! Builds the gadget tree mirroring a real device from its descriptor
//! snapshot. A failure anywhere unwinds everything built so far, in reverse
//! order, so a partial tree is never handed out.

use gadget::{
    ConfigCaps, DescriptorChain, DeviceCaps, Direction, EndpointCaps, Gadget, GadgetConfig,
    GadgetEndpoint, GadgetInterface, InterfaceCaps, IsoSync, IsoUsage, StringTable, TransferKind,
};
use tracing::debug;

use crate::bridge::{DeviceContext, TransferBridge};
use crate::controller::{ConfigController, DeviceController, InterfaceController};
use crate::error::Result;
use crate::usb::{
    ConfigDescriptor, DeviceDescriptors, EndpointDescriptor, HostDevice, InterfaceDescriptor,
};

pub type ProxyGadget<D> = Gadget<DeviceContext<D>>;

/// Build the gadget for `descriptors`, with string tables already read
pub fn build_gadget<D: HostDevice>(
    ctx: &mut DeviceContext<D>,
    descriptors: &DeviceDescriptors,
    string_tables: Vec<StringTable>,
) -> Result<ProxyGadget<D>> {
    let device = &descriptors.device;

    let endpoint0 = GadgetEndpoint::new(
        EndpointCaps::endpoint_zero(device.max_packet_size0),
        Box::new(TransferBridge::new(&mut ctx.transfers)),
    )?;

    let mut configs = Vec::with_capacity(descriptors.configs.len());
    for desc in &descriptors.configs {
        match build_config(ctx, desc) {
            Ok(config) => configs.push(config),
            Err(e) => {
                unwind(ctx, configs, GadgetConfig::destroy);
                endpoint0.destroy(ctx);
                return Err(e);
            }
        }
    }

    let caps = DeviceCaps {
        bcd_usb: device.bcd_usb,
        bcd_device: device.bcd_device,
        class: device.class,
        subclass: device.subclass,
        protocol: device.protocol,
        vendor_id: device.vendor_id,
        product_id: device.product_id,
        manufacturer: device.manufacturer,
        product: device.product,
        serial_number: device.serial_number,
        string_tables,
    };

    Ok(Gadget::new(
        ctx,
        caps,
        endpoint0,
        configs,
        Box::new(DeviceController),
    )?)
}

fn build_config<D: HostDevice>(
    ctx: &mut DeviceContext<D>,
    desc: &ConfigDescriptor,
) -> Result<GadgetConfig<DeviceContext<D>>> {
    let mut interfaces = Vec::with_capacity(desc.interfaces.len());
    for iface in &desc.interfaces {
        match build_interface(ctx, iface) {
            Ok(interface) => interfaces.push(interface),
            Err(e) => {
                unwind(ctx, interfaces, GadgetInterface::destroy);
                return Err(e);
            }
        }
    }

    let caps = ConfigCaps {
        number: desc.number,
        attributes: desc.attributes,
        max_power: desc.max_power,
        description: desc.description,
        descriptors: parse_extra(&desc.extra, "config", desc.number),
    };

    Ok(GadgetConfig::new(
        ctx,
        caps,
        interfaces,
        Box::new(ConfigController),
    )?)
}

fn build_interface<D: HostDevice>(
    ctx: &mut DeviceContext<D>,
    desc: &InterfaceDescriptor,
) -> Result<GadgetInterface<DeviceContext<D>>> {
    let mut endpoints = Vec::with_capacity(desc.endpoints.len());
    for caps in endpoint_caps(&desc.endpoints) {
        let bridge = TransferBridge::new(&mut ctx.transfers);
        match GadgetEndpoint::new(caps, Box::new(bridge)) {
            Ok(endpoint) => endpoints.push(endpoint),
            Err(e) => {
                unwind(ctx, endpoints, GadgetEndpoint::destroy);
                return Err(e.into());
            }
        }
    }

    let caps = InterfaceCaps {
        number: desc.number,
        alt_setting: desc.alt_setting,
        class: desc.class,
        subclass: desc.subclass,
        protocol: desc.protocol,
        description: desc.description,
        descriptors: parse_extra(&desc.extra, "interface", desc.number),
    };

    Ok(GadgetInterface::new(
        ctx,
        caps,
        endpoints,
        Box::new(InterfaceController),
    )?)
}

/// Endpoint capabilities of one interface, one per endpoint number.
///
/// An endpoint number listed in both directions becomes a single capability
/// carrying both; the first listing fixes its position and attributes.
pub fn endpoint_caps(descriptors: &[EndpointDescriptor]) -> Vec<EndpointCaps> {
    let mut caps: Vec<EndpointCaps> = Vec::with_capacity(descriptors.len());

    for desc in descriptors {
        let number = desc.address & 0x0f;
        let direction = Direction::from_address(desc.address);

        if let Some(existing) = caps.iter_mut().find(|c| c.address == number) {
            existing.direction |= direction;
            continue;
        }

        let kind = TransferKind::from_attributes(desc.attributes);
        let (sync, usage) = if kind == TransferKind::Isochronous {
            (
                IsoSync::from_attributes(desc.attributes),
                IsoUsage::from_attributes(desc.attributes),
            )
        } else {
            (IsoSync::None, IsoUsage::Data)
        };

        caps.push(EndpointCaps {
            address: number,
            direction,
            kind,
            sync,
            usage,
            max_packet_size: desc.max_packet_size,
            interval: desc.interval,
            descriptors: parse_extra(&desc.extra, "endpoint", number),
        });
    }

    caps
}

fn parse_extra(extra: &[u8], level: &str, number: u8) -> Option<DescriptorChain> {
    if extra.is_empty() {
        return None;
    }
    let chain = DescriptorChain::parse(extra);
    if chain.is_none() {
        debug!(
            "Dropping malformed extra descriptors of {} {} ({} bytes)",
            level,
            number,
            extra.len()
        );
    }
    chain
}

fn unwind<C, T>(ctx: &mut C, built: Vec<T>, destroy: fn(T, &mut C)) {
    for item in built.into_iter().rev() {
        destroy(item, ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeDevice, sample_descriptors};

    fn ep(address: u8, attributes: u8) -> EndpointDescriptor {
        EndpointDescriptor {
            address,
            attributes,
            max_packet_size: 64,
            interval: 0,
            extra: Vec::new(),
        }
    }

    #[test]
    fn test_split_direction_endpoints_merge() {
        let caps = endpoint_caps(&[ep(0x81, 0x02), ep(0x01, 0x02), ep(0x81, 0x02), ep(0x01, 0x02)]);

        assert_eq!(caps.len(), 1);
        assert_eq!(caps[0].address, 1);
        assert_eq!(caps[0].direction, Direction::BOTH);
    }

    #[test]
    fn test_first_listing_fixes_order() {
        let caps = endpoint_caps(&[ep(0x02, 0x02), ep(0x81, 0x03), ep(0x82, 0x02)]);

        let order: Vec<(u8, Direction)> = caps.iter().map(|c| (c.address, c.direction)).collect();
        assert_eq!(order, vec![(2, Direction::BOTH), (1, Direction::IN)]);
        assert_eq!(caps[1].kind, TransferKind::Interrupt);
    }

    #[test]
    fn test_iso_attributes_only_for_iso() {
        let caps = endpoint_caps(&[ep(0x83, 0x05 | 0x10), ep(0x04, 0x02 | 0x0c)]);

        assert_eq!(caps[0].kind, TransferKind::Isochronous);
        assert_eq!(caps[0].sync, IsoSync::Async);
        assert_eq!(caps[0].usage, IsoUsage::Feedback);
        assert_eq!(caps[1].sync, IsoSync::None);
    }

    #[test]
    fn test_malformed_extra_is_dropped_not_fatal() {
        let mut descriptors = sample_descriptors();
        descriptors.configs[0].interfaces[0].extra = vec![0x09, 0x21, 0x11];
        descriptors.configs[0].extra = vec![0x05, 0x24, 0x00, 0x10, 0x01];
        let mut ctx = DeviceContext::new(FakeDevice::new());

        let gadget = build_gadget(&mut ctx, &descriptors, Vec::new()).unwrap();

        let config = &gadget.configs()[0];
        assert_eq!(config.caps().descriptors.as_ref().map(|c| c.len()), Some(1));
        assert!(config.interfaces()[0].caps().descriptors.is_none());
    }

    #[test]
    fn test_tree_mirrors_descriptors() {
        let descriptors = sample_descriptors();
        let mut ctx = DeviceContext::new(FakeDevice::new());

        let gadget = build_gadget(&mut ctx, &descriptors, Vec::new()).unwrap();

        assert_eq!(gadget.caps().vendor_id, descriptors.device.vendor_id);
        assert_eq!(gadget.endpoint0().caps().max_packet_size, 64);
        assert!(gadget.endpoint0().is_enabled());
        let config = &gadget.configs()[0];
        assert_eq!(config.caps().number, 1);
        let pairs: Vec<(u8, u8)> = config
            .interfaces()
            .iter()
            .map(|i| (i.caps().number, i.caps().alt_setting))
            .collect();
        assert_eq!(pairs, vec![(0, 0), (1, 0), (1, 1)]);
        assert_eq!(config.interfaces()[0].endpoints().len(), 2);
    }

    #[test]
    fn test_duplicate_interface_unwinds_whole_tree() {
        let mut descriptors = sample_descriptors();
        let duplicate = descriptors.configs[0].interfaces[0].clone();
        descriptors.configs[0].interfaces.push(duplicate);
        let mut ctx = DeviceContext::new(FakeDevice::new());

        let result = build_gadget(&mut ctx, &descriptors, Vec::new());

        assert!(result.is_err());
        assert!(ctx.transfers.is_empty());
    }
}
