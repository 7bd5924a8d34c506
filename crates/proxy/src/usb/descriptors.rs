//! Owned snapshots of a device's standard descriptors
//!
//! Everything the translator needs is read from the device up front, so
//! building the gadget tree never touches hardware.

use rusb::{Device, SyncType, TransferType, UsageType, UsbContext, Version};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptors {
    pub device: DeviceDescriptor,
    pub configs: Vec<ConfigDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub bcd_usb: u16,
    pub bcd_device: u16,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub max_packet_size0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: u8,
    pub product: u8,
    pub serial_number: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigDescriptor {
    pub number: u8,
    pub attributes: u8,
    /// bMaxPower, 2 mA units
    pub max_power: u8,
    pub description: u8,
    pub extra: Vec<u8>,
    /// One entry per (interface number, alternate setting)
    pub interfaces: Vec<InterfaceDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub number: u8,
    pub alt_setting: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub description: u8,
    pub extra: Vec<u8>,
    pub endpoints: Vec<EndpointDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointDescriptor {
    /// bEndpointAddress, direction bit included
    pub address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
    pub extra: Vec<u8>,
}

impl DeviceDescriptors {
    /// Read the device descriptor and every configuration descriptor
    pub fn read<T: UsbContext>(device: &Device<T>) -> rusb::Result<Self> {
        let desc = device.device_descriptor()?;

        let mut configs = Vec::with_capacity(desc.num_configurations() as usize);
        for index in 0..desc.num_configurations() {
            let config = device.config_descriptor(index)?;
            configs.push(ConfigDescriptor::from_rusb(&config));
        }

        Ok(Self {
            device: DeviceDescriptor {
                bcd_usb: version_to_bcd(desc.usb_version()),
                bcd_device: version_to_bcd(desc.device_version()),
                class: desc.class_code(),
                subclass: desc.sub_class_code(),
                protocol: desc.protocol_code(),
                max_packet_size0: desc.max_packet_size(),
                vendor_id: desc.vendor_id(),
                product_id: desc.product_id(),
                manufacturer: desc.manufacturer_string_index().unwrap_or(0),
                product: desc.product_string_index().unwrap_or(0),
                serial_number: desc.serial_number_string_index().unwrap_or(0),
            },
            configs,
        })
    }
}

impl ConfigDescriptor {
    fn from_rusb(config: &rusb::ConfigDescriptor) -> Self {
        let mut attributes = 0x80;
        if config.self_powered() {
            attributes |= 0x40;
        }
        if config.remote_wakeup() {
            attributes |= 0x20;
        }

        let interfaces = config
            .interfaces()
            .flat_map(|interface| interface.descriptors())
            .map(|alt| InterfaceDescriptor {
                number: alt.interface_number(),
                alt_setting: alt.setting_number(),
                class: alt.class_code(),
                subclass: alt.sub_class_code(),
                protocol: alt.protocol_code(),
                description: alt.description_string_index().unwrap_or(0),
                extra: alt.extra().to_vec(),
                endpoints: alt
                    .endpoint_descriptors()
                    .map(|ep| EndpointDescriptor {
                        address: ep.address(),
                        attributes: endpoint_attributes(
                            ep.transfer_type(),
                            ep.sync_type(),
                            ep.usage_type(),
                        ),
                        max_packet_size: ep.max_packet_size(),
                        interval: ep.interval(),
                        extra: ep.extra().map(<[u8]>::to_vec).unwrap_or_default(),
                    })
                    .collect(),
            })
            .collect();

        Self {
            number: config.number(),
            attributes,
            max_power: (config.max_power() / 2) as u8,
            description: config.description_string_index().unwrap_or(0),
            extra: config.extra().to_vec(),
            interfaces,
        }
    }
}

/// Re-encode a decoded version as the descriptor's BCD field
pub fn version_to_bcd(version: Version) -> u16 {
    let major = version.major() as u16;
    ((major / 10) << 12)
        | ((major % 10) << 8)
        | ((version.minor() as u16 & 0x0f) << 4)
        | (version.sub_minor() as u16 & 0x0f)
}

/// Rebuild bmAttributes from its decoded parts
pub fn endpoint_attributes(kind: TransferType, sync: SyncType, usage: UsageType) -> u8 {
    let kind = match kind {
        TransferType::Control => 0,
        TransferType::Isochronous => 1,
        TransferType::Bulk => 2,
        TransferType::Interrupt => 3,
    };
    let sync = match sync {
        SyncType::NoSync => 0,
        SyncType::Asynchronous => 1,
        SyncType::Adaptive => 2,
        SyncType::Synchronous => 3,
    };
    let usage = match usage {
        UsageType::Data => 0,
        UsageType::Feedback => 1,
        UsageType::FeedbackData => 2,
        UsageType::Reserved => 3,
    };
    kind | (sync << 2) | (usage << 4)
}
