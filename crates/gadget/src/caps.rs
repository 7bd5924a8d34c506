//! Capability records
//!
//! Immutable descriptions of each level of a gadget, derived from the real
//! device's descriptors when the gadget is built.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

/// Link speed reported to the virtual host controller on attach
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Speed {
    Low,
    Full,
    High,
}

impl fmt::Display for Speed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Speed::Low => write!(f, "low"),
            Speed::Full => write!(f, "full"),
            Speed::High => write!(f, "high"),
        }
    }
}

/// Set of directions an endpoint carries traffic in
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Direction(u8);

impl Direction {
    pub const OUT: Direction = Direction(0b01);
    pub const IN: Direction = Direction(0b10);
    pub const BOTH: Direction = Direction(0b11);

    /// Direction of a descriptor endpoint address (bit 7 set means IN)
    pub fn from_address(address: u8) -> Self {
        if address & 0x80 != 0 {
            Direction::IN
        } else {
            Direction::OUT
        }
    }

    pub fn contains(self, other: Direction) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn is_in(self) -> bool {
        self.contains(Direction::IN)
    }

    pub fn is_out(self) -> bool {
        self.contains(Direction::OUT)
    }
}

impl BitOr for Direction {
    type Output = Direction;

    fn bitor(self, rhs: Direction) -> Direction {
        Direction(self.0 | rhs.0)
    }
}

impl BitOrAssign for Direction {
    fn bitor_assign(&mut self, rhs: Direction) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.is_in(), self.is_out()) {
            (true, true) => write!(f, "IN|OUT"),
            (true, false) => write!(f, "IN"),
            (false, true) => write!(f, "OUT"),
            (false, false) => write!(f, "NONE"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl TransferKind {
    /// Decode bits 0..1 of an endpoint's bmAttributes
    pub fn from_attributes(attributes: u8) -> Self {
        match attributes & 0x03 {
            0 => TransferKind::Control,
            1 => TransferKind::Isochronous,
            2 => TransferKind::Bulk,
            _ => TransferKind::Interrupt,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IsoSync {
    #[default]
    None,
    Async,
    Adaptive,
    Sync,
}

impl IsoSync {
    /// Decode bits 2..3 of an endpoint's bmAttributes
    pub fn from_attributes(attributes: u8) -> Self {
        match (attributes >> 2) & 0x03 {
            0 => IsoSync::None,
            1 => IsoSync::Async,
            2 => IsoSync::Adaptive,
            _ => IsoSync::Sync,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IsoUsage {
    #[default]
    Data,
    Feedback,
    Implicit,
}

impl IsoUsage {
    /// Decode bits 4..5 of an endpoint's bmAttributes; the reserved value
    /// reads as data
    pub fn from_attributes(attributes: u8) -> Self {
        match (attributes >> 4) & 0x03 {
            1 => IsoUsage::Feedback,
            2 => IsoUsage::Implicit,
            _ => IsoUsage::Data,
        }
    }
}

/// One opaque class or vendor descriptor, header included
#[derive(Clone, PartialEq, Eq)]
pub struct RawDescriptor {
    bytes: Vec<u8>,
}

impl RawDescriptor {
    pub fn length(&self) -> u8 {
        self.bytes[0]
    }

    pub fn descriptor_type(&self) -> u8 {
        self.bytes[1]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for RawDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawDescriptor")
            .field("length", &self.length())
            .field("type", &format_args!("{:#04x}", self.descriptor_type()))
            .finish()
    }
}

/// Class/vendor descriptors trailing a standard descriptor, in wire order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorChain {
    descriptors: Vec<RawDescriptor>,
}

impl DescriptorChain {
    /// Walk `extra` as length-prefixed records.
    ///
    /// Returns `None` when the records do not exactly cover the buffer, when
    /// a record claims a length shorter than its own header, or when the
    /// buffer holds no records at all.
    pub fn parse(extra: &[u8]) -> Option<Self> {
        let mut descriptors = Vec::new();
        let mut rest = extra;

        while rest.len() >= 2 {
            let length = rest[0] as usize;
            if length < 2 || length > rest.len() {
                return None;
            }
            let (record, tail) = rest.split_at(length);
            descriptors.push(RawDescriptor {
                bytes: record.to_vec(),
            });
            rest = tail;
        }

        if !rest.is_empty() || descriptors.is_empty() {
            return None;
        }

        Some(Self { descriptors })
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RawDescriptor> {
        self.descriptors.iter()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointCaps {
    /// Endpoint number 0..=15, without the direction bit
    pub address: u8,
    pub direction: Direction,
    pub kind: TransferKind,
    pub sync: IsoSync,
    pub usage: IsoUsage,
    pub max_packet_size: u16,
    pub interval: u8,
    pub descriptors: Option<DescriptorChain>,
}

impl EndpointCaps {
    /// The default control pipe
    pub fn endpoint_zero(max_packet_size: u8) -> Self {
        Self {
            address: 0,
            direction: Direction::BOTH,
            kind: TransferKind::Control,
            sync: IsoSync::None,
            usage: IsoUsage::Data,
            max_packet_size: max_packet_size as u16,
            interval: 0,
            descriptors: None,
        }
    }

    /// Descriptor address for the given direction (bit 7 set for IN)
    pub fn wire_address(&self, direction_in: bool) -> u8 {
        if direction_in {
            self.address | 0x80
        } else {
            self.address
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceCaps {
    pub number: u8,
    pub alt_setting: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    /// String index, 0 when absent
    pub description: u8,
    pub descriptors: Option<DescriptorChain>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigCaps {
    pub number: u8,
    /// bmAttributes as found on the wire
    pub attributes: u8,
    /// bMaxPower in 2 mA units
    pub max_power: u8,
    pub description: u8,
    pub descriptors: Option<DescriptorChain>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbString {
    pub index: u8,
    pub text: String,
}

/// Strings of one language, ordered by index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringTable {
    pub language_id: u16,
    pub strings: Vec<UsbString>,
}

impl StringTable {
    pub fn get(&self, index: u8) -> Option<&str> {
        self.strings
            .iter()
            .find(|s| s.index == index)
            .map(|s| s.text.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCaps {
    pub bcd_usb: u16,
    pub bcd_device: u16,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: u8,
    pub product: u8,
    pub serial_number: u8,
    pub string_tables: Vec<StringTable>,
}
