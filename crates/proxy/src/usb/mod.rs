//! Host USB stack: the boundary traits, descriptor snapshots and the libusb
//! implementation

pub mod descriptors;
pub mod host;
mod libusb;

pub use descriptors::{ConfigDescriptor, DeviceDescriptors, EndpointDescriptor, InterfaceDescriptor};
pub use host::{
    HostCompletion, HostDevice, HostStack, HostStatus, HostTransfer, HostTransferKind,
    HotplugEvent, PortAddress, TransferToken,
};
pub use libusb::LibusbStack;
