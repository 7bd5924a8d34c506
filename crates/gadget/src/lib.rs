//! Virtual USB gadget contract
//!
//! A gadget mirrors a real device as a tree of configurations, interfaces and
//! endpoints. Each level carries an immutable capability record and a set of
//! operations supplied by whoever backs the gadget. Events arriving from the
//! virtual host controller are dispatched through [`Gadget::handle_event`].

pub mod caps;
pub mod error;
pub mod ops;
pub mod port;
pub mod request;
pub mod tree;

pub use caps::{
    ConfigCaps, DescriptorChain, DeviceCaps, Direction, EndpointCaps, InterfaceCaps, IsoSync,
    IsoUsage, RawDescriptor, Speed, StringTable, TransferKind, UsbString,
};
pub use error::{GadgetError, Result};
pub use ops::{ConfigOps, EndpointOps, GadgetOps, InterfaceOps};
pub use port::{GadgetEvent, VirtualPort};
pub use request::{GadgetRequest, IsoPacket, RequestId, RequestSink, SetupPacket, UrbStatus};
pub use tree::{Gadget, GadgetConfig, GadgetEndpoint, GadgetInterface};
