//! Virtual host controller port

use std::os::fd::RawFd;

use crate::caps::Speed;
use crate::error::Result;
use crate::request::{GadgetRequest, RequestId, RequestSink};

/// One event fetched from a virtual port
#[derive(Debug)]
pub enum GadgetEvent {
    /// A new transfer request
    Submit(GadgetRequest),
    /// Cancel a previously submitted request
    Unlink {
        id: RequestId,
        endpoint: u8,
        direction_in: bool,
    },
}

/// One port of a virtual host controller, able to carry one gadget at a time
pub trait VirtualPort: RequestSink {
    /// Bus number the virtual controller shows up as on the host, if known
    fn bus_number(&self) -> Option<u8>;

    /// Plug a device in at `speed`
    fn attach(&mut self, speed: Speed) -> Result<()>;

    /// Unplug the current device
    fn detach(&mut self) -> Result<()>;

    /// Descriptor that becomes readable when an event is pending; `None`
    /// while detached
    fn wait_fd(&self) -> Option<RawFd>;

    /// Read exactly one event. `Ok(None)` means the descriptor woke without
    /// a complete event to deliver.
    fn fetch_event(&mut self) -> Result<Option<GadgetEvent>>;
}
