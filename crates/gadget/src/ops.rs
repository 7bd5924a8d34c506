//! Operations backing each level of a gadget
//!
//! Every call receives the per-device context `C` owned by whoever drives
//! the gadget, so implementations can share device state without interior
//! mutability.

use crate::caps::{ConfigCaps, EndpointCaps, InterfaceCaps};
use crate::request::{GadgetRequest, RequestId, RequestSink, UrbStatus};

pub trait EndpointOps<C> {
    /// Start or stop carrying traffic. Stopping cancels in-flight requests;
    /// their completions arrive later.
    fn enable(&mut self, ctx: &mut C, caps: &EndpointCaps, on: bool);

    /// Take ownership of a request. The request must eventually be handed
    /// back through `sink`, either before returning (submission failure) or
    /// from a later completion pass.
    fn enqueue(
        &mut self,
        ctx: &mut C,
        caps: &EndpointCaps,
        request: GadgetRequest,
        sink: &mut dyn RequestSink,
    );

    /// Ask for an in-flight request to be cancelled. Never completes it
    /// synchronously.
    fn dequeue(&mut self, ctx: &mut C, caps: &EndpointCaps, id: RequestId);

    fn clear_stall(&mut self, ctx: &mut C, caps: &EndpointCaps) -> UrbStatus;

    fn destroy(&mut self, ctx: &mut C, caps: &EndpointCaps);
}

pub trait InterfaceOps<C> {
    fn enable(&mut self, ctx: &mut C, caps: &InterfaceCaps, on: bool);

    fn destroy(&mut self, _ctx: &mut C, _caps: &InterfaceCaps) {}
}

pub trait ConfigOps<C> {
    fn enable(&mut self, ctx: &mut C, caps: &ConfigCaps, on: bool);

    fn destroy(&mut self, _ctx: &mut C, _caps: &ConfigCaps) {}
}

pub trait GadgetOps<C> {
    /// Called twice per bus reset: `starting` first, then finished
    fn reset(&mut self, ctx: &mut C, starting: bool);

    fn power(&mut self, ctx: &mut C, on: bool);

    fn set_address(&mut self, ctx: &mut C, address: u16);

    fn destroy(&mut self, _ctx: &mut C) {}
}
