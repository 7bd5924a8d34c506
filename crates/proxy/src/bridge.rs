//! Transfer bridge
//!
//! Turns virtual-side requests into asynchronous host transfers and host
//! completions back into finished requests. Every in-flight transfer is
//! recorded in a [`TransferTable`] keyed by a monotonically increasing
//! [`TransferToken`]; a record whose request has been severed is unowned and
//! its completion is only logged.

use std::collections::BTreeMap;
use std::mem;

use gadget::{
    EndpointCaps, EndpointOps, GadgetRequest, RequestId, RequestSink, TransferKind, UrbStatus,
};
use tracing::{debug, trace, warn};

use crate::usb::{HostCompletion, HostDevice, HostStatus, HostTransfer, HostTransferKind, TransferToken};

const SETUP_SIZE: usize = 8;

/// Identifies one bridge (one gadget endpoint) within a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BridgeId(u32);

#[derive(Debug)]
struct TransferRecord {
    bridge: BridgeId,
    kind: TransferKind,
    request: Option<GadgetRequest>,
}

/// In-flight transfers of one device, in submission order
#[derive(Debug, Default)]
pub struct TransferTable {
    records: BTreeMap<TransferToken, TransferRecord>,
    next_token: u64,
    next_bridge: u32,
}

impl TransferTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn register_bridge(&mut self) -> BridgeId {
        let id = BridgeId(self.next_bridge);
        self.next_bridge += 1;
        id
    }

    fn allocate_token(&mut self) -> TransferToken {
        let token = TransferToken(self.next_token);
        self.next_token += 1;
        token
    }

    fn tokens_for(&self, bridge: BridgeId) -> Vec<TransferToken> {
        self.records
            .iter()
            .filter(|(_, record)| record.bridge == bridge && record.request.is_some())
            .map(|(token, _)| *token)
            .collect()
    }

    fn find(&self, bridge: BridgeId, id: RequestId) -> Option<TransferToken> {
        self.records.iter().find_map(|(token, record)| {
            (record.bridge == bridge && record.request.as_ref().is_some_and(|r| r.id == id))
                .then_some(*token)
        })
    }

    /// Transfers still waiting for their completion, owned or not
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Transfers whose request has been severed
    pub fn unowned(&self) -> usize {
        self.records.values().filter(|r| r.request.is_none()).count()
    }
}

/// Per-device state threaded through every gadget operation
pub struct DeviceContext<D> {
    pub host: D,
    pub transfers: TransferTable,
    /// Requests severed by endpoint teardown, waiting to be handed back to
    /// the virtual side
    pub severed: Vec<GadgetRequest>,
}

impl<D: HostDevice> DeviceContext<D> {
    pub fn new(host: D) -> Self {
        Self {
            host,
            transfers: TransferTable::new(),
            severed: Vec::new(),
        }
    }

    /// Hand every severed request back to the virtual side as unlinked
    pub fn return_severed(&mut self, sink: &mut dyn RequestSink) {
        for request in self.severed.drain(..) {
            request.finish_with(UrbStatus::Unlinked, sink);
        }
    }
}

/// Endpoint operations backed by host transfers
#[derive(Debug)]
pub struct TransferBridge {
    id: BridgeId,
    enabled: bool,
}

impl TransferBridge {
    pub fn new(transfers: &mut TransferTable) -> Self {
        Self {
            id: transfers.register_bridge(),
            enabled: false,
        }
    }

    #[cfg(test)]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn cancel_all<D: HostDevice>(&self, ctx: &mut DeviceContext<D>, caps: &EndpointCaps) {
        for token in ctx.transfers.tokens_for(self.id) {
            if let Err(e) = ctx.host.cancel(token) {
                warn!("ep {} cancel {:?}: {}", caps.address, token, e);
            }
        }
    }
}

impl<D: HostDevice> EndpointOps<DeviceContext<D>> for TransferBridge {
    fn enable(&mut self, ctx: &mut DeviceContext<D>, caps: &EndpointCaps, on: bool) {
        debug!("ep {} enable {}", caps.address, on);
        self.enabled = on;
        if !on {
            self.cancel_all(ctx, caps);
        }
    }

    fn enqueue(
        &mut self,
        ctx: &mut DeviceContext<D>,
        caps: &EndpointCaps,
        mut request: GadgetRequest,
        sink: &mut dyn RequestSink,
    ) {
        trace!(
            "ep (addr={}, in={}, type={:?}) enqueue {}",
            caps.address, request.direction_in, caps.kind, request.id
        );
        if !self.enabled {
            debug!("ep {} is disabled, submitting {} anyway", caps.address, request.id);
        }

        let length = request.transfer_length as usize;
        let (kind, buffer) = match caps.kind {
            TransferKind::Control => {
                let mut buffer = Vec::with_capacity(SETUP_SIZE + length);
                buffer.extend_from_slice(&request.setup);
                if request.direction_in {
                    buffer.resize(SETUP_SIZE + length, 0);
                } else {
                    let payload = &request.buffer[..length.min(request.buffer.len())];
                    buffer.extend_from_slice(payload);
                }
                (HostTransferKind::Control, buffer)
            }
            TransferKind::Isochronous => {
                let packet_lengths = request.iso_packets.iter().map(|p| p.length).collect();
                (
                    HostTransferKind::Isochronous { packet_lengths },
                    mem::take(&mut request.buffer),
                )
            }
            TransferKind::Bulk => (HostTransferKind::Bulk, mem::take(&mut request.buffer)),
            TransferKind::Interrupt => {
                (HostTransferKind::Interrupt, mem::take(&mut request.buffer))
            }
        };

        let token = ctx.transfers.allocate_token();
        let transfer = HostTransfer {
            token,
            endpoint: caps.wire_address(request.direction_in),
            kind,
            buffer,
        };

        match ctx.host.submit(transfer) {
            Ok(()) => {
                ctx.transfers.records.insert(
                    token,
                    TransferRecord {
                        bridge: self.id,
                        kind: caps.kind,
                        request: Some(request),
                    },
                );
            }
            Err(e) => {
                warn!(
                    "ep {} submit of request {} failed: {}",
                    caps.address, request.id, e.error
                );
                if caps.kind != TransferKind::Control {
                    request.buffer = e.transfer.buffer;
                }
                request.finish_with(UrbStatus::Error, sink);
            }
        }
    }

    fn dequeue(&mut self, ctx: &mut DeviceContext<D>, caps: &EndpointCaps, id: RequestId) {
        debug!("ep {} dequeue {}", caps.address, id);
        let Some(token) = ctx.transfers.find(self.id, id) else {
            debug!("ep {} request {} is not in flight", caps.address, id);
            return;
        };
        if let Err(e) = ctx.host.cancel(token) {
            warn!("ep {} cancel of request {}: {}", caps.address, id, e);
        }
    }

    fn clear_stall(&mut self, ctx: &mut DeviceContext<D>, caps: &EndpointCaps) -> UrbStatus {
        debug!("ep {} clear stall", caps.address);
        let address = caps.wire_address(caps.direction.is_in() && caps.kind != TransferKind::Control);
        match ctx.host.clear_halt(address) {
            Ok(()) => UrbStatus::Completed,
            Err(e) => {
                warn!("clear_halt({:#04x}): {}", address, e);
                UrbStatus::Stall
            }
        }
    }

    fn destroy(&mut self, ctx: &mut DeviceContext<D>, caps: &EndpointCaps) {
        debug!("ep {} destroy", caps.address);
        for token in ctx.transfers.tokens_for(self.id) {
            if let Some(request) = ctx
                .transfers
                .records
                .get_mut(&token)
                .and_then(|record| record.request.take())
            {
                ctx.severed.push(request);
            }
            if let Err(e) = ctx.host.cancel(token) {
                debug!("ep {} cancel {:?}: {}", caps.address, token, e);
            }
        }
    }
}

/// Map a host transfer status onto a request status
pub fn map_status(status: HostStatus) -> UrbStatus {
    match status {
        HostStatus::Completed => UrbStatus::Completed,
        HostStatus::Error | HostStatus::TimedOut | HostStatus::NoDevice => UrbStatus::Error,
        HostStatus::Cancelled => UrbStatus::Unlinked,
        HostStatus::Stall => UrbStatus::Stall,
        HostStatus::Overflow => UrbStatus::Overflow,
        HostStatus::Unknown(code) => {
            warn!("Unexpected transfer status {}", code);
            UrbStatus::Error
        }
    }
}

/// Process every completion the host device delivered since the last pass
pub fn complete_transfers<D: HostDevice>(ctx: &mut DeviceContext<D>, sink: &mut dyn RequestSink) {
    for completion in ctx.host.drain_completions() {
        let token = completion.token;
        let Some(record) = ctx.transfers.records.remove(&token) else {
            warn!("Completion for unknown transfer {:?}", token);
            continue;
        };

        match record.request {
            None => debug!(
                "unowned transfer {:?} done: {:?}",
                token, completion.status
            ),
            Some(request) => {
                trace!("transfer {} done: {:?}", request.id, completion.status);
                finish_request(record.kind, request, completion, sink);
            }
        }
    }
}

fn finish_request(
    kind: TransferKind,
    mut request: GadgetRequest,
    completion: HostCompletion,
    sink: &mut dyn RequestSink,
) {
    request.status = map_status(completion.status);

    match kind {
        TransferKind::Control => {
            let data = completion.buffer.get(SETUP_SIZE..).unwrap_or_default();
            let mut actual = (completion.actual_length as usize).min(data.len());
            if request.direction_in {
                actual = actual.min(request.buffer.len());
                request.buffer[..actual].copy_from_slice(&data[..actual]);
            }
            request.actual_length = actual as u32;
        }
        TransferKind::Isochronous => {
            request.buffer = completion.buffer;
            for (packet, result) in request.iso_packets.iter_mut().zip(&completion.iso_packets) {
                packet.status = map_status(result.status);
                packet.actual_length = result.actual_length;
            }
            request.actual_length = request.iso_packets.iter().map(|p| p.actual_length).sum();
        }
        TransferKind::Bulk | TransferKind::Interrupt => {
            request.buffer = completion.buffer;
            request.actual_length = completion.actual_length;
        }
    }

    request.finish(sink);
}
