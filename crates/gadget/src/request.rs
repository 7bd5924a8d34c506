//! Requests issued by the virtual host controller

use std::fmt;

/// Identifier the virtual host controller assigned to a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u32);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Final status of a request (or of one isochronous packet)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum UrbStatus {
    #[default]
    Completed,
    Error,
    Unlinked,
    Stall,
    Overflow,
}

/// Decoded 8-byte control setup packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub fn from_bytes(bytes: &[u8; 8]) -> Self {
        Self {
            request_type: bytes[0],
            request: bytes[1],
            value: u16::from_le_bytes([bytes[2], bytes[3]]),
            index: u16::from_le_bytes([bytes[4], bytes[5]]),
            length: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = self.length.to_le_bytes();
        [
            self.request_type,
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }

    /// Device-to-host data stage
    pub fn is_in(&self) -> bool {
        self.request_type & 0x80 != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IsoPacket {
    /// Offset of this packet inside the request buffer
    pub offset: u32,
    pub length: u32,
    pub actual_length: u32,
    pub status: UrbStatus,
}

/// A transfer request from the virtual host controller.
///
/// For OUT requests `buffer` holds the payload; for IN requests it is sized
/// to the requested length and filled on completion. The request is consumed
/// by [`GadgetRequest::finish`], so it can be completed at most once.
#[derive(Debug)]
pub struct GadgetRequest {
    pub id: RequestId,
    /// Endpoint number without direction bit
    pub endpoint: u8,
    pub direction_in: bool,
    pub setup: [u8; 8],
    pub transfer_length: u32,
    pub buffer: Vec<u8>,
    pub iso_packets: Vec<IsoPacket>,
    pub status: UrbStatus,
    pub actual_length: u32,
}

impl GadgetRequest {
    pub fn setup_packet(&self) -> SetupPacket {
        SetupPacket::from_bytes(&self.setup)
    }

    /// Report the request to the virtual side and release it
    pub fn finish(self, sink: &mut dyn RequestSink) {
        sink.complete(&self);
        sink.destroy(self);
    }

    /// Finish with `status` and no data transferred
    pub fn finish_with(mut self, status: UrbStatus, sink: &mut dyn RequestSink) {
        self.status = status;
        self.actual_length = 0;
        self.finish(sink);
    }
}

/// Receiver for finished requests
pub trait RequestSink {
    /// Deliver the request's result to the virtual host controller
    fn complete(&mut self, request: &GadgetRequest);

    /// Release the request; always follows exactly one `complete`
    fn destroy(&mut self, request: GadgetRequest) {
        drop(request);
    }
}
