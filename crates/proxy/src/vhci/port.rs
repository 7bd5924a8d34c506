//! One `vhci_hcd` port carrying one gadget

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use gadget::{
    GadgetError, GadgetEvent, GadgetRequest, IsoPacket, RequestId, RequestSink, Speed, UrbStatus,
    VirtualPort,
};
use nix::errno::Errno;
use tracing::{debug, trace, warn};

use super::protocol::{
    self, Command, DIR_IN, IsoPacketDescriptor, RetSubmit, write_ret_submit, write_ret_unlink,
};

/// USB/IP status for a finished request
pub fn urb_errno(status: UrbStatus) -> i32 {
    match status {
        UrbStatus::Completed => 0,
        UrbStatus::Error => -(Errno::EIO as i32),
        UrbStatus::Unlinked => -(Errno::ECONNRESET as i32),
        UrbStatus::Stall => -(Errno::EPIPE as i32),
        UrbStatus::Overflow => -(Errno::EOVERFLOW as i32),
    }
}

/// `vhci_hcd` speed code
pub fn speed_code(speed: Speed) -> u8 {
    match speed {
        Speed::Low => 1,
        Speed::Full => 2,
        Speed::High => 3,
    }
}

fn write_sysfs(path: &Path, line: &str) -> io::Result<()> {
    debug!("Writing to {}: {}", path.display(), line.trim());
    let mut file = OpenOptions::new().write(true).open(path)?;
    file.write_all(line.as_bytes())?;
    file.flush()
}

/// A request handed to the gadget and not yet answered
#[derive(Debug, Clone, Copy)]
struct Outstanding {
    endpoint: u8,
    direction_in: bool,
    /// Sequence number of a CMD_UNLINK waiting for this request
    unlink: Option<u32>,
}

pub struct VhciPort {
    sysfs: PathBuf,
    port: u8,
    devid: u32,
    bus: Option<u8>,
    socket: Option<UnixStream>,
    outstanding: HashMap<u32, Outstanding>,
    /// First failed reply; reported by the next fetch
    write_error: Option<io::Error>,
}

impl VhciPort {
    pub(crate) fn new(sysfs: PathBuf, port: u8, bus: Option<u8>) -> Self {
        Self {
            sysfs,
            port,
            devid: ((u32::from(port) + 1) << 16) | 1,
            bus,
            socket: None,
            outstanding: HashMap::new(),
            write_error: None,
        }
    }

    fn send(&mut self, seqnum: u32, encode: impl FnOnce(&mut UnixStream) -> io::Result<()>) {
        let Some(socket) = self.socket.as_mut() else {
            debug!("port {}: reply to #{} after detach dropped", self.port, seqnum);
            return;
        };
        if let Err(e) = encode(socket) {
            warn!("port {}: reply to #{} failed: {}", self.port, seqnum, e);
            self.write_error.get_or_insert(e);
        }
    }

    fn submit_event(
        &mut self,
        header: protocol::UsbIpHeader,
        submit: protocol::CmdSubmit,
        data: Vec<u8>,
        iso: Vec<IsoPacketDescriptor>,
    ) -> GadgetEvent {
        let direction_in = header.direction == DIR_IN;
        let endpoint = (header.ep & 0x0f) as u8;
        let length = submit.transfer_buffer_length;
        trace!(
            "port {}: submit #{} ep {} in={} len={} flags={:#x} interval={} frame={}",
            self.port,
            header.seqnum,
            endpoint,
            direction_in,
            length,
            submit.transfer_flags,
            submit.interval,
            submit.start_frame
        );
        if header.devid != self.devid {
            debug!(
                "port {}: submit #{} for devid {:#x}, expected {:#x}",
                self.port, header.seqnum, header.devid, self.devid
            );
        }

        self.outstanding.insert(
            header.seqnum,
            Outstanding {
                endpoint,
                direction_in,
                unlink: None,
            },
        );

        GadgetEvent::Submit(GadgetRequest {
            id: RequestId(header.seqnum),
            endpoint,
            direction_in,
            setup: submit.setup,
            transfer_length: length,
            buffer: if direction_in {
                vec![0; length as usize]
            } else {
                data
            },
            iso_packets: iso
                .iter()
                .map(|d| IsoPacket {
                    offset: d.offset,
                    length: d.length,
                    ..Default::default()
                })
                .collect(),
            status: UrbStatus::Completed,
            actual_length: 0,
        })
    }

    fn unlink_event(&mut self, seqnum: u32, target: u32) -> Option<GadgetEvent> {
        match self.outstanding.get_mut(&target) {
            Some(entry) => {
                debug!("port {}: unlink #{} (by #{})", self.port, target, seqnum);
                entry.unlink = Some(seqnum);
                Some(GadgetEvent::Unlink {
                    id: RequestId(target),
                    endpoint: entry.endpoint,
                    direction_in: entry.direction_in,
                })
            }
            None => {
                debug!("port {}: unlink of finished #{}", self.port, target);
                let devid = self.devid;
                self.send(seqnum, |s| write_ret_unlink(s, seqnum, devid, 0));
                None
            }
        }
    }
}

/// IN payload as the wire carries it; isochronous packets are packed back to
/// back by actual length
fn reply_data(request: &GadgetRequest) -> Vec<u8> {
    if !request.direction_in {
        return Vec::new();
    }
    if request.iso_packets.is_empty() {
        let len = (request.actual_length as usize).min(request.buffer.len());
        return request.buffer[..len].to_vec();
    }
    let mut data = Vec::with_capacity(request.actual_length as usize);
    for packet in &request.iso_packets {
        let start = (packet.offset as usize).min(request.buffer.len());
        let end = (start + packet.actual_length as usize).min(request.buffer.len());
        data.extend_from_slice(&request.buffer[start..end]);
    }
    data
}

impl RequestSink for VhciPort {
    fn complete(&mut self, request: &GadgetRequest) {
        let seqnum = request.id.0;
        let devid = self.devid;
        trace!(
            "port {}: complete {} {:?} len={}",
            self.port, request.id, request.status, request.actual_length
        );

        let unlink = self.outstanding.remove(&seqnum).and_then(|o| o.unlink);
        if let Some(unlink_seqnum) = unlink {
            let status = urb_errno(UrbStatus::Unlinked);
            self.send(unlink_seqnum, |s| {
                write_ret_unlink(s, unlink_seqnum, devid, status)
            });
            return;
        }

        let iso: Vec<IsoPacketDescriptor> = request
            .iso_packets
            .iter()
            .map(|p| IsoPacketDescriptor {
                offset: p.offset,
                length: p.length,
                actual_length: p.actual_length,
                status: urb_errno(p.status),
            })
            .collect();
        let ret = RetSubmit {
            status: urb_errno(request.status),
            actual_length: request.actual_length,
            start_frame: 0,
            number_of_packets: iso.len() as i32,
            error_count: request
                .iso_packets
                .iter()
                .filter(|p| p.status != UrbStatus::Completed)
                .count() as i32,
        };
        let data = reply_data(request);
        self.send(seqnum, |s| write_ret_submit(s, seqnum, devid, &ret, &data, &iso));
    }
}

impl VirtualPort for VhciPort {
    fn bus_number(&self) -> Option<u8> {
        self.bus
    }

    fn attach(&mut self, speed: Speed) -> gadget::Result<()> {
        let (ours, theirs) = UnixStream::pair()?;
        let line = format!(
            "{} {} {} {}\n",
            self.port,
            theirs.as_raw_fd(),
            self.devid,
            speed_code(speed)
        );
        write_sysfs(&self.sysfs.join("attach"), &line)?;
        // The kernel holds its own reference to the socket now
        drop(theirs);

        self.outstanding.clear();
        self.write_error = None;
        self.socket = Some(ours);
        Ok(())
    }

    fn detach(&mut self) -> gadget::Result<()> {
        if self.socket.take().is_none() {
            return Err(GadgetError::NotAttached);
        }
        if !self.outstanding.is_empty() {
            debug!(
                "port {}: {} requests dropped at detach",
                self.port,
                self.outstanding.len()
            );
        }
        self.outstanding.clear();
        write_sysfs(&self.sysfs.join("detach"), &format!("{}\n", self.port))?;
        Ok(())
    }

    fn wait_fd(&self) -> Option<RawFd> {
        self.socket.as_ref().map(|s| s.as_raw_fd())
    }

    fn fetch_event(&mut self) -> gadget::Result<Option<GadgetEvent>> {
        if let Some(e) = self.write_error.take() {
            return Err(e.into());
        }
        let Some(socket) = self.socket.as_mut() else {
            return Ok(None);
        };

        match protocol::read_command(socket)? {
            Command::Submit {
                header,
                submit,
                data,
                iso,
            } => Ok(Some(self.submit_event(header, submit, data, iso))),
            Command::Unlink { header, target } => Ok(self.unlink_event(header.seqnum, target)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vhci::protocol::{
        CmdSubmit, DIR_OUT, Reply, UsbIpCommand, UsbIpHeader, read_reply, write_submit,
        write_unlink,
    };
    use std::fs;
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        sysfs: PathBuf,
        port: VhciPort,
        kernel: UnixStream,
    }

    /// An attached port whose kernel end is replaced by a socket we hold
    fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let sysfs = dir.path().to_path_buf();
        fs::write(sysfs.join("attach"), "").unwrap();
        fs::write(sysfs.join("detach"), "").unwrap();

        let mut port = VhciPort::new(sysfs.clone(), 2, Some(7));
        port.attach(Speed::Full).unwrap();
        let (ours, kernel) = UnixStream::pair().unwrap();
        port.socket = Some(ours);

        Harness {
            _dir: dir,
            sysfs,
            port,
            kernel,
        }
    }

    fn submit_header(seqnum: u32, ep: u32, direction: u32) -> UsbIpHeader {
        UsbIpHeader {
            command: UsbIpCommand::CmdSubmit,
            seqnum,
            devid: 0,
            direction,
            ep,
        }
    }

    fn bulk(length: u32) -> CmdSubmit {
        CmdSubmit {
            transfer_flags: 0,
            transfer_buffer_length: length,
            start_frame: 0,
            number_of_packets: 0,
            interval: 0,
            setup: [0; 8],
        }
    }

    fn fetch_submit(h: &mut Harness) -> GadgetRequest {
        match h.port.fetch_event().unwrap() {
            Some(GadgetEvent::Submit(request)) => request,
            other => panic!("expected submit, got {:?}", other),
        }
    }

    #[test]
    fn test_attach_writes_port_fd_devid_speed() {
        let h = harness();

        let line = fs::read_to_string(h.sysfs.join("attach")).unwrap();
        let fields: Vec<&str> = line.split_whitespace().collect();
        assert_eq!(fields.len(), 4);
        assert_eq!(fields[0], "2");
        assert!(fields[1].parse::<i32>().unwrap() >= 0);
        assert_eq!(fields[2], ((3u32 << 16) | 1).to_string());
        assert_eq!(fields[3], "2");
        assert!(h.port.wait_fd().is_some());
    }

    #[test]
    fn test_detach_writes_port_and_drops_socket() {
        let mut h = harness();

        h.port.detach().unwrap();

        assert_eq!(fs::read_to_string(h.sysfs.join("detach")).unwrap(), "2\n");
        assert!(h.port.wait_fd().is_none());
        assert!(matches!(h.port.detach(), Err(GadgetError::NotAttached)));
    }

    #[test]
    fn test_attach_without_sysfs_fails() {
        let dir = TempDir::new().unwrap();
        let mut port = VhciPort::new(dir.path().to_path_buf(), 0, None);

        assert!(port.attach(Speed::High).is_err());
        assert!(port.wait_fd().is_none());
    }

    #[test]
    fn test_in_submit_round_trip() {
        let mut h = harness();
        write_submit(&mut h.kernel, &submit_header(5, 0x81, DIR_IN), &bulk(8), &[], &[]).unwrap();

        let mut request = fetch_submit(&mut h);
        assert_eq!(request.id, RequestId(5));
        assert_eq!(request.endpoint, 1);
        assert!(request.direction_in);
        assert_eq!(request.buffer.len(), 8);

        request.buffer[..3].copy_from_slice(b"abc");
        request.actual_length = 3;
        request.finish(&mut h.port);

        let reply = read_reply(&mut h.kernel, true).unwrap();
        let Reply::Submit { header, ret, data, .. } = reply else {
            panic!("expected ret submit");
        };
        assert_eq!(header.seqnum, 5);
        assert_eq!(ret.status, 0);
        assert_eq!(ret.actual_length, 3);
        assert_eq!(data, b"abc");
    }

    #[test]
    fn test_out_submit_carries_data_and_replies_without_payload() {
        let mut h = harness();
        write_submit(&mut h.kernel, &submit_header(6, 2, DIR_OUT), &bulk(4), b"wxyz", &[]).unwrap();

        let mut request = fetch_submit(&mut h);
        assert!(!request.direction_in);
        assert_eq!(request.buffer, b"wxyz");

        request.actual_length = 4;
        request.finish_with(UrbStatus::Stall, &mut h.port);

        let Reply::Submit { ret, data, .. } = read_reply(&mut h.kernel, false).unwrap() else {
            panic!("expected ret submit");
        };
        assert_eq!(ret.status, -32);
        assert!(data.is_empty());
    }

    #[test]
    fn test_unlink_pending_request_answers_with_ret_unlink() {
        let mut h = harness();
        write_submit(&mut h.kernel, &submit_header(10, 0x81, DIR_IN), &bulk(8), &[], &[]).unwrap();
        let request = fetch_submit(&mut h);

        write_unlink(&mut h.kernel, &UsbIpHeader::new(UsbIpCommand::CmdUnlink, 11, 0), 10).unwrap();
        match h.port.fetch_event().unwrap() {
            Some(GadgetEvent::Unlink {
                id,
                endpoint,
                direction_in,
            }) => {
                assert_eq!(id, RequestId(10));
                assert_eq!(endpoint, 1);
                assert!(direction_in);
            }
            other => panic!("expected unlink, got {:?}", other),
        }

        request.finish_with(UrbStatus::Unlinked, &mut h.port);

        assert_eq!(
            read_reply(&mut h.kernel, true).unwrap(),
            Reply::Unlink {
                header: UsbIpHeader::new(UsbIpCommand::RetUnlink, 11, (3 << 16) | 1),
                status: -104
            }
        );
    }

    #[test]
    fn test_unlink_of_unknown_request_is_answered_immediately() {
        let mut h = harness();
        write_unlink(&mut h.kernel, &UsbIpHeader::new(UsbIpCommand::CmdUnlink, 20, 0), 99).unwrap();

        assert!(h.port.fetch_event().unwrap().is_none());

        let Reply::Unlink { header, status } = read_reply(&mut h.kernel, false).unwrap() else {
            panic!("expected ret unlink");
        };
        assert_eq!(header.seqnum, 20);
        assert_eq!(status, 0);
    }

    #[test]
    fn test_iso_in_data_is_packed() {
        let mut h = harness();
        let mut submit = bulk(8);
        submit.number_of_packets = 2;
        let iso = [
            IsoPacketDescriptor {
                offset: 0,
                length: 4,
                ..Default::default()
            },
            IsoPacketDescriptor {
                offset: 4,
                length: 4,
                ..Default::default()
            },
        ];
        write_submit(&mut h.kernel, &submit_header(30, 0x83, DIR_IN), &submit, &[], &iso).unwrap();

        let mut request = fetch_submit(&mut h);
        assert_eq!(request.iso_packets.len(), 2);
        request.buffer = b"ab--cdef".to_vec();
        request.iso_packets[0].actual_length = 2;
        request.iso_packets[1].actual_length = 4;
        request.iso_packets[1].status = UrbStatus::Error;
        request.actual_length = 6;
        request.finish(&mut h.port);

        let Reply::Submit { ret, data, iso, .. } = read_reply(&mut h.kernel, true).unwrap() else {
            panic!("expected ret submit");
        };
        assert_eq!(data, b"abcdef");
        assert_eq!(ret.number_of_packets, 2);
        assert_eq!(ret.error_count, 1);
        assert_eq!(iso[1].status, -5);
        assert_eq!(iso[1].offset, 4);
    }

    #[test]
    fn test_closed_socket_is_a_fetch_error() {
        let mut h = harness();
        drop(h.kernel);

        assert!(matches!(h.port.fetch_event(), Err(GadgetError::Io(_))));
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(urb_errno(UrbStatus::Completed), 0);
        assert_eq!(urb_errno(UrbStatus::Error), -5);
        assert_eq!(urb_errno(UrbStatus::Unlinked), -104);
        assert_eq!(urb_errno(UrbStatus::Stall), -32);
        assert_eq!(urb_errno(UrbStatus::Overflow), -75);
        assert_eq!(speed_code(Speed::Low), 1);
        assert_eq!(speed_code(Speed::High), 3);
    }
}
