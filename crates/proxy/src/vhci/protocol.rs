//! USB/IP wire protocol
//!
//! The protocol spoken between `vhci_hcd` and the process holding the other
//! end of an attached socket. All integers are big-endian. Every message
//! starts with a 48-byte header: 20 bytes common to all commands followed by
//! a 28-byte command-specific block. Layout follows the kernel's
//! `drivers/usb/usbip/usbip_common.h`.
//!
//! - `vhci_hcd` → us: CMD_SUBMIT (plus OUT data and iso descriptors),
//!   CMD_UNLINK
//! - us → `vhci_hcd`: RET_SUBMIT (plus IN data and iso descriptors),
//!   RET_UNLINK

use std::io::{self, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

pub const HEADER_SIZE: usize = 48;
pub const ISO_DESCRIPTOR_SIZE: usize = 16;

pub const DIR_OUT: u32 = 0;
pub const DIR_IN: u32 = 1;

/// Upper bound on a single transfer buffer accepted from the kernel
const MAX_TRANSFER: u32 = 16 * 1024 * 1024;
/// Upper bound on iso packets per request
const MAX_ISO_PACKETS: u32 = 1024;

/// USB/IP command codes
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbIpCommand {
    CmdSubmit = 0x0001,
    CmdUnlink = 0x0002,
    RetSubmit = 0x0003,
    RetUnlink = 0x0004,
}

impl UsbIpCommand {
    pub fn from_u32(value: u32) -> io::Result<Self> {
        match value {
            0x0001 => Ok(Self::CmdSubmit),
            0x0002 => Ok(Self::CmdUnlink),
            0x0003 => Ok(Self::RetSubmit),
            0x0004 => Ok(Self::RetUnlink),
            _ => Err(invalid(format!("unknown USB/IP command {:#06x}", value))),
        }
    }
}

fn invalid(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

/// Fields shared by every message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsbIpHeader {
    pub command: UsbIpCommand,
    pub seqnum: u32,
    pub devid: u32,
    pub direction: u32,
    pub ep: u32,
}

impl UsbIpHeader {
    pub fn new(command: UsbIpCommand, seqnum: u32, devid: u32) -> Self {
        Self {
            command,
            seqnum,
            devid,
            direction: DIR_OUT,
            ep: 0,
        }
    }

    fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        let command = UsbIpCommand::from_u32(reader.read_u32::<BigEndian>()?)?;
        Ok(Self {
            command,
            seqnum: reader.read_u32::<BigEndian>()?,
            devid: reader.read_u32::<BigEndian>()?,
            direction: reader.read_u32::<BigEndian>()?,
            ep: reader.read_u32::<BigEndian>()?,
        })
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_u32::<BigEndian>(self.command as u32)?;
        writer.write_u32::<BigEndian>(self.seqnum)?;
        writer.write_u32::<BigEndian>(self.devid)?;
        writer.write_u32::<BigEndian>(self.direction)?;
        writer.write_u32::<BigEndian>(self.ep)
    }
}

/// CMD_SUBMIT block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdSubmit {
    pub transfer_flags: u32,
    pub transfer_buffer_length: u32,
    pub start_frame: i32,
    /// Zero or -1 for anything but isochronous
    pub number_of_packets: i32,
    pub interval: i32,
    pub setup: [u8; 8],
}

impl CmdSubmit {
    fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        let transfer_flags = reader.read_u32::<BigEndian>()?;
        let transfer_buffer_length = reader.read_u32::<BigEndian>()?;
        let start_frame = reader.read_i32::<BigEndian>()?;
        let number_of_packets = reader.read_i32::<BigEndian>()?;
        let interval = reader.read_i32::<BigEndian>()?;
        let mut setup = [0u8; 8];
        reader.read_exact(&mut setup)?;
        Ok(Self {
            transfer_flags,
            transfer_buffer_length,
            start_frame,
            number_of_packets,
            interval,
            setup,
        })
    }

    #[cfg(test)]
    fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_u32::<BigEndian>(self.transfer_flags)?;
        writer.write_u32::<BigEndian>(self.transfer_buffer_length)?;
        writer.write_i32::<BigEndian>(self.start_frame)?;
        writer.write_i32::<BigEndian>(self.number_of_packets)?;
        writer.write_i32::<BigEndian>(self.interval)?;
        writer.write_all(&self.setup)
    }

    fn iso_packets(&self) -> io::Result<usize> {
        match self.number_of_packets {
            n if n <= 0 => Ok(0),
            n if n as u32 > MAX_ISO_PACKETS => {
                Err(invalid(format!("{} iso packets requested", n)))
            }
            n => Ok(n as usize),
        }
    }
}

/// RET_SUBMIT block
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetSubmit {
    /// Zero or a negative errno
    pub status: i32,
    pub actual_length: u32,
    pub start_frame: i32,
    pub number_of_packets: i32,
    pub error_count: i32,
}

impl RetSubmit {
    #[cfg(test)]
    fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        let ret = Self {
            status: reader.read_i32::<BigEndian>()?,
            actual_length: reader.read_u32::<BigEndian>()?,
            start_frame: reader.read_i32::<BigEndian>()?,
            number_of_packets: reader.read_i32::<BigEndian>()?,
            error_count: reader.read_i32::<BigEndian>()?,
        };
        let mut padding = [0u8; 8];
        reader.read_exact(&mut padding)?;
        Ok(ret)
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_i32::<BigEndian>(self.status)?;
        writer.write_u32::<BigEndian>(self.actual_length)?;
        writer.write_i32::<BigEndian>(self.start_frame)?;
        writer.write_i32::<BigEndian>(self.number_of_packets)?;
        writer.write_i32::<BigEndian>(self.error_count)?;
        writer.write_all(&[0u8; 8])
    }
}

/// Per-packet descriptor trailing an isochronous submit or return
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IsoPacketDescriptor {
    pub offset: u32,
    pub length: u32,
    pub actual_length: u32,
    pub status: i32,
}

impl IsoPacketDescriptor {
    fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        Ok(Self {
            offset: reader.read_u32::<BigEndian>()?,
            length: reader.read_u32::<BigEndian>()?,
            actual_length: reader.read_u32::<BigEndian>()?,
            status: reader.read_i32::<BigEndian>()?,
        })
    }

    fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_u32::<BigEndian>(self.offset)?;
        writer.write_u32::<BigEndian>(self.length)?;
        writer.write_u32::<BigEndian>(self.actual_length)?;
        writer.write_i32::<BigEndian>(self.status)
    }
}

/// A fully read command from `vhci_hcd`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Submit {
        header: UsbIpHeader,
        submit: CmdSubmit,
        /// OUT payload; empty for IN
        data: Vec<u8>,
        iso: Vec<IsoPacketDescriptor>,
    },
    Unlink {
        header: UsbIpHeader,
        /// Sequence number of the submit to cancel
        target: u32,
    },
}

/// Read one command, payload included
pub fn read_command<R: Read>(reader: &mut R) -> io::Result<Command> {
    let header = UsbIpHeader::read_from(reader)?;
    if header.direction > DIR_IN {
        return Err(invalid(format!("bad direction {}", header.direction)));
    }
    match header.command {
        UsbIpCommand::CmdSubmit => {
            let submit = CmdSubmit::read_from(reader)?;
            if submit.transfer_buffer_length > MAX_TRANSFER {
                return Err(invalid(format!(
                    "transfer of {} bytes requested",
                    submit.transfer_buffer_length
                )));
            }
            let mut data = Vec::new();
            if header.direction == DIR_OUT {
                data.resize(submit.transfer_buffer_length as usize, 0);
                reader.read_exact(&mut data)?;
            }
            let iso = (0..submit.iso_packets()?)
                .map(|_| IsoPacketDescriptor::read_from(reader))
                .collect::<io::Result<Vec<_>>>()?;
            Ok(Command::Submit {
                header,
                submit,
                data,
                iso,
            })
        }
        UsbIpCommand::CmdUnlink => {
            let target = reader.read_u32::<BigEndian>()?;
            let mut padding = [0u8; 24];
            reader.read_exact(&mut padding)?;
            Ok(Command::Unlink { header, target })
        }
        other => Err(invalid(format!("unexpected {:?} from vhci_hcd", other))),
    }
}

/// Encode a submit command; the kernel's side of the exchange
#[cfg(test)]
pub fn write_submit<W: Write>(
    writer: &mut W,
    header: &UsbIpHeader,
    submit: &CmdSubmit,
    data: &[u8],
    iso: &[IsoPacketDescriptor],
) -> io::Result<()> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + data.len() + iso.len() * ISO_DESCRIPTOR_SIZE);
    header.write_to(&mut buf)?;
    submit.write_to(&mut buf)?;
    buf.extend_from_slice(data);
    for desc in iso {
        desc.write_to(&mut buf)?;
    }
    writer.write_all(&buf)
}

/// Encode an unlink command; the kernel's side of the exchange
#[cfg(test)]
pub fn write_unlink<W: Write>(writer: &mut W, header: &UsbIpHeader, target: u32) -> io::Result<()> {
    let mut buf = Vec::with_capacity(HEADER_SIZE);
    header.write_to(&mut buf)?;
    buf.write_u32::<BigEndian>(target)?;
    buf.extend_from_slice(&[0u8; 24]);
    writer.write_all(&buf)
}

/// Send a RET_SUBMIT with its IN data and iso descriptors as one write
pub fn write_ret_submit<W: Write>(
    writer: &mut W,
    seqnum: u32,
    devid: u32,
    ret: &RetSubmit,
    data: &[u8],
    iso: &[IsoPacketDescriptor],
) -> io::Result<()> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + data.len() + iso.len() * ISO_DESCRIPTOR_SIZE);
    UsbIpHeader::new(UsbIpCommand::RetSubmit, seqnum, devid).write_to(&mut buf)?;
    ret.write_to(&mut buf)?;
    buf.extend_from_slice(data);
    for desc in iso {
        desc.write_to(&mut buf)?;
    }
    writer.write_all(&buf)
}

pub fn write_ret_unlink<W: Write>(
    writer: &mut W,
    seqnum: u32,
    devid: u32,
    status: i32,
) -> io::Result<()> {
    let mut buf = Vec::with_capacity(HEADER_SIZE);
    UsbIpHeader::new(UsbIpCommand::RetUnlink, seqnum, devid).write_to(&mut buf)?;
    buf.write_i32::<BigEndian>(status)?;
    buf.extend_from_slice(&[0u8; 24]);
    writer.write_all(&buf)
}

/// A reply read back, as `vhci_hcd` would see it
#[cfg(test)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Submit {
        header: UsbIpHeader,
        ret: RetSubmit,
        data: Vec<u8>,
        iso: Vec<IsoPacketDescriptor>,
    },
    Unlink {
        header: UsbIpHeader,
        status: i32,
    },
}

/// Read one reply. IN data is sized by the RET_SUBMIT actual length, so the
/// caller says whether the original request was IN.
#[cfg(test)]
pub fn read_reply<R: Read>(reader: &mut R, direction_in: bool) -> io::Result<Reply> {
    let header = UsbIpHeader::read_from(reader)?;
    match header.command {
        UsbIpCommand::RetSubmit => {
            let ret = RetSubmit::read_from(reader)?;
            let mut data = Vec::new();
            if direction_in {
                data.resize(ret.actual_length as usize, 0);
                reader.read_exact(&mut data)?;
            }
            let iso = (0..ret.number_of_packets.max(0))
                .map(|_| IsoPacketDescriptor::read_from(reader))
                .collect::<io::Result<Vec<_>>>()?;
            Ok(Reply::Submit {
                header,
                ret,
                data,
                iso,
            })
        }
        UsbIpCommand::RetUnlink => {
            let status = reader.read_i32::<BigEndian>()?;
            let mut padding = [0u8; 24];
            reader.read_exact(&mut padding)?;
            Ok(Reply::Unlink { header, status })
        }
        other => Err(invalid(format!("unexpected {:?} reply", other))),
    }
}
