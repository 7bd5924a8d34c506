//! USB/IP virtual host controller (`vhci_hcd`)
//!
//! The kernel exposes each controller under
//! `/sys/devices/platform/vhci_hcd[.N]`:
//!
//! - `attach`: `<port> <sockfd> <devid> <speed>` plugs a device in
//! - `detach`: `<port>` unplugs it
//! - `status`: one line per port, `sta` 004 meaning free
//!
//! Ports 0-7 of an instance are the USB 2.0 ports.

pub mod port;
pub mod protocol;

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::{ProxyError, Result};

pub use port::VhciPort;

const PLATFORM_DIR: &str = "/sys/devices/platform";

/// USB 2.0 ports per `vhci_hcd` instance
pub const HS_PORTS: usize = 8;

/// `sta` value of an unused port
const PORT_FREE: u32 = 4;

#[derive(Debug, Clone)]
pub struct VhciBus {
    path: PathBuf,
    bus_number: Option<u8>,
}

impl VhciBus {
    /// Use `explicit` if given, otherwise search the platform devices
    pub fn locate(explicit: Option<&Path>) -> Result<Self> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => Self::find_in(Path::new(PLATFORM_DIR))?,
        };
        Self::at(path)
    }

    /// Find `vhci_hcd.0`..`vhci_hcd.7` or plain `vhci_hcd` under `platform`
    fn find_in(platform: &Path) -> Result<PathBuf> {
        let numbered = (0..8).map(|i| platform.join(format!("vhci_hcd.{}", i)));
        std::iter::once(platform.join("vhci_hcd"))
            .chain(numbered)
            .find(|p| p.join("attach").exists())
            .ok_or_else(|| {
                ProxyError::Vhci(
                    "vhci_hcd not found. Please load the kernel module: sudo modprobe vhci-hcd"
                        .to_string(),
                )
            })
    }

    fn at(path: PathBuf) -> Result<Self> {
        if !path.join("attach").exists() {
            return Err(ProxyError::Vhci(format!(
                "{} has no attach file",
                path.display()
            )));
        }
        let bus_number = read_bus_number(&path);
        match bus_number {
            Some(bus) => info!("Found vhci_hcd at {} (bus {})", path.display(), bus),
            None => warn!(
                "Found vhci_hcd at {} but not its bus number; hot-plug will not skip it",
                path.display()
            ),
        }
        Ok(Self { path, bus_number })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Hand out the port for slot `index`, which must be free
    pub fn open_port(&self, index: usize) -> Result<VhciPort> {
        if index >= HS_PORTS {
            return Err(ProxyError::Vhci(format!(
                "port {} out of range (0-{})",
                index,
                HS_PORTS - 1
            )));
        }
        match self.read_status() {
            Ok(status) => {
                if let Some(sta) = port_state(&status, index as u32)
                    && sta != PORT_FREE
                {
                    return Err(ProxyError::Vhci(format!(
                        "port {} is in use (status {:03})",
                        index, sta
                    )));
                }
            }
            Err(e) => debug!("No vhci_hcd status available: {}", e),
        }
        Ok(VhciPort::new(self.path.clone(), index as u8, self.bus_number))
    }

    fn read_status(&self) -> std::io::Result<String> {
        fs::read_to_string(self.path.join("status"))
    }
}

/// Lowest `usbN` child: the USB 2.0 root hub
fn read_bus_number(path: &Path) -> Option<u8> {
    fs::read_dir(path)
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            entry
                .file_name()
                .to_str()?
                .strip_prefix("usb")?
                .parse::<u8>()
                .ok()
        })
        .min()
}

/// `sta` of a USB 2.0 port in a `status` dump. Handles both the
/// `hub port sta ...` layout and the older `prt sta ...` one.
fn port_state(status: &str, port: u32) -> Option<u32> {
    status.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        let first = fields.next()?;
        let (number, sta) = match first {
            "hs" => (fields.next()?, fields.next()?),
            "ss" => return None,
            _ => (first, fields.next()?),
        };
        if number.parse::<u32>().ok()? != port {
            return None;
        }
        sta.parse().ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const STATUS: &str = "\
hub port sta spd dev      sockfd local_busid
hs  0000 004 000 00000000 000000 0-0
hs  0001 006 003 00020001 000005 1-2
ss  0008 004 000 00000000 000000 0-0
";

    fn fake_vhci(dir: &Path) -> PathBuf {
        let path = dir.join("vhci_hcd.0");
        fs::create_dir_all(path.join("usb4")).unwrap();
        fs::create_dir_all(path.join("usb3")).unwrap();
        fs::write(path.join("attach"), "").unwrap();
        fs::write(path.join("detach"), "").unwrap();
        fs::write(path.join("status"), STATUS).unwrap();
        path
    }

    #[test]
    fn test_find_numbered_instance() {
        let dir = TempDir::new().unwrap();
        let path = fake_vhci(dir.path());

        assert_eq!(VhciBus::find_in(dir.path()).unwrap(), path);
    }

    #[test]
    fn test_missing_controller() {
        let dir = TempDir::new().unwrap();

        assert!(matches!(
            VhciBus::find_in(dir.path()),
            Err(ProxyError::Vhci(_))
        ));
        assert!(VhciBus::locate(Some(dir.path())).is_err());
    }

    #[test]
    fn test_bus_number_is_lowest_root_hub() {
        let dir = TempDir::new().unwrap();
        let bus = VhciBus::locate(Some(fake_vhci(dir.path()).as_path())).unwrap();

        assert_eq!(bus.bus_number, Some(3));
    }

    #[test]
    fn test_open_free_port() {
        let dir = TempDir::new().unwrap();
        let bus = VhciBus::locate(Some(fake_vhci(dir.path()).as_path())).unwrap();

        let port = bus.open_port(0).unwrap();
        assert!(gadget::VirtualPort::wait_fd(&port).is_none());
        assert_eq!(gadget::VirtualPort::bus_number(&port), Some(3));
    }

    #[test]
    fn test_busy_or_out_of_range_port_is_refused() {
        let dir = TempDir::new().unwrap();
        let bus = VhciBus::locate(Some(fake_vhci(dir.path()).as_path())).unwrap();

        assert!(bus.open_port(1).is_err());
        assert!(bus.open_port(HS_PORTS).is_err());
    }

    #[test]
    fn test_port_not_listed_is_assumed_free() {
        let dir = TempDir::new().unwrap();
        let bus = VhciBus::locate(Some(fake_vhci(dir.path()).as_path())).unwrap();

        assert!(bus.open_port(5).is_ok());
    }

    #[test]
    fn test_old_status_layout() {
        let status = "prt sta spd bus dev socket local_busid\n000 004 000 000 000000 0 0-0\n001 006 002 000 000000 0 1-1\n";

        assert_eq!(port_state(status, 0), Some(4));
        assert_eq!(port_state(status, 1), Some(6));
        assert_eq!(port_state(status, 2), None);
    }
}
