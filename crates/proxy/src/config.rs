//! Command line and validated runtime configuration

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use common::{Error, Result};

#[derive(Parser, Debug)]
#[command(name = "usb-proxy")]
#[command(
    author,
    version,
    about = "USB proxy - Expose a local USB device through the USB/IP virtual host controller"
)]
#[command(long_about = "
Waits for a USB device with the given vendor and product id, opens it through
libusb and plugs an equivalent virtual device into a vhci_hcd port. Transfers
against the virtual device are forwarded to the real hardware.

EXAMPLES:
    # Proxy a device, ids in hex
    usb-proxy 046d c52b

    # Debug logging, three slots, no settle delay
    usb-proxy 0x046d 0xc52b --log-level debug --slots 3 --settle-ms 0

REQUIREMENTS:
    The vhci-hcd kernel module must be loaded (sudo modprobe vhci-hcd) and
    the proxy needs write access to its sysfs attach and detach files.
    RUST_LOG overrides --log-level.
")]
pub struct Args {
    /// Vendor id in hex
    #[arg(value_name = "VENDOR_ID", value_parser = parse_hex_id)]
    pub vendor_id: u16,

    /// Product id in hex
    #[arg(value_name = "PRODUCT_ID", value_parser = parse_hex_id)]
    pub product_id: u16,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", default_value = "info")]
    pub log_level: String,

    /// Number of devices that can be proxied at once
    #[arg(long, value_name = "N", default_value_t = 5,
          value_parser = clap::value_parser!(u8).range(1..=8))]
    pub slots: u8,

    /// Delay after opening a newly arrived device, 0 to disable
    #[arg(long, value_name = "MS", default_value_t = 1000)]
    pub settle_ms: u64,

    /// Refuse devices whose link speed the virtual port cannot represent
    #[arg(long)]
    pub strict_speed: bool,

    /// vhci_hcd sysfs directory (default: search /sys/devices/platform)
    #[arg(long, value_name = "PATH")]
    pub vhci: Option<PathBuf>,
}

/// Parse a 16-bit id written in hex, with or without `0x`
pub fn parse_hex_id(s: &str) -> std::result::Result<u16, String> {
    let hex = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    if hex.is_empty() || hex.len() > 4 {
        return Err(format!("'{}' must be 1-4 hex digits", s));
    }
    u16::from_str_radix(hex, 16).map_err(|_| format!("'{}' is not a valid hex number", s))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub vendor_id: u16,
    pub product_id: u16,
    pub log_level: String,
    pub slots: usize,
    pub settle: Duration,
    pub strict_speed: bool,
    pub vhci: Option<PathBuf>,
}

impl TryFrom<Args> for ProxyConfig {
    type Error = Error;

    fn try_from(args: Args) -> Result<Self> {
        let config = Self {
            vendor_id: args.vendor_id,
            product_id: args.product_id,
            log_level: args.log_level,
            slots: usize::from(args.slots),
            settle: Duration::from_millis(args.settle_ms),
            strict_speed: args.strict_speed,
            vhci: args.vhci,
        };
        config.validate()?;
        Ok(config)
    }
}

impl ProxyConfig {
    fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.as_str()) {
            return Err(Error::Config(format!(
                "Invalid log level '{}', must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            )));
        }

        if !(1..=8).contains(&self.slots) {
            return Err(Error::Config(format!(
                "slots must be between 1 and 8, got {}",
                self.slots
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> std::result::Result<Args, clap::Error> {
        Args::try_parse_from(std::iter::once("usb-proxy").chain(argv.iter().copied()))
    }

    #[test]
    fn test_defaults() {
        let config = ProxyConfig::try_from(parse(&["046d", "c52b"]).unwrap()).unwrap();

        assert_eq!(config.vendor_id, 0x046d);
        assert_eq!(config.product_id, 0xc52b);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.slots, 5);
        assert_eq!(config.settle, Duration::from_millis(1000));
        assert!(!config.strict_speed);
        assert!(config.vhci.is_none());
    }

    #[test]
    fn test_all_options() {
        let args = parse(&[
            "0x1D6B",
            "0X0002",
            "--log-level",
            "debug",
            "--slots",
            "8",
            "--settle-ms",
            "0",
            "--strict-speed",
            "--vhci",
            "/tmp/vhci",
        ])
        .unwrap();
        let config = ProxyConfig::try_from(args).unwrap();

        assert_eq!(config.vendor_id, 0x1d6b);
        assert_eq!(config.product_id, 0x0002);
        assert_eq!(config.slots, 8);
        assert_eq!(config.settle, Duration::ZERO);
        assert!(config.strict_speed);
        assert_eq!(config.vhci, Some(PathBuf::from("/tmp/vhci")));
    }

    #[test]
    fn test_positional_count_is_enforced() {
        assert!(parse(&["046d"]).is_err());
        assert!(parse(&["046d", "c52b", "0001"]).is_err());
        assert_eq!(parse(&[]).unwrap_err().exit_code(), 2);
    }

    #[test]
    fn test_slot_range() {
        assert!(parse(&["1", "2", "--slots", "0"]).is_err());
        assert!(parse(&["1", "2", "--slots", "9"]).is_err());
    }

    #[test]
    fn test_hex_ids() {
        assert_eq!(parse_hex_id("ffff"), Ok(0xffff));
        assert_eq!(parse_hex_id("0x1"), Ok(1));
        assert!(parse_hex_id("").is_err());
        assert!(parse_hex_id("0x").is_err());
        assert!(parse_hex_id("10000").is_err());
        assert!(parse_hex_id("xyz").is_err());
    }

    #[test]
    fn test_invalid_log_level() {
        let args = parse(&["1", "2", "--log-level", "loud"]).unwrap();

        assert!(matches!(
            ProxyConfig::try_from(args),
            Err(Error::Config(_))
        ));
    }
}
