//! usb-proxy
//!
//! Exposes a physically attached USB device through the USB/IP virtual host
//! controller. Runs a single-threaded event loop multiplexing libusb and the
//! `vhci_hcd` ports until SIGINT or SIGTERM.

mod bridge;
mod config;
mod controller;
mod error;
mod event_loop;
mod slots;
mod strings;
mod translate;
mod usb;
mod vhci;

#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use clap::Parser;
use common::setup_logging;
use tracing::info;

use config::{Args, ProxyConfig};
use slots::SlotManager;
use usb::LibusbStack;
use vhci::VhciBus;

fn main() -> Result<()> {
    let config = ProxyConfig::try_from(Args::parse()).context("Invalid configuration")?;

    setup_logging(&config.log_level).context("Failed to setup logging")?;
    info!("usb-proxy v{}", env!("CARGO_PKG_VERSION"));

    run(&config)
}

fn run(config: &ProxyConfig) -> Result<()> {
    info!(
        "waiting for {:04x}:{:04x}",
        config.vendor_id, config.product_id
    );

    let mut stack = LibusbStack::new(config.vendor_id, config.product_id)
        .context("Failed to initialise libusb with hot-plug support")?;

    let bus = VhciBus::locate(config.vhci.as_deref()).context("Failed to locate vhci_hcd")?;
    let ports = (0..config.slots)
        .map(|index| {
            bus.open_port(index)
                .with_context(|| format!("Failed to open vhci_hcd port {}", index))
        })
        .collect::<Result<Vec<_>>>()?;
    info!(
        "Opened {} ports on {}",
        ports.len(),
        bus.path().display()
    );

    let mut slots = SlotManager::new(ports, config.settle, config.strict_speed);
    let shutdown =
        event_loop::install_shutdown_handler().context("Failed to install signal handlers")?;

    let result = event_loop::run(&mut stack, &mut slots, shutdown).context("Event loop failed");

    info!("Shutting down...");
    slots.shutdown(&stack);
    info!("Shutdown complete");

    result
}
