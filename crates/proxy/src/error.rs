//! Proxy error types

use gadget::GadgetError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),

    #[error("Gadget error: {0}")]
    Gadget(#[from] GadgetError),

    #[error("Unsupported link speed {0:?}")]
    UnsupportedSpeed(rusb::Speed),

    #[error("vhci_hcd error: {0}")]
    Vhci(String),

    #[error("Event loop error: {0}")]
    EventLoop(String),

    #[error("System error: {0}")]
    Sys(#[from] nix::errno::Errno),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProxyError>;
