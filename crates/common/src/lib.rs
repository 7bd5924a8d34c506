//! Common utilities for usb-proxy
//!
//! Shared error type and logging bootstrap used by the gadget contract crate
//! and the proxy binary.

pub mod error;
pub mod logging;

pub use error::{Error, Result};
pub use logging::setup_logging;
