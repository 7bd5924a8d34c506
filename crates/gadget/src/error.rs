//! Gadget error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GadgetError {
    #[error("Endpoint address {0:#04x} is out of range")]
    InvalidEndpoint(u8),

    #[error("Endpoint {0:#04x} declared twice in one interface")]
    DuplicateEndpoint(u8),

    #[error("Interface {number} alternate setting {alt_setting} declared twice")]
    DuplicateInterface { number: u8, alt_setting: u8 },

    #[error("Configuration {0} declared twice")]
    DuplicateConfig(u8),

    #[error("Endpoint 0 must be a bidirectional control endpoint")]
    InvalidEndpointZero,

    #[error("Virtual port is not attached")]
    NotAttached,

    #[error("Virtual port protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GadgetError>;
