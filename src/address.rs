//! Hypervisor socket addressing.
//!
//! A vsock endpoint is named by a context identifier (which machine) and a
//! port, instead of an IP address.

use std::fmt;
use thiserror::Error;

/// Wildcard context id: bind on every local context.
pub const CID_ANY: u32 = u32::MAX;

/// Reserved context id of the hypervisor itself.
pub const CID_HYPERVISOR: u32 = 0;

/// Context id Linux reserves for the host.
pub const CID_HOST: u32 = 2;

/// Context id of the parent instance as seen from a Nitro enclave.
pub const CID_PARENT: u32 = 3;

/// Port the relay uses when none is configured.
pub const DEFAULT_PORT: u32 = 10000;

/// Address parsing and validation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("port {0} out of range 1-65535")]
    PortOutOfRange(u32),
}

/// A (context id, port) pair. Immutable once constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointAddress {
    cid: u32,
    port: u32,
}

impl EndpointAddress {
    /// Build an address, rejecting ports outside 1..=65535.
    pub fn new(cid: u32, port: u32) -> Result<Self, AddressError> {
        if !(1..=65535).contains(&port) {
            return Err(AddressError::PortOutOfRange(port));
        }
        Ok(Self { cid, port })
    }

    pub fn with_default_port(cid: u32) -> Self {
        Self {
            cid,
            port: DEFAULT_PORT,
        }
    }

    pub fn cid(&self) -> u32 {
        self.cid
    }

    pub fn port(&self) -> u32 {
        self.port
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.cid == CID_ANY {
            write!(f, "vsock://any:{}", self.port)
        } else {
            write!(f, "vsock://{}:{}", self.cid, self.port)
        }
    }
}
