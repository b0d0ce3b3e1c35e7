//! Networking utilities for the fleet.
//!
//! This library provides the host port registry: a cluster-wide pool of
//! host ports in a fixed `[min, max]` range. A port may be held by at most
//! one instance per node, so each port can be handed out `node_count` times
//! concurrently. Capacity follows node membership.

mod ports;

pub use ports::{PortRegistry, PortRegistrySnapshot};

use thiserror::Error;

/// Port registry errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PortError {
    /// Not enough free ports for the request at the current node capacity.
    #[error("port pool exhausted: requested {requested}, {free} free")]
    Exhausted { requested: usize, free: usize },

    /// The configured range is empty or inverted.
    #[error("invalid port range: {min}..={max}")]
    InvalidRange { min: u16, max: u16 },

    /// A port outside the configured range was presented.
    #[error("port {port} outside range {min}..={max}")]
    OutOfRange { port: u16, min: u16, max: u16 },
}

impl PortError {
    /// Returns true if the caller should retry later rather than give up.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PortError::Exhausted { .. })
    }
}
