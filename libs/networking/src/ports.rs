//! Node-aware host port registry.
//!
//! Every port in `[min, max]` carries a holder count. A port is allocatable
//! while its holder count is below the number of known nodes, since two
//! instances on different nodes may bind the same host port. The registry
//! remembers which ports each owner holds so that releases are idempotent.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::PortError;

/// Point-in-time view of registry capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRegistrySnapshot {
    pub min: u16,
    pub max: u16,
    pub node_count: usize,
    /// Reservations still available at current capacity.
    pub free: usize,
    /// Sum of holder counts across all ports.
    pub held: usize,
    /// Number of owners holding at least one port.
    pub owners: usize,
}

#[derive(Debug)]
struct RegistryState {
    min: u16,
    node_count: usize,
    /// Holder count per port, indexed by `port - min`.
    holders: Vec<usize>,
    free: usize,
    /// Offset where the next scan starts.
    next: usize,
    owners: HashMap<(String, String), Vec<u16>>,
}

impl RegistryState {
    fn offset(&self, port: u16) -> Option<usize> {
        let offset = usize::from(port.checked_sub(self.min)?);
        (offset < self.holders.len()).then_some(offset)
    }

    fn port(&self, offset: usize) -> u16 {
        // offsets are always below holders.len(), which fits the u16 range
        self.min + offset as u16
    }

    fn recompute_free(&mut self) {
        let nodes = self.node_count;
        self.free = self
            .holders
            .iter()
            .map(|held| nodes.saturating_sub(*held))
            .sum();
    }

    fn hold(&mut self, offset: usize) {
        if self.holders[offset] < self.node_count {
            self.free -= 1;
        }
        self.holders[offset] += 1;
    }

    fn unhold(&mut self, offset: usize) {
        if self.holders[offset] == 0 {
            return;
        }
        self.holders[offset] -= 1;
        if self.holders[offset] < self.node_count {
            self.free += 1;
        }
    }
}

/// Cluster-wide pool of host ports.
///
/// All operations take a single internal lock, so concurrent `reserve`
/// calls never observe each other's partial state.
#[derive(Debug)]
pub struct PortRegistry {
    max: u16,
    state: Mutex<RegistryState>,
}

impl PortRegistry {
    /// Create a registry for `[min, max]` with `node_count` nodes of capacity.
    pub fn new(min: u16, max: u16, node_count: usize) -> Result<Self, PortError> {
        if min > max {
            return Err(PortError::InvalidRange { min, max });
        }

        let range = usize::from(max - min) + 1;
        let mut state = RegistryState {
            min,
            node_count,
            holders: vec![0; range],
            free: 0,
            next: 0,
            owners: HashMap::new(),
        };
        state.recompute_free();

        Ok(Self {
            max,
            state: Mutex::new(state),
        })
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve `count` distinct ports for `namespace/owner`.
    ///
    /// Either all ports are reserved or none are. Scanning resumes where the
    /// previous reservation stopped.
    pub fn reserve(&self, namespace: &str, owner: &str, count: usize) -> Result<Vec<u16>, PortError> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let mut state = self.lock();
        if state.free < count {
            return Err(PortError::Exhausted {
                requested: count,
                free: state.free,
            });
        }

        let range = state.holders.len();
        let mut picked = Vec::with_capacity(count);
        let mut offset = state.next;
        for _ in 0..range {
            if state.holders[offset] < state.node_count {
                picked.push(offset);
            }
            offset = (offset + 1) % range;
            if picked.len() == count {
                break;
            }
        }

        // free capacity may be concentrated on fewer ports than requested
        if picked.len() < count {
            return Err(PortError::Exhausted {
                requested: count,
                free: picked.len(),
            });
        }

        for &p in &picked {
            state.hold(p);
        }
        state.next = offset;

        let ports: Vec<u16> = picked.iter().map(|&p| state.port(p)).collect();
        state
            .owners
            .entry((namespace.to_string(), owner.to_string()))
            .or_default()
            .extend_from_slice(&ports);

        Ok(ports)
    }

    /// Release ports held by `namespace/owner`.
    ///
    /// Ports the owner does not hold are ignored, so releasing twice is a
    /// no-op. Returns how many reservations were actually freed.
    pub fn release(&self, namespace: &str, owner: &str, ports: &[u16]) -> usize {
        let mut state = self.lock();
        let key = (namespace.to_string(), owner.to_string());
        let Some(mut held) = state.owners.remove(&key) else {
            return 0;
        };

        let mut released = 0;
        for port in ports {
            if let Some(pos) = held.iter().position(|p| p == port) {
                held.swap_remove(pos);
                if let Some(offset) = state.offset(*port) {
                    state.unhold(offset);
                    released += 1;
                }
            }
        }

        if !held.is_empty() {
            state.owners.insert(key, held);
        }
        released
    }

    /// Release every port held by `namespace/owner`.
    pub fn release_owner(&self, namespace: &str, owner: &str) -> Vec<u16> {
        let mut state = self.lock();
        let Some(held) = state
            .owners
            .remove(&(namespace.to_string(), owner.to_string()))
        else {
            return Vec::new();
        };

        for port in &held {
            if let Some(offset) = state.offset(*port) {
                state.unhold(offset);
            }
        }
        held
    }

    /// Record ports that an existing instance already holds.
    ///
    /// Used at startup so the registry agrees with instances created by a
    /// previous process. Registering the same owner twice is a no-op for
    /// ports it already holds.
    pub fn register_existing(&self, namespace: &str, owner: &str, ports: &[u16]) -> Result<(), PortError> {
        let mut state = self.lock();

        let mut offsets = Vec::with_capacity(ports.len());
        for &port in ports {
            let offset = state.offset(port).ok_or(PortError::OutOfRange {
                port,
                min: state.min,
                max: self.max,
            })?;
            offsets.push((port, offset));
        }

        let key = (namespace.to_string(), owner.to_string());
        let mut held = state.owners.remove(&key).unwrap_or_default();
        for (port, offset) in offsets {
            if held.contains(&port) {
                continue;
            }
            state.hold(offset);
            held.push(port);
        }
        if !held.is_empty() {
            state.owners.insert(key, held);
        }
        Ok(())
    }

    /// Ports currently held by `namespace/owner`.
    pub fn ports_of(&self, namespace: &str, owner: &str) -> Vec<u16> {
        self.lock()
            .owners
            .get(&(namespace.to_string(), owner.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Converge capacity to `count` nodes. Returns the previous count.
    pub fn set_node_count(&self, count: usize) -> usize {
        let mut state = self.lock();
        let previous = state.node_count;
        if previous != count {
            state.node_count = count;
            state.recompute_free();
        }
        previous
    }

    pub fn node_count(&self) -> usize {
        self.lock().node_count
    }

    /// Reservations still available at current capacity.
    pub fn free_count(&self) -> usize {
        self.lock().free
    }

    /// Number of holders of `port` (zero for out-of-range ports).
    pub fn holders(&self, port: u16) -> usize {
        let state = self.lock();
        state.offset(port).map_or(0, |o| state.holders[o])
    }

    pub fn snapshot(&self) -> PortRegistrySnapshot {
        let state = self.lock();
        PortRegistrySnapshot {
            min: state.min,
            max: self.max,
            node_count: state.node_count,
            free: state.free,
            held: state.holders.iter().sum(),
            owners: state.owners.len(),
        }
    }
}
