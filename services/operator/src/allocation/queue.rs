//! Per-build queues of allocatable instances.
//!
//! Each build has its own binary min-heap ordered by node age, ties broken
//! by insertion order. The heap keeps a name to slot index so an entry can
//! be removed in O(log n) without a scan.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use fleet_id::BuildId;

use crate::model::{Instance, ObjectKey};

/// Projection of a standing-by instance used only for allocation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub key: ObjectKey,
    pub build_id: BuildId,
    pub node_age: u32,
    /// Resource version the entry was built from.
    pub resource_version: u64,
}

impl QueueEntry {
    pub fn from_instance(instance: &Instance) -> Self {
        Self {
            key: instance.key(),
            build_id: instance.spec.build_id,
            node_age: instance.status.node_age,
            resource_version: instance.metadata.resource_version,
        }
    }
}

/// Result of [`InstanceQueue::upsert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Refreshed,
    Unchanged,
}

#[derive(Debug)]
struct Slot {
    entry: QueueEntry,
    seq: u64,
}

impl Slot {
    fn cmp_priority(&self, other: &Slot) -> Ordering {
        self.entry
            .node_age
            .cmp(&other.entry.node_age)
            .then(self.seq.cmp(&other.seq))
    }
}

#[derive(Debug, Default)]
struct BuildHeap {
    slots: Vec<Slot>,
    positions: HashMap<ObjectKey, usize>,
}

impl BuildHeap {
    fn swap(&mut self, a: usize, b: usize) {
        self.slots.swap(a, b);
        self.positions.insert(self.slots[a].entry.key.clone(), a);
        self.positions.insert(self.slots[b].entry.key.clone(), b);
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.slots[i].cmp_priority(&self.slots[parent]) != Ordering::Less {
                break;
            }
            self.swap(i, parent);
            i = parent;
        }
    }

    fn sift_down(&mut self, mut i: usize) {
        let len = self.slots.len();
        loop {
            let left = 2 * i + 1;
            let right = left + 1;
            let mut smallest = i;
            if left < len && self.slots[left].cmp_priority(&self.slots[smallest]) == Ordering::Less {
                smallest = left;
            }
            if right < len && self.slots[right].cmp_priority(&self.slots[smallest]) == Ordering::Less {
                smallest = right;
            }
            if smallest == i {
                break;
            }
            self.swap(i, smallest);
            i = smallest;
        }
    }

    fn push(&mut self, slot: Slot) {
        let i = self.slots.len();
        self.positions.insert(slot.entry.key.clone(), i);
        self.slots.push(slot);
        self.sift_up(i);
    }

    fn remove_at(&mut self, i: usize) -> Option<QueueEntry> {
        let last = self.slots.len().checked_sub(1)?;
        if i != last {
            self.swap(i, last);
        }
        let entry = self.slots.pop()?.entry;
        self.positions.remove(&entry.key);
        if i < self.slots.len() {
            self.sift_down(i);
            self.sift_up(i);
        }
        Some(entry)
    }

    fn pop(&mut self) -> Option<QueueEntry> {
        self.remove_at(0)
    }

    fn remove(&mut self, key: &ObjectKey) -> Option<QueueEntry> {
        let i = *self.positions.get(key)?;
        self.remove_at(i)
    }
}

#[derive(Debug, Default)]
struct QueueState {
    heaps: HashMap<BuildId, BuildHeap>,
    /// Which build's heap holds each queued instance.
    index: HashMap<ObjectKey, BuildId>,
    next_seq: u64,
}

impl QueueState {
    fn insert(&mut self, entry: QueueEntry) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.index.insert(entry.key.clone(), entry.build_id);
        self.heaps
            .entry(entry.build_id)
            .or_default()
            .push(Slot { entry, seq });
    }

    fn remove(&mut self, key: &ObjectKey) -> Option<QueueEntry> {
        let build_id = self.index.remove(key)?;
        let heap = self.heaps.get_mut(&build_id)?;
        let entry = heap.remove(key);
        if heap.slots.is_empty() {
            self.heaps.remove(&build_id);
        }
        entry
    }
}

/// Allocatable instances, one min-heap per build.
///
/// Safe to share between reconcile workers and request handlers.
#[derive(Debug, Default)]
pub struct InstanceQueue {
    state: Mutex<QueueState>,
}

impl InstanceQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add an entry. Returns false, leaving the queue untouched, when an
    /// entry with the same key is already queued.
    pub fn push(&self, entry: QueueEntry) -> bool {
        let mut state = self.lock();
        if state.index.contains_key(&entry.key) {
            return false;
        }
        state.insert(entry);
        true
    }

    /// Add an entry, or replace a queued one whose version or node age
    /// changed. A replaced entry keeps its insertion order.
    pub fn upsert(&self, entry: QueueEntry) -> Upsert {
        let mut state = self.lock();
        let Some(build_id) = state.index.get(&entry.key).copied() else {
            state.insert(entry);
            return Upsert::Inserted;
        };

        if build_id != entry.build_id {
            state.remove(&entry.key);
            state.insert(entry);
            return Upsert::Refreshed;
        }

        let Some(heap) = state.heaps.get_mut(&build_id) else {
            return Upsert::Unchanged;
        };
        let Some(&i) = heap.positions.get(&entry.key) else {
            return Upsert::Unchanged;
        };
        if heap.slots[i].entry == entry {
            return Upsert::Unchanged;
        }
        heap.slots[i].entry = entry;
        heap.sift_down(i);
        heap.sift_up(i);
        Upsert::Refreshed
    }

    /// Take the next entry for a build. `None` means nothing is allocatable.
    pub fn pop(&self, build_id: BuildId) -> Option<QueueEntry> {
        let mut state = self.lock();
        let heap = state.heaps.get_mut(&build_id)?;
        let entry = heap.pop()?;
        if heap.slots.is_empty() {
            state.heaps.remove(&build_id);
        }
        state.index.remove(&entry.key);
        Some(entry)
    }

    /// Drop an entry without popping it.
    pub fn remove(&self, key: &ObjectKey) -> Option<QueueEntry> {
        self.lock().remove(key)
    }

    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.lock().index.contains_key(key)
    }

    /// Number of queued entries for a build.
    pub fn len(&self, build_id: BuildId) -> usize {
        self.lock()
            .heaps
            .get(&build_id)
            .map_or(0, |h| h.slots.len())
    }

    /// Number of queued entries across all builds.
    pub fn total(&self) -> usize {
        self.lock().index.len()
    }
}
