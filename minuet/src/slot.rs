//! Fixed-capacity connection slot table, indexed by descriptor value.
//!
//! Descriptors are small dense integers, so an O(1) vector lookup beats any
//! map. A slot pairs the loop-thread-only `ClientRecord` (peer address,
//! timer handle) with the `ConnCell` shared between the loop and workers.

use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::conn::Connection;
use crate::pool::CompletionLatch;
use crate::timer::TimerHandle;

/// Capacity of the slot table; also the live-connection cap.
pub const MAX_FD: usize = 65536;

/// Connection state shared between the event loop and the worker pool.
///
/// The mutex is uncontended in steady state: one-shot registration
/// guarantees at most one thread works a descriptor at a time.
pub struct ConnCell {
    inner: Mutex<Connection>,
    pub latch: CompletionLatch,
}

impl ConnCell {
    pub fn new(conn: Connection) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(conn),
            latch: CompletionLatch::new(),
        })
    }

    pub fn lock(&self) -> MutexGuard<'_, Connection> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Loop-thread-only metadata paired 1:1 with a `Connection`.
pub struct ClientRecord {
    pub addr: SocketAddr,
    pub fd: RawFd,
    pub timer: Option<TimerHandle>,
    pub cell: Arc<ConnCell>,
}

pub struct SlotTable {
    slots: Vec<Option<ClientRecord>>,
    active: usize,
}

impl SlotTable {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self { slots, active: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.active
    }

    pub fn is_empty(&self) -> bool {
        self.active == 0
    }

    /// Claim the slot for `record.fd`. False when the descriptor is out of
    /// range or the slot is unexpectedly occupied.
    pub fn insert(&mut self, record: ClientRecord) -> bool {
        let idx = record.fd as usize;
        match self.slots.get_mut(idx) {
            Some(slot @ None) => {
                *slot = Some(record);
                self.active += 1;
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, fd: RawFd) -> Option<&ClientRecord> {
        self.slots.get(fd as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, fd: RawFd) -> Option<&mut ClientRecord> {
        self.slots.get_mut(fd as usize)?.as_mut()
    }

    pub fn remove(&mut self, fd: RawFd) -> Option<ClientRecord> {
        let record = self.slots.get_mut(fd as usize)?.take();
        if record.is_some() {
            self.active -= 1;
        }
        record
    }
}
