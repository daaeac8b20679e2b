use crate::PortStatus;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::{oneshot, watch};
use tracing::debug;

/// What a single ports batch did to the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortsChange {
    pub added: Vec<u32>,
    pub changed: Vec<u32>,
    pub unserved: Vec<u32>,
}

impl PortsChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.unserved.is_empty()
    }
}

#[derive(Debug)]
struct PortWaiter {
    local_port: u32,
    tx: oneshot::Sender<u32>,
}

#[derive(Debug, Default)]
struct PortTable {
    ports: BTreeMap<u32, PortStatus>,
    waiters: Vec<PortWaiter>,
}

impl PortTable {
    fn external_port(&self, local_port: u32) -> Option<u32> {
        self.ports.get(&local_port).and_then(|port| port.global_port)
    }

    fn wake_waiters(&mut self) {
        for waiter in std::mem::take(&mut self.waiters) {
            match self.external_port(waiter.local_port) {
                Some(global_port) => {
                    let _ = waiter.tx.send(global_port);
                }
                None if waiter.tx.is_closed() => {}
                None => self.waiters.push(waiter),
            }
        }
    }
}

/// Authoritative local port -> forwarding status table.
///
/// Entries are never removed. A port missing from a batch is kept and marked
/// not served, so an already known external mapping survives. Subscribers get
/// one aggregate notification per batch and are expected to re-read the table.
#[derive(Debug)]
pub struct PortRegistry {
    table: Mutex<PortTable>,
    changes: watch::Sender<u64>,
}

impl PortRegistry {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            table: Mutex::new(PortTable::default()),
            changes,
        }
    }

    pub fn apply_update(&self, observed: Vec<PortStatus>) -> PortsChange {
        let mut table = self.lock();
        let ports = &mut table.ports;
        let mut stale: BTreeSet<u32> = ports.keys().copied().collect();
        let mut change = PortsChange::default();

        for port in observed {
            stale.remove(&port.local_port);
            let next = PortStatus {
                served: true,
                ..port
            };
            match ports.insert(next.local_port, next.clone()) {
                None => change.added.push(next.local_port),
                Some(previous) if previous != next => change.changed.push(next.local_port),
                Some(_) => {}
            }
        }

        for local_port in stale {
            if let Some(entry) = ports.get_mut(&local_port) {
                if entry.served {
                    entry.served = false;
                    change.unserved.push(local_port);
                }
            }
        }

        let total = ports.len();
        // Notify under the lock so a batch is observed whole.
        table.wake_waiters();
        self.changes.send_modify(|generation| *generation += 1);
        debug!(
            event = "ports_update_applied",
            total,
            added = change.added.len(),
            changed = change.changed.len(),
            unserved = change.unserved.len()
        );
        change
    }

    pub fn get(&self, local_port: u32) -> Option<PortStatus> {
        self.lock().ports.get(&local_port).cloned()
    }

    pub fn snapshot(&self) -> Vec<PortStatus> {
        self.lock().ports.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().ports.is_empty()
    }

    pub fn external_port(&self, local_port: u32) -> Option<u32> {
        self.lock().external_port(local_port)
    }

    /// Number of batches applied so far. Receivers are woken on every batch.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    pub fn generation(&self) -> u64 {
        *self.changes.borrow()
    }

    /// Resolves with the external port of `local_port` as soon as it is known.
    ///
    /// The value is the first mapping any batch reported for the port. There is
    /// no timeout: a port that is never forwarded keeps this pending forever, so
    /// callers that cannot wait must bound it themselves.
    pub async fn resolve_external_port(&self, local_port: u32) -> u32 {
        let rx = {
            let mut table = self.lock();
            if let Some(global_port) = table.external_port(local_port) {
                return global_port;
            }
            let (tx, rx) = oneshot::channel();
            table.waiters.push(PortWaiter { local_port, tx });
            rx
        };
        match rx.await {
            Ok(global_port) => global_port,
            Err(_) => std::future::pending().await,
        }
    }

    pub fn pending_resolutions(&self) -> usize {
        self.lock().waiters.len()
    }

    fn lock(&self) -> MutexGuard<'_, PortTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for PortRegistry {
    fn default() -> Self {
        Self::new()
    }
}
