use super::entry::{ConnStatus, ConnectionEntry, ConnectionHandle, ConnectionSummary, SocketId};
use crate::admission::{AdmissionController, AdmissionStats, ClientClass};
use crate::config::ServerConfig;
use crate::error::ConnError;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Client ids wrap back to 1 after this value.
pub const CLIENT_ID_MAX: u32 = i32::MAX as u32 - 1;

/// Monotonic client-id counter. Once it has wrapped, ids still held by
/// live connections are skipped.
#[derive(Debug)]
struct ClientIds {
    last: u32,
    max: u32,
    wrapped: bool,
    live: HashSet<u32>,
}

impl ClientIds {
    fn new(max: u32) -> Self {
        debug_assert!(max > 0);
        ClientIds {
            last: 0,
            max,
            wrapped: false,
            live: HashSet::new(),
        }
    }

    fn allocate(&mut self) -> u32 {
        debug_assert!((self.live.len() as u64) < self.max as u64, "client id space exhausted");
        loop {
            if self.last >= self.max {
                self.last = 1;
                self.wrapped = true;
            } else {
                self.last += 1;
            }
            if !self.wrapped || !self.live.contains(&self.last) {
                self.live.insert(self.last);
                return self.last;
            }
        }
    }

    fn free(&mut self, id: u32) {
        self.live.remove(&id);
    }
}

/// Fixed-capacity table of connection entries.
///
/// Slots move between a free list and an active list, each behind its own
/// reader/writer lock. The two locks are never held at the same time.
pub struct ConnectionRegistry {
    slots: Vec<Arc<ConnectionEntry>>,
    free: RwLock<Vec<usize>>,
    active: RwLock<Vec<usize>>,
    admission: AdmissionController,
    client_ids: Mutex<ClientIds>,
    next_session: AtomicU64,
    next_socket: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistrySnapshot {
    pub capacity: usize,
    pub active: usize,
    pub free: usize,
    pub admission: AdmissionStats,
    pub connections: Vec<ConnectionSummary>,
}

impl ConnectionRegistry {
    pub fn new(capacity: usize, entry_pool_size: usize, admission: AdmissionController) -> Self {
        Self::with_client_id_max(capacity, entry_pool_size, admission, CLIENT_ID_MAX)
    }

    fn with_client_id_max(
        capacity: usize,
        entry_pool_size: usize,
        admission: AdmissionController,
        client_id_max: u32,
    ) -> Self {
        debug_assert!(capacity > 0, "registry needs at least one slot");
        let slots = (0..capacity)
            .map(|i| Arc::new(ConnectionEntry::new(i, entry_pool_size)))
            .collect();
        ConnectionRegistry {
            slots,
            // Popped from the back, so slot 0 is handed out first
            free: RwLock::new((0..capacity).rev().collect()),
            active: RwLock::new(Vec::with_capacity(capacity)),
            admission,
            client_ids: Mutex::new(ClientIds::new(client_id_max)),
            next_session: AtomicU64::new(1),
            next_socket: AtomicU64::new(1),
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        let admission = AdmissionController::new(
            config.admission.max_clients,
            config.admission.rules.clone(),
        );
        Self::new(config.registry.capacity, config.registry.entry_pool_size, admission)
    }

    pub fn next_socket_id(&self) -> SocketId {
        SocketId(self.next_socket.fetch_add(1, Ordering::Relaxed))
    }

    /// Admit a client and hand it a free slot. The slot is not visible to
    /// lookups until `activate`.
    pub fn acquire(
        &self,
        socket: SocketId,
        class: ClientClass,
        peer: String,
    ) -> Result<ConnectionHandle, ConnError> {
        let ticket = self.admission.admit(class)?;

        let slot = self.free.write().pop();
        let Some(index) = slot else {
            self.admission.release(ticket);
            debug!(class = %class, "no free connection entry");
            return Err(ConnError::PoolExhausted);
        };

        let client_id = self.client_ids.lock().allocate();
        let session_id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let entry = &self.slots[index];
        entry.open(socket, peer, client_id, session_id, ticket);
        debug!(index, client_id, class = %class, "connection entry acquired");
        Ok(entry.handle())
    }

    pub fn activate(&self, handle: ConnectionHandle) -> Result<(), ConnError> {
        self.get(handle)?;
        let mut active = self.active.write();
        debug_assert!(
            !active.contains(&handle.index()),
            "slot {} activated twice",
            handle.index()
        );
        active.push(handle.index());
        Ok(())
    }

    /// Purge a connection and return its slot and admission unit.
    ///
    /// The generation bump in `reset` decides a racing double release: the
    /// loser gets `ConnectionClosed` and leaves both lists untouched.
    pub fn release(&self, handle: ConnectionHandle) -> Result<(), ConnError> {
        let entry = self
            .slots
            .get(handle.index())
            .ok_or(ConnError::ConnectionClosed)?;
        let (ticket, client_id) = entry.reset(handle).ok_or(ConnError::ConnectionClosed)?;
        {
            let mut active = self.active.write();
            if let Some(pos) = active.iter().position(|&i| i == handle.index()) {
                active.swap_remove(pos);
            }
        }

        if let Some(ticket) = ticket {
            self.admission.release(ticket);
        }
        self.client_ids.lock().free(client_id);

        let mut free = self.free.write();
        debug_assert!(!free.contains(&handle.index()), "slot {} freed twice", handle.index());
        free.push(handle.index());
        debug!(index = handle.index(), client_id, "connection entry released");
        Ok(())
    }

    /// Resolve a handle; stale generations are `ConnectionClosed`.
    pub fn get(&self, handle: ConnectionHandle) -> Result<Arc<ConnectionEntry>, ConnError> {
        let entry = self
            .slots
            .get(handle.index())
            .ok_or(ConnError::ConnectionClosed)?;
        if !entry.is_current(handle) {
            return Err(ConnError::ConnectionClosed);
        }
        Ok(entry.clone())
    }

    pub fn slot(&self, index: usize) -> Option<Arc<ConnectionEntry>> {
        self.slots.get(index).cloned()
    }

    pub fn active_connections(&self) -> Vec<Arc<ConnectionEntry>> {
        let active = self.active.read();
        active.iter().map(|&i| self.slots[i].clone()).collect()
    }

    pub fn find_by_transaction(&self, tran_index: usize) -> Option<Arc<ConnectionEntry>> {
        let active = self.active.read();
        active
            .iter()
            .map(|&i| &self.slots[i])
            .find(|e| e.transaction_index() == Some(tran_index))
            .cloned()
    }

    pub fn find_by_socket(&self, socket: SocketId) -> Option<Arc<ConnectionEntry>> {
        let active = self.active.read();
        active
            .iter()
            .map(|&i| &self.slots[i])
            .find(|e| e.socket() == Some(socket))
            .cloned()
    }

    pub fn session_ids_for_active_connections(&self) -> Vec<u64> {
        let active = self.active.read();
        active
            .iter()
            .map(|&i| &self.slots[i])
            .filter(|e| e.status() == ConnStatus::Open)
            .map(|e| e.session_id())
            .collect()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn active_count(&self) -> usize {
        self.active.read().len()
    }

    pub fn free_count(&self) -> usize {
        self.free.read().len()
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let connections = self
            .active_connections()
            .iter()
            .map(|e| e.summary())
            .collect();
        RegistrySnapshot {
            capacity: self.capacity(),
            active: self.active_count(),
            free: self.free_count(),
            admission: self.admission.stats(),
            connections,
        }
    }

    /// Dump the registry as JSON to the log.
    pub fn dump(&self) {
        match serde_json::to_string(&self.snapshot()) {
            Ok(json) => info!(registry = %json, "connection registry dump"),
            Err(e) => debug!(error = %e, "registry dump failed"),
        }
    }

    /// Verify all invariants hold (TigerStyle)
    pub fn verify_invariants(&self) {
        let free: Vec<usize> = self.free.read().clone();
        let active: Vec<usize> = self.active.read().clone();
        for i in &active {
            assert!(!free.contains(i), "slot {} is both free and active", i);
        }
        assert!(
            free.len() + active.len() <= self.slots.len(),
            "more listed slots than capacity"
        );
        for &i in &free {
            assert_eq!(
                self.slots[i].status(),
                ConnStatus::Closed,
                "free slot {} not closed",
                i
            );
        }
        self.admission.verify_invariants();
    }
}
