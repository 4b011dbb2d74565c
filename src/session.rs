//! Transaction-manager seam.
//!
//! The connection layer never owns transactions; it asks a
//! `TransactionManager` to bind, count, interrupt and terminate them.
//! `TransactionTable` is the in-process implementation used by the server
//! binary and the tests.

use crate::admission::ClientClass;
use crate::connection::ConnectionHandle;
use parking_lot::Mutex;
use std::collections::BTreeMap;

pub trait TransactionManager: Send + Sync {
    /// Bind a transaction slot to a connection, returning its index.
    fn bind_transaction(&self, conn: ConnectionHandle, class: ClientClass) -> usize;

    fn unbind_transaction(&self, tran_index: usize);

    /// Number of clients holding a transaction slot.
    fn count_active_clients(&self) -> usize;

    /// Ask the transaction's worker to stop at its next check.
    fn interrupt_transaction(&self, tran_index: usize);

    fn is_interrupted(&self, tran_index: usize) -> bool;

    /// Clients whose class may not stay connected in maintenance mode.
    fn count_not_allowed_in_maintenance(&self) -> usize;

    /// Terminate the transactions counted by `count_not_allowed_in_maintenance`.
    /// Returns how many were terminated.
    fn terminate_not_allowed_in_maintenance(&self) -> usize;
}

#[derive(Debug, Clone)]
struct TranRecord {
    conn: ConnectionHandle,
    class: ClientClass,
    interrupted: bool,
}

/// In-memory transaction table keyed by transaction index.
#[derive(Debug, Default)]
pub struct TransactionTable {
    inner: Mutex<TableInner>,
}

#[derive(Debug, Default)]
struct TableInner {
    next_index: usize,
    records: BTreeMap<usize, TranRecord>,
}

impl TransactionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_of(&self, tran_index: usize) -> Option<ConnectionHandle> {
        self.inner.lock().records.get(&tran_index).map(|r| r.conn)
    }
}

impl TransactionManager for TransactionTable {
    fn bind_transaction(&self, conn: ConnectionHandle, class: ClientClass) -> usize {
        let mut inner = self.inner.lock();
        inner.next_index += 1;
        let index = inner.next_index;
        inner.records.insert(
            index,
            TranRecord {
                conn,
                class,
                interrupted: false,
            },
        );
        index
    }

    fn unbind_transaction(&self, tran_index: usize) {
        self.inner.lock().records.remove(&tran_index);
    }

    fn count_active_clients(&self) -> usize {
        self.inner.lock().records.len()
    }

    fn interrupt_transaction(&self, tran_index: usize) {
        if let Some(record) = self.inner.lock().records.get_mut(&tran_index) {
            record.interrupted = true;
        }
    }

    fn is_interrupted(&self, tran_index: usize) -> bool {
        self.inner
            .lock()
            .records
            .get(&tran_index)
            .map(|r| r.interrupted)
            .unwrap_or(false)
    }

    fn count_not_allowed_in_maintenance(&self) -> usize {
        self.inner
            .lock()
            .records
            .values()
            .filter(|r| !r.class.allowed_in_maintenance())
            .count()
    }

    fn terminate_not_allowed_in_maintenance(&self) -> usize {
        let mut inner = self.inner.lock();
        let before = inner.records.len();
        inner.records.retain(|_, r| r.class.allowed_in_maintenance());
        before - inner.records.len()
    }
}
