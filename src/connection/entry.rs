use super::free_list::{FreeList, Recycle};
use crate::admission::{AdmissionTicket, ClientClass};
use crate::error::ConnError;
use crate::protocol::pack_eid;
use bytes::BytesMut;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::io::AsyncWrite;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Write half of a client transport.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Registry-assigned identifier of an accepted socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SocketId(pub u64);

/// Generation-checked reference to a registry slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl ConnectionHandle {
    pub fn index(&self) -> usize {
        self.index as usize
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnStatus {
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EntryStatus {
    #[default]
    Ok,
    /// Payload could not be buffered; the entry carries no data
    CannotAllocateBuffer,
}

/// A queued packet. Request entries carry the command header fields;
/// data and error entries own their payload until dequeued.
#[derive(Debug, Default)]
pub struct QueueEntry {
    pub request_id: u16,
    pub payload: Option<BytesMut>,
    pub size: usize,
    pub status: EntryStatus,
    pub transaction_id: i32,
    pub invalidate_snapshot: bool,
    pub error_code: i32,
    pub function_code: u16,
}

impl Recycle for QueueEntry {
    fn recycle(&mut self) {
        *self = QueueEntry::default();
    }
}

/// A parked receiver waiting for data on one request id.
#[derive(Debug, Default)]
pub struct WaitEntry {
    pub request_id: u16,
    pub(crate) tx: Option<oneshot::Sender<QueueEntry>>,
}

impl Recycle for WaitEntry {
    fn recycle(&mut self) {
        self.request_id = 0;
        self.tx = None;
    }
}

/// A caller-supplied buffer registered for one request id.
#[derive(Debug)]
pub struct UserBuffer {
    pub request_id: u16,
    pub buffer: BytesMut,
    pub capacity: usize,
}

/// Mutable per-connection state, guarded by the connection lock.
#[derive(Debug)]
pub struct ConnInner {
    pub status: ConnStatus,
    /// Bumped by every reset; handles minted before it are stale
    pub(crate) generation: u32,
    pub socket: Option<SocketId>,
    pub peer: String,
    pub client_id: u32,
    pub client_class: ClientClass,
    pub session_id: u64,
    pub transaction_index: Option<usize>,
    /// Transaction id and snapshot flag from the most recent header
    pub transaction_id: i32,
    pub invalidate_snapshot: bool,
    pub in_transaction: bool,
    pub reset_on_commit: bool,
    pub request_id_cursor: u16,
    pub request_queue: VecDeque<QueueEntry>,
    pub data_queue: VecDeque<QueueEntry>,
    pub wait_queue: Vec<WaitEntry>,
    pub abort_queue: Vec<QueueEntry>,
    pub buffer_queue: Vec<UserBuffer>,
    pub error_queue: VecDeque<QueueEntry>,
    /// Request ids whose receiver gave up before data arrived
    pub abandoned: Vec<u16>,
    pub interrupt: CancellationToken,
    pub(crate) ticket: Option<AdmissionTicket>,
    pub(crate) entry_pool: FreeList<QueueEntry>,
    pub(crate) wait_pool: FreeList<WaitEntry>,
}

impl ConnInner {
    fn new(pool_size: usize) -> Self {
        ConnInner {
            status: ConnStatus::Closed,
            generation: 0,
            socket: None,
            peer: String::new(),
            client_id: 0,
            client_class: ClientClass::Normal,
            session_id: 0,
            transaction_index: None,
            transaction_id: 0,
            invalidate_snapshot: false,
            in_transaction: false,
            reset_on_commit: false,
            request_id_cursor: 0,
            request_queue: VecDeque::new(),
            data_queue: VecDeque::new(),
            wait_queue: Vec::new(),
            abort_queue: Vec::new(),
            buffer_queue: Vec::new(),
            error_queue: VecDeque::new(),
            abandoned: Vec::new(),
            interrupt: CancellationToken::new(),
            ticket: None,
            entry_pool: FreeList::new(pool_size),
            wait_pool: FreeList::new(pool_size),
        }
    }

    pub(crate) fn new_entry(&mut self, request_id: u16) -> QueueEntry {
        let mut entry = self.entry_pool.take();
        entry.request_id = request_id;
        entry.transaction_id = self.transaction_id;
        entry.invalidate_snapshot = self.invalidate_snapshot;
        entry
    }

    pub(crate) fn recycle(&mut self, entry: QueueEntry) {
        self.entry_pool.give_back(entry);
    }

    pub fn is_aborted(&self, request_id: u16) -> bool {
        self.abort_queue.iter().any(|e| e.request_id == request_id)
    }

    pub(crate) fn take_from(queue: &mut VecDeque<QueueEntry>, request_id: u16) -> Option<QueueEntry> {
        let pos = queue.iter().position(|e| e.request_id == request_id)?;
        queue.remove(pos)
    }

    pub(crate) fn take_waiter(&mut self, request_id: u16) -> Option<oneshot::Sender<QueueEntry>> {
        let pos = self.wait_queue.iter().position(|w| w.request_id == request_id)?;
        let mut wait = self.wait_queue.swap_remove(pos);
        let tx = wait.tx.take();
        self.wait_pool.give_back(wait);
        tx
    }

    pub(crate) fn take_user_buffer(&mut self, request_id: u16) -> Option<UserBuffer> {
        let pos = self.buffer_queue.iter().position(|b| b.request_id == request_id)?;
        Some(self.buffer_queue.swap_remove(pos))
    }

    pub(crate) fn take_abandoned(&mut self, request_id: u16) -> bool {
        match self.abandoned.iter().position(|&r| r == request_id) {
            Some(pos) => {
                self.abandoned.swap_remove(pos);
                true
            }
            None => false,
        }
    }

    /// True if any queue still holds an entry for `request_id`, or a
    /// timed-out receive left it marked abandoned.
    pub fn holds_request_id(&self, request_id: u16) -> bool {
        self.data_queue.iter().any(|e| e.request_id == request_id)
            || self.request_queue.iter().any(|e| e.request_id == request_id)
            || self.error_queue.iter().any(|e| e.request_id == request_id)
            || self.is_aborted(request_id)
            || self.abandoned.contains(&request_id)
    }

    /// `ConnectionClosed` unless the connection is open and, when
    /// `generation` is given, still serving the client it was minted for.
    pub(crate) fn check_serving(&self, generation: Option<u32>) -> Result<(), ConnError> {
        if self.status != ConnStatus::Open {
            return Err(ConnError::ConnectionClosed);
        }
        match generation {
            Some(g) if g != self.generation => Err(ConnError::ConnectionClosed),
            _ => Ok(()),
        }
    }

    pub(crate) fn is_generation(&self, generation: Option<u32>) -> bool {
        generation.map_or(true, |g| g == self.generation)
    }

    /// Drop every queued entry for one request id.
    pub(crate) fn purge_request_id(&mut self, request_id: u16) {
        for queue in [
            &mut self.request_queue,
            &mut self.data_queue,
            &mut self.error_queue,
        ] {
            let mut i = 0;
            while i < queue.len() {
                if queue[i].request_id == request_id {
                    if let Some(entry) = queue.remove(i) {
                        self.entry_pool.give_back(entry);
                    }
                } else {
                    i += 1;
                }
            }
        }
    }

    /// Empty every queue. Parked receivers see their channel close.
    pub(crate) fn purge_all(&mut self) {
        let drained: Vec<QueueEntry> = self
            .request_queue
            .drain(..)
            .chain(self.data_queue.drain(..))
            .chain(self.error_queue.drain(..))
            .chain(self.abort_queue.drain(..))
            .collect();
        for entry in drained {
            self.entry_pool.give_back(entry);
        }
        for wait in std::mem::take(&mut self.wait_queue) {
            self.wait_pool.give_back(wait);
        }
        self.buffer_queue.clear();
        self.abandoned.clear();
    }

    /// Next free 16-bit request id; 0 is never handed out.
    pub fn next_request_id(&mut self) -> Result<u16, ConnError> {
        for _ in 0..u16::MAX {
            self.request_id_cursor = self.request_id_cursor.wrapping_add(1);
            if self.request_id_cursor == 0 {
                self.request_id_cursor = 1;
            }
            if !self.holds_request_id(self.request_id_cursor) {
                return Ok(self.request_id_cursor);
            }
        }
        Err(ConnError::InternalInconsistency(
            "every request id is in use".into(),
        ))
    }
}

/// One client connection: its queues, bindings and flags.
pub struct ConnectionEntry {
    index: usize,
    inner: Mutex<ConnInner>,
    stop_talk: AtomicBool,
    pending_requests: AtomicUsize,
    pub(crate) writer: tokio::sync::Mutex<Option<BoxedWriter>>,
}

impl ConnectionEntry {
    pub fn new(index: usize, pool_size: usize) -> Self {
        ConnectionEntry {
            index,
            inner: Mutex::new(ConnInner::new(pool_size)),
            stop_talk: AtomicBool::new(false),
            pending_requests: AtomicUsize::new(0),
            writer: tokio::sync::Mutex::new(None),
        }
    }

    /// Scoped access to the locked state. Never await inside `f`.
    #[inline]
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut ConnInner) -> R) -> R {
        let mut inner = self.inner.lock();
        f(&mut inner)
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            index: self.index as u32,
            generation: self.with_lock(|c| c.generation),
        }
    }

    pub fn is_current(&self, handle: ConnectionHandle) -> bool {
        handle.index() == self.index && self.with_lock(|c| c.generation == handle.generation)
    }

    /// Enquiry id for a request on this connection.
    pub fn eid(&self, request_id: u16) -> u32 {
        pack_eid(self.index, request_id)
    }

    pub fn status(&self) -> ConnStatus {
        self.with_lock(|c| c.status)
    }

    pub fn set_status(&self, status: ConnStatus) {
        self.with_lock(|c| c.status = status);
    }

    pub fn client_id(&self) -> u32 {
        self.with_lock(|c| c.client_id)
    }

    pub fn client_class(&self) -> ClientClass {
        self.with_lock(|c| c.client_class)
    }

    pub fn session_id(&self) -> u64 {
        self.with_lock(|c| c.session_id)
    }

    pub fn socket(&self) -> Option<SocketId> {
        self.with_lock(|c| c.socket)
    }

    pub fn peer(&self) -> String {
        self.with_lock(|c| c.peer.clone())
    }

    pub fn transaction_index(&self) -> Option<usize> {
        self.with_lock(|c| c.transaction_index)
    }

    pub fn bind_transaction(&self, tran_index: Option<usize>) {
        self.with_lock(|c| c.transaction_index = tran_index);
    }

    pub fn in_transaction(&self) -> bool {
        self.with_lock(|c| c.in_transaction)
    }

    pub fn set_in_transaction(&self, on: bool) {
        self.with_lock(|c| c.in_transaction = on);
    }

    pub fn reset_on_commit(&self) -> bool {
        self.with_lock(|c| c.reset_on_commit)
    }

    pub fn set_reset_on_commit(&self, on: bool) {
        self.with_lock(|c| c.reset_on_commit = on);
    }

    #[inline]
    pub fn stop_talk(&self) -> bool {
        self.stop_talk.load(Ordering::Acquire)
    }

    pub fn set_stop_talk(&self, on: bool) {
        self.stop_talk.store(on, Ordering::Release);
    }

    #[inline]
    pub fn pending_requests(&self) -> usize {
        self.pending_requests.load(Ordering::Acquire)
    }

    pub(crate) fn begin_request(&self) {
        self.pending_requests.fetch_add(1, Ordering::AcqRel);
    }

    /// Saturates at zero: `reset` may clear the counter under a late task.
    pub(crate) fn finish_request(&self) {
        let _ = self
            .pending_requests
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Wake every receive parked on this connection with an interrupt.
    /// Teardown only: the token stays cancelled until `open` installs a
    /// fresh one for the next client.
    pub fn interrupt(&self) {
        self.with_lock(|c| c.interrupt.cancel());
    }

    pub fn next_request_id(&self) -> Result<u16, ConnError> {
        self.next_request_id_in(None)
    }

    pub(crate) fn next_request_id_in(&self, generation: Option<u32>) -> Result<u16, ConnError> {
        self.with_lock(|c| {
            c.check_serving(generation)?;
            c.next_request_id()
        })
    }

    /// Bring a free slot into service for a newly admitted client.
    pub(crate) fn open(
        &self,
        socket: SocketId,
        peer: String,
        client_id: u32,
        session_id: u64,
        ticket: AdmissionTicket,
    ) {
        self.stop_talk.store(false, Ordering::Release);
        debug_assert_eq!(self.pending_requests(), 0, "slot reused with pending requests");
        self.with_lock(|c| {
            debug_assert_eq!(c.status, ConnStatus::Closed, "opening a live slot");
            c.status = ConnStatus::Open;
            c.socket = Some(socket);
            c.peer = peer;
            c.client_id = client_id;
            c.client_class = ticket.class();
            c.session_id = session_id;
            c.transaction_index = None;
            c.transaction_id = 0;
            c.invalidate_snapshot = false;
            c.in_transaction = false;
            c.reset_on_commit = false;
            c.request_id_cursor = 0;
            c.interrupt = CancellationToken::new();
            c.ticket = Some(ticket);
        });
    }

    /// Purge queues, mark closed and invalidate outstanding handles.
    /// Returns the admission ticket and client id to give back, or `None`
    /// if `handle` is already stale; only one reset per generation wins.
    pub(crate) fn reset(&self, handle: ConnectionHandle) -> Option<(Option<AdmissionTicket>, u32)> {
        let released = self.with_lock(|c| {
            if c.generation != handle.generation {
                return None;
            }
            c.generation = c.generation.wrapping_add(1);
            c.purge_all();
            c.interrupt.cancel();
            c.status = ConnStatus::Closed;
            c.socket = None;
            c.transaction_index = None;
            let id = std::mem::replace(&mut c.client_id, 0);
            Some((c.ticket.take(), id))
        })?;
        self.stop_talk.store(true, Ordering::Release);
        self.pending_requests.store(0, Ordering::Release);
        // A sender holding the writer checked the generation before the
        // bump; the next client's `attach_writer` waits for it.
        if let Ok(mut writer) = self.writer.try_lock() {
            *writer = None;
        }
        Some(released)
    }

    pub fn summary(&self) -> ConnectionSummary {
        let stop_talk = self.stop_talk();
        let pending_requests = self.pending_requests();
        self.with_lock(|c| ConnectionSummary {
            index: self.index,
            generation: c.generation,
            status: c.status,
            client_id: c.client_id,
            client_class: c.client_class,
            session_id: c.session_id,
            peer: c.peer.clone(),
            transaction_index: c.transaction_index,
            in_transaction: c.in_transaction,
            queued_requests: c.request_queue.len(),
            queued_data: c.data_queue.len(),
            queued_errors: c.error_queue.len(),
            waiters: c.wait_queue.len(),
            aborted: c.abort_queue.len(),
            pending_requests,
            stop_talk,
        })
    }
}

impl std::fmt::Debug for ConnectionEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionEntry")
            .field("index", &self.index)
            .field("generation", &self.inner.try_lock().map(|c| c.generation))
            .field("stop_talk", &self.stop_talk())
            .field("pending_requests", &self.pending_requests())
            .finish()
    }
}

/// Serializable view of one connection for diagnostics dumps.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSummary {
    pub index: usize,
    pub generation: u32,
    pub status: ConnStatus,
    pub client_id: u32,
    pub client_class: ClientClass,
    pub session_id: u64,
    pub peer: String,
    pub transaction_index: Option<usize>,
    pub in_transaction: bool,
    pub queued_requests: usize,
    pub queued_data: usize,
    pub queued_errors: usize,
    pub waiters: usize,
    pub aborted: usize,
    pub pending_requests: usize,
    pub stop_talk: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_entry() -> ConnectionEntry {
        let entry = ConnectionEntry::new(0, 4);
        entry.with_lock(|c| c.status = ConnStatus::Open);
        entry
    }

    #[test]
    fn test_request_id_skips_zero_and_live_ids() {
        let entry = open_entry();
        entry.with_lock(|c| {
            c.request_id_cursor = u16::MAX - 1;
            let mut e = c.new_entry(u16::MAX);
            e.size = 1;
            c.data_queue.push_back(e);
            let aborted = c.new_entry(1);
            c.abort_queue.push(aborted);
        });
        // MAX is queued, 0 is skipped, 1 is aborted
        assert_eq!(entry.next_request_id().unwrap(), 2);
    }

    #[test]
    fn test_request_ids_exhausted() {
        let entry = open_entry();
        entry.with_lock(|c| {
            for rid in 1..=u16::MAX {
                let e = c.new_entry(rid);
                c.request_queue.push_back(e);
            }
            assert!(matches!(
                c.next_request_id(),
                Err(ConnError::InternalInconsistency(_))
            ));
        });
    }

    #[test]
    fn test_purge_request_id_recycles() {
        let entry = open_entry();
        entry.with_lock(|c| {
            for rid in [1, 2, 1] {
                let e = c.new_entry(rid);
                c.data_queue.push_back(e);
            }
            let e = c.new_entry(1);
            c.request_queue.push_back(e);
            c.purge_request_id(1);
            assert_eq!(c.data_queue.len(), 1);
            assert!(c.request_queue.is_empty());
            assert!(!c.holds_request_id(1));
            assert!(c.holds_request_id(2));
            assert_eq!(c.entry_pool.len(), 3);
        });
    }

    #[test]
    fn test_eid() {
        let entry = ConnectionEntry::new(5, 1);
        assert_eq!(entry.eid(9), (5 << 16) | 9);
    }
}
