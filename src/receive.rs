//! Request-side API used by command handlers: dequeue commands, wait for
//! data on a request id, fetch client errors and manage unexpected packets.
//!
//! A receive either finds its entry already queued or parks a `WaitEntry`
//! carrying the send half of a one-shot channel. The dispatcher completes
//! that channel. On timeout or interrupt the receiver tries to take its
//! `WaitEntry` back. Whichever side removes it first owns cleanup: a
//! payload that raced in after the wait ended is freed by the receiver, a
//! payload arriving after the receiver left is freed by the dispatcher.
//! The id stays marked abandoned until a new command reuses it.
//!
//! Command tasks go through `ConnectionRef`, whose calls fail with
//! `ConnectionClosed` once the slot has been reset for another client.

use crate::connection::{
    ConnInner, ConnStatus, ConnectionEntry, ConnectionHandle, EntryStatus, QueueEntry, UserBuffer,
};
use crate::error::ConnError;
use bytes::BytesMut;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A dequeued command header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    pub request_id: u16,
    pub function_code: u16,
    /// Size of the data frame that accompanies the command, 0 if none
    pub buffer_size: usize,
    pub transaction_id: i32,
    pub invalidate_snapshot: bool,
}

/// A received data payload. Ownership moves to the caller.
#[derive(Debug)]
pub struct DataPacket {
    pub request_id: u16,
    pub payload: BytesMut,
    pub transaction_id: i32,
    pub invalidate_snapshot: bool,
}

impl DataPacket {
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// A client-side error delivered on the error queue.
#[derive(Debug)]
pub struct ErrorPacket {
    pub request_id: u16,
    pub error_code: i32,
    pub payload: BytesMut,
}

enum Lookup {
    Ready(QueueEntry),
    Parked(oneshot::Receiver<QueueEntry>, CancellationToken),
}

enum WaitOutcome {
    Delivered(QueueEntry),
    Interrupted,
    TimedOut,
    Closed,
}

fn into_packet(entry: QueueEntry) -> Result<DataPacket, ConnError> {
    if entry.status == EntryStatus::CannotAllocateBuffer {
        return Err(ConnError::CannotAllocateBuffer {
            request_id: entry.request_id,
        });
    }
    Ok(DataPacket {
        request_id: entry.request_id,
        payload: entry.payload.unwrap_or_default(),
        transaction_id: entry.transaction_id,
        invalidate_snapshot: entry.invalidate_snapshot,
    })
}

/// Queued data found while a user buffer is registered is copied into it.
fn fill_user_buffer(c: &mut ConnInner, mut entry: QueueEntry) -> QueueEntry {
    if let Some(mut user) = c.take_user_buffer(entry.request_id) {
        if let Some(payload) = entry.payload.take() {
            let n = payload.len().min(user.capacity);
            user.buffer.clear();
            user.buffer.extend_from_slice(&payload[..n]);
            entry.size = n;
            entry.payload = Some(user.buffer);
        }
    }
    entry
}

impl ConnectionEntry {
    /// Pop the oldest queued command.
    pub fn receive_command(&self) -> Result<RequestHeader, ConnError> {
        self.receive_command_in(None)
    }

    pub(crate) fn receive_command_in(&self, generation: Option<u32>) -> Result<RequestHeader, ConnError> {
        self.with_lock(|c| {
            c.check_serving(generation)?;
            let entry = c.request_queue.pop_front().ok_or(ConnError::NoDataAvailable)?;
            let header = RequestHeader {
                request_id: entry.request_id,
                function_code: entry.function_code,
                buffer_size: entry.size,
                transaction_id: entry.transaction_id,
                invalidate_snapshot: entry.invalidate_snapshot,
            };
            c.recycle(entry);
            Ok(header)
        })
    }

    /// Function code of the next queued command, without dequeuing it.
    pub fn peek_command(&self) -> Option<u16> {
        self.with_lock(|c| c.request_queue.front().map(|e| e.function_code))
    }

    /// Wait for the data packet tagged `request_id`.
    ///
    /// `None` waits until delivery, interrupt or connection purge. A zero
    /// timeout only checks the queue. A timeout yields `TimedOut`, an
    /// interrupt or an empty check `NoDataAvailable`.
    pub async fn receive_data(
        &self,
        request_id: u16,
        timeout: Option<Duration>,
    ) -> Result<DataPacket, ConnError> {
        self.receive_data_in(None, request_id, timeout).await
    }

    pub(crate) async fn receive_data_in(
        &self,
        generation: Option<u32>,
        request_id: u16,
        timeout: Option<Duration>,
    ) -> Result<DataPacket, ConnError> {
        let lookup = self.with_lock(|c| {
            c.check_serving(generation)?;
            c.take_abandoned(request_id);
            if let Some(entry) = ConnInner::take_from(&mut c.data_queue, request_id) {
                return Ok(Lookup::Ready(fill_user_buffer(c, entry)));
            }
            if timeout == Some(Duration::ZERO) {
                return Err(ConnError::NoDataAvailable);
            }
            if c.wait_queue.iter().any(|w| w.request_id == request_id) {
                return Err(ConnError::InternalInconsistency(format!(
                    "second receiver for request {}",
                    request_id
                )));
            }
            let (tx, rx) = oneshot::channel();
            let mut wait = c.wait_pool.take();
            wait.request_id = request_id;
            wait.tx = Some(tx);
            c.wait_queue.push(wait);
            Ok(Lookup::Parked(rx, c.interrupt.clone()))
        })?;

        let (mut rx, interrupt) = match lookup {
            Lookup::Ready(entry) => return into_packet(entry),
            Lookup::Parked(rx, interrupt) => (rx, interrupt),
        };

        let outcome = {
            let deadline = async {
                match timeout {
                    Some(d) => tokio::time::sleep(d).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::pin!(deadline);
            tokio::select! {
                res = &mut rx => match res {
                    Ok(entry) => WaitOutcome::Delivered(entry),
                    Err(_) => WaitOutcome::Closed,
                },
                _ = interrupt.cancelled() => WaitOutcome::Interrupted,
                _ = &mut deadline => WaitOutcome::TimedOut,
            }
        };

        let failure = match outcome {
            WaitOutcome::Delivered(entry) => return into_packet(entry),
            WaitOutcome::Closed => return Err(ConnError::ConnectionClosed),
            WaitOutcome::Interrupted => ConnError::NoDataAvailable,
            WaitOutcome::TimedOut => ConnError::TimedOut,
        };

        let still_parked = self.with_lock(|c| {
            if c.take_waiter(request_id).is_some() {
                c.abandoned.push(request_id);
                true
            } else {
                false
            }
        });
        if still_parked {
            debug!(conn = self.index(), rid = request_id, error = %failure, "receive abandoned");
            return Err(failure);
        }
        // The dispatcher took the wait entry first; its send is in flight.
        // Whatever raced in is freed with the receiver.
        if let Ok(entry) = rx.await {
            debug!(conn = self.index(), rid = request_id, size = entry.size, "raced delivery discarded");
        }
        Err(failure)
    }

    /// Pop the queued error for `request_id`.
    pub fn receive_error(&self, request_id: u16) -> Result<ErrorPacket, ConnError> {
        self.receive_error_in(None, request_id)
    }

    pub(crate) fn receive_error_in(
        &self,
        generation: Option<u32>,
        request_id: u16,
    ) -> Result<ErrorPacket, ConnError> {
        self.with_lock(|c| {
            c.check_serving(generation)?;
            let mut entry = ConnInner::take_from(&mut c.error_queue, request_id)
                .ok_or(ConnError::NoDataAvailable)?;
            let packet = ErrorPacket {
                request_id,
                error_code: entry.error_code,
                payload: entry.payload.take().unwrap_or_default(),
            };
            c.recycle(entry);
            Ok(packet)
        })
    }

    pub fn has_pending_error(&self, request_id: u16) -> bool {
        self.has_pending_error_in(None, request_id)
    }

    pub(crate) fn has_pending_error_in(&self, generation: Option<u32>, request_id: u16) -> bool {
        self.with_lock(|c| {
            c.is_generation(generation) && c.error_queue.iter().any(|e| e.request_id == request_id)
        })
    }

    /// Register a caller buffer for the next data packet on `request_id`.
    /// Returns false if the request was aborted.
    pub fn queue_user_buffer(&self, request_id: u16, capacity: usize) -> bool {
        self.queue_user_buffer_in(None, request_id, capacity)
    }

    pub(crate) fn queue_user_buffer_in(
        &self,
        generation: Option<u32>,
        request_id: u16,
        capacity: usize,
    ) -> bool {
        self.with_lock(|c| {
            if !c.is_generation(generation) || c.is_aborted(request_id) {
                return false;
            }
            c.buffer_queue.push(UserBuffer {
                request_id,
                buffer: BytesMut::with_capacity(capacity),
                capacity,
            });
            true
        })
    }

    pub fn remove_unexpected_packets(&self, request_id: u16) {
        self.remove_unexpected_packets_in(None, request_id);
    }

    pub(crate) fn remove_unexpected_packets_in(&self, generation: Option<u32>, request_id: u16) {
        self.with_lock(|c| {
            if c.is_generation(generation) {
                c.purge_request_id(request_id);
            }
        });
    }

    pub fn remove_all_unexpected_packets(&self) {
        self.with_lock(|c| c.purge_all());
    }

    /// Stop serving: empty every queue and move to `Closing`.
    pub fn end_request(&self) {
        self.end_request_in(None);
    }

    pub(crate) fn end_request_in(&self, generation: Option<u32>) {
        self.with_lock(|c| {
            if !c.is_generation(generation) {
                return;
            }
            c.purge_all();
            if c.status == ConnStatus::Open {
                c.status = ConnStatus::Closing;
            }
        });
    }
}

/// A connection bound to the client it served when the command was
/// dequeued. Every call fails with `ConnectionClosed` (or is a no-op) once
/// the slot has been reset, even if another client now occupies it.
#[derive(Debug, Clone)]
pub struct ConnectionRef {
    entry: Arc<ConnectionEntry>,
    handle: ConnectionHandle,
}

impl ConnectionRef {
    pub fn new(entry: Arc<ConnectionEntry>, handle: ConnectionHandle) -> Self {
        ConnectionRef { entry, handle }
    }

    /// Bind to whichever client the entry serves right now.
    pub fn bind(entry: &Arc<ConnectionEntry>) -> Self {
        ConnectionRef::new(entry.clone(), entry.handle())
    }

    #[inline]
    fn generation(&self) -> Option<u32> {
        Some(self.handle.generation())
    }

    pub fn entry(&self) -> &Arc<ConnectionEntry> {
        &self.entry
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle
    }

    pub fn index(&self) -> usize {
        self.entry.index()
    }

    pub fn is_current(&self) -> bool {
        self.entry.is_current(self.handle)
    }

    pub fn eid(&self, request_id: u16) -> u32 {
        self.entry.eid(request_id)
    }

    pub fn receive_command(&self) -> Result<RequestHeader, ConnError> {
        self.entry.receive_command_in(self.generation())
    }

    pub async fn receive_data(
        &self,
        request_id: u16,
        timeout: Option<Duration>,
    ) -> Result<DataPacket, ConnError> {
        self.entry
            .receive_data_in(self.generation(), request_id, timeout)
            .await
    }

    pub fn receive_error(&self, request_id: u16) -> Result<ErrorPacket, ConnError> {
        self.entry.receive_error_in(self.generation(), request_id)
    }

    pub fn has_pending_error(&self, request_id: u16) -> bool {
        self.entry.has_pending_error_in(self.generation(), request_id)
    }

    pub fn queue_user_buffer(&self, request_id: u16, capacity: usize) -> bool {
        self.entry
            .queue_user_buffer_in(self.generation(), request_id, capacity)
    }

    pub fn remove_unexpected_packets(&self, request_id: u16) {
        self.entry
            .remove_unexpected_packets_in(self.generation(), request_id);
    }

    pub fn next_request_id(&self) -> Result<u16, ConnError> {
        self.entry.next_request_id_in(self.generation())
    }

    pub fn end_request(&self) {
        self.entry.end_request_in(self.generation());
    }

    pub async fn send_reply(&self, request_id: u16, payload: &[u8]) -> Result<(), ConnError> {
        self.entry
            .send_reply_in(self.generation(), request_id, payload)
            .await
    }

    pub async fn send_error(
        &self,
        request_id: u16,
        error_code: i32,
        payload: &[u8],
    ) -> Result<(), ConnError> {
        self.entry
            .send_error_in(self.generation(), request_id, error_code, payload)
            .await
    }

    pub async fn send_abort(&self, request_id: u16) -> Result<(), ConnError> {
        self.entry.send_abort_in(self.generation(), request_id).await
    }
}
