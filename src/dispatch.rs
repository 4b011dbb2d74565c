//! Packet dispatcher: classifies each frame and applies its queuing rule.
//!
//! | packet  | rule |
//! |---------|------|
//! | Close   | mark the connection closed |
//! | Abort   | drop queued commands/data for the id, record an abort marker |
//! | Data    | fill a registered buffer or keep the read payload; hand to a parked receiver, else queue |
//! | Error   | always queued on the error queue, never handed to a receiver |
//! | Command | queue the header; if it announces data, read and dispatch the next frame too |
//!
//! Packets for aborted request ids are read off the stream and dropped.
//! Queues are only touched under the connection lock; parked receivers
//! are completed after the lock is released.

use crate::connection::{ConnInner, ConnStatus, ConnectionEntry, EntryStatus, QueueEntry};
use crate::error::ConnError;
use crate::protocol::{Frame, FrameReader, NetHeader, PacketType};
use bytes::BytesMut;
use tokio::io::AsyncRead;
use tokio::sync::oneshot;
use tracing::{debug, warn};

type Delivery = (oneshot::Sender<QueueEntry>, QueueEntry);

/// Result of one dispatch cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Type of the first frame in the cycle
    pub kind: PacketType,
    /// Commands queued during the cycle; each needs a command task
    pub commands: usize,
    /// A Close packet was seen
    pub closed: bool,
}

/// Queue one decoded frame on `conn`. Synchronous; never blocks on I/O.
pub fn queue_frame(conn: &ConnectionEntry, frame: Frame) -> PacketType {
    let Frame {
        header,
        payload,
        overflowed,
    } = frame;

    #[cfg(feature = "trace-frames")]
    debug!(
        conn = conn.index(),
        kind = ?header.packet_type,
        rid = header.request_id,
        size = header.buffer_size,
        "frame"
    );

    let delivery = conn.with_lock(|c| {
        c.transaction_id = header.transaction_id;
        c.invalidate_snapshot = header.invalidate_snapshot();
        match header.packet_type {
            PacketType::Close => {
                c.status = ConnStatus::Closed;
                None
            }
            PacketType::Abort => {
                queue_abort(c, header.request_id);
                None
            }
            PacketType::Data => queue_data(c, &header, payload, overflowed),
            PacketType::Error => {
                queue_error(c, &header, payload, overflowed);
                None
            }
            PacketType::Command => {
                queue_command(c, &header);
                None
            }
        }
    });

    if let Some((tx, entry)) = delivery {
        // The receiver only disappears if its task was dropped; the entry
        // is freed with the failed send.
        if tx.send(entry).is_err() {
            debug!(conn = conn.index(), rid = header.request_id, "receiver gone, data dropped");
        }
    }
    header.packet_type
}

fn queue_abort(c: &mut ConnInner, request_id: u16) {
    for queue in [&mut c.request_queue, &mut c.data_queue] {
        while let Some(entry) = ConnInner::take_from(queue, request_id) {
            c.entry_pool.give_back(entry);
        }
    }
    if !c.is_aborted(request_id) {
        let marker = c.new_entry(request_id);
        c.abort_queue.push(marker);
    }
}

fn queue_data(
    c: &mut ConnInner,
    header: &NetHeader,
    payload: BytesMut,
    overflowed: bool,
) -> Option<Delivery> {
    let rid = header.request_id;
    if c.is_aborted(rid) {
        return None;
    }

    let mut entry = c.new_entry(rid);
    if overflowed {
        warn!(rid, size = header.buffer_size, "payload too large, delivered as failed entry");
        entry.status = EntryStatus::CannotAllocateBuffer;
    } else {
        match c.take_user_buffer(rid) {
            Some(mut user) => {
                let n = payload.len().min(user.capacity);
                user.buffer.clear();
                user.buffer.extend_from_slice(&payload[..n]);
                entry.size = n;
                entry.payload = Some(user.buffer);
            }
            None => {
                entry.size = payload.len();
                entry.payload = Some(payload);
            }
        }
    }

    if let Some(tx) = c.take_waiter(rid) {
        return Some((tx, entry));
    }
    if c.take_abandoned(rid) {
        // Its receiver timed out; nobody will ask for this again
        c.recycle(entry);
        return None;
    }
    c.data_queue.push_back(entry);
    None
}

fn queue_error(c: &mut ConnInner, header: &NetHeader, payload: BytesMut, overflowed: bool) {
    let rid = header.request_id;
    if c.is_aborted(rid) {
        return;
    }
    let mut entry = c.new_entry(rid);
    entry.error_code = header.error_code;
    if overflowed {
        entry.status = EntryStatus::CannotAllocateBuffer;
    } else {
        entry.size = payload.len();
        entry.payload = Some(payload);
    }
    c.error_queue.push_back(entry);
}

fn queue_command(c: &mut ConnInner, header: &NetHeader) {
    let rid = header.request_id;
    // A new command reuses the id; data for it is wanted again
    c.take_abandoned(rid);
    if c.is_aborted(rid) {
        return;
    }
    let mut entry = c.new_entry(rid);
    entry.function_code = header.function_code;
    entry.size = header.buffer_size as usize;
    c.request_queue.push_back(entry);
}

/// Dispatch `frame`, then keep reading while a queued command announces
/// a data frame that has not arrived yet.
pub async fn dispatch_frame<R>(
    conn: &ConnectionEntry,
    frame: Frame,
    reader: &mut FrameReader<R>,
) -> Result<DispatchOutcome, ConnError>
where
    R: AsyncRead + Unpin,
{
    let mut outcome = DispatchOutcome {
        kind: frame.header.packet_type,
        commands: 0,
        closed: false,
    };
    let mut next = Some(frame);
    while let Some(frame) = next.take() {
        let follow_up =
            frame.header.packet_type == PacketType::Command && frame.header.buffer_size > 0;
        match queue_frame(conn, frame) {
            PacketType::Command => outcome.commands += 1,
            PacketType::Close => {
                outcome.closed = true;
                break;
            }
            _ => {}
        }
        if follow_up {
            next = Some(reader.expect_frame().await?);
        }
    }
    Ok(outcome)
}

/// Read one frame and dispatch it.
pub async fn read_and_queue<R>(
    conn: &ConnectionEntry,
    reader: &mut FrameReader<R>,
) -> Result<DispatchOutcome, ConnError>
where
    R: AsyncRead + Unpin,
{
    let frame = reader.expect_frame().await?;
    dispatch_frame(conn, frame, reader).await
}
