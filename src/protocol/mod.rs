//! Wire protocol: the fixed 22-byte packet header, the packet codec and a
//! pooled frame reader.
//!
//! ```text
//! +------+-----+------+-------+-------+-------------+---------------+
//! | type | rid | tran | flags | error | buffer_size | function_code |
//! | u32  | u16 | i32  | u16   | i32   | u32         | u16           |
//! +------+-----+------+-------+-------+-------------+---------------+
//!   Data/Error: followed by buffer_size payload bytes
//!   Command:    buffer_size announces the next Data frame
//! ```

mod codec;
mod header;
mod reader;

pub use codec::{Frame, PacketCodec};
pub use header::{NetHeader, PacketType, FLAG_INVALIDATE_SNAPSHOT, HEADER_SIZE};
pub use reader::FrameReader;

/// Reason code returned to a client in reply to its connect request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ConnectReason {
    Connected = 1,
    ClientsExceeded = 2,
    ServerBusy = 3,
    ServerUnavailable = 4,
}

impl ConnectReason {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(ConnectReason::Connected),
            2 => Some(ConnectReason::ClientsExceeded),
            3 => Some(ConnectReason::ServerBusy),
            4 => Some(ConnectReason::ServerUnavailable),
            _ => None,
        }
    }
}

/// Pack a connection slot index and request id into an enquiry id.
#[inline]
pub fn pack_eid(slot_index: usize, request_id: u16) -> u32 {
    debug_assert!(slot_index <= u16::MAX as usize, "slot index {} too large", slot_index);
    ((slot_index as u32) << 16) | request_id as u32
}

#[inline]
pub fn unpack_eid(eid: u32) -> (usize, u16) {
    ((eid >> 16) as usize, (eid & 0xffff) as u16)
}
