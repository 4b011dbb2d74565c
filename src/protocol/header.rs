use crate::error::ConnError;
use bytes::{Buf, BufMut};

/// Encoded size of a `NetHeader` on the wire.
pub const HEADER_SIZE: usize = 22;

/// Header flag: the client's snapshot must be invalidated before the request runs.
pub const FLAG_INVALIDATE_SNAPSHOT: u16 = 0x0001;

/// Packet kinds carried in the header's `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PacketType {
    Command = 1,
    Data = 2,
    Abort = 3,
    Close = 4,
    Error = 5,
}

impl PacketType {
    pub fn from_u32(value: u32) -> Result<Self, ConnError> {
        match value {
            1 => Ok(PacketType::Command),
            2 => Ok(PacketType::Data),
            3 => Ok(PacketType::Abort),
            4 => Ok(PacketType::Close),
            5 => Ok(PacketType::Error),
            other => Err(ConnError::WrongPacketType(other)),
        }
    }

    /// Data and Error packets are followed by `buffer_size` payload bytes.
    /// For a Command, `buffer_size` announces the next Data frame instead.
    #[inline]
    pub fn carries_payload(self) -> bool {
        matches!(self, PacketType::Data | PacketType::Error)
    }
}

/// Fixed-size packet envelope, big-endian on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetHeader {
    pub packet_type: PacketType,
    pub request_id: u16,
    pub transaction_id: i32,
    pub flags: u16,
    pub error_code: i32,
    pub buffer_size: u32,
    pub function_code: u16,
}

impl NetHeader {
    pub fn new(packet_type: PacketType, request_id: u16) -> Self {
        NetHeader {
            packet_type,
            request_id,
            transaction_id: 0,
            flags: 0,
            error_code: 0,
            buffer_size: 0,
            function_code: 0,
        }
    }

    pub fn command(request_id: u16, function_code: u16, buffer_size: u32) -> Self {
        NetHeader {
            function_code,
            buffer_size,
            ..Self::new(PacketType::Command, request_id)
        }
    }

    pub fn data(request_id: u16, buffer_size: u32) -> Self {
        NetHeader {
            buffer_size,
            ..Self::new(PacketType::Data, request_id)
        }
    }

    pub fn error(request_id: u16, error_code: i32, buffer_size: u32) -> Self {
        NetHeader {
            error_code,
            buffer_size,
            ..Self::new(PacketType::Error, request_id)
        }
    }

    #[inline]
    pub fn invalidate_snapshot(&self) -> bool {
        self.flags & FLAG_INVALIDATE_SNAPSHOT != 0
    }

    pub fn with_invalidate_snapshot(mut self, on: bool) -> Self {
        if on {
            self.flags |= FLAG_INVALIDATE_SNAPSHOT;
        } else {
            self.flags &= !FLAG_INVALIDATE_SNAPSHOT;
        }
        self
    }

    pub fn encode<B: BufMut>(&self, dst: &mut B) {
        dst.put_u32(self.packet_type as u32);
        dst.put_u16(self.request_id);
        dst.put_i32(self.transaction_id);
        dst.put_u16(self.flags);
        dst.put_i32(self.error_code);
        dst.put_u32(self.buffer_size);
        dst.put_u16(self.function_code);
    }

    /// Decode a header from exactly `HEADER_SIZE` bytes.
    pub fn decode(mut src: &[u8]) -> Result<Self, ConnError> {
        if src.len() < HEADER_SIZE {
            return Err(ConnError::Protocol(format!(
                "short header: {} bytes",
                src.len()
            )));
        }
        let packet_type = PacketType::from_u32(src.get_u32())?;
        let header = NetHeader {
            packet_type,
            request_id: src.get_u16(),
            transaction_id: src.get_i32(),
            flags: src.get_u16(),
            error_code: src.get_i32(),
            buffer_size: src.get_u32(),
            function_code: src.get_u16(),
        };
        Ok(header)
    }
}
