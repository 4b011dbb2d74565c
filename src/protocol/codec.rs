use super::header::{NetHeader, HEADER_SIZE};
use crate::error::ConnError;
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// One decoded packet: its header and, for Data/Error packets, the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: NetHeader,
    pub payload: BytesMut,
    /// The announced payload exceeded the buffer limit and was drained unread.
    pub overflowed: bool,
}

impl Frame {
    pub fn new(header: NetHeader, payload: BytesMut) -> Self {
        Frame {
            header,
            payload,
            overflowed: false,
        }
    }

    pub fn header_only(header: NetHeader) -> Self {
        Self::new(header, BytesMut::new())
    }
}

#[derive(Debug, Clone, Copy)]
enum DecodeState {
    Header,
    Payload { header: NetHeader, len: usize },
    Discard { header: NetHeader, remaining: usize },
}

/// Packet framer: header first, then `buffer_size` payload bytes for
/// Data/Error packets. Payloads larger than `max_payload` are skipped on
/// the stream and surface as an `overflowed` frame with no payload.
#[derive(Debug)]
pub struct PacketCodec {
    max_payload: usize,
    state: DecodeState,
}

impl PacketCodec {
    pub fn new(max_payload: usize) -> Self {
        debug_assert!(max_payload > 0, "max_payload must be positive");
        PacketCodec {
            max_payload,
            state: DecodeState::Header,
        }
    }

    /// True when no partially-decoded packet is pending.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, DecodeState::Header)
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_MAX_PAYLOAD)
    }
}

impl Decoder for PacketCodec {
    type Item = Frame;
    type Error = ConnError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ConnError> {
        loop {
            match self.state {
                DecodeState::Header => {
                    if src.len() < HEADER_SIZE {
                        src.reserve(HEADER_SIZE - src.len());
                        return Ok(None);
                    }
                    let header = NetHeader::decode(&src[..HEADER_SIZE])?;
                    src.advance(HEADER_SIZE);

                    let len = header.buffer_size as usize;
                    if !header.packet_type.carries_payload() || len == 0 {
                        return Ok(Some(Frame::header_only(header)));
                    }
                    self.state = if len > self.max_payload {
                        DecodeState::Discard {
                            header,
                            remaining: len,
                        }
                    } else {
                        DecodeState::Payload { header, len }
                    };
                }
                DecodeState::Payload { header, len } => {
                    if src.len() < len {
                        src.reserve(len - src.len());
                        return Ok(None);
                    }
                    let payload = src.split_to(len);
                    self.state = DecodeState::Header;
                    return Ok(Some(Frame::new(header, payload)));
                }
                DecodeState::Discard { header, remaining } => {
                    let n = remaining.min(src.len());
                    src.advance(n);
                    let remaining = remaining - n;
                    if remaining > 0 {
                        self.state = DecodeState::Discard { header, remaining };
                        return Ok(None);
                    }
                    self.state = DecodeState::Header;
                    return Ok(Some(Frame {
                        header,
                        payload: BytesMut::new(),
                        overflowed: true,
                    }));
                }
            }
        }
    }
}

impl Encoder<Frame> for PacketCodec {
    type Error = ConnError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), ConnError> {
        let mut header = frame.header;
        if header.packet_type.carries_payload() {
            header.buffer_size = u32::try_from(frame.payload.len())
                .map_err(|_| ConnError::Protocol("payload too large".into()))?;
        }
        dst.reserve(HEADER_SIZE + frame.payload.len());
        header.encode(dst);
        if header.packet_type.carries_payload() {
            dst.put_slice(&frame.payload);
        }
        Ok(())
    }
}
