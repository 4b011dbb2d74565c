//! Outbound packets and the client side of the wire protocol.
//!
//! The server writes through the write half attached to each
//! `ConnectionEntry`; a send holds the writer lock for the whole packet so
//! concurrent command tasks never interleave header and payload bytes.

use crate::admission::ClientClass;
use crate::connection::{BoxedWriter, ConnectionEntry};
use crate::error::ConnError;
use crate::protocol::{ConnectReason, Frame, NetHeader, PacketCodec, PacketType, HEADER_SIZE};
use bytes::{Buf, BufMut, BytesMut};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_util::codec::Framed;
use tracing::{debug, trace};

impl ConnectionEntry {
    pub async fn attach_writer(&self, writer: BoxedWriter) {
        *self.writer.lock().await = Some(writer);
    }

    /// Write one packet: header, then payload for Data/Error packets.
    pub async fn send_packet(&self, header: NetHeader, payload: &[u8]) -> Result<(), ConnError> {
        self.send_packet_in(None, header, payload).await
    }

    /// The generation is checked with the writer held, so a reset slot's
    /// next client cannot attach its writer before this send is done.
    pub(crate) async fn send_packet_in(
        &self,
        generation: Option<u32>,
        mut header: NetHeader,
        payload: &[u8],
    ) -> Result<(), ConnError> {
        if header.packet_type.carries_payload() {
            header.buffer_size = u32::try_from(payload.len())
                .map_err(|_| ConnError::Protocol("payload too large".into()))?;
        }
        let mut head = [0u8; HEADER_SIZE];
        header.encode(&mut &mut head[..]);

        let mut writer = self.writer.lock().await;
        if !self.with_lock(|c| c.is_generation(generation)) {
            return Err(ConnError::ConnectionClosed);
        }
        let w = writer.as_mut().ok_or(ConnError::ConnectionClosed)?;
        w.write_all(&head).await?;
        if header.packet_type.carries_payload() && !payload.is_empty() {
            w.write_all(payload).await?;
        }
        w.flush().await?;
        trace!(conn = self.index(), kind = ?header.packet_type, rid = header.request_id, "sent");
        Ok(())
    }

    fn reply_header(&self, header: NetHeader) -> NetHeader {
        let (tran, invalidate) = self.with_lock(|c| (c.transaction_id, c.invalidate_snapshot));
        let mut header = header.with_invalidate_snapshot(invalidate);
        header.transaction_id = tran;
        header
    }

    pub async fn send_reply(&self, request_id: u16, payload: &[u8]) -> Result<(), ConnError> {
        self.send_reply_in(None, request_id, payload).await
    }

    pub(crate) async fn send_reply_in(
        &self,
        generation: Option<u32>,
        request_id: u16,
        payload: &[u8],
    ) -> Result<(), ConnError> {
        let header = self.reply_header(NetHeader::data(request_id, 0));
        self.send_packet_in(generation, header, payload).await
    }

    pub async fn send_error(
        &self,
        request_id: u16,
        error_code: i32,
        payload: &[u8],
    ) -> Result<(), ConnError> {
        self.send_error_in(None, request_id, error_code, payload).await
    }

    pub(crate) async fn send_error_in(
        &self,
        generation: Option<u32>,
        request_id: u16,
        error_code: i32,
        payload: &[u8],
    ) -> Result<(), ConnError> {
        let header = self.reply_header(NetHeader::error(request_id, error_code, 0));
        self.send_packet_in(generation, header, payload).await
    }

    /// Drop everything queued for `request_id`, then tell the client.
    pub async fn send_abort(&self, request_id: u16) -> Result<(), ConnError> {
        self.send_abort_in(None, request_id).await
    }

    pub(crate) async fn send_abort_in(
        &self,
        generation: Option<u32>,
        request_id: u16,
    ) -> Result<(), ConnError> {
        self.remove_unexpected_packets_in(generation, request_id);
        let header = self.reply_header(NetHeader::new(PacketType::Abort, request_id));
        self.send_packet_in(generation, header, &[]).await
    }

    pub async fn send_close(&self) -> Result<(), ConnError> {
        self.send_packet(NetHeader::new(PacketType::Close, 0), &[]).await
    }

    /// Shut down and detach the write half.
    pub async fn shutdown_transport(&self) {
        if let Some(mut w) = self.writer.lock().await.take() {
            if let Err(e) = w.shutdown().await {
                debug!(conn = self.index(), error = %e, "transport shutdown failed");
            }
        }
    }
}

/// Reply to a client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Data(BytesMut),
    Error { code: i32, payload: BytesMut },
    Aborted,
}

/// Client end of a connection.
pub struct ClientConnection<S> {
    framed: Framed<S, PacketCodec>,
    client_id: u32,
    next_rid: u16,
    /// Replies that arrived while waiting for another request id
    early: HashMap<u16, Reply>,
}

/// Connect over TCP and run the handshake for `class`.
pub async fn open_client(
    addr: impl ToSocketAddrs,
    class: ClientClass,
) -> Result<ClientConnection<TcpStream>, ConnError> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    ClientConnection::handshake(stream, class).await
}

impl<S> ClientConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Send the connect request and check the server's reason code.
    pub async fn handshake(stream: S, class: ClientClass) -> Result<Self, ConnError> {
        let mut framed = Framed::new(stream, PacketCodec::default());
        framed
            .send(Frame::header_only(NetHeader::command(0, class.code(), 0)))
            .await?;

        let reply = framed.next().await.ok_or(ConnError::ConnectionClosed)??;
        if reply.header.packet_type != PacketType::Data || reply.payload.len() < 8 {
            return Err(ConnError::Protocol("malformed connect reply".into()));
        }
        let mut payload = reply.payload;
        let code = payload.get_u32();
        let client_id = payload.get_u32();
        match ConnectReason::from_u32(code) {
            Some(ConnectReason::Connected) => Ok(ClientConnection {
                framed,
                client_id,
                next_rid: 0,
                early: HashMap::new(),
            }),
            Some(ConnectReason::ClientsExceeded) => Err(ConnError::ClientsExceeded),
            Some(ConnectReason::ServerBusy) => Err(ConnError::PoolExhausted),
            Some(ConnectReason::ServerUnavailable) => Err(ConnError::RequestRefused),
            None => Err(ConnError::Protocol(format!("unknown connect reason {}", code))),
        }
    }

    pub fn client_id(&self) -> u32 {
        self.client_id
    }

    fn allocate_rid(&mut self) -> u16 {
        self.next_rid = self.next_rid.wrapping_add(1).max(1);
        self.next_rid
    }

    /// Send a command without waiting. Returns its request id.
    pub async fn send_command(&mut self, function_code: u16, payload: &[u8]) -> Result<u16, ConnError> {
        let rid = self.allocate_rid();
        let size = u32::try_from(payload.len())
            .map_err(|_| ConnError::Protocol("payload too large".into()))?;
        self.framed
            .feed(Frame::header_only(NetHeader::command(rid, function_code, size)))
            .await?;
        if !payload.is_empty() {
            self.framed
                .feed(Frame::new(NetHeader::data(rid, size), BytesMut::from(payload)))
                .await?;
        }
        self.framed.flush().await?;
        Ok(rid)
    }

    /// Next reply for `request_id`. Replies for other ids are kept until
    /// asked for.
    pub async fn recv_reply(&mut self, request_id: u16) -> Result<Reply, ConnError> {
        if let Some(reply) = self.early.remove(&request_id) {
            return Ok(reply);
        }
        loop {
            let frame = self.framed.next().await.ok_or(ConnError::ConnectionClosed)??;
            let reply = match frame.header.packet_type {
                PacketType::Close => return Err(ConnError::ConnectionClosed),
                PacketType::Data => Reply::Data(frame.payload),
                PacketType::Error => Reply::Error {
                    code: frame.header.error_code,
                    payload: frame.payload,
                },
                PacketType::Abort => Reply::Aborted,
                other => return Err(ConnError::Protocol(format!("unexpected {:?} reply", other))),
            };
            if frame.header.request_id == request_id {
                return Ok(reply);
            }
            trace!(rid = frame.header.request_id, "reply held for later");
            self.early.insert(frame.header.request_id, reply);
        }
    }

    /// Send a command and wait for its reply.
    pub async fn request(&mut self, function_code: u16, payload: &[u8]) -> Result<Reply, ConnError> {
        let rid = self.send_command(function_code, payload).await?;
        self.recv_reply(rid).await
    }

    pub async fn send_abort(&mut self, request_id: u16) -> Result<(), ConnError> {
        self.framed
            .send(Frame::header_only(NetHeader::new(PacketType::Abort, request_id)))
            .await
    }

    /// Say goodbye and shut the stream.
    pub async fn close(mut self) -> Result<(), ConnError> {
        self.framed
            .send(Frame::header_only(NetHeader::new(PacketType::Close, 0)))
            .await?;
        self.framed.get_mut().shutdown().await?;
        Ok(())
    }
}

/// Connect reply payload: reason code then client id.
pub(crate) fn connect_reply(reason: ConnectReason, client_id: u32) -> BytesMut {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_u32(reason as u32);
    buf.put_u32(client_id);
    buf
}
