use super::codec::{Frame, PacketCodec};
use crate::connection::BufferPool;
use crate::error::ConnError;
use bytes::BytesMut;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::codec::Decoder;

/// Reads frames off a byte stream into a pooled read buffer.
///
/// `next_frame` is cancel-safe: bytes already read stay in the buffer and
/// the codec keeps its partial state, so it can sit inside `select!` or
/// `timeout` without losing data.
pub struct FrameReader<R> {
    reader: R,
    buffer: BytesMut,
    codec: PacketCodec,
    pool: Arc<BufferPool>,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(reader: R, codec: PacketCodec, pool: Arc<BufferPool>) -> Self {
        let buffer = pool.acquire();
        FrameReader {
            reader,
            buffer,
            codec,
            pool,
        }
    }

    /// Next complete frame. `Ok(None)` on a clean end of stream between
    /// frames; a stream that ends mid-frame is `ConnectionClosed`.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>, ConnError> {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.buffer)? {
                return Ok(Some(frame));
            }
            let n = self.reader.read_buf(&mut self.buffer).await?;
            if n == 0 {
                if self.buffer.is_empty() && self.codec.is_idle() {
                    return Ok(None);
                }
                return Err(ConnError::ConnectionClosed);
            }
        }
    }

    /// Like `next_frame`, but end of stream is an error.
    pub async fn expect_frame(&mut self) -> Result<Frame, ConnError> {
        self.next_frame().await?.ok_or(ConnError::ConnectionClosed)
    }
}

impl<R> Drop for FrameReader<R> {
    fn drop(&mut self) {
        let buffer = std::mem::take(&mut self.buffer);
        self.pool.release(buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::header::{NetHeader, PacketType};
    use tokio::io::AsyncWriteExt;
    use tokio_util::codec::Encoder;

    #[tokio::test]
    async fn test_reads_frames_across_writes() {
        let (mut client, server) = tokio::io::duplex(64);
        let pool = Arc::new(BufferPool::new(2, 128));
        let mut reader = FrameReader::new(server, PacketCodec::new(1024), pool);

        let mut bytes = BytesMut::new();
        let mut codec = PacketCodec::new(1024);
        codec
            .encode(Frame::header_only(NetHeader::command(1, 5, 3)), &mut bytes)
            .unwrap();
        codec
            .encode(Frame::new(NetHeader::data(1, 0), BytesMut::from(&b"abc"[..])), &mut bytes)
            .unwrap();

        tokio::spawn(async move {
            for chunk in bytes.chunks(7) {
                client.write_all(chunk).await.unwrap();
            }
        });

        let first = reader.expect_frame().await.unwrap();
        assert_eq!(first.header.packet_type, PacketType::Command);
        let second = reader.expect_frame().await.unwrap();
        assert_eq!(&second.payload[..], b"abc");
        assert!(reader.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_eof_mid_frame_is_closed() {
        let (mut client, server) = tokio::io::duplex(64);
        let pool = Arc::new(BufferPool::new(1, 64));
        let mut reader = FrameReader::new(server, PacketCodec::new(1024), pool);
        client.write_all(&[0, 0, 0, 2, 0]).await.unwrap();
        drop(client);
        assert!(matches!(
            reader.next_frame().await,
            Err(ConnError::ConnectionClosed)
        ));
    }
}
