use bytes::BytesMut;
use crossbeam::queue::ArrayQueue;

/// Lock-free pool of read buffers shared by all connection readers.
pub struct BufferPool {
    pool: ArrayQueue<BytesMut>,
    capacity: usize,
}

impl BufferPool {
    pub fn new(size: usize, buffer_capacity: usize) -> Self {
        let pool = ArrayQueue::new(size.max(1));
        for _ in 0..size {
            let _ = pool.push(BytesMut::with_capacity(buffer_capacity));
        }
        BufferPool {
            pool,
            capacity: buffer_capacity,
        }
    }

    pub fn acquire(&self) -> BytesMut {
        self.pool
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.capacity))
    }

    /// Return a buffer. Buffers that grew past twice the nominal capacity
    /// are dropped instead of pooled.
    pub fn release(&self, mut buf: BytesMut) {
        buf.clear();
        if buf.capacity() <= self.capacity * 2 {
            let _ = self.pool.push(buf);
        }
    }

    pub fn available(&self) -> usize {
        self.pool.len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(128, 8192)
    }
}
