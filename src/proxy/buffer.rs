//! Fixed-size byte buffer pool.
//!
//! Buffers are handed out as `PooledBuffer` and go back to the pool when
//! dropped, on every exit path of the streamer.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

use bytes::BytesMut;

/// Pool of equally sized buffers.
#[derive(Debug)]
pub struct BufferPool {
    buffers: Mutex<Vec<BytesMut>>,
    buffer_size: usize,
    max_pooled: usize,
}

impl BufferPool {
    pub fn new(buffer_size: usize, max_pooled: usize) -> Arc<Self> {
        Arc::new(Self {
            buffers: Mutex::new(Vec::with_capacity(max_pooled)),
            buffer_size,
            max_pooled,
        })
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Take a cleared buffer, allocating when the pool is empty.
    pub fn get(self: &Arc<Self>) -> PooledBuffer {
        let pooled = self.buffers.lock().unwrap_or_else(|e| e.into_inner()).pop();
        let buf = pooled.unwrap_or_else(|| BytesMut::with_capacity(self.buffer_size));
        PooledBuffer {
            buf,
            pool: self.clone(),
        }
    }

    /// Buffers currently idle in the pool.
    pub fn idle(&self) -> usize {
        self.buffers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn put(&self, mut buf: BytesMut) {
        buf.clear();
        // undersized buffers (split off or shrunk by a caller) are dropped
        if buf.capacity() < self.buffer_size {
            return;
        }
        let mut buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        if buffers.len() < self.max_pooled {
            buffers.push(buf);
        }
    }
}

/// A buffer on loan from a `BufferPool`.
#[derive(Debug)]
pub struct PooledBuffer {
    buf: BytesMut,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = BytesMut;
    fn deref(&self) -> &BytesMut {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.put(std::mem::take(&mut self.buf));
    }
}
