//! Response streaming to the client.
//!
//! # Responsibilities
//! - Copy the backend body into the client body channel
//! - Apply the cluster's flush policy
//! - Enforce the client write deadline
//! - Stop reading the backend as soon as the client is gone
//!
//! # Design Decisions
//! - The client body is a bounded channel, so a slow client pushes back
//!   on the backend read
//! - Dropping the backend body is what cancels the backend request; it is
//!   owned by `send` and dropped on every exit path
//! - Coalescing buffers come from a fixed-size pool; flushed bytes are
//!   copied out so the buffer returns to the pool at full capacity
//! - The write deadline also bounds waiting on the backend body, so a
//!   stalled backend cannot pin the request past it

use std::io;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use bytes::Bytes;
use hyper::body::Frame;
use http_body_util::{BodyExt, StreamBody};
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::proxy::buffer::{BufferPool, PooledBuffer};

/// When buffered response bytes are pushed to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushInterval {
    /// Every chunk is forwarded as soon as it arrives.
    Streaming,
    /// Chunks are coalesced up to the buffer size.
    Buffered,
    /// Chunks are coalesced and flushed at least once per interval.
    Periodic(Duration),
}

impl FlushInterval {
    /// Negative streams, zero buffers, positive flushes periodically.
    pub fn from_millis(ms: i64) -> Self {
        match ms {
            ms if ms < 0 => FlushInterval::Streaming,
            0 => FlushInterval::Buffered,
            ms => FlushInterval::Periodic(Duration::from_millis(ms as u64)),
        }
    }
}

/// Streaming failures.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("client closed the connection")]
    ClientClosed,
    #[error("client write deadline exceeded")]
    WriteTimeout,
    #[error("reading backend body: {0}")]
    Backend(String),
}

type FrameResult = Result<Frame<Bytes>, io::Error>;

/// Sending half of a client response body.
#[derive(Debug, Clone)]
pub struct ClientWriter {
    tx: mpsc::Sender<FrameResult>,
}

/// A response body fed through a `ClientWriter`.
pub fn client_channel(capacity: usize) -> (ClientWriter, Body) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let frames = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|frame| (frame, rx))
    });
    (ClientWriter { tx }, Body::new(StreamBody::new(frames)))
}

impl ClientWriter {
    pub async fn send(&self, frame: Frame<Bytes>, deadline: Option<Instant>) -> Result<(), StreamError> {
        let send = self.tx.send(Ok(frame));
        let sent = match deadline {
            Some(at) => tokio::time::timeout_at(at, send)
                .await
                .map_err(|_| StreamError::WriteTimeout)?,
            None => send.await,
        };
        sent.map_err(|_| StreamError::ClientClosed)
    }

    /// Resolves once the client side of the body is gone.
    pub async fn closed(&self) {
        self.tx.closed().await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Make the client see a broken body instead of a clean end.
    pub fn abort(&self, reason: &str) {
        let _ = self
            .tx
            .try_send(Err(io::Error::new(io::ErrorKind::BrokenPipe, reason.to_string())));
    }
}

/// Per-response streaming options.
#[derive(Debug, Clone, Copy)]
pub struct StreamOptions {
    pub flush: FlushInterval,
    pub cancel_on_client_close: bool,
    /// Absolute deadline for the whole body.
    pub write_deadline: Option<Instant>,
}

/// Copies backend bodies to clients.
#[derive(Debug, Clone)]
pub struct ResponseStreamer {
    pool: Arc<BufferPool>,
}

/// Copy the buffered bytes out and clear the buffer, which keeps its
/// capacity for the pool.
fn take_chunk(buf: &mut PooledBuffer) -> Bytes {
    let chunk = Bytes::copy_from_slice(&buf[..]);
    buf.clear();
    chunk
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

impl ResponseStreamer {
    pub fn new(pool: Arc<BufferPool>) -> Self {
        Self { pool }
    }

    /// Stream `body` into `writer`. Returns the number of body bytes
    /// forwarded. The backend body is dropped when this returns.
    pub async fn send(&self, writer: &ClientWriter, mut body: Body, opts: &StreamOptions) -> Result<u64, StreamError> {
        let mut buf = self.pool.get();
        let capacity = self.pool.buffer_size();
        let mut written = 0u64;
        let mut ticker = match opts.flush {
            FlushInterval::Periodic(period) => {
                let mut interval = tokio::time::interval_at(Instant::now() + period, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                Some(interval)
            }
            _ => None,
        };

        loop {
            let frame = tokio::select! {
                biased;
                _ = writer.closed(), if opts.cancel_on_client_close => {
                    return Err(StreamError::ClientClosed);
                }
                // a backend stalled mid-body is bounded by the write deadline too
                _ = expire(opts.write_deadline) => {
                    return Err(StreamError::WriteTimeout);
                }
                _ = tick(&mut ticker) => {
                    if !buf.is_empty() {
                        let chunk = take_chunk(&mut buf);
                        writer.send(Frame::data(chunk), opts.write_deadline).await?;
                    }
                    continue;
                }
                frame = body.frame() => frame,
            };

            let frame = match frame {
                None => break,
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    if !buf.is_empty() {
                        let chunk = take_chunk(&mut buf);
                        writer.send(Frame::data(chunk), opts.write_deadline).await?;
                    }
                    return Err(StreamError::Backend(e.to_string()));
                }
            };

            match frame.into_data() {
                Ok(data) => {
                    written += data.len() as u64;
                    if opts.flush == FlushInterval::Streaming {
                        writer.send(Frame::data(data), opts.write_deadline).await?;
                        continue;
                    }
                    if buf.len() + data.len() > capacity && !buf.is_empty() {
                        let chunk = take_chunk(&mut buf);
                        writer.send(Frame::data(chunk), opts.write_deadline).await?;
                    }
                    if data.len() >= capacity {
                        writer.send(Frame::data(data), opts.write_deadline).await?;
                    } else {
                        buf.extend_from_slice(&data);
                    }
                }
                // trailers end the body
                Err(frame) => {
                    if !buf.is_empty() {
                        let chunk = take_chunk(&mut buf);
                        writer.send(Frame::data(chunk), opts.write_deadline).await?;
                    }
                    writer.send(frame, opts.write_deadline).await?;
                }
            }
        }

        if !buf.is_empty() {
            let chunk = take_chunk(&mut buf);
            writer.send(Frame::data(chunk), opts.write_deadline).await?;
        }
        Ok(written)
    }
}
