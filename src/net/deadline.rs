//! Client-side deadlines.
//!
//! # Responsibilities
//! - Give the pipeline one interface for arming read, write and idle
//!   deadlines on the client side of a request
//! - Enforce connection-level deadlines for HTTP/1 inside the IO stream
//! - Keep per-stream deadlines for multiplexed (HTTP/2) requests
//!
//! # Design Decisions
//! - HTTP/1 owns the whole connection, so deadlines live on the socket
//!   (`DeadlineIo`) and also cover the idle time between requests
//! - An HTTP/2 stream must not time out its siblings: its deadlines are
//!   only consulted by the body reader and the response streamer, and idle
//!   handling is left to the h2 connection
//! - Changing a deadline wakes the pending read/write so a newly armed
//!   deadline takes effect without further IO

use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures_util::task::AtomicWaker;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::Notify;
use tokio::time::{Instant, Sleep};

use crate::net::connection::Protocol;

/// Deadlines the pipeline may arm for the client side of a request.
pub trait ClientDeadline: Send + Sync + fmt::Debug {
    fn set_read_deadline(&self, at: Option<Instant>);
    fn read_deadline(&self) -> Option<Instant>;
    fn set_write_deadline(&self, at: Option<Instant>);
    fn write_deadline(&self) -> Option<Instant>;

    /// How long the connection may sit idle before the next request.
    fn set_idle_deadline(&self, _at: Option<Instant>) {}

    /// Close the connection once the in-flight response has been written.
    fn close_after_reply(&self) {}
}

fn load(slot: &Mutex<Option<Instant>>) -> Option<Instant> {
    *slot.lock().unwrap_or_else(|e| e.into_inner())
}

fn store(slot: &Mutex<Option<Instant>>, at: Option<Instant>) {
    *slot.lock().unwrap_or_else(|e| e.into_inner()) = at;
}

/// Connection-level deadlines of an HTTP/1 connection.
#[derive(Debug, Default)]
pub struct ConnDeadlines {
    read: Mutex<Option<Instant>>,
    write: Mutex<Option<Instant>>,
    idle: Mutex<Option<Instant>>,
    read_waker: AtomicWaker,
    write_waker: AtomicWaker,
    closing: AtomicBool,
    close: Notify,
}

impl ConnDeadlines {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Earliest of the read and idle deadlines.
    fn effective_read(&self) -> Option<Instant> {
        match (load(&self.read), load(&self.idle)) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Resolves once `close_after_reply` has been called.
    pub async fn closing(&self) {
        loop {
            let notified = self.close.notified();
            if self.is_closing() {
                return;
            }
            notified.await;
        }
    }
}

impl ClientDeadline for ConnDeadlines {
    fn set_read_deadline(&self, at: Option<Instant>) {
        store(&self.read, at);
        self.read_waker.wake();
    }

    fn read_deadline(&self) -> Option<Instant> {
        load(&self.read)
    }

    fn set_write_deadline(&self, at: Option<Instant>) {
        store(&self.write, at);
        self.write_waker.wake();
    }

    fn write_deadline(&self) -> Option<Instant> {
        load(&self.write)
    }

    fn set_idle_deadline(&self, at: Option<Instant>) {
        store(&self.idle, at);
        self.read_waker.wake();
    }

    fn close_after_reply(&self) {
        self.closing.store(true, Ordering::Release);
        self.close.notify_waiters();
    }
}

/// Deadlines of one multiplexed stream.
#[derive(Debug, Default)]
pub struct StreamDeadline {
    read: Mutex<Option<Instant>>,
    write: Mutex<Option<Instant>>,
}

impl ClientDeadline for StreamDeadline {
    fn set_read_deadline(&self, at: Option<Instant>) {
        store(&self.read, at);
    }

    fn read_deadline(&self) -> Option<Instant> {
        load(&self.read)
    }

    fn set_write_deadline(&self, at: Option<Instant>) {
        store(&self.write, at);
    }

    fn write_deadline(&self) -> Option<Instant> {
        load(&self.write)
    }
}

/// Deadline handle for a request arriving over `protocol`.
pub fn for_request(protocol: Protocol, conn: &Arc<ConnDeadlines>) -> Arc<dyn ClientDeadline> {
    match protocol {
        Protocol::Http1 => conn.clone(),
        Protocol::H2 => Arc::new(StreamDeadline::default()),
    }
}

#[derive(Default)]
struct Timer {
    armed: Option<(Instant, Pin<Box<Sleep>>)>,
}

impl Timer {
    /// `Ready` once `deadline` has passed.
    fn poll_expired(&mut self, cx: &mut Context<'_>, deadline: Option<Instant>) -> Poll<()> {
        let Some(at) = deadline else {
            self.armed = None;
            return Poll::Pending;
        };
        match &mut self.armed {
            Some((current, sleep)) if *current == at => sleep.as_mut().poll(cx),
            slot => {
                let mut sleep = Box::pin(tokio::time::sleep_until(at));
                let poll = sleep.as_mut().poll(cx);
                *slot = Some((at, sleep));
                poll
            }
        }
    }
}

/// IO wrapper enforcing `ConnDeadlines` on an HTTP/1 connection.
pub struct DeadlineIo<T> {
    inner: T,
    deadlines: Arc<ConnDeadlines>,
    read_timer: Timer,
    write_timer: Timer,
}

impl<T> DeadlineIo<T> {
    pub fn new(inner: T, deadlines: Arc<ConnDeadlines>) -> Self {
        Self {
            inner,
            deadlines,
            read_timer: Timer::default(),
            write_timer: Timer::default(),
        }
    }

    fn poll_write_deadline(&mut self, cx: &mut Context<'_>) -> Poll<io::Error> {
        self.deadlines.write_waker.register(cx.waker());
        let deadline = self.deadlines.write_deadline();
        self.write_timer
            .poll_expired(cx, deadline)
            .map(|()| io::Error::new(io::ErrorKind::TimedOut, "client write deadline exceeded"))
    }
}

impl<T> fmt::Debug for DeadlineIo<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeadlineIo")
            .field("deadlines", &self.deadlines)
            .finish()
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for DeadlineIo<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Poll::Ready(res) = Pin::new(&mut this.inner).poll_read(cx, buf) {
            return Poll::Ready(res);
        }
        this.deadlines.read_waker.register(cx.waker());
        let deadline = this.deadlines.effective_read();
        this.read_timer.poll_expired(cx, deadline).map(|()| {
            Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "client read deadline exceeded",
            ))
        })
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for DeadlineIo<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Poll::Ready(res) = Pin::new(&mut this.inner).poll_write(cx, buf) {
            return Poll::Ready(res);
        }
        this.poll_write_deadline(cx).map(Err)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Poll::Ready(res) = Pin::new(&mut this.inner).poll_write_vectored(cx, bufs) {
            return Poll::Ready(res);
        }
        this.poll_write_deadline(cx).map(Err)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Poll::Ready(res) = Pin::new(&mut this.inner).poll_flush(cx) {
            return Poll::Ready(res);
        }
        this.poll_write_deadline(cx).map(Err)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
