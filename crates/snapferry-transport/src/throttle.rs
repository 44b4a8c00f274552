//! Shared byte throttle for stream bodies.
//!
//! One token bucket bounds the aggregate bandwidth of every active transfer.
//! Readers take tokens after each read and may drive the bucket into debt;
//! the debt is then paid off by sleeping before the next read. The bucket
//! holds at most one second of traffic, so an idle period buys a burst of at
//! most that size.

use parking_lot::Mutex;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::time::{Instant, Sleep};

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket shared by all transfers of one server or client.
#[derive(Debug)]
pub struct Throttle {
    bytes_per_sec: u64,
    bucket: Mutex<Bucket>,
}

impl Throttle {
    /// Creates a throttle; 0 means unlimited.
    pub fn new(bytes_per_sec: u64) -> Self {
        Self {
            bytes_per_sec,
            bucket: Mutex::new(Bucket {
                tokens: bytes_per_sec as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// A throttle that never delays.
    pub fn unlimited() -> Self {
        Self::new(0)
    }

    /// Configured rate, 0 when unlimited.
    pub fn bytes_per_sec(&self) -> u64 {
        self.bytes_per_sec
    }

    /// Takes `amount` tokens and returns how long the caller has to wait
    /// before moving more bytes.
    pub fn reserve(&self, amount: u64) -> Duration {
        if self.bytes_per_sec == 0 || amount == 0 {
            return Duration::ZERO;
        }
        let rate = self.bytes_per_sec as f64;
        let now = Instant::now();
        let mut bucket = self.bucket.lock();
        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * rate).min(rate);
        bucket.last_refill = now;
        bucket.tokens -= amount as f64;
        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / rate)
        }
    }
}

/// [`AsyncRead`] adapter that charges every byte read to a [`Throttle`].
///
/// The optional deadline bounds the whole read side: a read fails with
/// `TimedOut` once it has passed, whether the reader is waiting on the
/// bucket or on a source that stopped producing.
pub struct ThrottledReader<R> {
    inner: R,
    throttle: Arc<Throttle>,
    deadline: Option<Instant>,
    delay: Option<Pin<Box<Sleep>>>,
    expiry: Option<Pin<Box<Sleep>>>,
    timed_out: bool,
}

impl<R> ThrottledReader<R> {
    /// Wraps `inner`. Reading past `deadline` fails with `TimedOut`.
    pub fn new(inner: R, throttle: Arc<Throttle>, deadline: Option<Instant>) -> Self {
        Self {
            inner,
            throttle,
            deadline,
            delay: None,
            expiry: None,
            timed_out: false,
        }
    }
}

fn deadline_exceeded() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "request deadline exceeded")
}

impl<R: AsyncRead + Unpin> AsyncRead for ThrottledReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if this.timed_out || this.deadline.is_some_and(|d| Instant::now() >= d) {
            this.timed_out = true;
            return Poll::Ready(Err(deadline_exceeded()));
        }
        if let Some(delay) = this.delay.as_mut() {
            ready!(delay.as_mut().poll(cx));
            this.delay = None;
        }

        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(result) => result?,
            Poll::Pending => {
                if let Some(deadline) = this.deadline {
                    let expiry = this
                        .expiry
                        .get_or_insert_with(|| Box::pin(tokio::time::sleep_until(deadline)));
                    if expiry.as_mut().poll(cx).is_ready() {
                        this.timed_out = true;
                        return Poll::Ready(Err(deadline_exceeded()));
                    }
                }
                return Poll::Pending;
            }
        }
        let read = (buf.filled().len() - before) as u64;

        let wait = this.throttle.reserve(read);
        if !wait.is_zero() {
            let until = Instant::now() + wait;
            if this.deadline.is_some_and(|d| until > d) {
                this.timed_out = true;
            } else {
                this.delay = Some(Box::pin(tokio::time::sleep_until(until)));
            }
        }
        Poll::Ready(Ok(()))
    }
}
