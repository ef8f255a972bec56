//! Keepalive Multiplexer
//!
//! Wraps a chunk stream and fills idle gaps with transport keepalives so
//! intermediaries with idle timeouts do not drop the connection during a long
//! silent generation.
//!
//! # Timing
//!
//! ```text
//! upstream:   C ........................ C ........ C  (end)
//! output:     C ....... K ....... K .... C ........ C  (end)
//!             |<- iv ->|<- iv ->|
//! ```
//!
//! The keepalive deadline is pushed back by every emission, whether a real
//! item or a keepalive. Upstream is always polled before the timer, so a
//! ready item is never delayed by a keepalive.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use tokio::time::{Instant, Sleep};

use crate::translate::StreamChunk;

/// An element of a multiplexed stream
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Multiplexed<T> {
    /// An upstream item, delivered unchanged and in order
    Item(T),
    /// Transport-level no-op
    Keepalive,
}

impl<T> Multiplexed<T> {
    /// Upstream item, if this is one
    pub fn into_item(self) -> Option<T> {
        match self {
            Self::Item(item) => Some(item),
            Self::Keepalive => None,
        }
    }

    /// Whether this is a keepalive
    #[must_use]
    pub fn is_keepalive(&self) -> bool {
        matches!(self, Self::Keepalive)
    }
}

impl<T> From<T> for Multiplexed<T> {
    fn from(item: T) -> Self {
        Self::Item(item)
    }
}

/// Items that can end a stream before upstream closes
pub trait EndsStream {
    /// Whether nothing follows this item
    fn ends_stream(&self) -> bool;
}

impl EndsStream for StreamChunk {
    fn ends_stream(&self) -> bool {
        self.is_terminal()
    }
}

/// Interleaves keepalives into an upstream stream
pub struct KeepaliveMultiplexer<S> {
    upstream: S,
    interval: Option<Duration>,
    deadline: Pin<Box<Sleep>>,
    terminated: bool,
}

impl<S> KeepaliveMultiplexer<S>
where
    S: Stream + Unpin,
    S::Item: EndsStream,
{
    /// Wrap `upstream`. A zero interval disables keepalives.
    pub fn new(upstream: S, interval: Duration) -> Self {
        let interval = (!interval.is_zero()).then_some(interval);
        let first = Instant::now() + interval.unwrap_or(Duration::from_secs(3600));
        Self {
            upstream,
            interval,
            deadline: Box::pin(tokio::time::sleep_until(first)),
            terminated: false,
        }
    }

    /// Configured interval, if keepalives are enabled
    #[must_use]
    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// Upstream stream
    #[must_use]
    pub fn get_ref(&self) -> &S {
        &self.upstream
    }

    /// Unwrap the upstream stream
    pub fn into_inner(self) -> S {
        self.upstream
    }

    fn rearm(&mut self) {
        if let Some(interval) = self.interval {
            self.deadline.as_mut().reset(Instant::now() + interval);
        }
    }
}

impl<S> Stream for KeepaliveMultiplexer<S>
where
    S: Stream + Unpin,
    S::Item: EndsStream,
{
    type Item = Multiplexed<S::Item>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.terminated {
            return Poll::Ready(None);
        }

        match Pin::new(&mut this.upstream).poll_next(cx) {
            Poll::Ready(Some(item)) => {
                if item.ends_stream() {
                    this.terminated = true;
                } else {
                    this.rearm();
                }
                return Poll::Ready(Some(Multiplexed::Item(item)));
            }
            Poll::Ready(None) => {
                this.terminated = true;
                return Poll::Ready(None);
            }
            Poll::Pending => {}
        }

        if this.interval.is_some() && this.deadline.as_mut().poll(cx).is_ready() {
            this.rearm();
            return Poll::Ready(Some(Multiplexed::Keepalive));
        }
        Poll::Pending
    }
}
