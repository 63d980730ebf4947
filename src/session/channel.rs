//! Server-to-client push channel backing a session's SSE stream.
//!
//! A [`StreamingChannel`] is the sending half owned by the session; the
//! [`ChannelStream`] is the receiving half handed to the HTTP layer as the
//! response body. Dropping the `ChannelStream` before it has finished is how a
//! client disconnect is observed.

use std::{
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering},
    },
    task::{Context, Poll},
    time::Duration,
};

use futures::{Stream, StreamExt, stream::BoxStream};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::model::JsonRpcMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Open,
    Closing,
    Closed,
}

impl ChannelState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ChannelState::Open,
            1 => ChannelState::Closing,
            _ => ChannelState::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ChannelState::Open => 0,
            ChannelState::Closing => 1,
            ChannelState::Closed => 2,
        }
    }
}

/// A message queued on a channel, tagged with its per-channel event id.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelEvent {
    pub event_id: u64,
    pub message: JsonRpcMessage,
}

#[derive(Debug, Default)]
struct ChannelShared {
    state: AtomicU8,
    next_event_id: AtomicU64,
    dropped: AtomicU64,
    disconnected: AtomicBool,
    /// Fires once the receiving half has finished, for any reason.
    terminated: CancellationToken,
    /// Fires to abandon whatever is still queued.
    abort: CancellationToken,
}

impl ChannelShared {
    fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ChannelState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    fn finish(&self, disconnected: bool) {
        if disconnected {
            self.disconnected.store(true, Ordering::Release);
        }
        self.set_state(ChannelState::Closed);
        self.terminated.cancel();
    }
}

/// Sending half of a session's push channel.
#[derive(Debug)]
pub struct StreamingChannel {
    tx: Option<mpsc::UnboundedSender<ChannelEvent>>,
    shared: Arc<ChannelShared>,
    grace_period: Duration,
}

impl StreamingChannel {
    /// Opens a channel. `grace_period` bounds how long [`close`](Self::close)
    /// waits for queued messages to drain.
    pub fn open(grace_period: Duration) -> (Self, ChannelStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(ChannelShared::default());
        let inner = UnboundedReceiverStream::new(rx)
            .take_until(shared.abort.clone().cancelled_owned())
            .boxed();

        let channel = StreamingChannel {
            tx: Some(tx),
            shared: shared.clone(),
            grace_period,
        };
        let stream = ChannelStream {
            inner,
            shared,
            finished: false,
        };
        (channel, stream)
    }

    pub fn state(&self) -> ChannelState {
        self.shared.state()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// Queues a message for delivery.
    ///
    /// Never fails loudly: when the channel is closing or closed the message
    /// is counted in [`dropped_count`](Self::dropped_count) and `false` is
    /// returned.
    pub fn push(&self, message: JsonRpcMessage) -> bool {
        let delivered = match (&self.tx, self.state()) {
            (Some(tx), ChannelState::Open) => {
                let event_id = self.shared.next_event_id.fetch_add(1, Ordering::Relaxed);
                tx.send(ChannelEvent { event_id, message }).is_ok()
            }
            _ => false,
        };
        if !delivered {
            let dropped = self.shared.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::debug!(dropped, "push on a channel that is not open, message dropped");
        }
        delivered
    }

    pub fn dropped_count(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// A handle that resolves when the receiving half finishes.
    pub fn watch(&self) -> ChannelWatch {
        ChannelWatch {
            shared: self.shared.clone(),
        }
    }

    /// Closes the channel: stops accepting pushes, lets queued messages drain
    /// for up to the grace period, then abandons the rest.
    pub async fn close(&mut self) {
        if self.state() == ChannelState::Closed {
            self.tx = None;
            return;
        }
        self.shared.set_state(ChannelState::Closing);
        // Dropping the sender ends the stream once the queue is drained.
        self.tx = None;

        if tokio::time::timeout(self.grace_period, self.shared.terminated.cancelled())
            .await
            .is_err()
        {
            tracing::debug!(
                grace_period = ?self.grace_period,
                "stream did not drain within the grace period, abandoning queued messages"
            );
            self.shared.abort.cancel();
        }
        self.shared.set_state(ChannelState::Closed);
    }
}

/// Observer for the end of a channel's receiving half.
#[derive(Debug, Clone)]
pub struct ChannelWatch {
    shared: Arc<ChannelShared>,
}

impl ChannelWatch {
    /// Waits until the stream has finished and reports whether it ended
    /// because the client went away rather than because it was closed.
    pub async fn disconnected(&self) -> bool {
        self.shared.terminated.cancelled().await;
        self.shared.disconnected.load(Ordering::Acquire)
    }
}

/// Receiving half of a push channel, consumed by the HTTP response.
pub struct ChannelStream {
    inner: BoxStream<'static, ChannelEvent>,
    shared: Arc<ChannelShared>,
    finished: bool,
}

impl std::fmt::Debug for ChannelStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelStream")
            .field("state", &self.shared.state())
            .field("finished", &self.finished)
            .finish()
    }
}

impl Stream for ChannelStream {
    type Item = ChannelEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match self.inner.poll_next_unpin(cx) {
            Poll::Ready(None) => {
                self.finished = true;
                self.shared.finish(false);
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

impl Drop for ChannelStream {
    fn drop(&mut self) {
        if !self.finished {
            self.shared.finish(true);
        }
    }
}
