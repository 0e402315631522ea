//! Multi-subscriber message streams.
//!
//! A [`StreamHub`] fans messages out to every stream subscribed so far.
//! Subscribing late yields only messages published afterwards. Each stream
//! ends exactly once, either completed or failed.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};

use crate::error::{ChannelError, SharedError};

const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// One observation from a [`MessageStream`].
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Message(String),
    Completed,
    Failed(SharedError),
}

/// Receiving end of a hub subscription.
///
/// Usable from blocking code ([`MessageStream::recv`], [`Iterator`]) and from
/// async code through [`futures_core::Stream`].
#[derive(Debug)]
pub struct MessageStream {
    rx: UnboundedReceiver<StreamEvent>,
}

/// Stream of responses for one client round.
pub type ResponseStream = MessageStream;

impl MessageStream {
    /// Block until the next event.
    ///
    /// Must not be called from inside an async runtime.
    pub fn recv(&mut self) -> StreamEvent {
        self.rx.blocking_recv().unwrap_or(StreamEvent::Completed)
    }

    /// Wait up to `timeout` for the next event; `None` if nothing arrived.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Option<StreamEvent> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(event) = self.try_recv() {
                return Some(event);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            std::thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<StreamEvent> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Disconnected) => Some(StreamEvent::Completed),
            Err(TryRecvError::Empty) => None,
        }
    }

    /// Drain the stream until it ends, collecting messages.
    pub fn collect_until_end(&mut self, timeout: Duration) -> Result<Vec<String>, SharedError> {
        let deadline = Instant::now() + timeout;
        let mut messages = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.recv_timeout(remaining) {
                Some(StreamEvent::Message(message)) => messages.push(message),
                Some(StreamEvent::Completed) => return Ok(messages),
                Some(StreamEvent::Failed(err)) => return Err(err),
                None => return Err(Arc::new(ChannelError::Timeout(timeout))),
            }
        }
    }
}

impl Iterator for MessageStream {
    type Item = Result<String, SharedError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.recv() {
            StreamEvent::Message(message) => Some(Ok(message)),
            StreamEvent::Failed(err) => Some(Err(err)),
            StreamEvent::Completed => None,
        }
    }
}

impl futures_core::Stream for MessageStream {
    type Item = Result<String, SharedError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.get_mut().rx.poll_recv(cx) {
            Poll::Ready(Some(StreamEvent::Message(message))) => Poll::Ready(Some(Ok(message))),
            Poll::Ready(Some(StreamEvent::Failed(err))) => Poll::Ready(Some(Err(err))),
            Poll::Ready(Some(StreamEvent::Completed)) | Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Publishing side shared by all subscribers.
#[derive(Debug, Default)]
pub struct StreamHub {
    subscribers: Vec<UnboundedSender<StreamEvent>>,
    terminated: bool,
}

impl StreamHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscriber. After termination the new stream is already complete.
    pub fn subscribe(&mut self) -> MessageStream {
        let (tx, rx) = mpsc::unbounded_channel();
        if !self.terminated {
            self.subscribers.push(tx);
        }
        MessageStream { rx }
    }

    /// Deliver `message` to every live subscriber. Dropped streams are pruned.
    pub fn publish(&mut self, message: &str) -> usize {
        if self.terminated {
            return 0;
        }
        self.subscribers
            .retain(|tx| tx.send(StreamEvent::Message(message.to_string())).is_ok());
        self.subscribers.len()
    }

    /// End every stream normally. Later calls are no-ops.
    pub fn complete(&mut self) {
        self.finish(StreamEvent::Completed);
    }

    /// End every stream with `err`. Later calls are no-ops.
    pub fn fail(&mut self, err: ChannelError) {
        self.finish(StreamEvent::Failed(Arc::new(err)));
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    fn finish(&mut self, event: StreamEvent) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        for tx in self.subscribers.drain(..) {
            let _ = tx.send(event.clone());
        }
    }
}
