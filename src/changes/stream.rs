//! Async stream view of a change session.
//!
//! [`ChangeStream::channel`] returns a [`ChannelListener`] to register with a
//! session and the [`ChangeStream`] that yields what it hears. The stream
//! ends after the [`FeedEvent::Disconnected`] item.
//!
//! # Examples
//!
//! ```ignore
//! use couch_feed::changes::{ChangeSession, ChangeStream, FeedEvent, StartOptions};
//! use futures::StreamExt;
//! use std::sync::Arc;
//!
//! let (listener, mut stream) = ChangeStream::channel();
//! session.add_listener(Arc::new(listener))?;
//! session.start(StartOptions::new()).await?;
//!
//! while let Some(event) = stream.next().await {
//!     match event {
//!         FeedEvent::Change(change) => println!("{} changed", change.id),
//!         FeedEvent::Disconnected(reason) => println!("feed ended: {reason}"),
//!     }
//! }
//! ```

use crate::changes::subscriber::{DisconnectReason, Listener};
use crate::types::ChangeRecord;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Item of a [`ChangeStream`]
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// A document changed
    Change(ChangeRecord),
    /// The feed ended; always the last item
    Disconnected(DisconnectReason),
}

/// [`Listener`] that forwards into a [`ChangeStream`].
///
/// Sends never block the feed; if the stream was dropped the events are
/// discarded.
pub struct ChannelListener {
    sender: mpsc::UnboundedSender<FeedEvent>,
}

impl Listener for ChannelListener {
    fn on_change(&self, change: &ChangeRecord) -> anyhow::Result<()> {
        // A dropped stream is not the feed's problem.
        let _ = self.sender.send(FeedEvent::Change(change.clone()));
        Ok(())
    }

    fn on_disconnect(&self, reason: &DisconnectReason) {
        let _ = self.sender.send(FeedEvent::Disconnected(reason.clone()));
    }
}

/// Stream of [`FeedEvent`]s from one session.
pub struct ChangeStream {
    receiver: UnboundedReceiverStream<FeedEvent>,
    done: bool,
}

impl ChangeStream {
    /// Create a connected listener/stream pair.
    pub fn channel() -> (ChannelListener, ChangeStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            ChannelListener { sender: tx },
            ChangeStream {
                receiver: UnboundedReceiverStream::new(rx),
                done: false,
            },
        )
    }

    /// Receive the next event.
    ///
    /// Returns `None` once the disconnect has been delivered, or when the
    /// listener was dropped without one.
    pub async fn next(&mut self) -> Option<FeedEvent> {
        if self.done {
            return None;
        }
        let event = StreamExt::next(&mut self.receiver).await;
        self.track(&event);
        event
    }

    fn track(&mut self, event: &Option<FeedEvent>) {
        if matches!(event, None | Some(FeedEvent::Disconnected(_))) {
            self.done = true;
        }
    }
}

impl Stream for ChangeStream {
    type Item = FeedEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        let polled = self.receiver.poll_next_unpin(cx);
        if let Poll::Ready(event) = &polled {
            self.track(event);
        }
        polled
    }
}
