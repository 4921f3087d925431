//! Async streams of registry events.
//!
//! The registry dispatches synchronously. Consumers living on an async
//! runtime get the same events through a bounded channel instead.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_core::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

use crate::registry::{ServiceEvent, ServiceListener, Subscription};

/// Type alias for a boxed async stream of events.
pub type EventStream<T> = Pin<Box<dyn Stream<Item = T> + Send>>;

/// Sending half of an event channel.
#[derive(Debug)]
pub struct EventSender<T> {
    tx: mpsc::Sender<T>,
}

impl<T> EventSender<T> {
    /// Wrap a tokio sender.
    pub fn new(tx: mpsc::Sender<T>) -> Self {
        Self { tx }
    }

    /// Send an event without waiting.
    ///
    /// Returns `Err(event)` if the channel is full or closed.
    pub fn try_send(&self, event: T) -> Result<(), T> {
        self.tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(v) => v,
            mpsc::error::TrySendError::Closed(v) => v,
        })
    }

    /// Check if the receiver has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl<T> Clone for EventSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

/// Create a bounded event channel.
pub fn channel<T: Send + 'static>(buffer_size: usize) -> (EventSender<T>, EventStream<T>) {
    let (tx, rx) = mpsc::channel(buffer_size.max(1));
    let stream: EventStream<T> = Box::pin(ReceiverStream::new(rx));
    (EventSender::new(tx), stream)
}

/// Registry listener forwarding events into a channel.
pub(crate) struct ChannelListener {
    registry: String,
    sender: EventSender<ServiceEvent>,
}

impl ChannelListener {
    pub(crate) fn new(registry: String, sender: EventSender<ServiceEvent>) -> Self {
        Self { registry, sender }
    }
}

impl ServiceListener for ChannelListener {
    fn service_changed(&self, event: &ServiceEvent) {
        if self.sender.is_closed() {
            return;
        }
        if let Err(dropped) = self.sender.try_send(event.clone()) {
            warn!(
                registry = %self.registry,
                service_id = %dropped.reference().id(),
                "watch stream is lagging, dropping service event"
            );
        }
    }
}

/// Stream that keeps its subscription alive for as long as it is polled.
struct WatchStream {
    events: EventStream<ServiceEvent>,
    _subscription: Subscription,
}

impl Stream for WatchStream {
    type Item = ServiceEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.as_mut().poll_next(cx)
    }
}

pub(crate) fn watch_stream(
    events: EventStream<ServiceEvent>,
    subscription: Subscription,
) -> EventStream<ServiceEvent> {
    Box::pin(WatchStream {
        events,
        _subscription: subscription,
    })
}
