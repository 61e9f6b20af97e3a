use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

/// Broadcast event stream handed to subscribers. Dropping it unsubscribes.
pub type EventStream<E> = broadcast::Receiver<E>;

/// Default per-hub broadcast buffer.
pub const DEFAULT_EVENT_BUFFER: usize = 256;

/// Errors returned by queue operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The consuming side is gone (its owner reached a terminal state).
    #[error("notice queue is closed")]
    QueueClosed,
}

/// Fan-out of one handle's events to any number of observers.
#[derive(Debug)]
pub struct EventHub<E> {
    event_tx: broadcast::Sender<E>,
}

impl<E: Clone> EventHub<E> {
    pub fn new(event_buffer: usize) -> Self {
        let (event_tx, _) = broadcast::channel(event_buffer.max(1));
        Self { event_tx }
    }

    /// Subscribe to events emitted from now on.
    pub fn subscribe(&self) -> EventStream<E> {
        self.event_tx.subscribe()
    }

    /// Emit an event to all subscribers.
    ///
    /// Emission is best-effort; lagged subscribers are handled by `broadcast`.
    pub fn emit(&self, event: E) {
        let _ = self.event_tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.event_tx.receiver_count()
    }
}

impl<E: Clone> Default for EventHub<E> {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER)
    }
}

/// Sending half of an ordered, single-consumer notice queue.
#[derive(Debug)]
pub struct NoticeSender<T> {
    tx: mpsc::UnboundedSender<T>,
}

impl<T> Clone for NoticeSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> NoticeSender<T> {
    pub fn send(&self, notice: T) -> Result<(), ChannelError> {
        self.tx.send(notice).map_err(|_| ChannelError::QueueClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the receiving side is gone.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

/// Receiving half of a notice queue, drained by exactly one owner task.
#[derive(Debug)]
pub struct NoticeReceiver<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> NoticeReceiver<T> {
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }
}

/// Create a notice queue. Notices are delivered in send order.
pub fn notice_channel<T>() -> (NoticeSender<T>, NoticeReceiver<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (NoticeSender { tx }, NoticeReceiver { rx })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fans_out_events_to_subscribers() {
        let hub = EventHub::<u32>::new(16);
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 2);

        hub.emit(7);

        assert_eq!(a.recv().await.expect("subscriber a should receive"), 7);
        assert_eq!(b.recv().await.expect("subscriber b should receive"), 7);
    }

    #[tokio::test]
    async fn dropped_subscriber_is_unsubscribed() {
        let hub = EventHub::<u32>::default();
        let stream = hub.subscribe();
        drop(stream);
        assert_eq!(hub.subscriber_count(), 0);
        hub.emit(1);
    }

    #[tokio::test]
    async fn notice_queue_preserves_order() {
        let (tx, mut rx) = notice_channel();
        for n in 0..5 {
            tx.send(n).expect("queue open");
        }
        for n in 0..5 {
            assert_eq!(rx.recv().await, Some(n));
        }
    }

    #[test]
    fn send_fails_once_receiver_is_gone() {
        let (tx, rx) = notice_channel::<&str>();
        drop(rx);
        assert!(tx.is_closed());
        assert_eq!(tx.send("late"), Err(ChannelError::QueueClosed));
    }
}
