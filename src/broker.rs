//! In-process event fan-out.
//!
//! The relay emits onto a single bounded channel; the broker consumes it and
//! copies each event to every subscriber. Delivery is best-effort in the
//! same way the relay's own emission is: a subscriber whose queue is full
//! misses the event, and a subscriber that went away is pruned. Nothing in
//! this module ever blocks the publishing side.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::event::Event;

/// Fan-out broker between the proxy's event channel and any number of
/// subscribers.
pub struct Broker {
    capacity: usize,
    subscribers: Mutex<Vec<mpsc::Sender<Event>>>,
}

impl Broker {
    /// Creates a broker whose subscribers each get a queue of `capacity`
    /// events.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Registers a new subscriber and returns its receiving end.
    pub async fn subscribe(&self) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let mut subs = self.subscribers.lock().await;
        subs.push(tx);
        debug!(subscribers = subs.len(), "subscriber added");
        rx
    }

    /// Delivers one event to every live subscriber without blocking.
    pub async fn publish(&self, event: Event) {
        let mut subs = self.subscribers.lock().await;
        subs.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                trace!("subscriber queue full; dropping event for it");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }

    /// Consumes the proxy's event receiver and fans every event out until
    /// the channel closes.
    pub async fn run(&self, mut events: mpsc::Receiver<Event>) {
        while let Some(event) = events.recv().await {
            self.publish(event).await;
        }
        debug!("event channel closed; broker stopping");
    }

    /// Number of currently registered subscribers.
    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventOp;
    use chrono::Utc;

    fn event(id: &str) -> Event {
        Event {
            id: id.to_string(),
            op: EventOp::Query,
            query: "SELECT 1".to_string(),
            args: None,
            start_time: Utc::now(),
            tx_id: String::new(),
        }
    }

    #[tokio::test]
    async fn fans_out_to_all_subscribers() {
        let broker = Broker::new(8);
        let mut a = broker.subscribe().await;
        let mut b = broker.subscribe().await;

        broker.publish(event("1")).await;

        assert_eq!(a.recv().await.map(|e| e.id), Some("1".to_string()));
        assert_eq!(b.recv().await.map(|e| e.id), Some("1".to_string()));
    }

    #[tokio::test]
    async fn full_subscriber_drops_without_blocking() {
        let broker = Broker::new(1);
        let mut rx = broker.subscribe().await;

        broker.publish(event("1")).await;
        broker.publish(event("2")).await;

        assert_eq!(rx.recv().await.map(|e| e.id), Some("1".to_string()));
        assert!(rx.try_recv().is_err());
        assert_eq!(broker.subscriber_count().await, 1);
    }

    #[tokio::test]
    async fn closed_subscriber_is_pruned() {
        let broker = Broker::new(4);
        let rx = broker.subscribe().await;
        drop(rx);

        broker.publish(event("1")).await;
        assert_eq!(broker.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn run_consumes_until_channel_closes() {
        let broker = std::sync::Arc::new(Broker::new(4));
        let (tx, rx) = mpsc::channel(4);
        let mut sub = broker.subscribe().await;

        let worker = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.run(rx).await })
        };

        tx.send(event("1")).await.expect("send");
        tx.send(event("2")).await.expect("send");
        drop(tx);

        assert_eq!(sub.recv().await.map(|e| e.id), Some("1".to_string()));
        assert_eq!(sub.recv().await.map(|e| e.id), Some("2".to_string()));
        worker.await.expect("broker task");
    }
}
