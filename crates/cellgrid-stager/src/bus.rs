//! In-process publish/subscribe bus.
//!
//! Every subscriber sees every message published after it subscribed;
//! [`Subscription::recv`] filters by subject. A subscriber that falls more
//! than the channel capacity behind loses the oldest messages.

use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{trace, warn};

use crate::error::StagerResult;

const BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub subject: String,
    pub payload: Vec<u8>,
}

#[derive(Clone)]
pub struct MessageBus {
    tx: broadcast::Sender<Message>,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(BUS_CAPACITY)
    }
}

impl MessageBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Returns how many subscriptions were live to see the message.
    pub fn publish(&self, subject: &str, payload: Vec<u8>) -> usize {
        trace!(%subject, bytes = payload.len(), "publish");
        self.tx
            .send(Message {
                subject: subject.to_string(),
                payload,
            })
            .unwrap_or(0)
    }

    pub fn publish_json<T: Serialize>(&self, subject: &str, value: &T) -> StagerResult<usize> {
        let payload = serde_json::to_vec(value)?;
        Ok(self.publish(subject, payload))
    }

    pub fn subscribe(&self, subject: &str) -> Subscription {
        Subscription {
            subject: subject.to_string(),
            rx: self.tx.subscribe(),
        }
    }
}

pub struct Subscription {
    subject: String,
    rx: broadcast::Receiver<Message>,
}

impl Subscription {
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Next message on this subject, or `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            match self.rx.recv().await {
                Ok(message) if message.subject == self.subject => return Some(message),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(subject = %self.subject, skipped, "subscription lagged, messages lost");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn subscribers_only_see_their_subject() {
        let bus = MessageBus::default();
        let mut starts = bus.subscribe("staging.start");
        let mut finished = bus.subscribe("staging.finished");

        bus.publish("staging.finished", b"done".to_vec());
        bus.publish("staging.start", b"go".to_vec());

        assert_eq!(starts.recv().await.unwrap().payload, b"go");
        assert_eq!(finished.recv().await.unwrap().payload, b"done");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_dropped() {
        let bus = MessageBus::default();
        assert_eq!(bus.publish("nobody.listens", vec![]), 0);

        let mut late = bus.subscribe("nobody.listens");
        let next = tokio::time::timeout(Duration::from_millis(20), late.recv()).await;
        assert!(next.is_err());
    }

    #[tokio::test]
    async fn closed_bus_ends_subscription() {
        let bus = MessageBus::default();
        let mut sub = bus.subscribe("x");
        drop(bus);
        assert!(sub.recv().await.is_none());
    }
}
