/*!
Broker en mémoire pour développement sans broker MQTT

Implémente le contrat de bus du kernel : les publications sont livrées
immédiatement aux abonnés du même topic et enregistrées pour les
assertions de test. Des fautes de connectivité peuvent être injectées.
*/

use async_trait::async_trait;
use orbion_kernel::bus::{Bus, BusError, BusMessage, Subscription};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Default)]
struct BrokerState {
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<BusMessage>>>,
    published: Vec<BusMessage>,
}

/// Broker partagé par tous les participants d'un test.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<parking_lot::Mutex<BrokerState>>,
    failures_left: Arc<AtomicUsize>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Une session de bus branchée sur ce broker.
    pub fn handle(&self) -> MemoryBus {
        MemoryBus { broker: self.clone() }
    }

    /// Les N prochaines publications échouent en faute de connectivité.
    pub fn fail_next_publishes(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    /// Tous les messages publiés (pour assertions de tests).
    pub fn published_messages(&self) -> Vec<BusMessage> {
        self.state.lock().published.clone()
    }

    /// Messages publiés sur un topic donné.
    pub fn messages_on(&self, topic: &str) -> Vec<BusMessage> {
        self.state
            .lock()
            .published
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Dernier message d'un topic, décodé en JSON.
    pub fn last_json<T>(&self, topic: &str) -> anyhow::Result<Option<T>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        match self.messages_on(topic).last() {
            Some(msg) => Ok(Some(serde_json::from_slice(&msg.payload)?)),
            None => Ok(None),
        }
    }

    pub fn clear(&self) {
        self.state.lock().published.clear();
    }

    fn do_publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(BusError::Connectivity("injected fault".into()));
        }

        let msg = BusMessage { topic: topic.to_string(), payload };
        let mut state = self.state.lock();
        state.published.push(msg.clone());
        if let Some(senders) = state.subscribers.get_mut(topic) {
            senders.retain(|tx| tx.send(msg.clone()).is_ok());
        }
        log::debug!("[broker] {} -> {} bytes", msg.topic, msg.payload.len());
        Ok(())
    }

    fn do_subscribe(&self, topic: &str) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state
            .lock()
            .subscribers
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        log::debug!("[broker] subscribed to {topic}");
        Subscription::new(topic.to_string(), rx)
    }
}

/// Session de bus sur le broker mémoire. Clonable à volonté, chaque
/// participant du test en tient une.
#[derive(Clone)]
pub struct MemoryBus {
    broker: MemoryBroker,
}

#[async_trait]
impl Bus for MemoryBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.broker.do_publish(topic, payload)
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError> {
        Ok(self.broker.do_subscribe(topic))
    }

    async fn close(&self) -> Result<(), BusError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscribers_and_is_recorded() {
        let broker = MemoryBroker::new();
        let bus = broker.handle();

        let mut sub = bus.subscribe("test/topic").await.unwrap();
        bus.publish("test/topic", b"hello".to_vec()).await.unwrap();

        let msg = sub.recv().await.unwrap();
        assert_eq!(msg.payload, b"hello");
        assert_eq!(broker.messages_on("test/topic").len(), 1);
    }

    #[tokio::test]
    async fn injected_faults_are_transient_and_bounded() {
        let broker = MemoryBroker::new();
        let bus = broker.handle();
        broker.fail_next_publishes(2);

        let err = bus.publish("t", vec![]).await.unwrap_err();
        assert!(err.is_transient());
        let err = bus.publish("t", vec![]).await.unwrap_err();
        assert!(err.is_transient());
        bus.publish("t", vec![]).await.unwrap();
        assert_eq!(broker.messages_on("t").len(), 1);
    }
}
