/**
 * BUS - Contrat de messagerie fiable consommé par tout le kernel
 *
 * RÔLE : Livraison point-à-point/pub-sub avec requête/réponse corrélée,
 * retry à backoff fixe sur fautes de connectivité, pool borné de workers
 * pour les envois fire-and-forget, et annulation coopérative.
 *
 * FONCTIONNEMENT :
 * - Le trait `Bus` est la couture : implémentation MQTT en production
 *   (mqtt.rs), bus mémoire du devkit pour les tests.
 * - Un envoi fire-and-forget qui a dépassé son budget de retry est jeté,
 *   jamais livré en retard.
 * - L'attente d'une réponse est découpée en tranches courtes pour honorer
 *   l'annulation rapidement, pas seulement au timeout plein.
 */

use crate::cancel::CancelToken;
use crate::models::{HostRequest, ReplyEnvelope, RequestEnvelope, HostReply};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Backoff fixe entre deux tentatives après une faute transitoire.
pub const RETRY_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum BusError {
    /// Faute de connectivité transitoire : seule classe retentée.
    #[error("transport connectivity fault: {0}")]
    Connectivity(String),

    #[error("transport timed out waiting for a reply")]
    Timeout,

    #[error("transport session is closed")]
    Closed,

    #[error("malformed payload: {0}")]
    Codec(String),
}

impl BusError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BusError::Connectivity(_))
    }
}

#[derive(Debug, Clone)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Session d'abonnement : flux des messages publiés sur un topic.
pub struct Subscription {
    pub topic: String,
    rx: mpsc::UnboundedReceiver<BusMessage>,
}

impl Subscription {
    pub fn new(topic: String, rx: mpsc::UnboundedReceiver<BusMessage>) -> Self {
        Self { topic, rx }
    }

    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }
}

/// Couture du transport. `publish` est une tentative unique ; le retry et le
/// fire-and-forget vivent au-dessus (retry_publish, OnewaySender).
#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError>;
    async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError>;
    async fn close(&self) -> Result<(), BusError>;
}

/// Publie avec retry à backoff fixe jusqu'à épuisement du budget. Les fautes
/// non transitoires remontent immédiatement. Un token annulé fait retourner
/// sans erreur, comme une opération abandonnée (l'appelant re-teste le token).
pub async fn retry_publish(
    bus: &dyn Bus,
    topic: &str,
    payload: &[u8],
    budget: Duration,
    cancel: Option<&CancelToken>,
) -> Result<(), BusError> {
    let start = Instant::now();
    loop {
        if CancelToken::is_cancelled_opt(cancel) {
            return Ok(());
        }
        match bus.publish(topic, payload.to_vec()).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transient() => {
                warn!("publish to {topic} failed ({e}), will retry soon");
                if start.elapsed() > budget {
                    return Err(e);
                }
                tokio::time::sleep(RETRY_BACKOFF).await;
            }
            Err(e) => return Err(e),
        }
    }
}

struct QueuedSend {
    topic: String,
    payload: Vec<u8>,
    payload_type: &'static str,
    enqueued: Instant,
}

/// Pool fixe de workers pour les envois fire-and-forget. Un message resté en
/// file plus longtemps que son budget de retry est jeté avec un log portant
/// le type de payload, plutôt que livré en retard.
pub struct OnewaySender {
    tx: parking_lot::Mutex<Option<mpsc::UnboundedSender<QueuedSend>>>,
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    shutdown_timeout: Duration,
}

impl OnewaySender {
    pub fn new(
        bus: Arc<dyn Bus>,
        worker_count: usize,
        budget: Duration,
        shutdown_timeout: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<QueuedSend>();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let mut workers = Vec::with_capacity(worker_count.max(1));
        for _ in 0..worker_count.max(1) {
            let bus = bus.clone();
            let rx = rx.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let item = { rx.lock().await.recv().await };
                    let Some(send) = item else { break };
                    let waited = send.enqueued.elapsed();
                    if waited > budget {
                        warn!(
                            "dropping {} message for {}: waited {}ms past its {}ms retry budget",
                            send.payload_type,
                            send.topic,
                            waited.as_millis(),
                            budget.as_millis()
                        );
                        continue;
                    }
                    if let Err(e) =
                        retry_publish(bus.as_ref(), &send.topic, &send.payload, budget, None).await
                    {
                        error!("failed to send {} message to {}: {e}", send.payload_type, send.topic);
                    }
                }
            }));
        }

        Self {
            tx: parking_lot::Mutex::new(Some(tx)),
            workers: parking_lot::Mutex::new(workers),
            shutdown_timeout,
        }
    }

    pub fn send(&self, topic: String, payload: Vec<u8>, payload_type: &'static str) {
        let guard = self.tx.lock();
        match guard.as_ref() {
            Some(tx) => {
                let _ = tx.send(QueuedSend {
                    topic,
                    payload,
                    payload_type,
                    enqueued: Instant::now(),
                });
            }
            None => warn!("oneway sender already shut down, dropping {payload_type} message"),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.tx.lock().is_none()
    }

    /// Draine les envois en attente pendant un délai borné, puis annule.
    pub async fn shutdown(&self) {
        drop(self.tx.lock().take());
        let workers = std::mem::take(&mut *self.workers.lock());
        let deadline = Instant::now() + self.shutdown_timeout;
        for handle in workers {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let abort = handle.abort_handle();
            if tokio::time::timeout(remaining, handle).await.is_err() {
                warn!("oneway worker did not drain in time, aborting");
                abort.abort();
            }
        }
    }
}

/// Canal requête/réponse corrélé au-dessus du bus : un topic de réponse par
/// client, une table d'attentes par correlation id, une pompe qui complète
/// les attentes au fil des réponses.
pub struct RequestChannel {
    bus: Arc<dyn Bus>,
    reply_topic: String,
    waiters: Arc<parking_lot::Mutex<HashMap<Uuid, oneshot::Sender<HostReply>>>>,
    pump: parking_lot::Mutex<Option<JoinHandle<()>>>,
    request_timeout: Duration,
    retry_budget: Duration,
}

impl RequestChannel {
    pub async fn open(
        bus: Arc<dyn Bus>,
        client_id: Uuid,
        request_timeout: Duration,
        retry_budget: Duration,
    ) -> Result<Self, BusError> {
        let reply_topic = crate::models::client_reply_topic(client_id);
        let mut sub = bus.subscribe(&reply_topic).await?;
        let waiters: Arc<parking_lot::Mutex<HashMap<Uuid, oneshot::Sender<HostReply>>>> =
            Arc::new(parking_lot::Mutex::new(HashMap::new()));

        let pump_waiters = waiters.clone();
        let pump = tokio::spawn(async move {
            while let Some(msg) = sub.recv().await {
                match serde_json::from_slice::<ReplyEnvelope>(&msg.payload) {
                    Ok(envelope) => {
                        let waiter = pump_waiters.lock().remove(&envelope.correlation_id);
                        match waiter {
                            Some(tx) => {
                                let _ = tx.send(envelope.reply);
                            }
                            None => debug!(
                                "uncorrelated reply {} on {}, ignoring",
                                envelope.correlation_id, msg.topic
                            ),
                        }
                    }
                    Err(e) => warn!("malformed reply on {}: {e}", msg.topic),
                }
            }
        });

        Ok(Self {
            bus,
            reply_topic,
            waiters,
            pump: parking_lot::Mutex::new(Some(pump)),
            request_timeout,
            retry_budget,
        })
    }

    pub fn reply_topic(&self) -> &str {
        &self.reply_topic
    }

    /// Envoie une requête et bloque jusqu'à la réponse corrélée, l'expiration
    /// du timeout ou l'annulation. L'attente est tranchée en timeout/100 pour
    /// réagir vite au token.
    pub async fn request(
        &self,
        topic: &str,
        request: HostRequest,
        correlation_id: Option<Uuid>,
        cancel: Option<&CancelToken>,
    ) -> crate::Result<HostReply> {
        if CancelToken::is_cancelled_opt(cancel) {
            return Err(crate::Error::Cancelled);
        }

        let correlation_id = correlation_id.unwrap_or_else(Uuid::new_v4);
        let envelope = RequestEnvelope {
            correlation_id,
            reply_to: self.reply_topic.clone(),
            request,
        };
        let payload = serde_json::to_vec(&envelope)
            .map_err(|e| BusError::Codec(e.to_string()))?;

        let (tx, mut rx) = oneshot::channel();
        self.waiters.lock().insert(correlation_id, tx);

        if let Err(e) =
            retry_publish(self.bus.as_ref(), topic, &payload, self.retry_budget, cancel).await
        {
            self.waiters.lock().remove(&correlation_id);
            return Err(e.into());
        }
        if CancelToken::is_cancelled_opt(cancel) {
            self.waiters.lock().remove(&correlation_id);
            return Err(crate::Error::Cancelled);
        }

        let slice = (self.request_timeout / 100).max(Duration::from_millis(10));
        let deadline = Instant::now() + self.request_timeout;
        loop {
            match tokio::time::timeout(slice, &mut rx).await {
                Ok(Ok(reply)) => return Ok(reply),
                Ok(Err(_)) => {
                    self.waiters.lock().remove(&correlation_id);
                    return Err(BusError::Closed.into());
                }
                Err(_) => {
                    if CancelToken::is_cancelled_opt(cancel) {
                        self.waiters.lock().remove(&correlation_id);
                        return Err(crate::Error::Cancelled);
                    }
                    if Instant::now() >= deadline {
                        self.waiters.lock().remove(&correlation_id);
                        return Err(crate::Error::Timeout);
                    }
                }
            }
        }
    }

    pub fn close(&self) {
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        self.waiters.lock().clear();
    }
}

impl Drop for RequestChannel {
    fn drop(&mut self) {
        self.close();
    }
}
