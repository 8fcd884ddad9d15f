/**
 * MQTT - Implémentation rumqttc du contrat de bus
 *
 * RÔLE : Une connexion partagée par adresse de broker, tenue dans un
 * `BusContext` explicite construit au démarrage (pas de singleton global).
 * Chaque session logique (détecteur, canal de dispatch du pool) multiplexe
 * la même connexion et survit ensemble à une reconnexion.
 *
 * FONCTIONNEMENT :
 * - La boucle d'événements re-souscrit tous les topics connus à chaque
 *   ConnAck : reconstruction transparente des sessions.
 * - Backoff exponentiel ×1.8 plafonné entre deux tentatives de reconnexion.
 * - La connexion est comptée par session ; la dernière session qui se
 *   déconnecte la ferme.
 */

use crate::bus::{Bus, BusError, BusMessage, Subscription};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

type Registry = parking_lot::Mutex<HashMap<String, Arc<MqttConnection>>>;

/// Progression du backoff de reconnexion : ×1.8 borné au plafond configuré.
fn next_backoff(current: Duration, ceiling: Duration) -> Duration {
    let next = current.mul_f64(1.8);
    next.min(ceiling)
}

pub struct BusContext {
    registry: Arc<Registry>,
    reconnect_ceiling: Duration,
}

impl BusContext {
    pub fn new(reconnect_ceiling: Duration) -> Self {
        Self {
            registry: Arc::new(parking_lot::Mutex::new(HashMap::new())),
            reconnect_ceiling,
        }
    }

    /// Ouvre une session sur le broker donné, en réutilisant la connexion
    /// partagée si elle existe déjà.
    pub fn session(&self, host: &str, port: u16) -> MqttSession {
        let address = format!("{host}:{port}");
        let mut registry = self.registry.lock();
        let conn = registry
            .entry(address.clone())
            .or_insert_with(|| MqttConnection::open(host, port, self.reconnect_ceiling))
            .clone();
        conn.sessions.fetch_add(1, Ordering::SeqCst);
        MqttSession {
            conn,
            registry: self.registry.clone(),
            closed: AtomicBool::new(false),
        }
    }

    /// Garde-fou d'arrêt : ferme toute connexion restante.
    pub fn close_all(&self) {
        let connections: Vec<Arc<MqttConnection>> =
            self.registry.lock().drain().map(|(_, c)| c).collect();
        for conn in connections {
            conn.shutdown();
        }
    }
}

struct MqttConnection {
    address: String,
    client: AsyncClient,
    topics: parking_lot::Mutex<HashMap<String, Vec<mpsc::UnboundedSender<BusMessage>>>>,
    sessions: AtomicUsize,
    closed: AtomicBool,
    event_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl MqttConnection {
    fn open(host: &str, port: u16, ceiling: Duration) -> Arc<Self> {
        let client_id = format!("orbion-{}", Uuid::new_v4());
        let mut opts = MqttOptions::new(client_id, host, port);
        opts.set_keep_alive(Duration::from_secs(15));
        let (client, mut eventloop) = AsyncClient::new(opts, 64);

        let conn = Arc::new(Self {
            address: format!("{host}:{port}"),
            client,
            topics: parking_lot::Mutex::new(HashMap::new()),
            sessions: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            event_task: parking_lot::Mutex::new(None),
        });

        let task_conn = conn.clone();
        let task = tokio::spawn(async move {
            let mut backoff = Duration::from_secs(1);
            loop {
                if task_conn.closed.load(Ordering::SeqCst) {
                    break;
                }
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        backoff = Duration::from_secs(1);
                        task_conn.resubscribe_all();
                    }
                    Ok(Event::Incoming(Incoming::Publish(p))) => {
                        task_conn.route(&p.topic, p.payload.to_vec());
                    }
                    Ok(_) => {}
                    Err(e) => {
                        if task_conn.closed.load(Ordering::SeqCst) {
                            break;
                        }
                        warn!(
                            "MQTT connection to {} lost ({e:?}), retrying in {}ms",
                            task_conn.address,
                            backoff.as_millis()
                        );
                        tokio::time::sleep(backoff).await;
                        backoff = next_backoff(backoff, ceiling);
                    }
                }
            }
        });
        *conn.event_task.lock() = Some(task);

        conn
    }

    /// Reconstruction de session après reconnexion : mêmes topics, mêmes
    /// listeners, sans intervention des appelants.
    fn resubscribe_all(&self) {
        let topics: Vec<String> = self.topics.lock().keys().cloned().collect();
        if !topics.is_empty() {
            info!(
                "MQTT reconnected to {}, restoring {} subscriptions",
                self.address,
                topics.len()
            );
        }
        for topic in topics {
            if let Err(e) = self.client.try_subscribe(&topic, QoS::AtLeastOnce) {
                warn!("failed to restore subscription to {topic}: {e}");
            }
        }
    }

    fn route(&self, topic: &str, payload: Vec<u8>) {
        let mut topics = self.topics.lock();
        if let Some(senders) = topics.get_mut(topic) {
            senders.retain(|tx| {
                tx.send(BusMessage { topic: topic.to_string(), payload: payload.clone() })
                    .is_ok()
            });
        } else {
            debug!("message on unrouted topic {topic}, ignoring");
        }
    }

    fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.client.try_disconnect();
        if let Some(task) = self.event_task.lock().take() {
            task.abort();
        }
        self.topics.lock().clear();
        info!("closed MQTT connection to {}", self.address);
    }
}

/// Session logique sur la connexion partagée.
pub struct MqttSession {
    conn: Arc<MqttConnection>,
    registry: Arc<Registry>,
    closed: AtomicBool,
}

impl MqttSession {
    fn check_open(&self) -> Result<(), BusError> {
        if self.closed.load(Ordering::SeqCst) || self.conn.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl Bus for MqttSession {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.check_open()?;
        self.conn
            .client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| BusError::Connectivity(e.to_string()))
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError> {
        self.check_open()?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.conn
            .topics
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        self.conn
            .client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| BusError::Connectivity(e.to_string()))?;
        Ok(Subscription::new(topic.to_string(), rx))
    }

    async fn close(&self) -> Result<(), BusError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // la dernière session ferme la connexion partagée
        if self.conn.sessions.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.registry.lock().remove(&self.conn.address);
            self.conn.shutdown();
        }
        Ok(())
    }
}
