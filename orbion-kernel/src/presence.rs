/**
 * PRESENCE - Détecteur de présence et de panne des hôtes
 *
 * RÔLE : Construire et maintenir le roster des hôtes vivants à partir du
 * protocole de heartbeats, classer chaque hôte statique/dynamique selon la
 * fenêtre de découverte, et distribuer des identifiants d'hôtes libres.
 *
 * FONCTIONNEMENT :
 * - Au démarrage : diffusion de deux demandes d'annonce espacées d'une
 *   demi-fenêtre, blocage sur la fenêtre complète. Vu pendant la fenêtre =
 *   statique (infrastructure préexistante), vu après = dynamique
 *   (provisionné par le contrôleur). La classification est définitive.
 * - Un heartbeat met à jour last_seen ; un IsDead retire immédiatement ;
 *   le cleanup périodique expire à 3 intervalles de silence.
 * - La perte de heartbeats est indistinguable de la mort : on préfère
 *   déclarer mort plutôt qu'attendre indéfiniment, sauf pour un id en
 *   cours d'usage où on refuse de deviner (jusqu'au seuil d'audit).
 */

use crate::bus::{retry_publish, Bus};
use crate::config::TimingConfig;
use crate::models::{AnnounceRequest, HostId, IsAlive, IsDead, ANNOUNCE_TOPIC, ISALIVE_TOPIC, ISDEAD_TOPIC};
use crate::state::{new_state, Shared};
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Pas d'attente entre deux sondages de `wait_for_id`.
const WAIT_TIME: Duration = Duration::from_millis(100);

/// Au-delà de ce multiple d'intervalles de silence, même un hôte en usage
/// est réclamé de force (journalisé en audit) au lieu de fuir pour toujours.
const FORCED_RECLAIM_FACTOR: u32 = 10;

#[derive(Debug, Clone)]
pub struct HostRecord {
    pub host_id: HostId,
    pub ip: String,
    pub is_static: bool,
    pub in_use: bool,
    pub last_seen_age: Duration,
}

#[derive(Default)]
struct Roster {
    static_ids: Vec<HostId>,
    dynamic_ids: Vec<HostId>,
    in_use: HashMap<HostId, bool>,
    last_seen: HashMap<HostId, Instant>,
    ips: HashMap<HostId, String>,
    during_startup: bool,
}

impl Roster {
    fn contains(&self, id: &HostId) -> bool {
        self.in_use.contains_key(id)
    }

    fn forget(&mut self, id: &HostId) {
        self.static_ids.retain(|h| h != id);
        self.dynamic_ids.retain(|h| h != id);
        self.in_use.remove(id);
        self.last_seen.remove(id);
        self.ips.remove(id);
    }

    /// Heartbeat reçu : mise à jour d'un hôte connu, ou enregistrement d'un
    /// nouveau avec classification selon la fenêtre de découverte.
    fn note_alive(&mut self, host_id: HostId, ip: String) {
        if self.contains(&host_id) {
            self.last_seen.insert(host_id, Instant::now());
            debug!("isalive for known host {host_id}, timestamp updated");
        } else {
            self.ips.insert(host_id, ip.clone());
            self.last_seen.insert(host_id, Instant::now());
            if self.during_startup {
                self.static_ids.push(host_id);
            } else {
                self.dynamic_ids.push(host_id);
            }
            self.in_use.insert(host_id, false);
            info!("isalive for new host {host_id} (ip={ip}), added to roster");
        }
    }

    /// IsDead explicite : retrait immédiat, sans attendre le timeout.
    fn note_dead(&mut self, host_id: HostId) {
        if self.contains(&host_id) {
            self.forget(&host_id);
            info!("isdead received for host {host_id}, removed from roster");
        } else {
            debug!("isdead for unknown host {host_id}, ignoring");
        }
    }

    /// Expire les hôtes muets depuis plus de 3 intervalles. Un hôte en usage
    /// est épargné (diagnostic fatal) jusqu'au seuil de réclamation forcée.
    fn cleanup_expired(&mut self, interval: Duration) {
        let timeout = interval * 3;
        let forced = interval * FORCED_RECLAIM_FACTOR;
        let now = Instant::now();

        let expired: Vec<(HostId, Duration)> = self
            .last_seen
            .iter()
            .filter(|(_, seen)| now.duration_since(**seen) > timeout)
            .map(|(id, seen)| (*id, now.duration_since(*seen)))
            .collect();

        for (id, age) in expired {
            let in_use = self.in_use.get(&id).copied().unwrap_or(false);
            if in_use {
                if age > forced {
                    // audit : la réclamation d'un id en usage doit rester visible
                    error!(
                        "AUDIT: force-reclaiming in-use host {id} silent for {}ms (threshold {}ms)",
                        age.as_millis(),
                        forced.as_millis()
                    );
                    self.forget(&id);
                } else {
                    error!("should be timing out host {id}, but it is in use");
                }
            } else {
                self.forget(&id);
                info!("removed old host {id} because of timeout");
            }
        }
    }
}

pub struct PresenceDetector {
    roster: Shared<Roster>,
    bus: Arc<dyn Bus>,
    timing: TimingConfig,
    caller_id: Uuid,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl PresenceDetector {
    pub fn new(bus: Arc<dyn Bus>, timing: TimingConfig) -> Self {
        Self {
            roster: new_state(Roster::default()),
            bus,
            timing,
            caller_id: Uuid::new_v4(),
            tasks: parking_lot::Mutex::new(Vec::new()),
        }
    }

    fn is_alive_interval(&self) -> Duration {
        Duration::from_millis(self.timing.is_alive_interval_ms)
    }

    /// Écoute les heartbeats, lance le cleanup périodique, puis bloque sur la
    /// fenêtre de découverte complète pour classer les hôtes statiques.
    pub async fn start(&self) -> Result<()> {
        self.roster.lock().during_startup = true;

        let mut alive_sub = self.bus.subscribe(ISALIVE_TOPIC).await?;
        let mut dead_sub = self.bus.subscribe(ISDEAD_TOPIC).await?;

        let roster = self.roster.clone();
        let alive_task = tokio::spawn(async move {
            while let Some(msg) = alive_sub.recv().await {
                match serde_json::from_slice::<IsAlive>(&msg.payload) {
                    Ok(hb) => roster.lock().note_alive(hb.host_id, hb.ip),
                    Err(e) => warn!("heartbeat JSON invalide: {e}"),
                }
            }
        });

        let roster = self.roster.clone();
        let dead_task = tokio::spawn(async move {
            while let Some(msg) = dead_sub.recv().await {
                match serde_json::from_slice::<IsDead>(&msg.payload) {
                    Ok(dead) => roster.lock().note_dead(dead.host_id),
                    Err(e) => warn!("isdead JSON invalide: {e}"),
                }
            }
        });

        let roster = self.roster.clone();
        let interval = self.is_alive_interval();
        let cleanup_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // premier tick immédiat
            loop {
                ticker.tick().await;
                roster.lock().cleanup_expired(interval);
            }
        });

        self.tasks.lock().extend([alive_task, dead_task, cleanup_task]);

        self.poll_static_instances().await;
        Ok(())
    }

    /// Diffuse "annoncez-vous maintenant" deux fois à une demi-fenêtre
    /// d'écart et attend la fenêtre entière.
    async fn poll_static_instances(&self) {
        let announce = AnnounceRequest { caller_id: self.caller_id };
        let payload = serde_json::to_vec(&announce).unwrap_or_default();
        let half_window = Duration::from_millis(self.timing.discovery_window_ms / 2);
        let budget = Duration::from_millis(self.timing.retry_timeout_ms);

        info!("starting to wait for static instances to announce themselves");
        if let Err(e) = retry_publish(self.bus.as_ref(), ANNOUNCE_TOPIC, &payload, budget, None).await
        {
            error!("failed to broadcast announce request: {e}");
        }
        tokio::time::sleep(half_window).await;

        // second envoi pour couvrir une perte du premier
        if let Err(e) = retry_publish(self.bus.as_ref(), ANNOUNCE_TOPIC, &payload, budget, None).await
        {
            error!("failed to broadcast announce request: {e}");
        }
        tokio::time::sleep(half_window).await;

        let mut roster = self.roster.lock();
        roster.during_startup = false;
        info!(
            "discovery window closed: {} static and {} dynamic instances",
            roster.static_ids.len(),
            roster.dynamic_ids.len()
        );
        if !roster.dynamic_ids.is_empty() {
            warn!("some hosts announced after the window and were classified dynamic");
        }
    }

    pub(crate) fn note_alive(&self, host_id: HostId, ip: String) {
        self.roster.lock().note_alive(host_id, ip);
    }

    pub(crate) fn note_dead(&self, host_id: HostId) {
        self.roster.lock().note_dead(host_id);
    }

    /// Sélection non bloquante d'un id libre : statiques d'abord (si permis),
    /// dynamiques ensuite. Marque l'id en usage.
    pub fn get_free_id(&self, static_instance_ok: bool) -> Option<HostId> {
        let mut roster = self.roster.lock();

        let pick = |ids: &[HostId], in_use: &HashMap<HostId, bool>| {
            ids.iter().copied().find(|id| !in_use.get(id).copied().unwrap_or(false))
        };

        let selected = if static_instance_ok {
            pick(&roster.static_ids, &roster.in_use)
                .inspect(|id| info!("using static instance {id}"))
        } else {
            None
        }
        .or_else(|| {
            pick(&roster.dynamic_ids, &roster.in_use)
                .inspect(|id| info!("using dynamic instance {id}"))
        });

        if let Some(id) = selected {
            roster.in_use.insert(id, true);
        }
        selected
    }

    /// Sonde `get_free_id(false)` jusqu'au succès ou au timeout
    /// d'initialisation d'hôte, auquel cas l'échec est fatal. Ne rend jamais
    /// un hôte statique.
    pub async fn wait_for_id(&self) -> Result<HostId> {
        let deadline =
            Instant::now() + Duration::from_millis(self.timing.host_initialization_timeout_ms);
        loop {
            if let Some(id) = self.get_free_id(false) {
                return Ok(id);
            }
            if Instant::now() >= deadline {
                return Err(Error::HostStartup(
                    "timed out waiting for new host to become available".into(),
                ));
            }
            tokio::time::sleep(WAIT_TIME).await;
        }
    }

    /// Libère l'id (l'hôte reste enregistré, réutilisable). No-op si inconnu.
    pub fn release_id(&self, id: HostId) {
        let mut roster = self.roster.lock();
        if roster.contains(&id) {
            roster.in_use.insert(id, false);
        }
    }

    /// Oublie complètement l'hôte : chemin rapide d'un arrêt propre, qui
    /// évite d'attendre la détection par timeout. No-op si inconnu.
    pub fn remove_id(&self, id: HostId) {
        let mut roster = self.roster.lock();
        if roster.contains(&id) {
            roster.forget(&id);
            info!("removed old host {id} because of explicit request");
        }
    }

    pub fn is_static_id(&self, id: HostId) -> bool {
        self.roster.lock().static_ids.contains(&id)
    }

    pub fn ip_of(&self, id: HostId) -> Option<String> {
        self.roster.lock().ips.get(&id).cloned()
    }

    pub fn registered_instances(&self) -> Vec<HostId> {
        let roster = self.roster.lock();
        roster.static_ids.iter().chain(roster.dynamic_ids.iter()).copied().collect()
    }

    /// Instantanés pour l'API de lecture.
    pub fn records(&self) -> Vec<HostRecord> {
        let roster = self.roster.lock();
        let now = Instant::now();
        roster
            .static_ids
            .iter()
            .map(|id| (id, true))
            .chain(roster.dynamic_ids.iter().map(|id| (id, false)))
            .map(|(id, is_static)| HostRecord {
                host_id: *id,
                ip: roster.ips.get(id).cloned().unwrap_or_default(),
                is_static,
                in_use: roster.in_use.get(id).copied().unwrap_or(false),
                last_seen_age: roster
                    .last_seen
                    .get(id)
                    .map(|seen| now.duration_since(*seen))
                    .unwrap_or_default(),
            })
            .collect()
    }

    pub fn close(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        let mut roster = self.roster.lock();
        *roster = Roster::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusError, BusMessage, Subscription};
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    /// Bus nul : publie dans le vide, abonnements muets.
    struct NullBus;

    #[async_trait]
    impl Bus for NullBus {
        async fn publish(&self, _topic: &str, _payload: Vec<u8>) -> std::result::Result<(), BusError> {
            Ok(())
        }

        async fn subscribe(&self, topic: &str) -> std::result::Result<Subscription, BusError> {
            let (tx, rx) = mpsc::unbounded_channel::<BusMessage>();
            std::mem::forget(tx);
            Ok(Subscription::new(topic.into(), rx))
        }

        async fn close(&self) -> std::result::Result<(), BusError> {
            Ok(())
        }
    }

    fn detector() -> Arc<PresenceDetector> {
        Arc::new(PresenceDetector::new(Arc::new(NullBus), TimingConfig::fast()))
    }

    #[tokio::test]
    async fn discovery_window_classifies_static_then_dynamic() {
        let detector = detector();
        let x = Uuid::new_v4();
        let y = Uuid::new_v4();

        let starter = detector.clone();
        let start = tokio::spawn(async move { starter.start().await });

        // X répond pendant la fenêtre (200ms en profil fast)
        tokio::time::sleep(Duration::from_millis(50)).await;
        detector.note_alive(x, "10.0.0.1".into());
        start.await.unwrap().unwrap();

        // Y s'annonce après la fermeture de la fenêtre
        detector.note_alive(y, "10.0.0.2".into());

        assert!(detector.is_static_id(x));
        assert!(!detector.is_static_id(y));
        assert_eq!(detector.registered_instances().len(), 2);
        detector.close();
    }

    #[tokio::test]
    async fn free_id_prefers_static_and_marks_in_use() {
        let detector = detector();
        let stat = Uuid::new_v4();
        let dyn_ = Uuid::new_v4();
        {
            detector.roster.lock().during_startup = true;
        }
        detector.note_alive(stat, "10.0.0.1".into());
        {
            detector.roster.lock().during_startup = false;
        }
        detector.note_alive(dyn_, "10.0.0.2".into());

        assert_eq!(detector.get_free_id(true), Some(stat));
        // statique pris : le suivant est dynamique
        assert_eq!(detector.get_free_id(true), Some(dyn_));
        assert_eq!(detector.get_free_id(true), None);

        detector.release_id(dyn_);
        // jamais de statique quand static_instance_ok est faux
        detector.release_id(stat);
        assert_eq!(detector.get_free_id(false), Some(dyn_));
    }

    #[tokio::test]
    async fn release_and_remove_unknown_are_noops() {
        let detector = detector();
        let unknown = Uuid::new_v4();
        detector.release_id(unknown);
        detector.remove_id(unknown);
        assert!(detector.registered_instances().is_empty());
    }

    #[tokio::test]
    async fn isdead_removes_immediately() {
        let detector = detector();
        let id = Uuid::new_v4();
        detector.note_alive(id, "10.0.0.1".into());
        assert_eq!(detector.registered_instances().len(), 1);
        detector.note_dead(id);
        assert!(detector.registered_instances().is_empty());
        // un second isdead ne fait rien
        detector.note_dead(id);
    }

    #[tokio::test]
    async fn silent_host_expires_within_three_intervals() {
        let detector = detector();
        detector.start().await.unwrap();
        let id = Uuid::new_v4();
        detector.note_alive(id, "10.0.0.1".into());

        // is_alive_interval=100ms : silence de 500ms, l'hôte doit disparaître
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!detector.registered_instances().contains(&id));
        detector.close();
    }

    #[tokio::test]
    async fn in_use_host_survives_timeout_then_forced_reclaim() {
        let detector = detector();
        detector.start().await.unwrap();
        let id = Uuid::new_v4();
        detector.note_alive(id, "10.0.0.1".into());
        // marquer en usage via la voie normale
        assert_eq!(detector.get_free_id(false), Some(id));

        // au triple de l'intervalle l'hôte en usage est épargné
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(detector.registered_instances().contains(&id));

        // au seuil d'audit (10 intervalles) il est réclamé de force
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert!(!detector.registered_instances().contains(&id));
        detector.close();
    }

    #[tokio::test]
    async fn wait_for_id_fails_fatally_on_timeout() {
        let mut timing = TimingConfig::fast();
        timing.host_initialization_timeout_ms = 250;
        let detector = Arc::new(PresenceDetector::new(Arc::new(NullBus), timing));
        let err = detector.wait_for_id().await.unwrap_err();
        assert!(matches!(err, Error::HostStartup(_)));
    }

    #[tokio::test]
    async fn wait_for_id_returns_dynamic_host_when_available() {
        let detector = detector();
        let id = Uuid::new_v4();
        let waiter = detector.clone();
        let wait = tokio::spawn(async move { waiter.wait_for_id().await });
        tokio::time::sleep(Duration::from_millis(150)).await;
        detector.note_alive(id, "10.0.0.3".into());
        assert_eq!(wait.await.unwrap().unwrap(), id);
    }
}
