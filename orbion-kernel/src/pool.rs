/**
 * POOL - Orchestrateur de placement des objets sur les hôtes
 *
 * RÔLE : Source de vérité du placement : quel objet vit sur quel hôte, avec
 * un verrou équitable par objet. Démarre et rend les hôtes via la plateforme
 * et la politique de scaling.
 *
 * FONCTIONNEMENT :
 * - Un hôte en démarrage est inscrit au pool AVANT son démarrage ; un échec
 *   le retire, jamais d'hôte mort-né dans le pool.
 * - Un arrêt asynchrone retire l'hôte du pool de façon synchrone d'abord,
 *   le démontage part ensuite en tâche de fond.
 * - destroy et migrate mutent la table de placement : les deux prennent le
 *   verrou en écriture de l'objet.
 * - Les échecs des chemins asynchrones sont journalisés, jamais redélivrés ;
 *   les callbacks ne sont appelés qu'en succès.
 */

use crate::bus::{Bus, OnewaySender};
use crate::cancel::CancelToken;
use crate::config::TimingConfig;
use crate::hosts::{ClientObject, VirtualHost};
use crate::models::{HostId, ObjectDescriptor, ObjectId};
use crate::platform::CloudPlatform;
use crate::policy::ScalingPolicy;
use crate::presence::PresenceDetector;
use crate::state::{new_state, Shared};
use crate::{Error, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

pub type CoLock = Arc<RwLock<()>>;

pub struct HostPool {
    bus: Arc<dyn Bus>,
    timing: TimingConfig,
    detector: Arc<PresenceDetector>,
    platform: Arc<dyn CloudPlatform>,
    policy: Arc<dyn ScalingPolicy>,
    default_size: String,
    hosts: Shared<Vec<Arc<VirtualHost>>>,
    placements: Shared<HashMap<ObjectId, Arc<VirtualHost>>>,
    locks: Shared<HashMap<ObjectId, CoLock>>,
    oneway: OnewaySender,
    workers: Shared<Vec<JoinHandle<()>>>,
    timers: Shared<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
    // référence faible sur soi-même pour les tâches de fond, posée par open()
    self_ref: Weak<HostPool>,
}

impl HostPool {
    /// Ouvre le pool : démarre le détecteur (bloque sur la fenêtre de
    /// découverte) puis les tâches de fond.
    pub async fn open(
        bus: Arc<dyn Bus>,
        timing: TimingConfig,
        platform: Arc<dyn CloudPlatform>,
        policy: Arc<dyn ScalingPolicy>,
        default_size: String,
    ) -> Result<Arc<Self>> {
        let detector = Arc::new(PresenceDetector::new(bus.clone(), timing.clone()));
        detector.start().await?;

        let oneway = OnewaySender::new(
            bus.clone(),
            timing.async_send_workers,
            Duration::from_millis(timing.retry_timeout_ms),
            Duration::from_millis(timing.drain_timeout_ms),
        );

        let pool = Arc::new_cyclic(|me| Self {
            bus,
            timing,
            detector,
            platform,
            policy,
            default_size,
            hosts: new_state(Vec::new()),
            placements: new_state(HashMap::new()),
            locks: new_state(HashMap::new()),
            oneway,
            workers: new_state(Vec::new()),
            timers: new_state(Vec::new()),
            closed: AtomicBool::new(false),
            self_ref: me.clone(),
        });
        pool.start_keepalive();
        Ok(pool)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::InvalidState("host pool is closed".into()));
        }
        Ok(())
    }

    pub fn detector(&self) -> &Arc<PresenceDetector> {
        &self.detector
    }

    pub(crate) fn oneway(&self) -> &OnewaySender {
        &self.oneway
    }

    pub fn hosts(&self) -> Vec<Arc<VirtualHost>> {
        self.hosts.lock().clone()
    }

    pub fn host_by_id(&self, host_id: HostId) -> Option<Arc<VirtualHost>> {
        self.hosts.lock().iter().find(|h| h.id() == Some(host_id)).cloned()
    }

    pub fn host_or_unknown(&self, host_id: HostId) -> Result<Arc<VirtualHost>> {
        self.host_by_id(host_id).ok_or(Error::UnknownHost(host_id))
    }

    pub fn get_cloud_objects_count(&self) -> usize {
        self.placements.lock().len()
    }

    pub fn find_managing_host(&self, object_id: ObjectId) -> Option<Arc<VirtualHost>> {
        self.placements.lock().get(&object_id).cloned()
    }

    pub fn get_cloud_object_by_id(&self, object_id: ObjectId) -> Option<ClientObject> {
        self.find_managing_host(object_id)
            .and_then(|h| h.managed_object(object_id))
    }

    /// Verrou équitable de l'objet, absent (pas une erreur) pour un id
    /// inconnu.
    pub fn get_co_lock(&self, object_id: ObjectId) -> Option<CoLock> {
        self.locks.lock().get(&object_id).cloned()
    }

    fn lock_or_unknown(&self, object_id: ObjectId) -> Result<CoLock> {
        self.get_co_lock(object_id)
            .ok_or(Error::UnknownObject(object_id))
    }

    /// Déploie un objet : hôte choisi par la politique, hôte neuf si elle
    /// n'en désigne aucun. Verrou frais et placement installés après
    /// l'instanciation. Jamais idempotent.
    pub async fn deploy_cloud_object(
        &self,
        descriptor: ObjectDescriptor,
        args: Vec<Value>,
    ) -> Result<ObjectId> {
        self.ensure_open()?;
        let host = match self.policy.select_host(&descriptor, self) {
            Some(host) => host,
            None => self.start_new_host(None).await?,
        };
        let object_id = host.deploy_cloud_object(descriptor, args).await?;
        self.placements.lock().insert(object_id, host);
        self.locks.lock().insert(object_id, Arc::new(RwLock::new(())));
        Ok(object_id)
    }

    /// Détruit l'objet sous son verrou en écriture : la destruction mute la
    /// table de placement, comme la migration.
    pub async fn destroy_cloud_object(&self, object_id: ObjectId) -> Result<()> {
        let lock = self.lock_or_unknown(object_id)?;
        let _guard = lock.write().await;

        // l'objet a pu disparaître pendant l'attente du verrou
        let host = self
            .find_managing_host(object_id)
            .ok_or(Error::UnknownObject(object_id))?;
        host.destroy_cloud_object(object_id).await?;
        self.placements.lock().remove(&object_id);
        self.locks.lock().remove(&object_id);
        info!("destroyed cloud object {object_id}");
        Ok(())
    }

    /// Invocation sous le verrou en lecture de l'objet : concurrente entre
    /// appels, exclue d'une destruction ou migration en cours.
    pub async fn invoke_cloud_object(
        &self,
        object_id: ObjectId,
        method: &str,
        args: Vec<Value>,
        cancel: Option<&CancelToken>,
    ) -> Result<Value> {
        let lock = self.lock_or_unknown(object_id)?;
        let _guard = lock.read().await;
        let host = self
            .find_managing_host(object_id)
            .ok_or(Error::UnknownObject(object_id))?;
        host.invoke_cloud_object(object_id, method, args, cancel).await
    }

    pub async fn get_cloud_object_field(&self, object_id: ObjectId, field: &str) -> Result<Value> {
        let lock = self.lock_or_unknown(object_id)?;
        let _guard = lock.read().await;
        let host = self
            .find_managing_host(object_id)
            .ok_or(Error::UnknownObject(object_id))?;
        host.get_cloud_object_field(object_id, field).await
    }

    pub async fn set_cloud_object_field(
        &self,
        object_id: ObjectId,
        field: &str,
        value: Value,
    ) -> Result<()> {
        let lock = self.lock_or_unknown(object_id)?;
        let _guard = lock.read().await;
        let host = self
            .find_managing_host(object_id)
            .ok_or(Error::UnknownObject(object_id))?;
        host.set_cloud_object_field(object_id, field, value).await
    }

    /// Démarre un hôte neuf. Il est inscrit au pool avant son démarrage ;
    /// l'échec le retire et remonte, un hôte raté n'est jamais gardé.
    pub async fn start_new_host(&self, size: Option<String>) -> Result<Arc<VirtualHost>> {
        self.ensure_open()?;
        let size = size.unwrap_or_else(|| self.default_size.clone());
        let host = VirtualHost::new(self.bus.clone(), &self.timing, size).await?;
        self.hosts.lock().push(host.clone());

        match host.startup(&self.detector, self.platform.as_ref()).await {
            Ok(()) => {
                self.spawn_scale_down_timer(&host);
                Ok(host)
            }
            Err(e) => {
                self.hosts.lock().retain(|h| !Arc::ptr_eq(h, &host));
                if let Err(close_err) = host.close().await {
                    warn!("failed host cleanup also failed: {close_err}");
                }
                Err(e)
            }
        }
    }

    /// Forme asynchrone : l'échec est journalisé et l'hôte retiré, jamais
    /// propagé ; le callback n'est appelé qu'en succès.
    pub fn start_new_host_async(
        &self,
        size: Option<String>,
        callback: impl FnOnce(Arc<VirtualHost>) + Send + 'static,
    ) {
        if self.ensure_open().is_err() {
            warn!("pool closed, ignoring async host start request");
            return;
        }
        let Some(pool) = self.self_ref.upgrade() else { return };
        self.spawn_worker(async move {
            match pool.start_new_host(size).await {
                Ok(host) => callback(host),
                Err(e) => error!("async host startup failed: {e}"),
            }
        });
    }

    /// Arrêt synchrone : retrait du pool, drain des objets un par un sous
    /// leur verrou en écriture (les échecs par objet sont journalisés, le
    /// drain continue), puis restitution de l'hôte.
    pub async fn shutdown_host(&self, host: &Arc<VirtualHost>) -> Result<()> {
        self.hosts.lock().retain(|h| !Arc::ptr_eq(h, host));
        self.teardown_host(host).await
    }

    /// Drain puis restitution. Un hôte statique ne nous appartient pas : son
    /// agent n'est jamais arrêté, son id est relâché dans le roster et reste
    /// réutilisable. Un hôte dynamique est arrêté à distance, oublié du
    /// roster et rendu à la plateforme.
    async fn teardown_host(&self, host: &Arc<VirtualHost>) -> Result<()> {
        for object_id in host.get_managed_object_ids() {
            let lock = self.get_co_lock(object_id);
            let _guard = match &lock {
                Some(l) => Some(l.write().await),
                None => None,
            };
            if let Err(e) = host.destroy_cloud_object(object_id).await {
                warn!("draining {object_id} during host shutdown failed: {e}");
            }
            self.placements.lock().remove(&object_id);
            self.locks.lock().remove(&object_id);
        }

        let is_static = host
            .id()
            .map(|id| self.detector.is_static_id(id))
            .unwrap_or(false);
        let outcome = if is_static { host.release().await } else { host.close().await };

        if let Some(id) = host.id() {
            if is_static {
                self.detector.release_id(id);
            } else {
                self.detector.remove_id(id);
                if let Err(e) = self.platform.stop_instance(id).await {
                    warn!("platform stop for {id} failed: {e}");
                }
            }
        }
        outcome
    }

    /// Forme asynchrone : l'hôte est absent du pool dès le retour, le
    /// démontage part en tâche de fond.
    pub fn shutdown_host_async(&self, host: Arc<VirtualHost>) {
        self.hosts.lock().retain(|h| !Arc::ptr_eq(h, &host));
        {
            let mut placements = self.placements.lock();
            let mut locks = self.locks.lock();
            for object_id in host.get_managed_object_ids() {
                placements.remove(&object_id);
                locks.remove(&object_id);
            }
        }

        let Some(pool) = self.self_ref.upgrade() else { return };
        self.spawn_worker(async move {
            // déjà hors du pool : shutdown_host ne fera que le démontage
            if let Err(e) = pool.shutdown_host(&host).await {
                error!("async host teardown failed: {e}");
            }
        });
    }

    /// Migration bloquante, voir `migration::migrate_object`.
    pub async fn migrate_object(
        &self,
        object_id: ObjectId,
        target: Arc<VirtualHost>,
    ) -> Result<()> {
        self.ensure_open()?;
        crate::migration::migrate_object(self, object_id, target).await
    }

    /// Variante par identifiant, pour les appelants qui ne tiennent pas de
    /// proxy (administration, scripts).
    pub async fn migrate_object_to(&self, object_id: ObjectId, target_id: HostId) -> Result<()> {
        let target = self.host_or_unknown(target_id)?;
        self.migrate_object(object_id, target).await
    }

    /// Forme asynchrone : échec journalisé sans redélivrance, callback en
    /// succès uniquement.
    pub fn migrate_object_async(
        &self,
        object_id: ObjectId,
        target: Arc<VirtualHost>,
        callback: impl FnOnce(ObjectId) + Send + 'static,
    ) {
        if self.ensure_open().is_err() {
            warn!("pool closed, ignoring async migration request");
            return;
        }
        let Some(pool) = self.self_ref.upgrade() else { return };
        self.spawn_worker(async move {
            match crate::migration::migrate_object(&pool, object_id, target).await {
                Ok(()) => callback(object_id),
                Err(e) => error!("async migration of {object_id} failed: {e}"),
            }
        });
    }

    /// Retrait atomique d'un placement migré : l'ancien part strictement
    /// avant que le nouveau n'arrive, sous le même verrou de table.
    pub(crate) fn commit_migration(
        &self,
        object_id: ObjectId,
        to: Arc<VirtualHost>,
    ) {
        let mut placements = self.placements.lock();
        placements.remove(&object_id);
        placements.insert(object_id, to);
    }

    fn spawn_worker(&self, fut: impl std::future::Future<Output = ()> + Send + 'static) {
        let mut workers = self.workers.lock();
        workers.retain(|h| !h.is_finished());
        workers.push(tokio::spawn(fut));
    }

    fn start_keepalive(&self) {
        if self.timing.keepalive_interval_ms == 0 {
            return;
        }
        let interval = Duration::from_millis(self.timing.keepalive_interval_ms);
        let weak = self.self_ref.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(pool) = weak.upgrade() else { break };
                if pool.closed.load(Ordering::SeqCst) {
                    break;
                }
                for host in pool.hosts() {
                    if !host.is_online() {
                        continue;
                    }
                    if let Err(e) = host.refresh_cloud_objects().await {
                        warn!("keepalive refresh of host {:?} failed: {e}", host.id());
                    }
                }
            }
        });
        self.timers.lock().push(task);
    }

    fn spawn_scale_down_timer(&self, host: &Arc<VirtualHost>) {
        if self.timing.scale_down_interval_ms == 0 {
            return;
        }
        let interval = Duration::from_millis(self.timing.scale_down_interval_ms);
        let weak = self.self_ref.clone();
        let host = host.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(pool) = weak.upgrade() else { break };
                if pool.closed.load(Ordering::SeqCst) || !host.is_online() {
                    break;
                }
                if pool.policy.scale_down(&host, &pool) {
                    info!("scale-down policy releases host {:?}", host.id());
                    if let Err(e) = pool.shutdown_host(&host).await {
                        warn!("scale-down shutdown failed: {e}");
                    }
                    break;
                }
            }
        });
        self.timers.lock().push(task);
    }

    /// Fermeture ordonnée : plus de travail accepté, drain borné des tâches
    /// de fond puis annulation forcée, démontage des hôtes restants,
    /// détecteur fermé en dernier.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        for timer in self.timers.lock().drain(..) {
            timer.abort();
        }

        let workers = std::mem::take(&mut *self.workers.lock());
        let deadline = Instant::now() + Duration::from_millis(self.timing.drain_timeout_ms);
        for handle in workers {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let abort = handle.abort_handle();
            if tokio::time::timeout(remaining, handle).await.is_err() {
                warn!("background task did not finish in time, aborting");
                abort.abort();
            }
        }

        self.oneway.shutdown().await;

        let hosts = std::mem::take(&mut *self.hosts.lock());
        for host in hosts {
            if let Err(e) = self.teardown_host(&host).await {
                warn!("host teardown failed at pool close: {e}");
            }
        }
        self.placements.lock().clear();
        self.locks.lock().clear();

        self.detector.close();
        if let Err(e) = self.bus.close().await {
            warn!("bus close failed: {e}");
        }
        info!("host pool closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusError, BusMessage, Subscription};
    use crate::platform::LocalPlatform;
    use crate::policy::FirstFitPolicy;
    use async_trait::async_trait;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    struct NullBus;

    #[async_trait]
    impl Bus for NullBus {
        async fn publish(&self, _t: &str, _p: Vec<u8>) -> std::result::Result<(), BusError> {
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

    async fn pool() -> Arc<HostPool> {
        HostPool::open(
            Arc::new(NullBus),
            TimingConfig::fast(),
            Arc::new(LocalPlatform::new("small")),
            Arc::new(FirstFitPolicy),
            "small".into(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn unknown_object_lookups_are_absent_not_errors() {
        let pool = pool().await;
        let id = Uuid::new_v4();
        assert!(pool.find_managing_host(id).is_none());
        assert!(pool.get_cloud_object_by_id(id).is_none());
        assert!(pool.get_co_lock(id).is_none());
        pool.close().await;
    }

    #[tokio::test]
    async fn closed_pool_refuses_new_work() {
        let pool = pool().await;
        pool.close().await;
        let err = pool.start_new_host(None).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        let err = pool
            .deploy_cloud_object(
                ObjectDescriptor { kind: "counter".into(), methods: vec![], transferable: true },
                vec![],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn migration_to_unknown_host_id_is_refused() {
        let pool = pool().await;
        let err = pool
            .migrate_object_to(Uuid::new_v4(), Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownHost(_)));
        pool.close().await;
    }

    #[tokio::test]
    async fn destroy_of_unknown_object_errors_before_any_lock() {
        let pool = pool().await;
        let err = pool.destroy_cloud_object(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, Error::UnknownObject(_)));
        pool.close().await;
    }

    #[tokio::test]
    async fn failed_host_startup_leaves_no_host_behind() {
        // pas d'agent sur le bus nul : wait_for_id expire
        let mut timing = TimingConfig::fast();
        timing.host_initialization_timeout_ms = 300;
        let pool = HostPool::open(
            Arc::new(NullBus),
            timing,
            Arc::new(LocalPlatform::new("small")),
            Arc::new(FirstFitPolicy),
            "small".into(),
        )
        .await
        .unwrap();

        let err = pool.start_new_host(None).await.unwrap_err();
        assert!(matches!(err, Error::HostStartup(_)));
        assert!(pool.hosts().is_empty());
        pool.close().await;
    }
}
