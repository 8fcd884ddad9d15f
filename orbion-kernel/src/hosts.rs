/**
 * HOSTS - Proxy local d'un hôte distant et de ses objets gérés
 *
 * RÔLE : Chaque hôte du pool est représenté par un `VirtualHost` qui porte
 * son cycle de vie (jamais réutilisé), l'ensemble de ses objets gérés et le
 * canal de requêtes corrélées vers l'agent distant.
 *
 * FONCTIONNEMENT :
 * - Le démarrage préfère un id statique libre ; sinon la plateforme démarre
 *   une instance et on attend qu'elle s'annonce.
 * - Chaque appel distant passe par le canal requête/réponse avec timeout
 *   par appel et token d'annulation optionnel.
 * - La résolution de surcharge est faite une fois par signature d'appel et
 *   mise en cache.
 */

use crate::bus::{Bus, RequestChannel};
use crate::cancel::CancelToken;
use crate::config::TimingConfig;
use crate::dispatch::resolve_overload;
use crate::models::{
    host_request_topic, HostId, HostReply, HostRequest, MethodDescriptor, ObjectDescriptor,
    ObjectId, ParamKind,
};
use crate::platform::CloudPlatform;
use crate::presence::PresenceDetector;
use crate::state::{new_state, Shared};
use crate::{Error, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    NotStarted,
    Online,
    ShuttingDown,
    Closed,
}

/// État d'un objet vu du contrôleur.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectState {
    Idle,
    Executing,
    Migrating,
}

#[derive(Debug, Clone)]
pub struct ClientObject {
    pub descriptor: ObjectDescriptor,
    pub state: ObjectState,
}

fn kind_of(value: &Value) -> ParamKind {
    match value {
        Value::Bool(_) => ParamKind::Bool,
        Value::Number(_) => ParamKind::Number,
        Value::String(_) => ParamKind::String,
        Value::Array(_) => ParamKind::Array,
        Value::Object(_) => ParamKind::Object,
        Value::Null => ParamKind::Any,
    }
}

type DispatchKey = (ObjectId, String, Vec<ParamKind>);

pub struct VirtualHost {
    id: OnceLock<HostId>,
    size: String,
    lifecycle: parking_lot::Mutex<Lifecycle>,
    started_at: parking_lot::Mutex<Option<Instant>>,
    managed: Shared<HashMap<ObjectId, ClientObject>>,
    dispatch_cache: Shared<HashMap<DispatchKey, MethodDescriptor>>,
    channel: RequestChannel,
}

impl VirtualHost {
    /// Crée le proxy, pas encore rattaché à un hôte réel.
    pub async fn new(bus: Arc<dyn Bus>, timing: &TimingConfig, size: String) -> Result<Arc<Self>> {
        let channel = RequestChannel::open(
            bus,
            Uuid::new_v4(),
            Duration::from_millis(timing.request_timeout_ms),
            Duration::from_millis(timing.retry_timeout_ms),
        )
        .await?;
        Ok(Arc::new(Self {
            id: OnceLock::new(),
            size,
            lifecycle: parking_lot::Mutex::new(Lifecycle::NotStarted),
            started_at: parking_lot::Mutex::new(None),
            managed: new_state(HashMap::new()),
            dispatch_cache: new_state(HashMap::new()),
            channel,
        }))
    }

    pub fn id(&self) -> Option<HostId> {
        self.id.get().copied()
    }

    fn require_id(&self) -> Result<HostId> {
        self.id()
            .ok_or_else(|| Error::InvalidState("host has no id yet".into()))
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.lock()
    }

    pub fn is_online(&self) -> bool {
        self.lifecycle() == Lifecycle::Online
    }

    pub fn declared_size(&self) -> &str {
        &self.size
    }

    pub fn startup_age(&self) -> Option<Duration> {
        self.started_at.lock().map(|t| t.elapsed())
    }

    /// Rattache le proxy à un hôte réel : id statique libre si disponible,
    /// sinon provisionnement et attente d'annonce. L'échec laisse le proxy
    /// inutilisable, l'appelant le retire du pool.
    pub async fn startup(
        &self,
        detector: &Arc<PresenceDetector>,
        platform: &dyn CloudPlatform,
    ) -> Result<()> {
        {
            let lifecycle = self.lifecycle.lock();
            if *lifecycle != Lifecycle::NotStarted {
                return Err(Error::InvalidState(format!(
                    "host cannot start from state {lifecycle:?}"
                )));
            }
        }

        let id = match detector.get_free_id(true) {
            Some(id) => id,
            None => {
                platform.start_instance(&self.size).await?;
                detector.wait_for_id().await?
            }
        };
        self.id
            .set(id)
            .map_err(|_| Error::InvalidState("host already started once".into()))?;
        *self.started_at.lock() = Some(Instant::now());
        *self.lifecycle.lock() = Lifecycle::Online;
        info!("virtual host attached to instance {id} (size={})", self.size);
        Ok(())
    }

    /// Envoie une requête et traduit l'erreur distante. Autorisé en ligne et
    /// pendant le drain d'arrêt, jamais avant démarrage ni après fermeture.
    async fn call(&self, request: HostRequest, cancel: Option<&CancelToken>) -> Result<HostReply> {
        match self.lifecycle() {
            Lifecycle::Online | Lifecycle::ShuttingDown => {}
            _ => return Err(Error::HostOffline),
        }
        let topic = host_request_topic(self.require_id()?);
        match self.channel.request(&topic, request, None, cancel).await? {
            HostReply::Error { message } => Err(Error::Remote(message)),
            reply => Ok(reply),
        }
    }

    pub async fn deploy_cloud_object(
        &self,
        descriptor: ObjectDescriptor,
        args: Vec<Value>,
    ) -> Result<ObjectId> {
        let reply = self
            .call(HostRequest::Deploy { descriptor: descriptor.clone(), args }, None)
            .await?;
        let HostReply::Deployed { object_id } = reply else {
            return Err(Error::Remote("unexpected reply to deploy".into()));
        };
        self.managed.lock().insert(
            object_id,
            ClientObject { descriptor, state: ObjectState::Idle },
        );
        info!("deployed cloud object {object_id} on host {:?}", self.id());
        Ok(object_id)
    }

    pub async fn destroy_cloud_object(&self, object_id: ObjectId) -> Result<()> {
        if !self.managed.lock().contains_key(&object_id) {
            return Err(Error::UnknownObject(object_id));
        }
        self.call(HostRequest::Destroy { object_id }, None).await?;
        self.managed.lock().remove(&object_id);
        self.dispatch_cache.lock().retain(|(id, _, _), _| *id != object_id);
        Ok(())
    }

    /// Invocation distante : signature résolue une fois par (objet, nom,
    /// sortes d'arguments) puis cachée.
    pub async fn invoke_cloud_object(
        &self,
        object_id: ObjectId,
        method: &str,
        args: Vec<Value>,
        cancel: Option<&CancelToken>,
    ) -> Result<Value> {
        let descriptor = self
            .managed
            .lock()
            .get(&object_id)
            .map(|o| o.descriptor.clone())
            .ok_or(Error::UnknownObject(object_id))?;

        let key: DispatchKey =
            (object_id, method.to_string(), args.iter().map(kind_of).collect());
        let cached = self.dispatch_cache.lock().get(&key).cloned();
        let resolved = match cached {
            Some(m) => m,
            None => {
                let m = resolve_overload(&descriptor.methods, method, &args)?.clone();
                self.dispatch_cache.lock().insert(key, m.clone());
                m
            }
        };

        self.set_object_state(object_id, ObjectState::Executing);
        let outcome = self
            .call(
                HostRequest::Invoke { object_id, method: resolved.name.clone(), args },
                cancel,
            )
            .await;
        self.set_object_state(object_id, ObjectState::Idle);

        match outcome? {
            HostReply::Value { value } => Ok(value),
            HostReply::Done => Ok(Value::Null),
            _ => Err(Error::Remote("unexpected reply to invoke".into())),
        }
    }

    pub async fn get_cloud_object_field(&self, object_id: ObjectId, field: &str) -> Result<Value> {
        if !self.managed.lock().contains_key(&object_id) {
            return Err(Error::UnknownObject(object_id));
        }
        match self
            .call(HostRequest::GetField { object_id, field: field.into() }, None)
            .await?
        {
            HostReply::Value { value } => Ok(value),
            _ => Err(Error::Remote("unexpected reply to get_field".into())),
        }
    }

    pub async fn set_cloud_object_field(
        &self,
        object_id: ObjectId,
        field: &str,
        value: Value,
    ) -> Result<()> {
        if !self.managed.lock().contains_key(&object_id) {
            return Err(Error::UnknownObject(object_id));
        }
        self.call(HostRequest::SetField { object_id, field: field.into(), value }, None)
            .await?;
        Ok(())
    }

    /// Signal de vivacité : les objets de cet hôte sont toujours utilisés.
    pub async fn refresh_cloud_objects(&self) -> Result<()> {
        self.call(HostRequest::Refresh, None).await?;
        Ok(())
    }

    pub fn get_managed_object_ids(&self) -> Vec<ObjectId> {
        self.managed.lock().keys().copied().collect()
    }

    pub fn get_cloud_objects_count(&self) -> usize {
        self.managed.lock().len()
    }

    pub fn managed_object(&self, object_id: ObjectId) -> Option<ClientObject> {
        self.managed.lock().get(&object_id).cloned()
    }

    pub(crate) fn set_object_state(&self, object_id: ObjectId, state: ObjectState) {
        if let Some(obj) = self.managed.lock().get_mut(&object_id) {
            obj.state = state;
        }
    }

    /// Sérialise l'état de l'objet en vue d'une migration.
    pub async fn serialize_to_migrate(&self, object_id: ObjectId) -> Result<Vec<u8>> {
        match self.call(HostRequest::Serialize { object_id }, None).await? {
            HostReply::State { bytes } => Ok(bytes),
            _ => Err(Error::Remote("unexpected reply to serialize".into())),
        }
    }

    /// Reconstruit sur cet hôte un objet migré sous son id d'origine.
    pub async fn deploy_migrated_cloud_object(
        &self,
        object_id: ObjectId,
        record: ClientObject,
        state: Vec<u8>,
    ) -> Result<()> {
        self.call(
            HostRequest::DeployMigrated {
                object_id,
                descriptor: record.descriptor.clone(),
                state,
            },
            None,
        )
        .await?;
        self.managed.lock().insert(object_id, record);
        Ok(())
    }

    /// Retire l'objet du suivi local sans le détruire à distance. Réservé à
    /// la migration, qui a déjà reconstruit l'objet ailleurs.
    pub(crate) fn remove_cloud_object(&self, object_id: ObjectId) -> Option<ClientObject> {
        self.dispatch_cache.lock().retain(|(id, _, _), _| *id != object_id);
        self.managed.lock().remove(&object_id)
    }

    /// Arrêt de l'hôte distant puis fermeture du canal. L'agent peut mourir
    /// avant de répondre : un timeout ici n'est pas une erreur.
    pub async fn close(&self) -> Result<()> {
        {
            let mut lifecycle = self.lifecycle.lock();
            match *lifecycle {
                Lifecycle::Closed => return Ok(()),
                Lifecycle::NotStarted => {
                    *lifecycle = Lifecycle::Closed;
                    self.channel.close();
                    return Ok(());
                }
                _ => *lifecycle = Lifecycle::ShuttingDown,
            }
        }

        if let Err(e) = self.call(HostRequest::Shutdown, None).await {
            if e.is_timeout() {
                info!("host {:?} did not acknowledge shutdown, assuming gone", self.id());
            } else {
                warn!("shutdown request to host {:?} failed: {e}", self.id());
            }
        }

        self.managed.lock().clear();
        self.channel.close();
        *self.lifecycle.lock() = Lifecycle::Closed;
        Ok(())
    }

    /// Détache le proxy d'un hôte statique : l'agent ne nous appartient pas,
    /// on ne lui envoie jamais d'ordre d'arrêt, seul le canal est fermé.
    pub async fn release(&self) -> Result<()> {
        {
            let mut lifecycle = self.lifecycle.lock();
            if *lifecycle == Lifecycle::Closed {
                return Ok(());
            }
            *lifecycle = Lifecycle::Closed;
        }
        self.managed.lock().clear();
        self.dispatch_cache.lock().clear();
        self.channel.close();
        info!("released static instance {:?} back to the roster", self.id());
        Ok(())
    }
}

impl std::fmt::Debug for VirtualHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualHost")
            .field("id", &self.id())
            .field("size", &self.size)
            .field("lifecycle", &self.lifecycle())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusError, BusMessage, Subscription};
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    struct NullBus;

    #[async_trait]
    impl Bus for NullBus {
        async fn publish(&self, _t: &str, _p: Vec<u8>) -> std::result::Result<(), BusError> {
            Ok(())
        }

        async fn subscribe(&self, topic: &str) -> std::result::Result<Subscription, BusError> {
            let (tx, rx) = mpsc::unbounded_channel::<BusMessage>();
            std::mem::forget(tx); // garde l'abonnement ouvert, jamais de message
            Ok(Subscription::new(topic.into(), rx))
        }

        async fn close(&self) -> std::result::Result<(), BusError> {
            Ok(())
        }
    }

    async fn host() -> Arc<VirtualHost> {
        VirtualHost::new(Arc::new(NullBus), &TimingConfig::fast(), "small".into())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn calls_refused_before_startup() {
        let host = host().await;
        assert_eq!(host.lifecycle(), Lifecycle::NotStarted);
        let err = host.refresh_cloud_objects().await.unwrap_err();
        assert!(matches!(err, Error::HostOffline));
    }

    #[tokio::test]
    async fn close_before_startup_goes_straight_to_closed() {
        let host = host().await;
        host.close().await.unwrap();
        assert_eq!(host.lifecycle(), Lifecycle::Closed);
        // un hôte fermé n'est jamais réutilisé
        let err = host.refresh_cloud_objects().await.unwrap_err();
        assert!(matches!(err, Error::HostOffline));
    }

    #[tokio::test]
    async fn unknown_object_is_reported_without_remote_call() {
        let host = host().await;
        let id = Uuid::new_v4();
        let err = host
            .invoke_cloud_object(id, "anything", vec![], None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownObject(_)));
        let err = host.destroy_cloud_object(id).await.unwrap_err();
        assert!(matches!(err, Error::UnknownObject(_)));
    }

    #[test]
    fn kinds_of_json_values() {
        assert_eq!(kind_of(&serde_json::json!(true)), ParamKind::Bool);
        assert_eq!(kind_of(&serde_json::json!(1.5)), ParamKind::Number);
        assert_eq!(kind_of(&serde_json::json!("s")), ParamKind::String);
        assert_eq!(kind_of(&serde_json::json!([1])), ParamKind::Array);
        assert_eq!(kind_of(&serde_json::json!({})), ParamKind::Object);
        assert_eq!(kind_of(&Value::Null), ParamKind::Any);
    }
}
