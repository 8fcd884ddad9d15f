/**
 * MIGRATION - Déplacement d'un objet vivant entre deux hôtes
 *
 * RÔLE : Un seul appel bloquant : verrou en écriture de l'objet, état
 * MIGRATING, transfert de l'état sérialisé de la source vers la cible, et
 * seulement après confirmation de la reconstruction, bascule atomique du
 * placement (l'ancien retiré strictement avant le nouveau), retour à IDLE.
 *
 * Tout échec de transfert laisse l'objet pleinement opérationnel sur la
 * source, état restauré, rien de committé.
 */

use crate::hosts::{ClientObject, ObjectState, VirtualHost};
use crate::models::{host_request_topic, HostRequest, ObjectId, RequestEnvelope};
use crate::pool::HostPool;
use crate::{Error, Result};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

pub async fn migrate_object(
    pool: &HostPool,
    object_id: ObjectId,
    target: Arc<VirtualHost>,
) -> Result<()> {
    if !target.is_online() {
        return Err(Error::HostOffline);
    }
    let lock = pool
        .get_co_lock(object_id)
        .ok_or(Error::UnknownObject(object_id))?;
    let _guard = lock.write().await;

    // placement relu sous le verrou : il a pu bouger pendant l'attente
    let source = pool
        .find_managing_host(object_id)
        .ok_or(Error::UnknownObject(object_id))?;
    if Arc::ptr_eq(&source, &target) {
        info!("migration of {object_id} to its own host, nothing to do");
        return Ok(());
    }
    let record = source
        .managed_object(object_id)
        .ok_or(Error::UnknownObject(object_id))?;

    source.set_object_state(object_id, ObjectState::Migrating);
    let transfer = transfer(&source, &target, object_id, &record).await;
    if let Err(e) = transfer {
        source.set_object_state(object_id, ObjectState::Idle);
        return Err(Error::Migration(e.to_string()));
    }

    // la reconstruction est confirmée : bascule du placement puis retrait
    // fire-and-forget côté source
    pool.commit_migration(object_id, target.clone());
    source.remove_cloud_object(object_id);
    send_remove_migrated(pool, &source, object_id);

    info!(
        "migrated cloud object {object_id} from {:?} to {:?}",
        source.id(),
        target.id()
    );
    Ok(())
}

async fn transfer(
    source: &Arc<VirtualHost>,
    target: &Arc<VirtualHost>,
    object_id: ObjectId,
    record: &ClientObject,
) -> Result<()> {
    let state = source.serialize_to_migrate(object_id).await?;
    target
        .deploy_migrated_cloud_object(
            object_id,
            ClientObject { descriptor: record.descriptor.clone(), state: ObjectState::Idle },
            state,
        )
        .await
}

/// Le retrait côté source n'a pas besoin de confirmation : l'objet vit déjà
/// sur la cible et la source finira par être recyclée de toute façon.
fn send_remove_migrated(pool: &HostPool, source: &Arc<VirtualHost>, object_id: ObjectId) {
    let Some(source_id) = source.id() else { return };
    let envelope = RequestEnvelope {
        correlation_id: Uuid::new_v4(),
        reply_to: String::new(),
        request: HostRequest::RemoveMigrated { object_id },
    };
    match serde_json::to_vec(&envelope) {
        Ok(payload) => {
            pool.oneway()
                .send(host_request_topic(source_id), payload, "RemoveMigrated")
        }
        Err(e) => warn!("could not encode remove-migrated for {object_id}: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{Bus, BusError, BusMessage, Subscription};
    use crate::config::TimingConfig;
    use crate::platform::LocalPlatform;
    use crate::policy::FirstFitPolicy;
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
            std::mem::forget(tx);
            Ok(Subscription::new(topic.into(), rx))
        }

        async fn close(&self) -> std::result::Result<(), BusError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn migration_to_offline_target_is_refused() {
        let pool = HostPool::open(
            Arc::new(NullBus),
            TimingConfig::fast(),
            Arc::new(LocalPlatform::new("small")),
            Arc::new(FirstFitPolicy),
            "small".into(),
        )
        .await
        .unwrap();
        let target = VirtualHost::new(Arc::new(NullBus), &TimingConfig::fast(), "small".into())
            .await
            .unwrap();

        let err = migrate_object(&pool, Uuid::new_v4(), target).await.unwrap_err();
        assert!(matches!(err, Error::HostOffline));
        pool.close().await;
    }
}
