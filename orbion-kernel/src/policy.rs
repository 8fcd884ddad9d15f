/**
 * POLICY - Décision de placement et de décommissionnement
 *
 * RÔLE : Le pool délègue ici le choix de l'hôte cible d'un déploiement et la
 * décision de rendre un hôte. La politique voit le pool en lecture et rien
 * d'autre ; elle ne mute jamais le pool elle-même.
 */

use crate::hosts::VirtualHost;
use crate::models::ObjectDescriptor;
use crate::pool::HostPool;
use std::sync::Arc;

/// Couture de placement. `select_host` rend `None` pour demander un hôte
/// neuf ; `scale_down` est consultée par le timer de décommissionnement de
/// chaque hôte.
pub trait ScalingPolicy: Send + Sync {
    fn select_host(
        &self,
        descriptor: &ObjectDescriptor,
        pool: &HostPool,
    ) -> Option<Arc<VirtualHost>>;

    fn scale_down(&self, host: &Arc<VirtualHost>, pool: &HostPool) -> bool;
}

/// Politique par défaut : premier hôte en ligne, décommissionnement des
/// hôtes dynamiques devenus vides.
pub struct FirstFitPolicy;

impl ScalingPolicy for FirstFitPolicy {
    fn select_host(
        &self,
        _descriptor: &ObjectDescriptor,
        pool: &HostPool,
    ) -> Option<Arc<VirtualHost>> {
        pool.hosts().into_iter().find(|h| h.is_online())
    }

    fn scale_down(&self, host: &Arc<VirtualHost>, pool: &HostPool) -> bool {
        if host.get_cloud_objects_count() > 0 {
            return false;
        }
        // ne jamais rendre un hôte statique, il ne nous appartient pas
        match host.id() {
            Some(id) => !pool.detector().is_static_id(id),
            None => false,
        }
    }
}

/// Un hôte neuf par objet : utile pour les tests d'isolation.
pub struct HostPerObjectPolicy;

impl ScalingPolicy for HostPerObjectPolicy {
    fn select_host(
        &self,
        _descriptor: &ObjectDescriptor,
        _pool: &HostPool,
    ) -> Option<Arc<VirtualHost>> {
        None
    }

    fn scale_down(&self, host: &Arc<VirtualHost>, pool: &HostPool) -> bool {
        FirstFitPolicy.scale_down(host, pool)
    }
}
