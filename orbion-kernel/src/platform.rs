/**
 * PLATFORM - Couture vers l'infrastructure qui démarre les machines
 *
 * RÔLE : Le pool demande une instance, la plateforme la fournit. Aucun
 * driver cloud concret ici ; la plateforme locale suppose des agents
 * démarrés à la main (ou par le harnais de test) qui s'annoncent seuls
 * sur le bus.
 */

use crate::models::HostId;
use crate::Result;
use async_trait::async_trait;
use tracing::info;

/// Contrat minimal de provisionnement. `start_instance` est fire-and-forget :
/// l'instance démarrée finit par s'annoncer via heartbeat et le détecteur la
/// distribue par `wait_for_id`.
#[async_trait]
pub trait CloudPlatform: Send + Sync {
    async fn start_instance(&self, size: &str) -> Result<()>;
    async fn stop_instance(&self, host_id: HostId) -> Result<()>;
}

/// Plateforme de développement : ne démarre rien, les agents tournent déjà.
pub struct LocalPlatform {
    default_size: String,
}

impl LocalPlatform {
    pub fn new(default_size: impl Into<String>) -> Self {
        Self { default_size: default_size.into() }
    }
}

#[async_trait]
impl CloudPlatform for LocalPlatform {
    async fn start_instance(&self, size: &str) -> Result<()> {
        info!("local platform: instance of size {size} requested, expecting an externally started agent");
        Ok(())
    }

    async fn stop_instance(&self, host_id: HostId) -> Result<()> {
        info!("local platform: stop requested for {host_id}, nothing to tear down");
        Ok(())
    }
}
