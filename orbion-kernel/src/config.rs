use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct KernelConfig {
    pub mqtt: MqttConf,
    pub http: HttpConf,
    pub timing: TimingConfig,
    pub platform: PlatformConf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConf {
    pub port: u16,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PlatformConf {
    pub default_instance_size: String,
}

/// Tous les délais du plan de contrôle, par appel et non globaux.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TimingConfig {
    /// Période des heartbeats ; le cleanup tourne à cette période et expire
    /// au triple.
    pub is_alive_interval_ms: u64,
    /// Fenêtre de découverte au démarrage : tout hôte vu dedans est statique.
    pub discovery_window_ms: u64,
    /// Budget de `wait_for_id` avant échec fatal.
    pub host_initialization_timeout_ms: u64,
    /// Timeout des appels requête/réponse.
    pub request_timeout_ms: u64,
    /// Budget de retry des envois (fire-and-forget compris).
    pub retry_timeout_ms: u64,
    /// Plafond du backoff exponentiel de reconnexion.
    pub reconnect_ceiling_ms: u64,
    /// 0 désactive le keepalive périodique des objets.
    pub keepalive_interval_ms: u64,
    /// Période de consultation de la politique de décommissionnement par
    /// hôte. 0 désactive.
    pub scale_down_interval_ms: u64,
    /// Nombre de workers du pool d'envoi fire-and-forget.
    pub async_send_workers: usize,
    /// Attente bornée de drain à la fermeture, avant annulation forcée.
    pub drain_timeout_ms: u64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            mqtt: MqttConf::default(),
            http: HttpConf::default(),
            timing: TimingConfig::default(),
            platform: PlatformConf::default(),
        }
    }
}

impl Default for MqttConf {
    fn default() -> Self {
        Self { host: "localhost".into(), port: 1883 }
    }
}

impl Default for HttpConf {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

impl Default for PlatformConf {
    fn default() -> Self {
        Self { default_instance_size: "small".into() }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            is_alive_interval_ms: 5_000,
            discovery_window_ms: 4_000,
            host_initialization_timeout_ms: 60_000,
            request_timeout_ms: 30_000,
            retry_timeout_ms: 10_000,
            reconnect_ceiling_ms: 30_000,
            keepalive_interval_ms: 60_000,
            scale_down_interval_ms: 60_000,
            async_send_workers: 4,
            drain_timeout_ms: 60_000,
        }
    }
}

impl TimingConfig {
    /// Profil rapide pour tests : tout en dizaines de millisecondes.
    pub fn fast() -> Self {
        Self {
            is_alive_interval_ms: 100,
            discovery_window_ms: 200,
            host_initialization_timeout_ms: 2_000,
            request_timeout_ms: 2_000,
            retry_timeout_ms: 300,
            reconnect_ceiling_ms: 500,
            keepalive_interval_ms: 0,
            scale_down_interval_ms: 0,
            async_send_workers: 2,
            drain_timeout_ms: 2_000,
        }
    }
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("ORBION_KERNEL_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        if txt.trim().is_empty() {
            return KernelConfig::default();
        }
        serde_yaml::from_str(&txt).unwrap_or_else(|e| {
            tracing::error!("config invalide: {e}");
            KernelConfig::default()
        })
    } else {
        tracing::warn!("pas de kernel.yaml, usage config par défaut");
        KernelConfig::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = KernelConfig::default();
        assert_eq!(cfg.mqtt.port, 1883);
        assert_eq!(cfg.timing.is_alive_interval_ms, 5_000);
        assert!(cfg.timing.async_send_workers > 0);
    }

    #[test]
    fn partial_yaml_overrides_only_named_fields() {
        let cfg: KernelConfig =
            serde_yaml::from_str("timing:\n  is_alive_interval_ms: 250\n").unwrap();
        assert_eq!(cfg.timing.is_alive_interval_ms, 250);
        // le reste garde les défauts
        assert_eq!(cfg.timing.request_timeout_ms, 30_000);
        assert_eq!(cfg.mqtt.host, "localhost");
    }
}
