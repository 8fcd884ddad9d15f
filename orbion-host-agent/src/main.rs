//! Thin binary around the agent library: MQTT session, env-driven config,
//! Ctrl-C turns into a graceful goodbye.

use anyhow::Context;
use orbion_host_agent::HostAgent;
use orbion_kernel::mqtt::BusContext;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone)]
struct AgentConfig {
    mqtt_broker: String,
    mqtt_port: u16,
    ip: String,
    heartbeat_interval: Duration,
    reconnect_ceiling: Duration,
}

impl AgentConfig {
    fn from_env() -> Self {
        let env_or = |key: &str, fallback: &str| {
            std::env::var(key).unwrap_or_else(|_| fallback.to_string())
        };
        Self {
            mqtt_broker: env_or("ORBION_MQTT_HOST", "localhost"),
            mqtt_port: env_or("ORBION_MQTT_PORT", "1883").parse().unwrap_or(1883),
            ip: env_or("ORBION_AGENT_IP", "127.0.0.1"),
            heartbeat_interval: Duration::from_millis(
                env_or("ORBION_HEARTBEAT_MS", "5000").parse().unwrap_or(5_000),
            ),
            reconnect_ceiling: Duration::from_millis(
                env_or("ORBION_RECONNECT_CEILING_MS", "30000").parse().unwrap_or(30_000),
            ),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = AgentConfig::from_env();
    info!("connecting to mqtt://{}:{}", cfg.mqtt_broker, cfg.mqtt_port);

    let bus_context = BusContext::new(cfg.reconnect_ceiling);
    let session = bus_context.session(&cfg.mqtt_broker, cfg.mqtt_port);

    let agent = Arc::new(HostAgent::new(cfg.ip, cfg.heartbeat_interval));
    let stopper = agent.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            stopper.stop();
        }
    });

    agent
        .run(Arc::new(session))
        .await
        .context("agent loop failed")?;
    bus_context.close_all();
    Ok(())
}
