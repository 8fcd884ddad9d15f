/**
 * ORBION KERNEL - Point d'entrée du plan de contrôle
 *
 * RÔLE : Bootstrap complet : config, bus MQTT, détecteur de présence, pool
 * d'hôtes, API REST. Arrêt propre sur Ctrl-C avec drain borné.
 *
 * ARCHITECTURE : Event-driven via MQTT + API REST lecture seule.
 */

use anyhow::Context;
use orbion_kernel::config::load_config;
use orbion_kernel::http::{self, AppState};
use orbion_kernel::mqtt::BusContext;
use orbion_kernel::platform::LocalPlatform;
use orbion_kernel::policy::FirstFitPolicy;
use orbion_kernel::pool::HostPool;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = load_config().await;

    let bus_context = BusContext::new(Duration::from_millis(cfg.timing.reconnect_ceiling_ms));
    let session = bus_context.session(&cfg.mqtt.host, cfg.mqtt.port);

    let pool = HostPool::open(
        Arc::new(session),
        cfg.timing.clone(),
        Arc::new(LocalPlatform::new(cfg.platform.default_instance_size.clone())),
        Arc::new(FirstFitPolicy),
        cfg.platform.default_instance_size.clone(),
    )
    .await
    .context("host pool startup failed")?;

    let app = http::build_router(AppState { pool: pool.clone() });
    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.http.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot bind {addr}"))?;
    info!("kernel listening on http://{addr}");

    tokio::select! {
        served = axum::serve(listener, app).into_future() => {
            served.context("http server stopped")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
        }
    }

    pool.close().await;
    bus_context.close_all();
    Ok(())
}
