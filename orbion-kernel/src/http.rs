/**
 * API REST ORBION - Surface de lecture du plan de contrôle
 *
 * RÔLE :
 * Exposer l'état du pool et du roster pour dashboard, CLI et scripts
 * d'administration. Lecture seule : toute mutation passe par le bus.
 *
 * FONCTIONNEMENT :
 * - Serveur Axum avec middleware auth API key
 * - Routes : /health, /hosts, /hosts/{id}, /objects/count, /objects/{id}
 * - Sérialisation JSON automatique des réponses
 *
 * SÉCURITÉ :
 * - Header x-api-key obligatoire sur toutes routes sauf /health
 * - Validation côté middleware avant traitement métier
 */

use crate::hosts::{Lifecycle, ObjectState};
use crate::pool::HostPool;
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use std::sync::Arc;
use uuid::Uuid;

#[derive(serde::Serialize)]
struct HostView {
    host_id: String,
    ip: String,
    is_static: bool,
    in_use: bool,
    last_seen_age_seconds: u64,
    lifecycle: Option<String>,
    size: Option<String>,
    uptime_seconds: Option<u64>,
    managed_objects: usize,
}

#[derive(serde::Serialize)]
struct ObjectView {
    object_id: String,
    kind: String,
    state: String,
    host_id: Option<String>,
}

fn lifecycle_label(l: Lifecycle) -> &'static str {
    match l {
        Lifecycle::NotStarted => "not_started",
        Lifecycle::Online => "online",
        Lifecycle::ShuttingDown => "shutting_down",
        Lifecycle::Closed => "closed",
    }
}

fn state_label(s: ObjectState) -> &'static str {
    match s {
        ObjectState::Idle => "idle",
        ObjectState::Executing => "executing",
        ObjectState::Migrating => "migrating",
    }
}

async fn require_api_key(req: Request, next: Next) -> Result<Response, StatusCode> {
    let path = req.uri().path();

    // Health check toujours accessible
    if path.starts_with("/health") {
        return Ok(next.run(req).await);
    }

    let expected = std::env::var("ORBION_API_KEY").unwrap_or_default();
    if expected.is_empty() {
        tracing::error!("SECURITY: ORBION_API_KEY not set - API access denied");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);

    if !ok {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<HostPool>,
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/hosts", get(get_hosts))
        .route("/hosts/{id}", get(get_host))
        .route("/objects/count", get(get_objects_count))
        .route("/objects/{id}", get(get_object))
        .with_state(app_state)
        .layer(middleware::from_fn(require_api_key))
}

fn host_views(pool: &HostPool) -> Vec<HostView> {
    pool.detector()
        .records()
        .into_iter()
        .map(|r| {
            let proxy = pool.host_by_id(r.host_id);
            HostView {
                host_id: r.host_id.to_string(),
                ip: r.ip,
                is_static: r.is_static,
                in_use: r.in_use,
                last_seen_age_seconds: r.last_seen_age.as_secs(),
                lifecycle: proxy.as_ref().map(|h| lifecycle_label(h.lifecycle()).to_string()),
                size: proxy.as_ref().map(|h| h.declared_size().to_string()),
                uptime_seconds: proxy
                    .as_ref()
                    .and_then(|h| h.startup_age())
                    .map(|age| age.as_secs()),
                managed_objects: proxy.map(|h| h.get_cloud_objects_count()).unwrap_or(0),
            }
        })
        .collect()
}

// GET /hosts (liste)
async fn get_hosts(State(app): State<AppState>) -> Json<Vec<HostView>> {
    Json(host_views(&app.pool))
}

// GET /hosts/:id (détail)
async fn get_host(
    State(app): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<HostView>, StatusCode> {
    host_views(&app.pool)
        .into_iter()
        .find(|v| v.host_id == id.to_string())
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

// GET /objects/count
async fn get_objects_count(State(app): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "count": app.pool.get_cloud_objects_count() }))
}

// GET /objects/:id (détail)
async fn get_object(
    State(app): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ObjectView>, StatusCode> {
    let Some(obj) = app.pool.get_cloud_object_by_id(id) else {
        return Err(StatusCode::NOT_FOUND);
    };
    Ok(Json(ObjectView {
        object_id: id.to_string(),
        kind: obj.descriptor.kind,
        state: state_label(obj.state).to_string(),
        host_id: app
            .pool
            .find_managing_host(id)
            .and_then(|h| h.id())
            .map(|h| h.to_string()),
    }))
}
