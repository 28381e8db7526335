use anyhow::Result;
use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn, Level};
use tracing_subscriber;

use brain_memory_cache::{
    BrainMemoryCacheStore, DeltaSyncCoordinator, HttpUpstreamFetcher, KvBackend, MemoryBackend,
    RedisBackend, ResultCache, TypedEntityCache,
};
use brain_memory_engine::MemoryEngine;
use brain_memory_schemas::{
    AdmitRequest, ContactRecord, DataType, RefreshRequest, SyncedPayload, TouchRequest, UserId,
};
use brain_memory_service::{Config, HealthMonitor};

#[derive(Clone)]
struct AppState {
    engine: Arc<MemoryEngine>,
    store: Arc<Mutex<BrainMemoryCacheStore>>,
    sync: Arc<DeltaSyncCoordinator>,
    entities: TypedEntityCache,
    monitor: Arc<HealthMonitor>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Brain Memory Service v0.1.0");

    let config = Config::from_env();

    let store = Arc::new(Mutex::new(BrainMemoryCacheStore::new(&config.db_path)?));

    // Redis is optional: without it (or when it refuses the connection) the
    // result cache runs on the in-process backend and the service stays up.
    let backend: Arc<dyn KvBackend> = match &config.redis_url {
        Some(url) => match RedisBackend::connect(url).await {
            Ok(redis) => {
                info!("Result cache backed by Redis at {}", url);
                Arc::new(redis)
            }
            Err(e) => {
                warn!("Redis unavailable ({}), using in-process result cache", e);
                Arc::new(MemoryBackend::new())
            }
        },
        None => {
            info!("REDIS_URL not set, using in-process result cache");
            Arc::new(MemoryBackend::new())
        }
    };
    let result_cache = ResultCache::new(backend);

    let state = AppState {
        engine: Arc::new(MemoryEngine::new()),
        sync: Arc::new(DeltaSyncCoordinator::new(
            Arc::clone(&store),
            Arc::new(HttpUpstreamFetcher::new(config.upstream_url.clone())),
        )),
        entities: TypedEntityCache::new(result_cache.clone()),
        monitor: Arc::new(HealthMonitor::new(Arc::clone(&store), result_cache)),
        store,
    };

    // Timer-triggered consolidation; the same sweep is reachable on demand
    // through POST /consolidate.
    let sweeper = Arc::clone(&state.engine);
    let sweep_interval = config.sweep_interval_secs;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(sweep_interval));
        interval.tick().await;
        loop {
            interval.tick().await;
            sweeper.sweep(Utc::now());
        }
    });

    // CORS layer for channel adapters
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Build router
    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/consolidate", post(consolidate))
        .route("/stats", get(cache_stats))
        .route("/admit", post(admit))
        .route("/touch", post(touch))
        .route("/refresh", post(refresh))
        .route("/cache/:user_id", delete(reset_cache))
        .route("/entity/contact/:name", get(resolve_contact))
        .layer(cors)
        .with_state(state);

    let http_addr = format!("127.0.0.1:{}", config.port);
    info!("Starting HTTP server on http://{}", http_addr);

    let listener = tokio::net::TcpListener::bind(&http_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[derive(Deserialize)]
struct UserParams {
    user_id: String,
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.monitor.health().await;
    let code = match report.status {
        "down" => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (code, Json(report.body()))
}

async fn metrics(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let now = Utc::now();
    let cache_entries = {
        let store = state.store.lock().await;
        store
            .entry_count()
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
    };

    Ok(Json(json!({
        "working_memory_size": state.engine.working_memory_size(),
        "active_concepts": state.engine.active_concept_total(now),
        "consolidation_queue_depth": state.engine.queue_depth(),
        "cache_entries": cache_entries,
    })))
}

async fn consolidate(State(state): State<AppState>) -> impl IntoResponse {
    let report = state.engine.sweep(Utc::now());
    Json(json!({
        "fresh_to_consolidating": report.fresh_to_consolidating,
        "consolidating_to_consolidated": report.consolidating_to_consolidated,
        "consolidated_to_archived": report.consolidated_to_archived,
        "errors": report.errors,
        "states": state.engine.state_counts(),
    }))
}

async fn cache_stats(
    State(state): State<AppState>,
    Query(params): Query<UserParams>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let user_id = UserId(params.user_id);
    let stats = {
        let store = state.store.lock().await;
        store
            .stats(&user_id)
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
    };
    Ok(Json(stats))
}

async fn admit(
    State(state): State<AppState>,
    Json(request): Json<AdmitRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    info!(
        "Admit: user={} channel={} concepts={}",
        request.user_id,
        request.channel,
        request.concepts.len()
    );

    let context = state.engine.admit(request, Utc::now()).map_err(|e| {
        error!("Failed to admit message: {}", e);
        (StatusCode::BAD_REQUEST, e.to_string())
    })?;

    Ok(Json(context))
}

async fn touch(
    State(state): State<AppState>,
    Json(request): Json<TouchRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let updated = state.engine.working.touch(
        &request.user_id,
        &request.message_id,
        request.modified_at,
    );
    if !updated {
        return Err((
            StatusCode::NOT_FOUND,
            format!("{} is not in working memory", request.message_id),
        ));
    }
    Ok(Json(json!({ "updated": true })))
}

async fn refresh(
    State(state): State<AppState>,
    Json(request): Json<RefreshRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let response = state
        .sync
        .refresh(&request.user_id, &request.data_type)
        .await
        .map_err(|e| {
            error!("Refresh failed for {}: {}", request.data_type, e);
            (StatusCode::BAD_GATEWAY, e.to_string())
        })?;

    // Built-in data types are shaped into their record schema at the
    // boundary; custom types pass through opaque.
    let data = match SyncedPayload::shape(&request.data_type, response.data.clone()) {
        Some(payload) => json!(payload),
        None => response.data,
    };

    Ok(Json(json!({
        "data_type": request.data_type.as_str(),
        "outcome": response.outcome.as_str(),
        "stale": response.stale,
        "data": data,
    })))
}

async fn reset_cache(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let user_id = UserId(user_id);
    let removed = {
        let store = state.store.lock().await;
        store
            .delete_user(&user_id)
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
    };
    info!("Cache reset for {}: {} entries removed", user_id, removed);
    Ok(Json(json!({ "removed": removed })))
}

async fn resolve_contact(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<UserParams>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let user_id = UserId(params.user_id);
    let lookup = format!("{}:{}", user_id, name);

    if let Some(contact) = state.entities.lookup::<ContactRecord>("contact", &lookup).await {
        return Ok(Json(contact));
    }

    // Cold path: resolve against the synced contacts row.
    let entry = {
        let store = state.store.lock().await;
        store
            .get(
                &user_id,
                &DataType::Contacts,
                DataType::Contacts.as_str(),
                false,
                Utc::now(),
            )
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
    };

    let contact = entry
        .and_then(|e| SyncedPayload::shape(&DataType::Contacts, e.cache_data))
        .and_then(|payload| match payload {
            SyncedPayload::Contacts(contacts) => contacts
                .into_iter()
                .find(|c| c.name.eq_ignore_ascii_case(name.trim())),
            _ => None,
        })
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("no contact named {}", name)))?;

    state.entities.store("contact", &lookup, &contact).await;
    Ok(Json(contact))
}
