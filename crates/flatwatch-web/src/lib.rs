//! Axum JSON API for the filter UI and the liveness checker.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use flatwatch_core::{ActiveState, ListingId, Location, SubscriberFilter};
use flatwatch_storage::{Store, StoreError};
use flatwatch_sync::{SourceRegistry, SyncConfig, SyncPipeline};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "flatwatch-web";

const MAX_EXTEND_DAYS: u32 = 3650;
const MAX_LIVENESS_BATCH: u32 = 1000;

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub workspace_root: PathBuf,
}

impl AppState {
    pub fn new(store: Store, workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            store,
            workspace_root: workspace_root.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ExtendRequest {
    days: u32,
}

#[derive(Debug, Deserialize)]
struct SearchingRequest {
    searching: bool,
}

#[derive(Debug, Deserialize)]
struct ActiveRequest {
    state: ActiveState,
    #[serde(default)]
    checked_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct LivenessQuery {
    #[serde(default)]
    state: Option<ActiveState>,
    #[serde(default)]
    after: Option<String>,
    #[serde(default)]
    limit: Option<u32>,
}

#[derive(Debug, Serialize)]
struct SourceRow {
    source: String,
    display_name: &'static str,
    enabled: bool,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/api/sources", get(sources_handler))
        .route(
            "/api/subscribers/{user_id}",
            get(get_subscriber_handler).put(put_subscriber_handler),
        )
        .route("/api/subscribers/{user_id}/register", post(register_handler))
        .route("/api/subscribers/{user_id}/extend", post(extend_handler))
        .route("/api/subscribers/{user_id}/searching", post(searching_handler))
        .route("/api/subscribers/{user_id}/deliveries", get(deliveries_handler))
        .route("/api/listings/liveness", get(liveness_handler))
        .route(
            "/api/listings/{id}",
            get(get_listing_handler).delete(delete_listing_handler),
        )
        .route("/api/listings/{id}/active", put(set_active_handler))
        .route("/api/passes/latest", get(latest_pass_handler))
        .with_state(Arc::new(state))
}

/// Serves the API; with `FLATWATCH_SCHEDULER_ENABLED` the sync schedule runs alongside.
pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("FLATWATCH_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let config = SyncConfig::from_env();

    let store = Store::connect(&config.database_url).await?;
    let _scheduler = if config.scheduler_enabled {
        let transport = config.build_transport()?;
        let pipeline = Arc::new(SyncPipeline::with_parts(config.clone(), store.clone(), transport).await?);
        let sched = pipeline.build_scheduler().await?;
        sched.start().await?;
        info!(cron = %config.sync_cron, "sync scheduler running alongside the api");
        Some(sched)
    } else {
        None
    };

    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, database_url = %config.database_url, "serving flatwatch api");
    axum::serve(listener, app(AppState::new(store, config.workspace_root.clone()))).await?;
    Ok(())
}

async fn healthz_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.ping().await {
        Ok(()) => Json(json!({ "status": "ok" })).into_response(),
        Err(err) => server_error(err),
    }
}

async fn sources_handler(State(state): State<Arc<AppState>>) -> Response {
    match SourceRegistry::load(state.workspace_root.join("sources.yaml")).await {
        Ok(registry) => {
            let rows = registry
                .sources
                .iter()
                .map(|cfg| SourceRow {
                    source: cfg.source.slug().to_string(),
                    display_name: cfg.source.display_name(),
                    enabled: cfg.enabled,
                })
                .collect::<Vec<_>>();
            Json(rows).into_response()
        }
        Err(err) => {
            error!(error = %format!("{err:#}"), "loading source registry");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))
        }
    }
}

async fn get_subscriber_handler(State(state): State<Arc<AppState>>, AxumPath(user_id): AxumPath<i64>) -> Response {
    match state.store.get_subscriber(user_id).await {
        Ok(Some(filter)) => Json(filter).into_response(),
        Ok(None) => not_found(format!("subscriber {user_id}")),
        Err(err) => server_error(err),
    }
}

async fn put_subscriber_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(user_id): AxumPath<i64>,
    Json(mut filter): Json<SubscriberFilter>,
) -> Response {
    filter.user_id = user_id;
    if let Err(reason) = validate_filter(&filter) {
        return api_error(StatusCode::UNPROCESSABLE_ENTITY, reason);
    }
    match state.store.upsert_subscriber(&filter).await {
        Ok(()) => Json(filter).into_response(),
        Err(err) => server_error(err),
    }
}

async fn register_handler(State(state): State<Arc<AppState>>, AxumPath(user_id): AxumPath<i64>) -> Response {
    match state.store.register_subscriber(user_id, Utc::now()).await {
        Ok((filter, true)) => (StatusCode::CREATED, Json(filter)).into_response(),
        Ok((filter, false)) => Json(filter).into_response(),
        Err(err) => server_error(err),
    }
}

async fn extend_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(user_id): AxumPath<i64>,
    Json(req): Json<ExtendRequest>,
) -> Response {
    if req.days == 0 || req.days > MAX_EXTEND_DAYS {
        return api_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("days must be between 1 and {MAX_EXTEND_DAYS}"),
        );
    }
    match state.store.extend_subscription(user_id, req.days, Utc::now()).await {
        Ok(Some(until)) => Json(json!({ "user_id": user_id, "subscription_until": until })).into_response(),
        Ok(None) => not_found(format!("subscriber {user_id}")),
        Err(err) => server_error(err),
    }
}

async fn searching_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(user_id): AxumPath<i64>,
    Json(req): Json<SearchingRequest>,
) -> Response {
    let filter = match state.store.get_subscriber(user_id).await {
        Ok(Some(filter)) => filter,
        Ok(None) => return not_found(format!("subscriber {user_id}")),
        Err(err) => return server_error(err),
    };

    if req.searching {
        if !filter.location.is_matchable() {
            return api_error(StatusCode::UNPROCESSABLE_ENTITY, "set a search area before searching");
        }
        if filter.is_expired(Utc::now()) {
            return api_error(StatusCode::UNPROCESSABLE_ENTITY, "subscription expired");
        }
    }

    match state.store.set_searching(user_id, req.searching).await {
        Ok(_) => Json(json!({ "user_id": user_id, "is_searching": req.searching })).into_response(),
        Err(err) => server_error(err),
    }
}

async fn deliveries_handler(State(state): State<Arc<AppState>>, AxumPath(user_id): AxumPath<i64>) -> Response {
    match state.store.deliveries_for_user(user_id).await {
        Ok(records) => Json(records).into_response(),
        Err(err) => server_error(err),
    }
}

async fn get_listing_handler(State(state): State<Arc<AppState>>, AxumPath(id): AxumPath<String>) -> Response {
    let id = ListingId::from_raw(id);
    match state.store.get_listing(&id).await {
        Ok(Some(listing)) => Json(listing).into_response(),
        Ok(None) => not_found(format!("listing {id}")),
        Err(err) => server_error(err),
    }
}

async fn set_active_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
    Json(req): Json<ActiveRequest>,
) -> Response {
    let id = ListingId::from_raw(id);
    let checked_at = req.checked_at.unwrap_or_else(Utc::now);
    match state.store.set_active(&id, req.state, checked_at).await {
        Ok(true) => Json(json!({ "id": id, "is_active": req.state, "last_checked": checked_at })).into_response(),
        Ok(false) => not_found(format!("listing {id}")),
        Err(err) => server_error(err),
    }
}

async fn delete_listing_handler(State(state): State<Arc<AppState>>, AxumPath(id): AxumPath<String>) -> Response {
    let id = ListingId::from_raw(id);
    match state.store.remove_listing(&id).await {
        Ok(true) => {
            info!(listing_id = %id, "listing removed by liveness check");
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(false) => not_found(format!("listing {id}")),
        Err(err) => server_error(err),
    }
}

async fn liveness_handler(State(state): State<Arc<AppState>>, Query(query): Query<LivenessQuery>) -> Response {
    let after = query.after.filter(|a| !a.is_empty()).map(ListingId::from_raw);
    let limit = query.limit.unwrap_or(100).clamp(1, MAX_LIVENESS_BATCH);
    let listing_state = query.state.unwrap_or_default();
    match state.store.listings_for_liveness(listing_state, after.as_ref(), limit).await {
        Ok(listings) => {
            let next_after = listings.last().map(|l| l.id.clone());
            Json(json!({ "listings": listings, "next_after": next_after })).into_response()
        }
        Err(err) => server_error(err),
    }
}

async fn latest_pass_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.latest_pass().await {
        Ok(Some(pass)) => Json(pass).into_response(),
        Ok(None) => not_found("no pass recorded yet".to_string()),
        Err(err) => server_error(err),
    }
}

fn validate_filter(filter: &SubscriberFilter) -> Result<(), String> {
    match &filter.location {
        Location::Circle {
            center_lat,
            center_lon,
            radius_m,
        } => {
            Location::circle(*center_lat, *center_lon, *radius_m).map_err(|e| e.to_string())?;
        }
        Location::Polygon { vertices } => {
            Location::polygon(vertices.clone()).map_err(|e| e.to_string())?;
        }
        Location::Unset => {}
    }
    for (name, min, max) in [
        ("price", filter.min_price, filter.max_price),
        ("size", filter.min_size, filter.max_size),
    ] {
        if let (Some(min), Some(max)) = (min, max) {
            if min > max {
                return Err(format!("min_{name} {min} exceeds max_{name} {max}"));
            }
        }
    }
    Ok(())
}

fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn not_found(what: String) -> Response {
    api_error(StatusCode::NOT_FOUND, format!("{what} not found"))
}

fn server_error(err: StoreError) -> Response {
    error!(error = %err, "store failure while serving request");
    api_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}
