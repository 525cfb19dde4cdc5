//! HTTP route handlers.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, Sse},
        Json,
    },
    routing::{get, post},
    Router,
};
use futures::stream::Stream;
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::config::Config;
use crate::events::EventLog;
use crate::model::{AccountState, EventCategory, EventSeverity, Platform};
use crate::scheduler::{Scheduler, SchedulerError};
use crate::store::{EventFilter, Store, StoreError};

/// How often the SSE tail polls the event table.
const STREAM_POLL: std::time::Duration = std::time::Duration::from_secs(2);

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub store: Store,
    pub events: EventLog,
    pub scheduler: Arc<Scheduler>,
}

type ApiError = (StatusCode, String);

fn internal(e: StoreError) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

fn bad_request(message: impl Into<String>) -> ApiError {
    (StatusCode::BAD_REQUEST, message.into())
}

/// Build the router; separated from `serve` so tests can drive it directly.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/overview", get(overview))
        .route("/api/accounts", get(list_accounts))
        .route("/api/devices", get(list_devices))
        .route("/api/events", get(list_events))
        .route("/api/events/unresolved", get(unresolved_events))
        .route("/api/events/:id/resolve", post(resolve_event))
        .route("/api/logs/stream", get(stream_logs))
        .route("/api/scheduler/start", post(scheduler_start))
        .route("/api/scheduler/stop", post(scheduler_stop))
        .route("/api/scheduler/status", get(scheduler_status))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server and block until shutdown.
pub async fn serve(state: Arc<AppState>) -> anyhow::Result<()> {
    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("dashboard API listening on {}", addr);

    let scheduler = Arc::clone(&state.scheduler);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            if let Err(e) = scheduler.stop().await {
                tracing::debug!(error = %e, "scheduler was not running at shutdown");
            }
        })
        .await?;
    Ok(())
}

// ── Overview ─────────────────────────────────────────────────────────────────

async fn overview(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let devices = state.store.list_devices().await.map_err(internal)?;
    let active_devices = devices
        .iter()
        .filter(|d| d.status == crate::model::DeviceStatus::Active)
        .count();
    let state_counts = state.store.account_state_counts().await.map_err(internal)?;
    let recent = state
        .store
        .query_events(EventFilter {
            limit: Some(10),
            ..EventFilter::default()
        })
        .await
        .map_err(internal)?;
    let unresolved = state.store.unresolved_events(Some(1000)).await.map_err(internal)?;

    let accounts_total: i64 = state_counts.iter().map(|(_, n)| n).sum();
    let states: serde_json::Map<String, serde_json::Value> = state_counts
        .into_iter()
        .map(|(s, n)| (s.as_str().to_string(), serde_json::json!(n)))
        .collect();

    Ok(Json(serde_json::json!({
        "devices": {"total": devices.len(), "active": active_devices},
        "accounts": {"total": accounts_total, "by_state": states},
        "unresolved_events": unresolved.len(),
        "recent_events": recent,
        "scheduler": state.scheduler.status().await,
    })))
}

// ── Accounts / devices ───────────────────────────────────────────────────────

#[derive(Deserialize)]
struct AccountsQuery {
    platform: Option<String>,
    state: Option<String>,
    niche_id: Option<Uuid>,
}

async fn list_accounts(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AccountsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let platform = query
        .platform
        .as_deref()
        .map(|raw| Platform::parse(raw).ok_or_else(|| bad_request(format!("unknown platform {:?}", raw))))
        .transpose()?;
    let account_state = query
        .state
        .as_deref()
        .map(|raw| {
            AccountState::parse(raw).ok_or_else(|| bad_request(format!("unknown state {:?}", raw)))
        })
        .transpose()?;

    let accounts = state
        .store
        .list_accounts(platform, account_state, query.niche_id)
        .await
        .map_err(internal)?;
    Ok(Json(serde_json::json!({"accounts": accounts})))
}

async fn list_devices(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let devices = state.store.list_devices().await.map_err(internal)?;
    Ok(Json(serde_json::json!({"devices": devices})))
}

// ── Events ───────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct EventsQuery {
    severity: Option<String>,
    category: Option<String>,
    event_type: Option<String>,
    device_id: Option<Uuid>,
    account_id: Option<Uuid>,
    resolved: Option<bool>,
    after_id: Option<i64>,
    limit: Option<usize>,
}

async fn list_events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let severity = query
        .severity
        .as_deref()
        .map(|raw| {
            EventSeverity::parse(raw)
                .ok_or_else(|| bad_request(format!("unknown severity {:?}", raw)))
        })
        .transpose()?;
    let category = query
        .category
        .as_deref()
        .map(|raw| {
            EventCategory::parse(raw)
                .ok_or_else(|| bad_request(format!("unknown category {:?}", raw)))
        })
        .transpose()?;

    let events = state
        .store
        .query_events(EventFilter {
            severity,
            category,
            event_type: query.event_type,
            device_id: query.device_id,
            account_id: query.account_id,
            resolved: query.resolved,
            after_id: query.after_id,
            limit: query.limit,
        })
        .await
        .map_err(internal)?;
    Ok(Json(serde_json::json!({"events": events})))
}

async fn unresolved_events(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let events = state.store.unresolved_events(None).await.map_err(internal)?;
    Ok(Json(serde_json::json!({"events": events})))
}

#[derive(Deserialize, Default)]
struct ResolveBody {
    resolved_by: Option<String>,
}

async fn resolve_event(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    body: Option<Json<ResolveBody>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let resolved_by = body
        .and_then(|Json(b)| b.resolved_by)
        .unwrap_or_else(|| "dashboard".to_string());
    let updated = state
        .store
        .resolve_event(id, &resolved_by)
        .await
        .map_err(internal)?;
    if !updated {
        return Err((
            StatusCode::NOT_FOUND,
            format!("event {} not found or already resolved", id),
        ));
    }
    Ok(Json(serde_json::json!({"ok": true, "id": id})))
}

/// Live tail: poll the event table every 2 s, emit each new row as one
/// `data:` frame.
async fn stream_logs(
    State(state): State<Arc<AppState>>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let mut last_id = state.store.latest_event_id().await.map_err(internal)?;
    let store = state.store.clone();

    let stream = async_stream::stream! {
        let mut poll = tokio::time::interval(STREAM_POLL);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            poll.tick().await;
            match store.events_after(last_id, 1000).await {
                Ok(rows) => {
                    for row in rows {
                        last_id = last_id.max(row.id);
                        match Event::default().json_data(&row) {
                            Ok(frame) => yield Ok(frame),
                            Err(e) => {
                                tracing::error!(error = %e, "event row failed to serialize for SSE");
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "event poll failed; stream continues");
                }
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(
        axum::response::sse::KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("keepalive"),
    ))
}

// ── Scheduler control ────────────────────────────────────────────────────────

async fn scheduler_start(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match state.scheduler.start().await {
        Ok(workers) => Ok(Json(serde_json::json!({"ok": true, "workers": workers}))),
        Err(SchedulerError::AlreadyRunning) => {
            Err((StatusCode::CONFLICT, "scheduler already running".into()))
        }
        Err(e) => Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}

async fn scheduler_stop(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match state.scheduler.stop().await {
        Ok(()) => Ok(Json(serde_json::json!({"ok": true}))),
        Err(SchedulerError::NotRunning) => {
            Err((StatusCode::CONFLICT, "scheduler is not running".into()))
        }
        Err(e) => Err((StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
    }
}

async fn scheduler_status(
    State(state): State<Arc<AppState>>,
) -> Json<crate::scheduler::SchedulerStatus> {
    Json(state.scheduler.status().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Codec;

    fn test_state() -> Arc<AppState> {
        let store = Store::open_in_memory().unwrap();
        let events = EventLog::new(store.clone());
        let config = Config::for_tests(std::path::PathBuf::from(":memory:"));
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            events.clone(),
            Codec::new([0u8; 32]),
            config.clone(),
        ));
        Arc::new(AppState {
            config,
            store,
            events,
            scheduler,
        })
    }

    #[tokio::test]
    async fn overview_reports_empty_fleet() {
        let state = test_state();
        let Json(body) = overview(State(state)).await.unwrap();
        assert_eq!(body["devices"]["total"], 0);
        assert_eq!(body["accounts"]["total"], 0);
        assert_eq!(body["scheduler"]["running"], false);
    }

    #[tokio::test]
    async fn bad_platform_filter_is_rejected() {
        let state = test_state();
        let err = list_accounts(
            State(state),
            Query(AccountsQuery {
                platform: Some("myspace".into()),
                state: None,
                niche_id: None,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.0, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn resolve_unknown_event_is_404() {
        let state = test_state();
        let err = resolve_event(State(state), Path(999), None).await.unwrap_err();
        assert_eq!(err.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn scheduler_endpoints_round_trip() {
        let state = test_state();
        let Json(body) = scheduler_start(State(Arc::clone(&state))).await.unwrap();
        assert_eq!(body["ok"], true);

        let err = scheduler_start(State(Arc::clone(&state))).await.unwrap_err();
        assert_eq!(err.0, StatusCode::CONFLICT);

        let Json(status) = scheduler_status(State(Arc::clone(&state))).await;
        assert!(status.running);

        let Json(body) = scheduler_stop(State(state)).await.unwrap();
        assert_eq!(body["ok"], true);
    }
}
