//! REST API of the ingest server
//!
//! - `POST /api/agent`          one forwarded result (`AgentRequest`)
//! - `GET  /events`             latest event per (hostname, source), optional `?status=`
//! - `GET  /events/{hostname}`  same, one host
//! - `GET  /health`             ingest counters, never behind the token
//!
//! When a token is configured every route but `/health` requires it in the
//! `x-api-key` or `AUTH` header.

use crate::health::{HealthTracker, ServerHealth};
use crate::models::{EventsMap, HostEvent};
use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{Duration, Utc};
use hostwatch_agent::collector::ResultQueue;
use hostwatch_agent::forwarder::{AgentRequest, API_KEY_HEADER};
use hostwatch_agent::plugin::Status;
use hostwatch_agent::state::Shared;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

const AUTH_HEADER: &str = "auth";

#[derive(Clone)]
pub struct AppState {
    pub events: Shared<EventsMap>,
    pub queue: ResultQueue,
    pub token: Option<String>,
    pub stale_after: Duration,
    pub health: HealthTracker,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EventView {
    #[serde(flatten)]
    pub event: HostEvent,
    pub stale: bool,
    pub age_seconds: i64,
}

fn to_view(event: &HostEvent, stale_after: Duration) -> EventView {
    let age = Utc::now() - event.received_at;
    EventView {
        event: event.clone(),
        stale: age > stale_after,
        age_seconds: age.num_seconds().max(0),
    }
}

#[derive(Debug, Default, Deserialize)]
struct EventFilter {
    status: Option<Status>,
}

pub fn is_authorized(headers: &HeaderMap, expected: &str) -> bool {
    [API_KEY_HEADER, AUTH_HEADER]
        .iter()
        .filter_map(|name| headers.get(*name))
        .filter_map(|value| value.to_str().ok())
        .any(|value| value == expected)
}

async fn require_api_key(
    State(app): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    if req.uri().path().starts_with("/health") {
        return Ok(next.run(req).await);
    }
    let Some(expected) = app.token.as_deref() else {
        return Ok(next.run(req).await);
    };
    if !is_authorized(req.headers(), expected) {
        app.health.mark_rejected();
        warn!(path = %req.uri().path(), "request without valid api key");
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/api/agent", post(ingest))
        .route("/events", get(list_events))
        .route("/events/{hostname}", get(host_events))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_api_key))
        .with_state(app_state)
}

// GET /health
async fn get_health(State(app): State<AppState>) -> Json<ServerHealth> {
    Json(app.health.get_health(&app.events))
}

// POST /api/agent
async fn ingest(
    State(app): State<AppState>,
    Json(request): Json<AgentRequest>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let event = HostEvent::from_request(&request, Utc::now());
    debug!(
        host = %event.hostname,
        task = %event.source,
        status = %event.status,
        "result received"
    );
    app.events.lock().insert(event.key(), event);

    if !app.queue.push(request.into_result()) {
        app.health.mark_rejected();
        error!("collector is gone, result dropped");
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    app.health.mark_accepted();
    Ok(Json(serde_json::json!({ "ok": true })))
}

// GET /events
async fn list_events(
    State(app): State<AppState>,
    Query(filter): Query<EventFilter>,
) -> Json<Vec<EventView>> {
    let events = app.events.lock();
    let list = events
        .values()
        .filter(|event| filter.status.map_or(true, |status| event.status == status))
        .map(|event| to_view(event, app.stale_after))
        .collect();
    Json(list)
}

// GET /events/{hostname}
async fn host_events(
    State(app): State<AppState>,
    Path(hostname): Path<String>,
) -> Result<Json<Vec<EventView>>, StatusCode> {
    let events = app.events.lock();
    let list: Vec<EventView> = events
        .values()
        .filter(|event| event.hostname == hostname)
        .map(|event| to_view(event, app.stale_after))
        .collect();
    if list.is_empty() {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(Json(list))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Method, Request as HttpRequest};
    use hostwatch_agent::collector::result_queue;
    use hostwatch_agent::plugin::ServerData;
    use hostwatch_agent::result::{SchedulerInfo, TaskResult};
    use hostwatch_agent::state::new_state;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tower::ServiceExt;

    fn state(token: Option<&str>) -> (AppState, UnboundedReceiver<TaskResult>) {
        let (queue, rx) = result_queue();
        let state = AppState {
            events: new_state(EventsMap::new()),
            queue,
            token: token.map(str::to_string),
            stale_after: Duration::seconds(600),
            health: HealthTracker::new(),
        };
        (state, rx)
    }

    fn body(host: &str, source: &str, status: Status, message: &str) -> Body {
        let result = TaskResult {
            plugin: source.into(),
            module: "serverloads".into(),
            group: "*".into(),
            priority: false,
            status,
            message: message.into(),
            details: ServerData::None,
            hits: 1,
            hits_reached: true,
            produced_at: Utc::now(),
            context: SchedulerInfo::starting(),
        };
        let request = AgentRequest::from_result(&result, host);
        Body::from(serde_json::to_vec(&request).unwrap())
    }

    fn post(body: Body, key: Option<(&str, &str)>) -> Request {
        let mut builder = HttpRequest::builder()
            .method(Method::POST)
            .uri("/api/agent")
            .header(header::CONTENT_TYPE, "application/json");
        if let Some((name, value)) = key {
            builder = builder.header(name, value);
        }
        builder.body(body).unwrap()
    }

    fn get(uri: &str) -> Request {
        HttpRequest::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_is_authorized() {
        let mut headers = HeaderMap::new();
        assert!(!is_authorized(&headers, "secret"));
        headers.insert("auth", "secret".parse().unwrap());
        assert!(is_authorized(&headers, "secret"));
        assert!(!is_authorized(&headers, "other"));
    }

    #[tokio::test]
    async fn test_ingest_requires_token() {
        let (state, mut rx) = state(Some("secret"));
        let app = build_router(state.clone());

        let denied = app
            .clone()
            .oneshot(post(body("web-01", "loads", Status::Failed, "cpu"), None))
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);
        assert!(rx.try_recv().is_err());

        let accepted = app
            .oneshot(post(
                body("web-01", "loads", Status::Failed, "cpu"),
                Some((API_KEY_HEADER, "secret")),
            ))
            .await
            .unwrap();
        assert_eq!(accepted.status(), StatusCode::OK);

        let result = rx.try_recv().unwrap();
        assert_eq!(result.plugin, "loads");
        assert_eq!(result.status, Status::Failed);
        assert!(result.hits_reached);

        let health = state.health.get_health(&state.events);
        assert_eq!((health.accepted, health.rejected), (1, 1));
    }

    #[tokio::test]
    async fn test_health_is_open() {
        let (state, _rx) = state(Some("secret"));
        let response = build_router(state).oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await["events_tracked"], 0);
    }

    #[tokio::test]
    async fn test_keeps_latest_event_per_host_and_source() {
        let (state, _rx) = state(None);
        let app = build_router(state);

        for (host, source, status, message) in [
            ("web-01", "loads", Status::Failed, "first"),
            ("web-01", "loads", Status::Ok, "second"),
            ("web-01", "disk", Status::Ok, "fine"),
            ("db-01", "loads", Status::Warning, "busy"),
        ] {
            let response = app
                .clone()
                .oneshot(post(body(host, source, status, message), None))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let all = json(app.clone().oneshot(get("/events")).await.unwrap()).await;
        assert_eq!(all.as_array().unwrap().len(), 3);

        let web = json(app.clone().oneshot(get("/events/web-01")).await.unwrap()).await;
        let loads = web
            .as_array()
            .unwrap()
            .iter()
            .find(|e| e["source"] == "loads")
            .unwrap();
        assert_eq!(loads["message"], "second");
        assert_eq!(loads["stale"], false);

        let warnings = json(app.clone().oneshot(get("/events?status=WARNING")).await.unwrap()).await;
        assert_eq!(warnings.as_array().unwrap().len(), 1);
        assert_eq!(warnings[0]["hostname"], "db-01");

        let missing = app.oneshot(get("/events/nope")).await.unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unavailable_when_collector_is_gone() {
        let (state, rx) = state(None);
        drop(rx);
        let response = build_router(state)
            .oneshot(post(body("web-01", "loads", Status::Ok, "ok"), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
