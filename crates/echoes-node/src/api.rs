//! HTTP API for the library.

use crate::epoch::ClosureOutcome;
use crate::error::{Error, SubmitError};
use crate::identity::{CallerContext, Identity};
use crate::library::{
    ClosedEpochView, EpochMap, EpochSummary, Library, LiveStats, SubmitReceipt, SystemState,
};
use crate::models::{Epoch, EpochAggregate, EpochId, LayerMoment, NarrativeDraft};
use crate::rate_limit::QuotaStatus;
use crate::ws::ws_events_handler;
use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

type AppState = Arc<Library>;

/// Build the API router.
pub fn build_router(library: Arc<Library>) -> Router {
    // CORS layer for browser access
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health (at root and under /api/v1 for compatibility)
        .route("/health", get(health))
        .route("/api/v1/health", get(health))
        .route("/ready", get(ready))
        // Submission
        .route("/api/v1/messages", post(submit_message))
        .route("/api/v1/remaining", get(remaining_quota))
        // Current epoch
        .route("/api/v1/state", get(system_state))
        .route("/api/v1/stats", get(live_stats))
        .route("/api/v1/message-map", get(message_map))
        .route("/api/v1/layer-moment", get(layer_moment))
        // Epoch archive
        .route("/api/v1/epochs", get(list_epochs))
        .route("/api/v1/closed-epoch", get(closed_epoch))
        .route("/api/v1/epochs/:id/narrative", post(supply_narrative))
        .route("/api/v1/epochs/:id/export", get(export_epoch))
        .route("/api/v1/epochs/:id/layer-moments", get(layer_moments))
        // WebSocket for live library events
        .route("/api/v1/ws/events", get(ws_events_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(library)
}

// --- Errors ---

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct ErrorDetail {
    kind: &'static str,
    detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    reset_in_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    blocked_until: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    requires_auth: Option<bool>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

/// JSON error response.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: ErrorDetail,
}

impl ApiError {
    fn new(status: StatusCode, kind: &'static str, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: ErrorDetail {
                kind,
                detail: detail.into(),
                reset_in_seconds: None,
                blocked_until: None,
                requires_auth: None,
            },
        }
    }

    fn not_found(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", detail)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ErrorBody { error: self.detail })).into_response()
    }
}

impl From<SubmitError> for ApiError {
    fn from(e: SubmitError) -> Self {
        let kind = e.kind();
        match e {
            SubmitError::Validation(rejection) => {
                Self::new(StatusCode::BAD_REQUEST, kind, rejection.to_string())
            }
            SubmitError::QuotaExceeded {
                reset_in_seconds,
                requires_auth,
            } => {
                let mut error = Self::new(StatusCode::TOO_MANY_REQUESTS, kind, e.to_string());
                error.detail.reset_in_seconds = Some(reset_in_seconds);
                error.detail.requires_auth = Some(requires_auth);
                error
            }
            SubmitError::AbuseBlocked { until } => {
                let mut error = Self::new(StatusCode::TOO_MANY_REQUESTS, kind, e.to_string());
                error.detail.blocked_until = Some(until);
                error
            }
            SubmitError::EpochTransition { .. } => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, kind, e.to_string())
            }
            SubmitError::NoActiveEpoch => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, kind, e.to_string())
            }
            SubmitError::Store(_) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                kind,
                "storage failure, the outcome is uncertain; check state before resubmitting",
            ),
        }
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        match e {
            Error::NotFound(what) => Self::not_found(what),
            Error::InvalidInput(detail) => Self::new(StatusCode::BAD_REQUEST, "invalid_input", detail),
            other => {
                tracing::error!("Request failed: {}", other);
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", other.to_string())
            }
        }
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// --- Callers ---

/// Best-known client address. Proxy headers are only consulted when the
/// node sits behind a trusted proxy; otherwise the socket peer is used.
fn client_address(headers: &HeaderMap, peer: Option<SocketAddr>, trust_proxy: bool) -> String {
    let peer = || {
        peer.map(|addr| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string())
    };
    if !trust_proxy {
        return peer();
    }

    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    };

    if let Some(forwarded) = header_value("x-forwarded-for") {
        if let Some(first) = forwarded.split(',').map(str::trim).find(|v| !v.is_empty()) {
            return first.to_string();
        }
    }
    header_value("x-real-ip")
        .or_else(|| header_value("cf-connecting-ip"))
        .map(str::to_string)
        .unwrap_or_else(peer)
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer "))?;
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}

fn caller_context(
    library: &Library,
    headers: &HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
) -> CallerContext {
    CallerContext {
        bearer_token: bearer_token(headers),
        address: client_address(
            headers,
            peer.map(|ConnectInfo(addr)| addr),
            library.trusts_proxy_headers(),
        ),
    }
}

fn require_admin(library: &Library, caller: &CallerContext) -> Result<Identity, ApiError> {
    let identity = library.resolve_identity(caller);
    if identity.is_privileged {
        Ok(identity)
    } else if identity.is_authenticated {
        Err(ApiError::new(StatusCode::FORBIDDEN, "forbidden", "admin access required"))
    } else {
        Err(ApiError::new(StatusCode::UNAUTHORIZED, "unauthorized", "session token required"))
    }
}

// --- Health endpoints ---

async fn health() -> &'static str {
    "OK"
}

async fn ready(State(library): State<AppState>) -> Result<&'static str, ApiError> {
    library.system_state()?;
    Ok("OK")
}

// --- Submission endpoints ---

#[derive(Debug, Deserialize)]
struct SubmitRequest {
    text: String,
}

async fn submit_message(
    State(library): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(req): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<SubmitReceipt>), ApiError> {
    let caller = caller_context(&library, &headers, peer);
    let receipt = library.submit_message(&req.text, &caller).await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

async fn remaining_quota(
    State(library): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> ApiResult<QuotaStatus> {
    let caller = caller_context(&library, &headers, peer);
    Ok(Json(library.remaining_quota(&caller)?))
}

// --- Epoch endpoints ---

async fn system_state(State(library): State<AppState>) -> ApiResult<SystemState> {
    Ok(Json(library.system_state()?))
}

async fn live_stats(State(library): State<AppState>) -> ApiResult<LiveStats> {
    Ok(Json(library.live_stats()?))
}

async fn message_map(State(library): State<AppState>) -> ApiResult<Vec<EpochMap>> {
    Ok(Json(library.message_map().await?))
}

async fn layer_moment(State(library): State<AppState>) -> ApiResult<LayerMoment> {
    match library.layer_moment().await? {
        Some(moment) => Ok(Json(moment)),
        None => Err(ApiError::not_found("the current epoch has no messages yet")),
    }
}

async fn list_epochs(State(library): State<AppState>) -> ApiResult<Vec<EpochSummary>> {
    Ok(Json(library.epochs()?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClosedEpochQuery {
    epoch_id: Option<EpochId>,
}

async fn closed_epoch(
    State(library): State<AppState>,
    Query(query): Query<ClosedEpochQuery>,
) -> ApiResult<ClosedEpochView> {
    match library.closed_epoch_narrative(query.epoch_id)? {
        Some(view) => Ok(Json(view)),
        None => Err(ApiError::not_found("no closed epoch")),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ClosureResponse {
    closed: Epoch,
    successor: Epoch,
}

async fn supply_narrative(
    State(library): State<AppState>,
    Path(id): Path<EpochId>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(draft): Json<NarrativeDraft>,
) -> ApiResult<ClosureResponse> {
    let admin = require_admin(&library, &caller_context(&library, &headers, peer))?;
    let by = admin.public_key.unwrap_or(admin.identifier);

    match library.supply_manual_narrative(id, draft, &by).await? {
        ClosureOutcome::Closed { closed, successor } => Ok(Json(ClosureResponse { closed, successor })),
        ClosureOutcome::InProgress => Err(ApiError::new(
            StatusCode::CONFLICT,
            "closure_in_progress",
            "the epoch is already being closed",
        )),
        ClosureOutcome::AlreadyClosed => Err(ApiError::new(
            StatusCode::CONFLICT,
            "already_closed",
            "the epoch is already closed",
        )),
        ClosureOutcome::BelowThreshold { .. } | ClosureOutcome::NotFound => {
            Err(ApiError::not_found(Epoch::name_for(id)))
        }
    }
}

async fn export_epoch(
    State(library): State<AppState>,
    Path(id): Path<EpochId>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> ApiResult<EpochAggregate> {
    require_admin(&library, &caller_context(&library, &headers, peer))?;
    Ok(Json(library.export_epoch(id).await?))
}

async fn layer_moments(
    State(library): State<AppState>,
    Path(id): Path<EpochId>,
) -> ApiResult<Vec<LayerMoment>> {
    Ok(Json(library.layer_moments(id)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::text::Rejection;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn address_prefers_forwarded_for() {
        let peer: SocketAddr = "192.0.2.1:4000".parse().unwrap();
        let map = headers(&[
            ("x-forwarded-for", "203.0.113.7, 10.0.0.1"),
            ("x-real-ip", "198.51.100.2"),
        ]);
        assert_eq!(client_address(&map, Some(peer), true), "203.0.113.7");
        assert_eq!(
            client_address(&headers(&[("cf-connecting-ip", "198.51.100.9")]), Some(peer), true),
            "198.51.100.9"
        );
        assert_eq!(client_address(&HeaderMap::new(), Some(peer), true), "192.0.2.1");
        assert_eq!(client_address(&HeaderMap::new(), None, true), "unknown");
    }

    #[test]
    fn untrusted_proxy_headers_are_ignored() {
        let peer: SocketAddr = "192.0.2.1:4000".parse().unwrap();
        // rotating the header must not mint a fresh anonymous identity
        for forged in ["203.0.113.7", "203.0.113.8"] {
            let mut map = headers(&[("x-real-ip", "198.51.100.2")]);
            map.insert("x-forwarded-for", HeaderValue::from_static(forged));
            assert_eq!(client_address(&map, Some(peer), false), "192.0.2.1");
        }
        assert_eq!(client_address(&HeaderMap::new(), None, false), "unknown");
    }

    #[test]
    fn bearer_token_is_extracted() {
        assert_eq!(
            bearer_token(&headers(&[("authorization", "Bearer abc.1.def")])),
            Some("abc.1.def".to_string())
        );
        assert_eq!(bearer_token(&headers(&[("authorization", "Basic xyz")])), None);
        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }

    #[test]
    fn submit_errors_map_to_statuses() {
        let cases: Vec<(SubmitError, StatusCode)> = vec![
            (SubmitError::Validation(Rejection::Empty), StatusCode::BAD_REQUEST),
            (
                SubmitError::QuotaExceeded {
                    reset_in_seconds: 60,
                    requires_auth: true,
                },
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (
                SubmitError::AbuseBlocked { until: Utc::now() },
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (
                SubmitError::EpochTransition {
                    epoch_name: "Age 1".into(),
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (SubmitError::NoActiveEpoch, StatusCode::INTERNAL_SERVER_ERROR),
            (
                SubmitError::Store(Error::Storage("disk".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (error, status) in cases {
            assert_eq!(ApiError::from(error).status, status);
        }
    }

    #[test]
    fn quota_error_carries_hints() {
        let error = ApiError::from(SubmitError::QuotaExceeded {
            reset_in_seconds: 90,
            requires_auth: true,
        });
        let json = serde_json::to_value(ErrorBody { error: error.detail }).unwrap();
        assert_eq!(json["error"]["kind"], "quota_exceeded");
        assert_eq!(json["error"]["resetInSeconds"], 90);
        assert_eq!(json["error"]["requiresAuth"], true);
        assert!(json["error"].get("blockedUntil").is_none());
    }
}
