//! Axum REST API handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::backend::ContributionBackend;
use crate::errors::SettlementError;
use crate::gate;
use crate::reconcile::{Dashboard, FundraiserView, RefreshSummary, Trigger};
use crate::review::ReviewQuery;
use crate::session::{Session, SessionStatus};
use crate::submission::{self, SubmissionForm};
use crate::types::{Contribution, Notice};

#[derive(Clone)]
pub struct ApiState {
    pub dashboard: Arc<Dashboard>,
    pub session: Arc<Session>,
    pub backend: Arc<dyn ContributionBackend>,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/fundraisers", get(list_fundraisers))
        .route("/fundraisers/refresh", post(refresh))
        .route("/fundraisers/reload", post(reload))
        .route("/contributions", get(list_contributions).post(submit_contribution))
        .route("/contributions/:id/final-verification", post(verify_contribution))
        .route("/session", get(session_status).put(login).delete(logout))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─────────────────────────────────────────────────────────
// Response shapes
// ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FundraisersResponse {
    pub count: usize,
    pub refreshing: bool,
    pub last_refresh: Option<RefreshSummary>,
    pub fundraisers: Vec<FundraiserView>,
}

#[derive(Serialize)]
pub struct ReloadResponse {
    pub loaded: usize,
    pub summary: RefreshSummary,
}

#[derive(Serialize)]
pub struct SubmissionResponse {
    pub contribution: Contribution,
    pub notice: Notice,
}

#[derive(Serialize)]
pub struct SessionResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub notice: Notice,
}

#[derive(Deserialize)]
pub struct VerifyRequest {
    pub notes: Option<String>,
}

#[derive(Deserialize)]
pub struct LoginRequest {
    pub token: String,
}

pub fn status_for(e: &SettlementError) -> StatusCode {
    match e {
        SettlementError::Validation(_) => StatusCode::BAD_REQUEST,
        SettlementError::Authorization(_) => StatusCode::FORBIDDEN,
        SettlementError::Authentication(_) => StatusCode::UNAUTHORIZED,
        SettlementError::NotFound(_) => StatusCode::NOT_FOUND,
        SettlementError::AlreadyVerified(_) => StatusCode::CONFLICT,
        SettlementError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        SettlementError::Database(_) | SettlementError::Migrate(_) | SettlementError::Config(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        SettlementError::Backend { .. } | SettlementError::Http(_) | SettlementError::Json(_) => {
            StatusCode::BAD_GATEWAY
        }
    }
}

fn failure(status: StatusCode, error: String, notice: Notice) -> Response {
    (status, Json(ErrorResponse { error, notice })).into_response()
}

fn error_response(e: SettlementError) -> Response {
    let notice = if e.requires_login() {
        Notice::Failure("Your session has expired. Please log in again.".to_string())
    } else {
        Notice::Failure(e.to_string())
    };
    failure(status_for(&e), e.to_string(), notice)
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `GET /fundraisers`
///
/// The dashboard as currently displayed; never triggers a refresh.
pub async fn list_fundraisers(State(state): State<Arc<ApiState>>) -> Response {
    let fundraisers = state.dashboard.views().await;
    Json(FundraisersResponse {
        count: fundraisers.len(),
        refreshing: state.dashboard.is_refreshing(),
        last_refresh: state.dashboard.last_summary().await,
        fundraisers,
    })
    .into_response()
}

/// `POST /fundraisers/refresh`
pub async fn refresh(State(state): State<Arc<ApiState>>) -> Response {
    match state.dashboard.refresh(Trigger::Manual).await {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => error_response(e),
    }
}

/// `POST /fundraisers/reload`
pub async fn reload(State(state): State<Arc<ApiState>>) -> Response {
    let loaded = match state.dashboard.reload_fundraisers().await {
        Ok(n) => n,
        Err(e) => return error_response(e),
    };
    match state.dashboard.refresh(Trigger::Manual).await {
        Ok(summary) => Json(ReloadResponse { loaded, summary }).into_response(),
        Err(e) => error_response(e),
    }
}

/// `GET /contributions?fundraiserId=&status=&search=`
pub async fn list_contributions(State(state): State<Arc<ApiState>>, Query(query): Query<ReviewQuery>) -> Response {
    match state.dashboard.review(&query).await {
        Ok(review) => Json(review).into_response(),
        Err(e) => error_response(e),
    }
}

/// `POST /contributions`
pub async fn submit_contribution(State(state): State<Arc<ApiState>>, Json(form): Json<SubmissionForm>) -> Response {
    let result = submission::submit(state.backend.as_ref(), &form).await;
    let notice = submission::notice_for(&result);
    match result {
        Ok(contribution) => (StatusCode::CREATED, Json(SubmissionResponse { contribution, notice })).into_response(),
        Err(e) => failure(status_for(&e), e.to_string(), notice),
    }
}

/// `POST /contributions/:id/final-verification`
///
/// Runs the gate, then reconciles the owning fundraiser.
pub async fn verify_contribution(
    State(state): State<Arc<ApiState>>,
    Path(contribution_id): Path<String>,
    body: Option<Json<VerifyRequest>>,
) -> Response {
    let notes = body.and_then(|Json(b)| b.notes);
    match state
        .dashboard
        .verify_contribution(&contribution_id, notes.as_deref())
        .await
    {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => {
            let status = status_for(&e);
            let error = e.to_string();
            let notice = gate::notice_for(&Err(e));
            failure(status, error, notice)
        }
    }
}

/// `GET /session`
pub async fn session_status(State(state): State<Arc<ApiState>>) -> Response {
    let body = match state.session.status() {
        SessionStatus::Active => SessionResponse {
            status: "active",
            reason: None,
        },
        SessionStatus::Expired(reason) => SessionResponse {
            status: "expired",
            reason: Some(reason),
        },
    };
    Json(body).into_response()
}

/// `PUT /session`
pub async fn login(State(state): State<Arc<ApiState>>, Json(req): Json<LoginRequest>) -> Response {
    match state.session.install(req.token).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

/// `DELETE /session`
pub async fn logout(State(state): State<Arc<ApiState>>) -> Response {
    state.session.invalidate("logged out").await;
    StatusCode::NO_CONTENT.into_response()
}
