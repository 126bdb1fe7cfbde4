//! REST handlers for dashboard queries, session tracking and operational
//! endpoints.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use dashmap::DashMap;
use funnel_core::types::{DeviceType, QueryFilters, Session};
use funnel_core::{FunnelError, FunnelResult, TrackingSink};
use funnel_integrations::{OutboundQueue, OutboundStats};
use funnel_reporting::attribution::AttributionReport;
use funnel_reporting::journey::JourneyReport;
use funnel_reporting::questions::QuestionReport;
use funnel_reporting::trend::FunnelComparison;
use funnel_reporting::{
    DashboardQuery, DateWindow, FunnelDashboard, FunnelReport, InsightsReport, WindowScope,
};
use funnel_tracking::{PageContext, QuizTracker, SessionHandle, SessionState};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, warn};

/// Upper bound for `limit` on journey listings.
const MAX_JOURNEY_LIMIT: usize = 1000;

/// Shared application state for REST handlers.
#[derive(Clone)]
pub struct AppState {
    pub dashboard: Arc<FunnelDashboard>,
    pub tracker: Arc<QuizTracker<dyn TrackingSink>>,
    pub outbound: Option<OutboundQueue>,
    /// One cancellation scope per dashboard client.
    pub windows: Arc<DashMap<String, Arc<WindowScope>>>,
    pub node_id: String,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        dashboard: FunnelDashboard,
        tracker: QuizTracker<dyn TrackingSink>,
        outbound: Option<OutboundQueue>,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            dashboard: Arc::new(dashboard),
            tracker: Arc::new(tracker),
            outbound,
            windows: Arc::new(DashMap::new()),
            node_id: node_id.into(),
            start_time: Instant::now(),
        }
    }

    /// Run a query under the client's window scope, if it named one. A newer
    /// request from the same client cancels this one.
    async fn scoped<T, F>(&self, client: Option<&str>, fut: F) -> FunnelResult<T>
    where
        F: Future<Output = FunnelResult<T>>,
    {
        match client.filter(|c| !c.is_empty()) {
            Some(client) => {
                let lease = ScopeLease {
                    windows: &self.windows,
                    client,
                };
                // Dropped before `lease`, so the lease sees the final count.
                let scope = lease.checkout();
                let result = scope.run(fut).await;
                result
            }
            None => fut.await,
        }
    }
}

/// Removes a client's window scope from the map once the last request
/// holding it finishes or is dropped, so idle clients cost nothing.
struct ScopeLease<'a> {
    windows: &'a DashMap<String, Arc<WindowScope>>,
    client: &'a str,
}

impl ScopeLease<'_> {
    fn checkout(&self) -> Arc<WindowScope> {
        self.windows.entry(self.client.to_string()).or_default().clone()
    }
}

impl Drop for ScopeLease<'_> {
    fn drop(&mut self) {
        self.windows
            .remove_if(self.client, |_, scope| Arc::strong_count(scope) == 1);
    }
}

/// Query string shared by every reporting endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct ReportParams {
    #[serde(rename = "startDate")]
    pub start_date: Option<String>,
    #[serde(rename = "endDate")]
    pub end_date: Option<String>,
    #[serde(rename = "previousStartDate")]
    pub previous_start_date: Option<String>,
    #[serde(rename = "previousEndDate")]
    pub previous_end_date: Option<String>,
    pub source_page: Option<String>,
    pub utm_source: Option<String>,
    pub utm_campaign: Option<String>,
    pub device_type: Option<DeviceType>,
    pub limit: Option<usize>,
    pub client: Option<String>,
}

impl ReportParams {
    pub fn to_query(&self) -> FunnelResult<DashboardQuery> {
        Ok(DashboardQuery {
            window: window(&self.start_date, &self.end_date, "startDate/endDate")?,
            previous: window(
                &self.previous_start_date,
                &self.previous_end_date,
                "previousStartDate/previousEndDate",
            )?,
            filters: QueryFilters {
                source_page: non_blank(&self.source_page),
                utm_source: non_blank(&self.utm_source),
                utm_campaign: non_blank(&self.utm_campaign),
                device_type: self.device_type,
            },
        })
    }
}

fn window(start: &Option<String>, end: &Option<String>, name: &str) -> FunnelResult<Option<DateWindow>> {
    match (non_blank(start), non_blank(end)) {
        (Some(start), Some(end)) => DateWindow::parse(&start, &end).map(Some),
        (None, None) => Ok(None),
        _ => Err(FunnelError::Validation(format!(
            "{name} must be supplied together"
        ))),
    }
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub retryable: bool,
}

/// Maps engine errors onto HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    Engine(FunnelError),
    NotFound(String),
}

impl From<FunnelError> for ApiError {
    fn from(e: FunnelError) -> Self {
        Self::Engine(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = match self {
            ApiError::Engine(err) => err,
            ApiError::NotFound(what) => {
                metrics::counter!("api.errors", "code" => "not_found").increment(1);
                let body = ErrorResponse {
                    error: "not_found".to_string(),
                    message: what,
                    retryable: false,
                };
                return (StatusCode::NOT_FOUND, Json(body)).into_response();
            }
        };

        let (status, code) = match &err {
            FunnelError::InvalidRange { .. } => (StatusCode::BAD_REQUEST, "invalid_range"),
            FunnelError::Validation(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            FunnelError::InvalidTransition(_) => (StatusCode::CONFLICT, "invalid_transition"),
            FunnelError::Cancelled => (StatusCode::CONFLICT, "cancelled"),
            FunnelError::DataUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "data_unavailable"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };

        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %err, "Request failed");
            "Internal processing error".to_string()
        } else {
            warn!(error = %err, code, "Request rejected");
            err.to_string()
        };
        metrics::counter!("api.errors", "code" => code).increment(1);

        let body = ErrorResponse {
            error: code.to_string(),
            message,
            retryable: err.is_retryable(),
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

/// GET /v1/funnel
pub async fn funnel(
    State(state): State<AppState>,
    Query(params): Query<ReportParams>,
) -> ApiResult<FunnelReport> {
    let query = params.to_query()?;
    let report = state
        .scoped(params.client.as_deref(), state.dashboard.funnel(&query))
        .await?;
    Ok(Json(report))
}

/// GET /v1/funnel/compare
pub async fn funnel_compare(
    State(state): State<AppState>,
    Query(params): Query<ReportParams>,
) -> ApiResult<FunnelComparison> {
    let query = params.to_query()?;
    let comparison = state
        .scoped(
            params.client.as_deref(),
            state.dashboard.funnel_comparison(&query),
        )
        .await?;
    Ok(Json(comparison))
}

/// GET /v1/insights
pub async fn insights(
    State(state): State<AppState>,
    Query(params): Query<ReportParams>,
) -> ApiResult<InsightsReport> {
    let query = params.to_query()?;
    let report = state
        .scoped(params.client.as_deref(), state.dashboard.insights(&query))
        .await?;
    Ok(Json(report))
}

/// GET /v1/attribution
pub async fn attribution(
    State(state): State<AppState>,
    Query(params): Query<ReportParams>,
) -> ApiResult<AttributionReport> {
    let query = params.to_query()?;
    let report = state
        .scoped(params.client.as_deref(), state.dashboard.attribution(&query))
        .await?;
    Ok(Json(report))
}

/// GET /v1/journeys
pub async fn journeys(
    State(state): State<AppState>,
    Query(params): Query<ReportParams>,
) -> ApiResult<JourneyReport> {
    let query = params.to_query()?;
    let limit = params.limit.map(|l| l.min(MAX_JOURNEY_LIMIT));
    let report = state
        .scoped(
            params.client.as_deref(),
            state.dashboard.journeys(&query, limit),
        )
        .await?;
    Ok(Json(report))
}

/// GET /v1/questions
pub async fn questions(
    State(state): State<AppState>,
    Query(params): Query<ReportParams>,
) -> ApiResult<QuestionReport> {
    let query = params.to_query()?;
    let report = state
        .scoped(params.client.as_deref(), state.dashboard.questions(&query))
        .await?;
    Ok(Json(report))
}

#[derive(Debug, Serialize)]
pub struct SessionView {
    pub session_id: String,
    pub state: SessionState,
    pub session: Session,
}

impl From<&SessionHandle> for SessionView {
    fn from(handle: &SessionHandle) -> Self {
        Self {
            session_id: handle.id().to_string(),
            state: handle.state(),
            session: handle.session().clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct OpenSessionRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    pub source_page: String,
    #[serde(default, flatten)]
    pub context: PageContext,
}

/// POST /v1/sessions
pub async fn open_session(
    State(state): State<AppState>,
    Json(request): Json<OpenSessionRequest>,
) -> Result<(StatusCode, Json<SessionView>), ApiError> {
    if request.source_page.trim().is_empty() {
        return Err(FunnelError::Validation("source_page must not be empty".into()).into());
    }
    let handle = state
        .tracker
        .page_view(request.session_id, &request.source_page, request.context)
        .await?;
    Ok((StatusCode::CREATED, Json(SessionView::from(&handle))))
}

async fn load(state: &AppState, session_id: &str) -> Result<SessionHandle, ApiError> {
    state
        .tracker
        .resume(session_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("unknown session {session_id}")))
}

#[derive(Debug, Deserialize)]
pub struct StartRequest {
    pub total_questions: u32,
}

/// POST /v1/sessions/:id/start
pub async fn start_quiz(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<StartRequest>,
) -> ApiResult<SessionView> {
    let mut handle = load(&state, &session_id).await?;
    state
        .tracker
        .start_quiz(&mut handle, request.total_questions)
        .await?;
    Ok(Json(SessionView::from(&handle)))
}

#[derive(Debug, Deserialize)]
pub struct QuestionRequest {
    pub question_id: String,
    #[serde(default)]
    pub time_spent_ms: Option<u64>,
}

/// POST /v1/sessions/:id/questions/:index/view
pub async fn view_question(
    State(state): State<AppState>,
    Path((session_id, index)): Path<(String, u32)>,
    Json(request): Json<QuestionRequest>,
) -> ApiResult<SessionView> {
    let mut handle = load(&state, &session_id).await?;
    state
        .tracker
        .view_question(&mut handle, &request.question_id, index)
        .await?;
    Ok(Json(SessionView::from(&handle)))
}

/// POST /v1/sessions/:id/questions/:index/answer
pub async fn answer_question(
    State(state): State<AppState>,
    Path((session_id, index)): Path<(String, u32)>,
    Json(request): Json<QuestionRequest>,
) -> ApiResult<SessionView> {
    let mut handle = load(&state, &session_id).await?;
    state
        .tracker
        .answer_question(
            &mut handle,
            &request.question_id,
            index,
            request.time_spent_ms.unwrap_or(0),
        )
        .await?;
    Ok(Json(SessionView::from(&handle)))
}

#[derive(Debug, Deserialize)]
pub struct CaptureRequest {
    pub email: String,
    #[serde(default)]
    pub submission_id: Option<String>,
}

/// POST /v1/sessions/:id/email
pub async fn capture_email(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(request): Json<CaptureRequest>,
) -> ApiResult<SessionView> {
    let mut handle = load(&state, &session_id).await?;
    state
        .tracker
        .capture_email(&mut handle, &request.email, request.submission_id)
        .await?;
    Ok(Json(SessionView::from(&handle)))
}

/// POST /v1/sessions/:id/complete
pub async fn complete(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<SessionView> {
    let mut handle = load(&state, &session_id).await?;
    state.tracker.complete(&mut handle).await?;
    Ok(Json(SessionView::from(&handle)))
}

/// POST /v1/sessions/:id/abandon
pub async fn abandon(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<SessionView> {
    let mut handle = load(&state, &session_id).await?;
    state.tracker.abandon(&mut handle).await?;
    Ok(Json(SessionView::from(&handle)))
}

/// POST /v1/sessions/:id/buy
pub async fn buy_click(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<SessionView> {
    let mut handle = load(&state, &session_id).await?;
    state.tracker.buy_click(&mut handle).await?;
    Ok(Json(SessionView::from(&handle)))
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: String,
    pub uptime_secs: u64,
    pub outbound: Option<OutboundStats>,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        node_id: state.node_id.clone(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        outbound: state.outbound.as_ref().map(OutboundQueue::stats),
    })
}

/// GET /ready
pub async fn readiness() -> StatusCode {
    StatusCode::OK
}

/// GET /live
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}
