use crate::config::Config;
use crate::errors::AppError;
use crate::lead_models::{GoogleAdsWebhookPayload, WebhookResponse};
use crate::models::{CustomerRecord, PendingReview, ReviewDisposition};
use crate::pipeline::{IngestReport, LeadPipeline, ReviewDecision};
use crate::signature::constant_time_compare;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;
use uuid::Uuid;

/// Request bodies above this size are rejected before reaching a handler.
pub const MAX_BODY_BYTES: usize = 5 * 1024 * 1024;

/// Shared application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    /// Ingestion pipeline (owns the store).
    pub pipeline: LeadPipeline,
    /// Application configuration.
    pub config: Config,
}

/// Health check endpoint.
pub async fn health() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "clinic-lead-intake",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

/// Webhook and API routes. Rate limiting is layered on by the binary.
pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/api/v1/webhooks/leads",
            get(verify_subscription).post(lead_webhook),
        )
        .route("/api/v1/webhooks/google-ads", post(google_ads_webhook))
        .route("/api/v1/customers/:id", get(get_customer))
        .route("/api/v1/reviews/:id", get(get_review))
        .route("/api/v1/reviews/:id/confirm-merge", post(confirm_merge))
        .route("/api/v1/reviews/:id/confirm-distinct", post(confirm_distinct))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
}

/// Full application router without the per-IP limiter.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(api_routes())
        .with_state(state)
}

// ============ Lead webhook ============

/// Reads the provider signature, preferring the SHA-256 header.
fn signature_header(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("X-Hub-Signature-256")
        .or_else(|| headers.get("X-Hub-Signature"))
        .and_then(|v| v.to_str().ok())
}

/// POST /api/v1/webhooks/leads
///
/// The body is taken as raw bytes: the signature covers the exact payload.
/// Entries are ingested concurrently; each one is reported inline. When any
/// entry hit a storage failure the delivery answers 503 so the provider
/// redelivers (entries already done replay as duplicates).
pub async fn lead_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<WebhookResponse>), AppError> {
    let reports = state
        .pipeline
        .ingest_webhook(&body, signature_header(&headers))
        .await?;

    let received = reports.len();
    let duplicates = reports.iter().filter(|r| r.is_duplicate()).count();
    let failed = reports.iter().filter(|r| r.is_failed()).count();
    let processed = received - duplicates - failed;
    let retryable = reports
        .iter()
        .any(|r| r.code == Some("ingestion_failed"));

    tracing::info!(
        "Lead webhook complete: {} received, {} processed, {} duplicates, {} failed",
        received,
        processed,
        duplicates,
        failed
    );

    let status = if retryable {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    Ok((
        status,
        Json(WebhookResponse {
            status: if failed == 0 { "received" } else { "partial" }.to_string(),
            received,
            processed,
            duplicates,
            failed,
            results: reports,
        }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct SubscriptionQuery {
    #[serde(rename = "hub.mode")]
    mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    challenge: Option<String>,
}

/// GET /api/v1/webhooks/leads
///
/// Subscription handshake: echoes `hub.challenge` when the verify token matches.
pub async fn verify_subscription(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SubscriptionQuery>,
) -> Result<String, AppError> {
    let expected = state.config.webhook_verify_token.as_deref().ok_or_else(|| {
        AppError::Unauthorized("WEBHOOK_VERIFY_TOKEN not configured".to_string())
    })?;

    if query.mode.as_deref() != Some("subscribe") {
        return Err(AppError::BadRequest("hub.mode must be 'subscribe'".to_string()));
    }

    let token = query.verify_token.as_deref().unwrap_or_default();
    if !constant_time_compare(token, expected) {
        return Err(AppError::Unauthorized("Invalid hub.verify_token".to_string()));
    }

    let challenge = query
        .challenge
        .ok_or_else(|| AppError::BadRequest("Missing hub.challenge".to_string()))?;

    tracing::info!("✓ Lead webhook subscription verified");
    Ok(challenge)
}

// ============ Google Ads ============

/// Query parameters for Google Ads webhook verification.
#[derive(Debug, Deserialize)]
pub struct GoogleAdsWebhookQuery {
    google_key: Option<String>,
}

/// POST /api/v1/webhooks/google-ads
///
/// The key may come as a query parameter or in the body; either way it is
/// checked before the lead reaches the pipeline. Ingestion runs detached, so
/// a caller hanging up mid-request still gets the lead recorded.
pub async fn google_ads_webhook(
    State(state): State<Arc<AppState>>,
    Query(query): Query<GoogleAdsWebhookQuery>,
    Json(payload): Json<GoogleAdsWebhookPayload>,
) -> Result<(StatusCode, Json<IngestReport>), AppError> {
    tracing::info!(
        "📨 Received Google Ads webhook: lead_id={}, campaign={}",
        payload.lead_id,
        payload.campaign_id
    );

    let provided = query.google_key.as_deref().unwrap_or(&payload.google_key);
    validate_google_key(&state.config, provided)?;

    if payload.is_test {
        tracing::info!("⚠️  Google Ads test lead {}", payload.lead_id);
    }

    let event = payload.into_event(Utc::now())?;
    let report = state.pipeline.ingest_event_detached(event).await?;

    let status = if report.replayed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(report)))
}

fn validate_google_key(config: &Config, provided_key: &str) -> Result<(), AppError> {
    let expected_key = config.google_ads_webhook_key.as_ref().ok_or_else(|| {
        AppError::InternalError("GOOGLE_ADS_WEBHOOK_KEY not configured (required)".to_string())
    })?;

    if !constant_time_compare(provided_key, expected_key) {
        tracing::error!("❌ Invalid Google Ads webhook key");
        return Err(AppError::Unauthorized("Invalid google_key".to_string()));
    }

    tracing::debug!("✓ Google webhook key validated");
    Ok(())
}

// ============ Customers & reviews ============

/// GET /api/v1/customers/:id
pub async fn get_customer(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<CustomerRecord>, AppError> {
    state
        .pipeline
        .store()
        .get_customer(id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Customer {} not found", id)))
}

/// GET /api/v1/reviews/:id
pub async fn get_review(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<PendingReview>, AppError> {
    state
        .pipeline
        .store()
        .get_review(id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("Review {} not found", id)))
}

#[derive(Debug, Deserialize)]
pub struct ConfirmMergeRequest {
    pub customer_id: Uuid,
}

/// POST /api/v1/reviews/:id/confirm-merge
pub async fn confirm_merge(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(request): Json<ConfirmMergeRequest>,
) -> Result<Json<ReviewDecision>, AppError> {
    let decision = state
        .pipeline
        .resolve_review(
            id,
            ReviewDisposition::ConfirmMerge {
                customer_id: request.customer_id,
            },
        )
        .await?;
    Ok(Json(decision))
}

/// POST /api/v1/reviews/:id/confirm-distinct
pub async fn confirm_distinct(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ReviewDecision>, AppError> {
    let decision = state
        .pipeline
        .resolve_review(id, ReviewDisposition::ConfirmDistinct)
        .await?;
    Ok(Json(decision))
}
