/// HTTP-level tests: the router driven with `tower::ServiceExt::oneshot`.
use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use uuid::Uuid;

use clinic_lead_intake::config::Config;
use clinic_lead_intake::handlers::{build_router, AppState};
use clinic_lead_intake::lead_fetch::LeadFetcher;
use clinic_lead_intake::models::CustomerRecord;
use clinic_lead_intake::pipeline::LeadPipeline;
use clinic_lead_intake::signature::{sign, SignatureAlgorithm, SignatureVerifier};
use clinic_lead_intake::matching::MatchCandidate;
use clinic_lead_intake::models::{
    CanonicalLead, IdempotencyKey, IngestOutcome, MergeTarget, PendingReview,
};
use clinic_lead_intake::store::{LeadStore, MemoryLeadStore, StoreResult};

const SECRET: &str = "api-test-secret";
const VERIFY_TOKEN: &str = "verify-me";
const GOOGLE_KEY: &str = "google-test-key";

fn test_config() -> Config {
    let vars: HashMap<&str, &str> = [
        ("LEAD_WEBHOOK_SECRET", SECRET),
        ("WEBHOOK_VERIFY_TOKEN", VERIFY_TOKEN),
        ("GOOGLE_ADS_WEBHOOK_KEY", GOOGLE_KEY),
    ]
    .into_iter()
    .collect();
    Config::from_lookup(|name| vars.get(name).map(|v| v.to_string())).unwrap()
}

fn app_with(store: Arc<dyn LeadStore>) -> Router {
    let config = test_config();
    let pipeline = LeadPipeline::new(
        store,
        SignatureVerifier::new(config.webhook_secret.clone()),
        LeadFetcher::Mock,
        config.pipeline_settings(),
    );
    build_router(Arc::new(AppState { pipeline, config }))
}

fn app() -> Router {
    app_with(Arc::new(MemoryLeadStore::new()))
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn lead_body(lead_id: &str, email: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "object": "page",
        "entry": [{
            "leadgen_id": lead_id,
            "created_time": "2024-05-01T10:00:00+0000",
            "field_data": [
                {"name": "full_name", "values": ["Jane Doe"]},
                {"name": "email", "values": [email]}
            ]
        }]
    }))
    .unwrap()
}

fn signed_post(body: Vec<u8>) -> Request<Body> {
    let signature = sign(&body, SECRET, SignatureAlgorithm::Sha256);
    Request::builder()
        .method("POST")
        .uri("/api/v1/webhooks/leads")
        .header("content-type", "application/json")
        .header("X-Hub-Signature-256", signature)
        .body(Body::from(body))
        .unwrap()
}

#[tokio::test]
async fn test_health() {
    let response = app()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "healthy");
}

#[tokio::test]
async fn test_signed_webhook_creates_customer() {
    let app = app();

    let response = app
        .clone()
        .oneshot(signed_post(lead_body("H-1", "jane@x.com")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["received"], 1);
    assert_eq!(body["processed"], 1);
    assert_eq!(body["results"][0]["outcome"]["outcome"], "customer_created");

    let customer_id = body["results"][0]["outcome"]["customer_id"]
        .as_str()
        .unwrap()
        .to_string();
    let response = app
        .clone()
        .oneshot(
            Request::get(format!("/api/v1/customers/{}", customer_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let customer: CustomerRecord =
        serde_json::from_value(body_json(response).await).unwrap();
    assert_eq!(customer.email.as_deref(), Some("jane@x.com"));

    // Redelivery
    let response = app
        .oneshot(signed_post(lead_body("H-1", "jane@x.com")))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["duplicates"], 1);
    assert_eq!(body["processed"], 0);
}

#[tokio::test]
async fn test_bad_signature_is_unauthorized() {
    let store = Arc::new(MemoryLeadStore::new());
    let app = app_with(store.clone());

    let body = lead_body("H-2", "jane@x.com");
    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/webhooks/leads")
        .header("X-Hub-Signature-256", sign(&body, "wrong", SignatureAlgorithm::Sha256))
        .body(Body::from(body))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["error"], "Unauthorized");
    assert_eq!(store.customer_count().await, 0);
}

#[tokio::test]
async fn test_legacy_signature_header_accepted() {
    let body = lead_body("H-3", "legacy@x.com");
    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/webhooks/leads")
        .header("X-Hub-Signature", sign(&body, SECRET, SignatureAlgorithm::Sha384))
        .body(Body::from(body))
        .unwrap();

    let response = app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_invalid_json_is_bad_request() {
    let response = app()
        .oneshot(signed_post(b"{\"object\": 42".to_vec()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_subscription_handshake() {
    let ok = app()
        .oneshot(
            Request::get(format!(
                "/api/v1/webhooks/leads?hub.mode=subscribe&hub.verify_token={}&hub.challenge=12345",
                VERIFY_TOKEN
            ))
            .body(Body::empty())
            .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(ok.status(), StatusCode::OK);
    let bytes = to_bytes(ok.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], b"12345");

    let denied = app()
        .oneshot(
            Request::get(
                "/api/v1/webhooks/leads?hub.mode=subscribe&hub.verify_token=nope&hub.challenge=1",
            )
            .body(Body::empty())
            .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);
}

fn google_ads_request(key: &str, lead_id: &str) -> Request<Body> {
    let payload = json!({
        "lead_id": lead_id,
        "api_version": "1.0",
        "form_id": 123,
        "campaign_id": 456,
        "google_key": key,
        "is_test": false,
        "user_column_data": [
            {"column_id": "FULL_NAME", "column_name": "Full Name", "string_value": "Rui Costa"},
            {"column_id": "PHONE_NUMBER", "column_name": "Phone", "string_value": "+55 11 98765-4321"}
        ]
    });
    Request::builder()
        .method("POST")
        .uri("/api/v1/webhooks/google-ads")
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&payload).unwrap()))
        .unwrap()
}

#[tokio::test]
async fn test_google_ads_webhook() {
    let store = Arc::new(MemoryLeadStore::new());
    let app = app_with(store.clone());

    let rejected = app
        .clone()
        .oneshot(google_ads_request("wrong-key", "G-1"))
        .await
        .unwrap();
    assert_eq!(rejected.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(store.customer_count().await, 0);

    let created = app
        .clone()
        .oneshot(google_ads_request(GOOGLE_KEY, "G-1"))
        .await
        .unwrap();
    assert_eq!(created.status(), StatusCode::CREATED);
    let body = body_json(created).await;
    assert_eq!(body["outcome"], "customer_created");
    assert_eq!(body["provider"], "google_ads");
    assert_eq!(body["replayed"], false);

    let replay = app
        .oneshot(google_ads_request(GOOGLE_KEY, "G-1"))
        .await
        .unwrap();
    assert_eq!(replay.status(), StatusCode::OK);
    assert_eq!(body_json(replay).await["replayed"], true);

    let customers = store.customers().await;
    assert_eq!(customers.len(), 1);
    assert_eq!(customers[0].last_name.as_deref(), Some("Costa"));
}

#[tokio::test]
async fn test_review_endpoints() {
    let store = Arc::new(MemoryLeadStore::new());
    let app = app_with(store.clone());

    // Same phone, different person: lands in review
    app.clone()
        .oneshot(signed_post(
            serde_json::to_vec(&json!({
                "object": "page",
                "entry": [{
                    "leadgen_id": "R-1",
                    "created_time": "2024-05-01T10:00:00Z",
                    "field_data": [
                        {"name": "full_name", "values": ["Ana Lima"]},
                        {"name": "phone_number", "values": ["555-0100"]}
                    ]
                }]
            }))
            .unwrap(),
        ))
        .await
        .unwrap();

    let response = app
        .clone()
        .oneshot(signed_post(
            serde_json::to_vec(&json!({
                "object": "page",
                "entry": [{
                    "leadgen_id": "R-2",
                    "created_time": "2024-05-02T10:00:00Z",
                    "field_data": [
                        {"name": "full_name", "values": ["Bea Reis"]},
                        {"name": "phone_number", "values": ["(555) 0100"]}
                    ]
                }]
            }))
            .unwrap(),
        ))
        .await
        .unwrap();
    let body = body_json(response).await;
    let outcome = &body["results"][0]["outcome"];
    assert_eq!(outcome["outcome"], "review_required");
    let review_id = outcome["review_id"].as_str().unwrap().to_string();

    let review = app
        .clone()
        .oneshot(
            Request::get(format!("/api/v1/reviews/{}", review_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(review.status(), StatusCode::OK);
    assert_eq!(body_json(review).await["status"], "pending");

    let not_candidate = app
        .clone()
        .oneshot(
            Request::post(format!("/api/v1/reviews/{}/confirm-merge", review_id))
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({ "customer_id": Uuid::new_v4() }).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(not_candidate.status(), StatusCode::CONFLICT);

    let distinct = app
        .clone()
        .oneshot(
            Request::post(format!("/api/v1/reviews/{}/confirm-distinct", review_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(distinct.status(), StatusCode::OK);
    let decision = body_json(distinct).await;
    assert_eq!(decision["status"], "confirmed_distinct");
    assert_eq!(decision["customer"]["first_name"], "Bea");
    assert_eq!(store.customer_count().await, 2);

    let unknown = app
        .oneshot(
            Request::get(format!("/api/v1/reviews/{}", Uuid::new_v4()))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
}

/// Memory store whose candidate lookup takes a while.
struct SlowLookupStore {
    inner: MemoryLeadStore,
    delay: Duration,
}

#[async_trait]
impl LeadStore for SlowLookupStore {
    async fn find_candidates(&self, lead: &CanonicalLead) -> StoreResult<Vec<CustomerRecord>> {
        tokio::time::sleep(self.delay).await;
        self.inner.find_candidates(lead).await
    }

    async fn get_customer(&self, id: Uuid) -> StoreResult<Option<CustomerRecord>> {
        self.inner.get_customer(id).await
    }

    async fn create_customer(&self, lead: &CanonicalLead) -> StoreResult<CustomerRecord> {
        self.inner.create_customer(lead).await
    }

    async fn merge_into(
        &self,
        target: &MergeTarget,
        lead: &CanonicalLead,
    ) -> StoreResult<CustomerRecord> {
        self.inner.merge_into(target, lead).await
    }

    async fn create_review(
        &self,
        lead: &CanonicalLead,
        candidates: &[MatchCandidate],
    ) -> StoreResult<PendingReview> {
        self.inner.create_review(lead, candidates).await
    }

    async fn get_review(&self, id: Uuid) -> StoreResult<Option<PendingReview>> {
        self.inner.get_review(id).await
    }

    async fn confirm_review_merge(
        &self,
        review_id: Uuid,
        target: &MergeTarget,
    ) -> StoreResult<CustomerRecord> {
        self.inner.confirm_review_merge(review_id, target).await
    }

    async fn confirm_review_distinct(&self, review_id: Uuid) -> StoreResult<CustomerRecord> {
        self.inner.confirm_review_distinct(review_id).await
    }

    async fn previous_outcome(&self, key: &IdempotencyKey) -> StoreResult<Option<IngestOutcome>> {
        self.inner.previous_outcome(key).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_google_ads_lead_survives_abandoned_request() {
    let store = Arc::new(SlowLookupStore {
        inner: MemoryLeadStore::new(),
        delay: Duration::from_millis(200),
    });
    let app = app_with(store.clone());

    // Caller gives up long before the lookup finishes
    let abandoned = tokio::time::timeout(
        Duration::from_millis(50),
        app.oneshot(google_ads_request(GOOGLE_KEY, "G-ABANDON")),
    )
    .await;
    assert!(abandoned.is_err());

    tokio::time::sleep(Duration::from_millis(600)).await;

    assert_eq!(store.inner.customer_count().await, 1);
    let outcome = store
        .inner
        .previous_outcome(&IdempotencyKey::new("google_ads", "G-ABANDON"))
        .await
        .unwrap();
    assert!(matches!(outcome, Some(IngestOutcome::CustomerCreated { .. })));
}
