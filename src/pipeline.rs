//! Lead ingestion pipeline.
//!
//! Per event: idempotency check, optional field fetch, normalization,
//! candidate lookup, scoring, resolution and the completing store write.
//! A stale merge (`VersionConflict`) re-runs the lookup from scratch.

use moka::future::Cache;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::dedup::{merge_target, resolve, MatchThresholds, Resolution};
use crate::errors::{IngestError, StoreError};
use crate::lead_fetch::LeadFetcher;
use crate::lead_models::{LeadWebhookPayload, ParsedEntry};
use crate::matching::{score_candidates, MatchWeights};
use crate::models::{
    CanonicalLead, CustomerRecord, IdempotencyKey, InboundLeadEvent, IngestOutcome, LeadEvent,
    MergeTarget, ReviewDisposition, ReviewStatus,
};
use crate::normalizer::normalize_event;
use crate::retry::{with_backoff, RetryPolicy};
use crate::signature::{SignatureVerifier, Verdict};
use crate::store::LeadStore;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Tunables for a pipeline instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSettings {
    pub weights: MatchWeights,
    pub thresholds: MatchThresholds,
    pub retry: RetryPolicy,
    /// Extra find/score/resolve rounds allowed after a `VersionConflict`.
    pub conflict_retries: u32,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            weights: MatchWeights::default(),
            thresholds: MatchThresholds::default(),
            retry: RetryPolicy::default(),
            conflict_retries: 5,
        }
    }
}

/// Result of ingesting one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    #[serde(flatten)]
    pub outcome: IngestOutcome,
    /// True when the outcome was already recorded and nothing was reprocessed.
    pub replayed: bool,
}

/// Per-entry line of a webhook response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventReport {
    pub lead_id: Option<String>,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<IngestOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
}

impl EventReport {
    pub fn from_result(lead_id: Option<String>, result: Result<IngestReport, IngestError>) -> Self {
        match result {
            Ok(report) => Self {
                lead_id,
                status: if report.replayed {
                    "duplicate"
                } else {
                    "processed"
                },
                outcome: Some(report.outcome),
                error: None,
                code: None,
            },
            Err(e) => Self {
                lead_id,
                status: "failed",
                outcome: None,
                code: Some(e.code()),
                error: Some(e.to_string()),
            },
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == "failed"
    }

    pub fn is_duplicate(&self) -> bool {
        self.status == "duplicate"
    }
}

/// What a review disposition produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReviewDecision {
    pub review_id: Uuid,
    pub status: ReviewStatus,
    pub customer: CustomerRecord,
    pub outcome: IngestOutcome,
}

struct PipelineInner {
    store: Arc<dyn LeadStore>,
    verifier: SignatureVerifier,
    fetcher: LeadFetcher,
    settings: PipelineSettings,
    /// In-flight lock per idempotency key; serializes duplicate deliveries.
    key_locks: Cache<String, Arc<Mutex<()>>>,
    events: broadcast::Sender<LeadEvent>,
}

/// Cheap to clone; every clone shares the same store, locks and event channel.
#[derive(Clone)]
pub struct LeadPipeline {
    inner: Arc<PipelineInner>,
}

impl fmt::Debug for LeadPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeadPipeline")
            .field("verifier", &self.inner.verifier)
            .field("fetcher", &self.inner.fetcher)
            .field("settings", &self.inner.settings)
            .finish()
    }
}

fn failed(key: &IdempotencyKey, err: impl fmt::Display) -> IngestError {
    IngestError::IngestionFailed {
        key: Some(key.clone()),
        message: err.to_string(),
    }
}

impl LeadPipeline {
    pub fn new(
        store: Arc<dyn LeadStore>,
        verifier: SignatureVerifier,
        fetcher: LeadFetcher,
        settings: PipelineSettings,
    ) -> Self {
        let key_locks = Cache::builder()
            .time_to_idle(Duration::from_secs(300))
            .max_capacity(10_000)
            .build();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(PipelineInner {
                store,
                verifier,
                fetcher,
                settings,
                key_locks,
                events,
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn LeadStore> {
        &self.inner.store
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.inner.settings
    }

    /// Downstream notifications. Only fresh outcomes are published.
    pub fn subscribe(&self) -> broadcast::Receiver<LeadEvent> {
        self.inner.events.subscribe()
    }

    /// Verifies and ingests a raw webhook delivery.
    ///
    /// Signature and envelope problems fail the whole delivery before anything
    /// is persisted. Past that point every entry runs as its own detached task
    /// and gets its own report, in delivery order.
    pub async fn ingest_webhook(
        &self,
        body: &[u8],
        signature: Option<&str>,
    ) -> Result<Vec<EventReport>, IngestError> {
        if let Verdict::Rejected(reason) = self.inner.verifier.check(body, signature) {
            return Err(IngestError::AuthenticationFailure(reason.to_string()));
        }

        let payload: LeadWebhookPayload = serde_json::from_slice(body)
            .map_err(|e| IngestError::MalformedPayload(format!("invalid webhook body: {}", e)))?;
        let entries = payload.into_entries()?;

        tracing::info!("📨 Lead webhook received: {} entr(ies)", entries.len());

        let mut pending = Vec::with_capacity(entries.len());
        for entry in entries {
            match entry {
                Ok(entry) => {
                    let lead_id = entry.event.provenance.lead_id.clone();
                    pending.push((Some(lead_id), Ok(self.spawn_entry(entry))));
                }
                Err(e) => {
                    tracing::warn!("⚠️  Rejected lead entry: {}", e);
                    pending.push((None, Err(e)));
                }
            }
        }

        let mut reports = Vec::with_capacity(pending.len());
        for (lead_id, task) in pending {
            let result = match task {
                Ok(handle) => join_ingestion(handle).await,
                Err(e) => Err(e),
            };
            reports.push(EventReport::from_result(lead_id, result));
        }

        Ok(reports)
    }

    /// Ingests one validated webhook entry, fetching its fields first when the
    /// provider only sent the lead id.
    pub async fn ingest_entry(&self, entry: ParsedEntry) -> Result<IngestReport, IngestError> {
        self.run(entry.event, entry.needs_fetch).await
    }

    /// Ingests an event whose field list is already complete.
    pub async fn ingest_event(&self, event: InboundLeadEvent) -> Result<IngestReport, IngestError> {
        self.run(event, false).await
    }

    /// Same as `ingest_event`, but the work runs as its own task: dropping
    /// the returned future does not cancel the ingestion.
    pub async fn ingest_event_detached(
        &self,
        event: InboundLeadEvent,
    ) -> Result<IngestReport, IngestError> {
        let entry = ParsedEntry {
            event,
            needs_fetch: false,
        };
        join_ingestion(self.spawn_entry(entry)).await
    }

    fn spawn_entry(&self, entry: ParsedEntry) -> JoinHandle<Result<IngestReport, IngestError>> {
        let pipeline = self.clone();
        tokio::spawn(async move { pipeline.ingest_entry(entry).await })
    }

    async fn run(
        &self,
        mut event: InboundLeadEvent,
        needs_fetch: bool,
    ) -> Result<IngestReport, IngestError> {
        let key = event.key();
        let lock = self
            .inner
            .key_locks
            .get_with(key.to_string(), async { Arc::new(Mutex::new(())) })
            .await;
        let _guard = lock.lock().await;

        if let Some(outcome) = self.stored_outcome(&key).await? {
            tracing::info!("🔁 Lead {} already ingested ({}), replaying", key, outcome.kind());
            return Ok(IngestReport {
                outcome,
                replayed: true,
            });
        }

        if needs_fetch {
            event.field_data = self
                .inner
                .fetcher
                .fetch_field_data(&event.provenance.lead_id)
                .await
                .map_err(|e| failed(&key, e))?;
        }

        let lead = normalize_event(&event);
        if lead.is_empty() {
            tracing::warn!("⚠️  Lead {} has no recognised contact fields", key);
        }

        let rounds = self.inner.settings.conflict_retries.saturating_add(1);
        for round in 1..=rounds {
            match self.resolve_and_write(&lead).await {
                Ok(outcome) => {
                    tracing::info!(
                        "✅ Lead {} ingested: {} (customer {})",
                        key,
                        outcome.kind(),
                        outcome.customer_id()
                    );
                    self.publish(&outcome);
                    return Ok(IngestReport {
                        outcome,
                        replayed: false,
                    });
                }
                Err(StoreError::VersionConflict { customer_id }) => {
                    tracing::debug!(
                        "Customer {} changed while merging lead {} (round {}/{}), re-matching",
                        customer_id,
                        key,
                        round,
                        rounds
                    );
                }
                Err(StoreError::AlreadyIngested(_)) => {
                    return match self.stored_outcome(&key).await? {
                        Some(outcome) => {
                            tracing::info!("🔁 Lead {} was ingested concurrently, replaying", key);
                            Ok(IngestReport {
                                outcome,
                                replayed: true,
                            })
                        }
                        None => Err(failed(&key, "ingestion claimed but no outcome recorded")),
                    };
                }
                Err(e) => {
                    tracing::error!("❌ Lead {} failed: {}", key, e);
                    return Err(failed(&key, e));
                }
            }
        }

        tracing::error!("❌ Lead {} still conflicting after {} round(s)", key, rounds);
        Err(failed(
            &key,
            format!("gave up after {} concurrent-modification round(s)", rounds),
        ))
    }

    /// One find/score/resolve round ending in the completing write.
    async fn resolve_and_write(&self, lead: &CanonicalLead) -> Result<IngestOutcome, StoreError> {
        let store = self.inner.store.as_ref();
        let settings = &self.inner.settings;
        let key = lead.key();

        let pool = with_backoff(&settings.retry, "find_candidates", move || {
            store.find_candidates(lead)
        })
        .await?;
        let candidates = score_candidates(lead, &pool, &settings.weights);
        let resolution = resolve(&candidates, &settings.thresholds);

        tracing::debug!(
            "Lead {}: {} candidate(s) scored, resolution {}",
            key,
            candidates.len(),
            resolution.label()
        );

        match resolution {
            Resolution::NoMatch => {
                let customer = with_backoff(&settings.retry, "create_customer", move || {
                    store.create_customer(lead)
                })
                .await?;
                Ok(IngestOutcome::created(&customer, &key))
            }
            Resolution::AutoMerge(top) => {
                let target = merge_target(&top);
                let target_ref = &target;
                with_backoff(&settings.retry, "merge_into", move || {
                    store.merge_into(target_ref, lead)
                })
                .await?;
                Ok(IngestOutcome::merged(&key, &target))
            }
            Resolution::ReviewRequired(candidates) => {
                let candidates_ref = candidates.as_slice();
                let review = with_backoff(&settings.retry, "create_review", move || {
                    store.create_review(lead, candidates_ref)
                })
                .await?;
                Ok(IngestOutcome::review(&review))
            }
        }
    }

    async fn stored_outcome(&self, key: &IdempotencyKey) -> Result<Option<IngestOutcome>, IngestError> {
        let store = self.inner.store.as_ref();
        with_backoff(&self.inner.settings.retry, "previous_outcome", move || {
            store.previous_outcome(key)
        })
        .await
        .map_err(|e| failed(key, e))
    }

    /// Applies a manual decision to a pending review.
    pub async fn resolve_review(
        &self,
        review_id: Uuid,
        disposition: ReviewDisposition,
    ) -> Result<ReviewDecision, IngestError> {
        let store = self.inner.store.as_ref();
        let retry = &self.inner.settings.retry;
        let review_failed = |e: StoreError| IngestError::IngestionFailed {
            key: None,
            message: format!("review {}: {}", review_id, e),
        };

        let review = with_backoff(retry, "get_review", move || store.get_review(review_id))
            .await
            .map_err(review_failed)?
            .ok_or(IngestError::UnknownReview(review_id))?;

        if review.status != ReviewStatus::Pending {
            return Err(IngestError::InvalidDisposition(format!(
                "review {} is already {}",
                review_id,
                review.status.as_str()
            )));
        }

        match disposition {
            ReviewDisposition::ConfirmMerge { customer_id } => {
                let candidate = review.candidate(customer_id).cloned().ok_or_else(|| {
                    IngestError::InvalidDisposition(format!(
                        "customer {} is not a candidate of review {}",
                        customer_id, review_id
                    ))
                })?;

                let rounds = self.inner.settings.conflict_retries.saturating_add(1);
                for _ in 0..rounds {
                    let customer = with_backoff(retry, "get_customer", move || {
                        store.get_customer(customer_id)
                    })
                    .await
                    .map_err(review_failed)?
                    .ok_or_else(|| {
                        IngestError::InvalidDisposition(format!(
                            "customer {} no longer exists",
                            customer_id
                        ))
                    })?;

                    let target = MergeTarget {
                        customer_id,
                        expected_version: customer.version,
                        confidence: candidate.confidence,
                        reason: format!("{} (confirmed by review)", candidate.reason),
                    };
                    let target_ref = &target;

                    match with_backoff(retry, "confirm_review_merge", move || {
                        store.confirm_review_merge(review_id, target_ref)
                    })
                    .await
                    {
                        Ok(customer) => {
                            let outcome = IngestOutcome::merged(&review.key, &target);
                            tracing::info!(
                                "✅ Review {} resolved: lead {} merged into customer {}",
                                review_id,
                                review.key,
                                customer.id
                            );
                            self.publish(&outcome);
                            return Ok(ReviewDecision {
                                review_id,
                                status: ReviewStatus::ConfirmedMerge,
                                customer,
                                outcome,
                            });
                        }
                        Err(StoreError::VersionConflict { .. }) => continue,
                        Err(e) => return Err(map_review_error(review_id, e)),
                    }
                }

                Err(review_failed(StoreError::VersionConflict { customer_id }))
            }
            ReviewDisposition::ConfirmDistinct => {
                let customer = with_backoff(retry, "confirm_review_distinct", move || {
                    store.confirm_review_distinct(review_id)
                })
                .await
                .map_err(|e| map_review_error(review_id, e))?;

                let outcome = IngestOutcome::created(&customer, &review.key);
                tracing::info!(
                    "✅ Review {} resolved: lead {} kept distinct as customer {}",
                    review_id,
                    review.key,
                    customer.id
                );
                self.publish(&outcome);
                Ok(ReviewDecision {
                    review_id,
                    status: ReviewStatus::ConfirmedDistinct,
                    customer,
                    outcome,
                })
            }
        }
    }

    fn publish(&self, outcome: &IngestOutcome) {
        if self.inner.events.send(outcome.event()).is_err() {
            tracing::debug!("No subscribers for lead events");
        }
    }
}

async fn join_ingestion(
    handle: JoinHandle<Result<IngestReport, IngestError>>,
) -> Result<IngestReport, IngestError> {
    handle.await.unwrap_or_else(|e| {
        Err(IngestError::IngestionFailed {
            key: None,
            message: format!("ingestion task aborted: {}", e),
        })
    })
}

fn map_review_error(review_id: Uuid, err: StoreError) -> IngestError {
    match err {
        StoreError::ReviewClosed(_) => {
            IngestError::InvalidDisposition(format!("review {} is already resolved", review_id))
        }
        StoreError::NotFound(what) => {
            IngestError::InvalidDisposition(format!("{} not found", what))
        }
        other => IngestError::IngestionFailed {
            key: None,
            message: format!("review {}: {}", review_id, other),
        },
    }
}
