//! Persistence boundary for the ingestion pipeline.
//!
//! Every write that completes an ingestion (`create_customer`, `merge_into`,
//! `create_review`, and the review confirmations) also records the outcome
//! under the lead's idempotency key in the same unit of work, and fails with
//! `StoreError::AlreadyIngested` when an outcome is already there.

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::errors::StoreError;
use crate::matching::MatchCandidate;
use crate::models::{
    CanonicalLead, CustomerRecord, IdempotencyKey, IngestOutcome, MergeTarget, PendingReview,
    ReviewStatus,
};

mod memory;
mod postgres;

pub use memory::MemoryLeadStore;
pub use postgres::PgLeadStore;

pub type StoreResult<T> = Result<T, StoreError>;

/// New pending review for `lead`. Its outcome names the top candidate, so an
/// empty candidate list is refused.
pub(crate) fn new_review(
    lead: &CanonicalLead,
    candidates: &[MatchCandidate],
) -> StoreResult<PendingReview> {
    if candidates.is_empty() {
        return Err(StoreError::Fatal(format!(
            "review for {} needs at least one candidate",
            lead.key()
        )));
    }

    Ok(PendingReview {
        id: Uuid::new_v4(),
        key: lead.key(),
        lead: lead.clone(),
        candidates: candidates.iter().map(MatchCandidate::summary).collect(),
        status: ReviewStatus::Pending,
        resolved_customer_id: None,
        created_at: Utc::now(),
        resolved_at: None,
    })
}

#[async_trait]
pub trait LeadStore: Send + Sync {
    /// Customers sharing any matchable attribute with the lead.
    async fn find_candidates(&self, lead: &CanonicalLead) -> StoreResult<Vec<CustomerRecord>>;

    async fn get_customer(&self, id: Uuid) -> StoreResult<Option<CustomerRecord>>;

    /// Creates a customer from the lead and records `CustomerCreated`.
    async fn create_customer(&self, lead: &CanonicalLead) -> StoreResult<CustomerRecord>;

    /// Fills the target's empty fields from the lead and records
    /// `CustomerMerged`. Fails with `VersionConflict` when the customer's
    /// version is no longer `target.expected_version`.
    async fn merge_into(
        &self,
        target: &MergeTarget,
        lead: &CanonicalLead,
    ) -> StoreResult<CustomerRecord>;

    /// Parks the lead for manual disposition and records `ReviewRequired`.
    async fn create_review(
        &self,
        lead: &CanonicalLead,
        candidates: &[MatchCandidate],
    ) -> StoreResult<PendingReview>;

    async fn get_review(&self, id: Uuid) -> StoreResult<Option<PendingReview>>;

    /// Closes a pending review by merging its lead into `target`; the stored
    /// outcome becomes `CustomerMerged`.
    async fn confirm_review_merge(
        &self,
        review_id: Uuid,
        target: &MergeTarget,
    ) -> StoreResult<CustomerRecord>;

    /// Closes a pending review by creating a new customer; the stored outcome
    /// becomes `CustomerCreated`.
    async fn confirm_review_distinct(&self, review_id: Uuid) -> StoreResult<CustomerRecord>;

    /// Outcome recorded for `key`, if any.
    async fn previous_outcome(&self, key: &IdempotencyKey) -> StoreResult<Option<IngestOutcome>>;

    async fn record_already_ingested(&self, key: &IdempotencyKey) -> StoreResult<bool> {
        Ok(self.previous_outcome(key).await?.is_some())
    }
}
