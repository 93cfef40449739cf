use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{new_review, LeadStore, StoreResult};
use crate::dedup::fold_lead_into;
use crate::errors::StoreError;
use crate::matching::{normalize_email, normalize_name, normalize_phone, MatchCandidate};
use crate::models::{
    CanonicalLead, CustomerRecord, IdempotencyKey, IngestOutcome, MergeTarget, PendingReview,
    ReviewStatus,
};

#[derive(Default)]
struct MemoryState {
    customers: HashMap<Uuid, CustomerRecord>,
    reviews: HashMap<Uuid, PendingReview>,
    outcomes: HashMap<IdempotencyKey, IngestOutcome>,
}

impl MemoryState {
    fn ensure_new(&self, key: &IdempotencyKey) -> StoreResult<()> {
        if self.outcomes.contains_key(key) {
            return Err(StoreError::AlreadyIngested(key.clone()));
        }
        Ok(())
    }

    /// Applies a versioned merge without touching the outcome log.
    fn merge(&mut self, target: &MergeTarget, lead: &CanonicalLead) -> StoreResult<CustomerRecord> {
        let record = self
            .customers
            .get_mut(&target.customer_id)
            .ok_or_else(|| StoreError::NotFound(format!("customer {}", target.customer_id)))?;

        if record.version != target.expected_version {
            return Err(StoreError::VersionConflict {
                customer_id: target.customer_id,
            });
        }

        fold_lead_into(record, lead, Utc::now());
        Ok(record.clone())
    }

    fn pending_review(&self, review_id: Uuid) -> StoreResult<PendingReview> {
        let review = self
            .reviews
            .get(&review_id)
            .ok_or_else(|| StoreError::NotFound(format!("review {}", review_id)))?;
        if review.status != ReviewStatus::Pending {
            return Err(StoreError::ReviewClosed(review_id));
        }
        Ok(review.clone())
    }

    fn close_review(&mut self, review_id: Uuid, status: ReviewStatus, customer_id: Uuid) {
        if let Some(review) = self.reviews.get_mut(&review_id) {
            review.status = status;
            review.resolved_customer_id = Some(customer_id);
            review.resolved_at = Some(Utc::now());
        }
    }
}

/// In-process store for tests and database-less environments.
///
/// A single `RwLock` makes every write atomic, which gives the same
/// uniqueness and version guarantees the Postgres store gets from its
/// constraints and conditional updates.
#[derive(Default)]
pub struct MemoryLeadStore {
    state: RwLock<MemoryState>,
}

impl MemoryLeadStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a customer directly, bypassing ingestion. Used for seeding.
    pub async fn insert_customer(&self, record: CustomerRecord) {
        self.state.write().await.customers.insert(record.id, record);
    }

    pub async fn customer_count(&self) -> usize {
        self.state.read().await.customers.len()
    }

    pub async fn customers(&self) -> Vec<CustomerRecord> {
        self.state.read().await.customers.values().cloned().collect()
    }
}

fn matches_any(lead: &CanonicalLead, record: &CustomerRecord) -> bool {
    let eq = |a: &Option<String>, b: &Option<String>, norm: fn(&str) -> Option<String>| {
        match (a.as_deref().and_then(norm), b.as_deref().and_then(norm)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        }
    };
    eq(&lead.email, &record.email, normalize_email)
        || eq(&lead.phone, &record.phone, normalize_phone)
        || eq(&lead.last_name, &record.last_name, normalize_name)
}

#[async_trait]
impl LeadStore for MemoryLeadStore {
    async fn find_candidates(&self, lead: &CanonicalLead) -> StoreResult<Vec<CustomerRecord>> {
        let state = self.state.read().await;
        Ok(state
            .customers
            .values()
            .filter(|record| matches_any(lead, record))
            .cloned()
            .collect())
    }

    async fn get_customer(&self, id: Uuid) -> StoreResult<Option<CustomerRecord>> {
        Ok(self.state.read().await.customers.get(&id).cloned())
    }

    async fn create_customer(&self, lead: &CanonicalLead) -> StoreResult<CustomerRecord> {
        let key = lead.key();
        let mut state = self.state.write().await;
        state.ensure_new(&key)?;

        let record = CustomerRecord::from_lead(lead, Utc::now());
        state
            .outcomes
            .insert(key.clone(), IngestOutcome::created(&record, &key));
        state.customers.insert(record.id, record.clone());
        Ok(record)
    }

    async fn merge_into(
        &self,
        target: &MergeTarget,
        lead: &CanonicalLead,
    ) -> StoreResult<CustomerRecord> {
        let key = lead.key();
        let mut state = self.state.write().await;
        state.ensure_new(&key)?;

        let record = state.merge(target, lead)?;
        state
            .outcomes
            .insert(key.clone(), IngestOutcome::merged(&key, target));
        Ok(record)
    }

    async fn create_review(
        &self,
        lead: &CanonicalLead,
        candidates: &[MatchCandidate],
    ) -> StoreResult<PendingReview> {
        let review = new_review(lead, candidates)?;
        let key = review.key.clone();
        let mut state = self.state.write().await;
        state.ensure_new(&key)?;

        state.outcomes.insert(key, IngestOutcome::review(&review));
        state.reviews.insert(review.id, review.clone());
        Ok(review)
    }

    async fn get_review(&self, id: Uuid) -> StoreResult<Option<PendingReview>> {
        Ok(self.state.read().await.reviews.get(&id).cloned())
    }

    async fn confirm_review_merge(
        &self,
        review_id: Uuid,
        target: &MergeTarget,
    ) -> StoreResult<CustomerRecord> {
        let mut state = self.state.write().await;
        let review = state.pending_review(review_id)?;

        let record = state.merge(target, &review.lead)?;
        state.outcomes.insert(
            review.key.clone(),
            IngestOutcome::merged(&review.key, target),
        );
        state.close_review(review_id, ReviewStatus::ConfirmedMerge, record.id);
        Ok(record)
    }

    async fn confirm_review_distinct(&self, review_id: Uuid) -> StoreResult<CustomerRecord> {
        let mut state = self.state.write().await;
        let review = state.pending_review(review_id)?;

        let record = CustomerRecord::from_lead(&review.lead, Utc::now());
        state.customers.insert(record.id, record.clone());
        state.outcomes.insert(
            review.key.clone(),
            IngestOutcome::created(&record, &review.key),
        );
        state.close_review(review_id, ReviewStatus::ConfirmedDistinct, record.id);
        Ok(record)
    }

    async fn previous_outcome(&self, key: &IdempotencyKey) -> StoreResult<Option<IngestOutcome>> {
        Ok(self.state.read().await.outcomes.get(key).cloned())
    }
}
