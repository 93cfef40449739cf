use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use std::collections::HashMap;
use uuid::Uuid;

use super::{new_review, LeadStore, StoreResult};
use crate::errors::StoreError;
use crate::matching::{normalize_email, normalize_name, normalize_phone, MatchCandidate};
use crate::models::{
    CanonicalLead, CustomerRecord, IdempotencyKey, IngestOutcome, LeadRef, MergeTarget,
    PendingReview, ReviewCandidate, ReviewStatus,
};

const CUSTOMER_COLUMNS: &str =
    "id, first_name, last_name, email, phone, version, created_at, updated_at";

#[derive(Debug, FromRow)]
struct CustomerRow {
    id: Uuid,
    first_name: Option<String>,
    last_name: Option<String>,
    email: Option<String>,
    phone: Option<String>,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl CustomerRow {
    fn into_record(self, lead_refs: Vec<LeadRef>) -> CustomerRecord {
        CustomerRecord {
            id: self.id,
            first_name: self.first_name,
            last_name: self.last_name,
            email: self.email,
            phone: self.phone,
            version: self.version,
            created_at: self.created_at,
            updated_at: self.updated_at,
            lead_refs,
        }
    }
}

#[derive(Debug, FromRow)]
struct SourceRow {
    customer_id: Uuid,
    provider: String,
    lead_id: String,
}

#[derive(Debug, FromRow)]
struct ReviewRow {
    id: Uuid,
    provider: String,
    lead_id: String,
    canonical_lead: Json<CanonicalLead>,
    candidates: Json<Vec<ReviewCandidate>>,
    status: String,
    resolved_customer_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    resolved_at: Option<DateTime<Utc>>,
}

impl ReviewRow {
    fn into_review(self) -> StoreResult<PendingReview> {
        let status = ReviewStatus::parse(&self.status).ok_or_else(|| {
            StoreError::Fatal(format!("review {} has unknown status '{}'", self.id, self.status))
        })?;
        Ok(PendingReview {
            id: self.id,
            key: IdempotencyKey::new(self.provider, self.lead_id),
            lead: self.canonical_lead.0,
            candidates: self.candidates.0,
            status,
            resolved_customer_id: self.resolved_customer_id,
            created_at: self.created_at,
            resolved_at: self.resolved_at,
        })
    }
}

/// Postgres-backed store.
///
/// Idempotency rides on the `lead_ingestions` primary key: each completing
/// write claims the key first, inside the same transaction as the customer
/// change, so a lost race rolls back cleanly. Merges are conditional on the
/// customer's `version` column.
#[derive(Clone)]
pub struct PgLeadStore {
    pool: PgPool,
    candidate_limit: i64,
}

impl PgLeadStore {
    pub fn new(pool: PgPool, candidate_limit: usize) -> Self {
        Self {
            pool,
            candidate_limit: candidate_limit.max(1) as i64,
        }
    }

    async fn lead_refs(&self, customer_ids: &[Uuid]) -> StoreResult<HashMap<Uuid, Vec<LeadRef>>> {
        let rows = sqlx::query_as::<_, SourceRow>(
            r#"
            SELECT customer_id, provider, lead_id
            FROM lead_customer_sources
            WHERE customer_id = ANY($1)
            ORDER BY linked_at ASC
            "#,
        )
        .bind(customer_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut refs: HashMap<Uuid, Vec<LeadRef>> = HashMap::new();
        for row in rows {
            refs.entry(row.customer_id).or_default().push(LeadRef {
                provider: row.provider,
                lead_id: row.lead_id,
            });
        }
        Ok(refs)
    }

    async fn with_refs(&self, rows: Vec<CustomerRow>) -> StoreResult<Vec<CustomerRecord>> {
        let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();
        let mut refs = self.lead_refs(&ids).await?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let lead_refs = refs.remove(&row.id).unwrap_or_default();
                row.into_record(lead_refs)
            })
            .collect())
    }
}

/// Claims the idempotency key for this transaction.
async fn claim_ingestion(
    tx: &mut Transaction<'_, Postgres>,
    lead: &CanonicalLead,
    outcome: &IngestOutcome,
) -> StoreResult<()> {
    let key = lead.key();
    let result = sqlx::query(
        r#"
        INSERT INTO lead_ingestions (provider, lead_id, canonical_lead, outcome)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (provider, lead_id) DO NOTHING
        "#,
    )
    .bind(&key.provider)
    .bind(&key.lead_id)
    .bind(Json(lead))
    .bind(Json(outcome))
    .execute(&mut **tx)
    .await?;

    if result.rows_affected() == 0 {
        return Err(StoreError::AlreadyIngested(key));
    }
    Ok(())
}

async fn replace_outcome(
    tx: &mut Transaction<'_, Postgres>,
    key: &IdempotencyKey,
    outcome: &IngestOutcome,
) -> StoreResult<()> {
    sqlx::query(
        r#"
        UPDATE lead_ingestions
        SET outcome = $3, updated_at = now()
        WHERE provider = $1 AND lead_id = $2
        "#,
    )
    .bind(&key.provider)
    .bind(&key.lead_id)
    .bind(Json(outcome))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn link_source(
    tx: &mut Transaction<'_, Postgres>,
    lead: &CanonicalLead,
    customer_id: Uuid,
    link_kind: &str,
    target: Option<&MergeTarget>,
) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO lead_customer_sources (provider, lead_id, customer_id, link_kind, confidence, reason)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (provider, lead_id) DO NOTHING
        "#,
    )
    .bind(&lead.provenance.provider)
    .bind(&lead.provenance.lead_id)
    .bind(customer_id)
    .bind(link_kind)
    .bind(target.map(|t| i16::from(t.confidence)))
    .bind(target.map(|t| t.reason.as_str()))
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_customer(
    tx: &mut Transaction<'_, Postgres>,
    record: &CustomerRecord,
) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO lead_customers (id, first_name, last_name, email, phone, phone_digits, version, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(record.id)
    .bind(&record.first_name)
    .bind(&record.last_name)
    .bind(&record.email)
    .bind(&record.phone)
    .bind(record.phone.as_deref().and_then(normalize_phone))
    .bind(record.version)
    .bind(record.created_at)
    .bind(record.updated_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Versioned fill-only-empty update. `VersionConflict` when the row moved on.
async fn merge_customer(
    tx: &mut Transaction<'_, Postgres>,
    target: &MergeTarget,
    lead: &CanonicalLead,
) -> StoreResult<CustomerRow> {
    let updated = sqlx::query_as::<_, CustomerRow>(&format!(
        r#"
        UPDATE lead_customers SET
            first_name = CASE WHEN NULLIF(btrim(first_name), '') IS NULL THEN COALESCE($3, first_name) ELSE first_name END,
            last_name = CASE WHEN NULLIF(btrim(last_name), '') IS NULL THEN COALESCE($4, last_name) ELSE last_name END,
            email = CASE WHEN NULLIF(btrim(email), '') IS NULL THEN COALESCE($5, email) ELSE email END,
            phone = CASE WHEN NULLIF(btrim(phone), '') IS NULL THEN COALESCE($6, phone) ELSE phone END,
            phone_digits = CASE WHEN NULLIF(btrim(phone), '') IS NULL THEN COALESCE($7, phone_digits) ELSE phone_digits END,
            version = version + 1,
            updated_at = now()
        WHERE id = $1 AND version = $2
        RETURNING {}
        "#,
        CUSTOMER_COLUMNS
    ))
    .bind(target.customer_id)
    .bind(target.expected_version)
    .bind(&lead.first_name)
    .bind(&lead.last_name)
    .bind(&lead.email)
    .bind(&lead.phone)
    .bind(lead.phone.as_deref().and_then(normalize_phone))
    .fetch_optional(&mut **tx)
    .await?;

    if let Some(row) = updated {
        return Ok(row);
    }

    let exists =
        sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM lead_customers WHERE id = $1)")
            .bind(target.customer_id)
            .fetch_one(&mut **tx)
            .await?;

    if exists {
        Err(StoreError::VersionConflict {
            customer_id: target.customer_id,
        })
    } else {
        Err(StoreError::NotFound(format!("customer {}", target.customer_id)))
    }
}

async fn lock_pending_review(
    tx: &mut Transaction<'_, Postgres>,
    review_id: Uuid,
) -> StoreResult<PendingReview> {
    let row = sqlx::query_as::<_, ReviewRow>(
        r#"
        SELECT id, provider, lead_id, canonical_lead, candidates, status,
               resolved_customer_id, created_at, resolved_at
        FROM lead_reviews
        WHERE id = $1
        FOR UPDATE
        "#,
    )
    .bind(review_id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or_else(|| StoreError::NotFound(format!("review {}", review_id)))?;

    let review = row.into_review()?;
    if review.status != ReviewStatus::Pending {
        return Err(StoreError::ReviewClosed(review_id));
    }
    Ok(review)
}

async fn close_review(
    tx: &mut Transaction<'_, Postgres>,
    review_id: Uuid,
    status: ReviewStatus,
    customer_id: Uuid,
) -> StoreResult<()> {
    sqlx::query(
        r#"
        UPDATE lead_reviews
        SET status = $2, resolved_customer_id = $3, resolved_at = now()
        WHERE id = $1
        "#,
    )
    .bind(review_id)
    .bind(status.as_str())
    .bind(customer_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[async_trait]
impl LeadStore for PgLeadStore {
    /// Email and phone matches are always returned; only rows sharing just
    /// the last name are capped at `candidate_limit`, newest first.
    async fn find_candidates(&self, lead: &CanonicalLead) -> StoreResult<Vec<CustomerRecord>> {
        let email = lead.email.as_deref().and_then(normalize_email);
        let phone = lead.phone.as_deref().and_then(normalize_phone);
        let last_name = lead.last_name.as_deref().and_then(normalize_name);

        if email.is_none() && phone.is_none() && last_name.is_none() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query_as::<_, CustomerRow>(&format!(
            r#"
            SELECT {}
            FROM lead_customers
            WHERE id IN (
                SELECT id FROM lead_customers
                WHERE ($1::text IS NOT NULL AND lower(email) = $1)
                   OR ($2::text IS NOT NULL AND phone_digits = $2)
                UNION
                (SELECT id FROM lead_customers
                 WHERE $3::text IS NOT NULL AND lower(last_name) = $3
                 ORDER BY created_at DESC
                 LIMIT $4)
            )
            ORDER BY created_at DESC
            "#,
            CUSTOMER_COLUMNS
        ))
        .bind(email)
        .bind(phone)
        .bind(last_name)
        .bind(self.candidate_limit)
        .fetch_all(&self.pool)
        .await?;

        tracing::debug!(
            "Candidate pool for {}: {} customer(s)",
            lead.key(),
            rows.len()
        );
        self.with_refs(rows).await
    }

    async fn get_customer(&self, id: Uuid) -> StoreResult<Option<CustomerRecord>> {
        let row = sqlx::query_as::<_, CustomerRow>(&format!(
            "SELECT {} FROM lead_customers WHERE id = $1",
            CUSTOMER_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(self.with_refs(vec![row]).await?.pop()),
            None => Ok(None),
        }
    }

    async fn create_customer(&self, lead: &CanonicalLead) -> StoreResult<CustomerRecord> {
        let key = lead.key();
        let record = CustomerRecord::from_lead(lead, Utc::now());

        let mut tx = self.pool.begin().await?;
        claim_ingestion(&mut tx, lead, &IngestOutcome::created(&record, &key)).await?;
        insert_customer(&mut tx, &record).await?;
        link_source(&mut tx, lead, record.id, "created", None).await?;
        tx.commit().await?;

        tracing::info!("✓ Customer {} created from lead {}", record.id, key);
        Ok(record)
    }

    async fn merge_into(
        &self,
        target: &MergeTarget,
        lead: &CanonicalLead,
    ) -> StoreResult<CustomerRecord> {
        let key = lead.key();

        let mut tx = self.pool.begin().await?;
        claim_ingestion(&mut tx, lead, &IngestOutcome::merged(&key, target)).await?;
        let row = merge_customer(&mut tx, target, lead).await?;
        link_source(&mut tx, lead, row.id, "merged", Some(target)).await?;
        tx.commit().await?;

        tracing::info!(
            "✓ Lead {} merged into customer {} (version {})",
            key,
            row.id,
            row.version
        );
        Ok(self.with_refs(vec![row]).await?.remove(0))
    }

    async fn create_review(
        &self,
        lead: &CanonicalLead,
        candidates: &[MatchCandidate],
    ) -> StoreResult<PendingReview> {
        let review = new_review(lead, candidates)?;

        let mut tx = self.pool.begin().await?;
        claim_ingestion(&mut tx, lead, &IngestOutcome::review(&review)).await?;
        sqlx::query(
            r#"
            INSERT INTO lead_reviews (id, provider, lead_id, canonical_lead, candidates, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(review.id)
        .bind(&review.key.provider)
        .bind(&review.key.lead_id)
        .bind(Json(&review.lead))
        .bind(Json(&review.candidates))
        .bind(review.status.as_str())
        .bind(review.created_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        tracing::info!(
            "⚠️  Lead {} parked for review {} ({} candidate(s))",
            review.key,
            review.id,
            review.candidates.len()
        );
        Ok(review)
    }

    async fn get_review(&self, id: Uuid) -> StoreResult<Option<PendingReview>> {
        let row = sqlx::query_as::<_, ReviewRow>(
            r#"
            SELECT id, provider, lead_id, canonical_lead, candidates, status,
                   resolved_customer_id, created_at, resolved_at
            FROM lead_reviews
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(ReviewRow::into_review).transpose()
    }

    async fn confirm_review_merge(
        &self,
        review_id: Uuid,
        target: &MergeTarget,
    ) -> StoreResult<CustomerRecord> {
        let mut tx = self.pool.begin().await?;
        let review = lock_pending_review(&mut tx, review_id).await?;

        let row = merge_customer(&mut tx, target, &review.lead).await?;
        link_source(&mut tx, &review.lead, row.id, "review_merge", Some(target)).await?;
        replace_outcome(&mut tx, &review.key, &IngestOutcome::merged(&review.key, target)).await?;
        close_review(&mut tx, review_id, ReviewStatus::ConfirmedMerge, row.id).await?;
        tx.commit().await?;

        Ok(self.with_refs(vec![row]).await?.remove(0))
    }

    async fn confirm_review_distinct(&self, review_id: Uuid) -> StoreResult<CustomerRecord> {
        let mut tx = self.pool.begin().await?;
        let review = lock_pending_review(&mut tx, review_id).await?;

        let record = CustomerRecord::from_lead(&review.lead, Utc::now());
        insert_customer(&mut tx, &record).await?;
        link_source(&mut tx, &review.lead, record.id, "review_distinct", None).await?;
        replace_outcome(&mut tx, &review.key, &IngestOutcome::created(&record, &review.key)).await?;
        close_review(&mut tx, review_id, ReviewStatus::ConfirmedDistinct, record.id).await?;
        tx.commit().await?;

        Ok(record)
    }

    async fn previous_outcome(&self, key: &IdempotencyKey) -> StoreResult<Option<IngestOutcome>> {
        let outcome = sqlx::query_scalar::<_, Json<IngestOutcome>>(
            "SELECT outcome FROM lead_ingestions WHERE provider = $1 AND lead_id = $2",
        )
        .bind(&key.provider)
        .bind(&key.lead_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(outcome.map(|json| json.0))
    }
}
