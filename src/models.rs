use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

// ============ Inbound ============

/// A single named form field as delivered by a lead provider.
///
/// A field may carry several values; only the first one is authoritative.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FieldData {
    pub name: String,
    #[serde(default)]
    pub values: Vec<String>,
}

impl FieldData {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: vec![value.into()],
        }
    }
}

/// Where a lead came from. Carried unchanged from the inbound event into the
/// canonical lead, the ingestion log and the downstream events.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LeadProvenance {
    /// Provider name (e.g. "page", "google_ads").
    pub provider: String,
    /// Opaque provider lead id.
    pub lead_id: String,
    pub form_id: Option<String>,
    pub campaign_id: Option<String>,
    pub adset_id: Option<String>,
    pub ad_id: Option<String>,
    /// When the provider says the lead was submitted.
    pub created_time: DateTime<Utc>,
}

impl LeadProvenance {
    pub fn key(&self) -> IdempotencyKey {
        IdempotencyKey::new(self.provider.clone(), self.lead_id.clone())
    }
}

/// Raw lead event as received from a provider, after structural validation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InboundLeadEvent {
    pub provenance: LeadProvenance,
    pub field_data: Vec<FieldData>,
    /// The provider entry exactly as received, kept for audit.
    pub raw: Value,
}

impl InboundLeadEvent {
    pub fn key(&self) -> IdempotencyKey {
        self.provenance.key()
    }
}

/// Idempotency key for inbound lead events: `(provider, provider lead id)`.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Deserialize, Serialize)]
pub struct IdempotencyKey {
    pub provider: String,
    pub lead_id: String,
}

impl IdempotencyKey {
    pub fn new(provider: impl Into<String>, lead_id: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            lead_id: lead_id.into(),
        }
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider, self.lead_id)
    }
}

// ============ Canonical ============

/// Provider-agnostic projection of a lead's contact fields.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CanonicalLead {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub provenance: LeadProvenance,
    /// Original provider entry, unknown fields included.
    pub raw: Value,
}

impl CanonicalLead {
    pub fn key(&self) -> IdempotencyKey {
        self.provenance.key()
    }

    /// True when no contact field survived normalization.
    pub fn is_empty(&self) -> bool {
        self.first_name.is_none()
            && self.last_name.is_none()
            && self.email.is_none()
            && self.phone.is_none()
    }

    pub fn lead_ref(&self) -> LeadRef {
        LeadRef {
            provider: self.provenance.provider.clone(),
            lead_id: self.provenance.lead_id.clone(),
        }
    }
}

// ============ Customers ============

/// Back-reference from a customer to a lead event that contributed to it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LeadRef {
    pub provider: String,
    pub lead_id: String,
}

/// The enduring customer identity.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CustomerRecord {
    pub id: Uuid,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    /// Optimistic-concurrency counter, bumped on every merge.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub lead_refs: Vec<LeadRef>,
}

impl CustomerRecord {
    /// Builds a brand-new record from a canonical lead.
    pub fn from_lead(lead: &CanonicalLead, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            first_name: lead.first_name.clone(),
            last_name: lead.last_name.clone(),
            email: lead.email.clone(),
            phone: lead.phone.clone(),
            version: 1,
            created_at: now,
            updated_at: now,
            lead_refs: vec![lead.lead_ref()],
        }
    }
}

// ============ Outcomes ============

/// Where a merge should land, and the version the decision was based on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeTarget {
    pub customer_id: Uuid,
    pub expected_version: i64,
    pub confidence: u8,
    pub reason: String,
}

/// Terminal result of ingesting one lead event. Stored per idempotency key
/// so replays can hand back exactly what the first run produced.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IngestOutcome {
    CustomerCreated {
        customer_id: Uuid,
        provider: String,
        lead_id: String,
    },
    CustomerMerged {
        customer_id: Uuid,
        provider: String,
        lead_id: String,
        confidence: u8,
        reason: String,
    },
    ReviewRequired {
        review_id: Uuid,
        /// Top-scoring candidate.
        customer_id: Uuid,
        candidate_ids: Vec<Uuid>,
        provider: String,
        lead_id: String,
    },
}

impl IngestOutcome {
    pub fn created(customer: &CustomerRecord, key: &IdempotencyKey) -> Self {
        IngestOutcome::CustomerCreated {
            customer_id: customer.id,
            provider: key.provider.clone(),
            lead_id: key.lead_id.clone(),
        }
    }

    pub fn merged(key: &IdempotencyKey, target: &MergeTarget) -> Self {
        IngestOutcome::CustomerMerged {
            customer_id: target.customer_id,
            provider: key.provider.clone(),
            lead_id: key.lead_id.clone(),
            confidence: target.confidence,
            reason: target.reason.clone(),
        }
    }

    pub fn review(review: &PendingReview) -> Self {
        let candidate_ids: Vec<Uuid> = review.candidates.iter().map(|c| c.customer_id).collect();
        IngestOutcome::ReviewRequired {
            review_id: review.id,
            customer_id: candidate_ids.first().copied().unwrap_or_default(),
            candidate_ids,
            provider: review.key.provider.clone(),
            lead_id: review.key.lead_id.clone(),
        }
    }

    pub fn customer_id(&self) -> Uuid {
        match self {
            IngestOutcome::CustomerCreated { customer_id, .. }
            | IngestOutcome::CustomerMerged { customer_id, .. }
            | IngestOutcome::ReviewRequired { customer_id, .. } => *customer_id,
        }
    }

    pub fn lead_id(&self) -> &str {
        match self {
            IngestOutcome::CustomerCreated { lead_id, .. }
            | IngestOutcome::CustomerMerged { lead_id, .. }
            | IngestOutcome::ReviewRequired { lead_id, .. } => lead_id,
        }
    }

    /// Short label used in logs and API responses.
    pub fn kind(&self) -> &'static str {
        match self {
            IngestOutcome::CustomerCreated { .. } => "customer_created",
            IngestOutcome::CustomerMerged { .. } => "customer_merged",
            IngestOutcome::ReviewRequired { .. } => "review_required",
        }
    }

    /// Downstream notification for this outcome.
    pub fn event(&self) -> LeadEvent {
        match self {
            IngestOutcome::CustomerCreated {
                customer_id,
                provider,
                lead_id,
            } => LeadEvent::CustomerCreated {
                customer_id: *customer_id,
                provider: provider.clone(),
                lead_id: lead_id.clone(),
            },
            IngestOutcome::CustomerMerged {
                customer_id,
                provider,
                lead_id,
                ..
            } => LeadEvent::CustomerMerged {
                customer_id: *customer_id,
                provider: provider.clone(),
                lead_id: lead_id.clone(),
            },
            IngestOutcome::ReviewRequired {
                review_id,
                customer_id,
                provider,
                lead_id,
                ..
            } => LeadEvent::ReviewRequired {
                review_id: *review_id,
                customer_id: *customer_id,
                provider: provider.clone(),
                lead_id: lead_id.clone(),
            },
        }
    }
}

/// Events published for CRM task automation and UI layers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum LeadEvent {
    CustomerCreated {
        customer_id: Uuid,
        provider: String,
        lead_id: String,
    },
    CustomerMerged {
        customer_id: Uuid,
        provider: String,
        lead_id: String,
    },
    ReviewRequired {
        review_id: Uuid,
        customer_id: Uuid,
        provider: String,
        lead_id: String,
    },
}

// ============ Reviews ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Pending,
    ConfirmedMerge,
    ConfirmedDistinct,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewStatus::Pending => "pending",
            ReviewStatus::ConfirmedMerge => "confirmed_merge",
            ReviewStatus::ConfirmedDistinct => "confirmed_distinct",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ReviewStatus::Pending),
            "confirmed_merge" => Some(ReviewStatus::ConfirmedMerge),
            "confirmed_distinct" => Some(ReviewStatus::ConfirmedDistinct),
            _ => None,
        }
    }
}

/// Persisted summary of one ambiguous candidate.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ReviewCandidate {
    pub customer_id: Uuid,
    pub confidence: u8,
    pub reason: String,
}

/// A lead parked for manual disposition.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PendingReview {
    pub id: Uuid,
    pub key: IdempotencyKey,
    pub lead: CanonicalLead,
    /// Ordered by descending confidence.
    pub candidates: Vec<ReviewCandidate>,
    pub status: ReviewStatus,
    pub resolved_customer_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl PendingReview {
    pub fn is_candidate(&self, customer_id: Uuid) -> bool {
        self.candidates.iter().any(|c| c.customer_id == customer_id)
    }

    pub fn candidate(&self, customer_id: Uuid) -> Option<&ReviewCandidate> {
        self.candidates.iter().find(|c| c.customer_id == customer_id)
    }
}

/// External decision on a pending review.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ReviewDisposition {
    ConfirmMerge { customer_id: Uuid },
    ConfirmDistinct,
}
