//! Deterministic, explainable scoring of a canonical lead against existing
//! customers. Pure: the candidate pool is supplied by the caller.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::models::{CanonicalLead, CustomerRecord, ReviewCandidate};

/// Upper bound of any confidence score.
pub const MAX_CONFIDENCE: u8 = 100;

/// Points contributed by each signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct MatchWeights {
    /// Exact, case-insensitive email equality.
    pub email: u8,
    /// Digits-only phone equality.
    pub phone: u8,
    /// Case-insensitive last-name equality.
    pub last_name: u8,
    /// First-name equality; only counted alongside a last-name match.
    pub first_name: u8,
}

impl Default for MatchWeights {
    fn default() -> Self {
        Self {
            email: 90,
            phone: 70,
            last_name: 40,
            first_name: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchSignal {
    Email,
    Phone,
    LastName,
    FirstName,
}

impl MatchSignal {
    fn label(&self) -> &'static str {
        match self {
            MatchSignal::Email => "exact email",
            MatchSignal::Phone => "phone",
            MatchSignal::LastName => "last name",
            MatchSignal::FirstName => "first name",
        }
    }
}

/// One scored customer. Recomputed on every attempt, never persisted as-is.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchCandidate {
    pub customer: CustomerRecord,
    pub confidence: u8,
    pub signals: Vec<MatchSignal>,
    pub reason: String,
}

impl MatchCandidate {
    pub fn summary(&self) -> ReviewCandidate {
        ReviewCandidate {
            customer_id: self.customer.id,
            confidence: self.confidence,
            reason: self.reason.clone(),
        }
    }
}

/// Scores every record in `pool` and returns the non-zero ones, best first.
///
/// Ties go to the most recently created record, then to the lower id so the
/// order is fully deterministic.
pub fn score_candidates(
    lead: &CanonicalLead,
    pool: &[CustomerRecord],
    weights: &MatchWeights,
) -> Vec<MatchCandidate> {
    let mut scored: Vec<MatchCandidate> = pool
        .iter()
        .filter_map(|record| score_one(lead, record, weights))
        .collect();

    scored.sort_by(rank);
    scored
}

fn rank(a: &MatchCandidate, b: &MatchCandidate) -> Ordering {
    b.confidence
        .cmp(&a.confidence)
        .then_with(|| b.customer.created_at.cmp(&a.customer.created_at))
        .then_with(|| a.customer.id.cmp(&b.customer.id))
}

/// Scores a single record; `None` when nothing but (at most) a first name matches.
pub fn score_one(
    lead: &CanonicalLead,
    record: &CustomerRecord,
    weights: &MatchWeights,
) -> Option<MatchCandidate> {
    let mut signals = Vec::new();

    if same(&lead.email, &record.email, normalize_email) {
        signals.push(MatchSignal::Email);
    }
    if same(&lead.phone, &record.phone, normalize_phone) {
        signals.push(MatchSignal::Phone);
    }
    let last_name_match = same(&lead.last_name, &record.last_name, normalize_name);
    if last_name_match {
        signals.push(MatchSignal::LastName);
        if same(&lead.first_name, &record.first_name, normalize_name) {
            signals.push(MatchSignal::FirstName);
        }
    }

    let total: u32 = signals
        .iter()
        .map(|s| u32::from(weight(weights, *s)))
        .sum();
    let confidence = total.min(u32::from(MAX_CONFIDENCE)) as u8;
    if confidence == 0 {
        return None;
    }

    Some(MatchCandidate {
        customer: record.clone(),
        confidence,
        reason: describe(&signals),
        signals,
    })
}

fn weight(weights: &MatchWeights, signal: MatchSignal) -> u8 {
    match signal {
        MatchSignal::Email => weights.email,
        MatchSignal::Phone => weights.phone,
        MatchSignal::LastName => weights.last_name,
        MatchSignal::FirstName => weights.first_name,
    }
}

/// "exact email match", "phone + last name match", ...
fn describe(signals: &[MatchSignal]) -> String {
    let labels: Vec<&str> = signals.iter().map(MatchSignal::label).collect();
    format!("{} match", labels.join(" + "))
}

fn same(a: &Option<String>, b: &Option<String>, norm: fn(&str) -> Option<String>) -> bool {
    match (a.as_deref().and_then(norm), b.as_deref().and_then(norm)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

pub fn normalize_email(raw: &str) -> Option<String> {
    let email = raw.trim().to_lowercase();
    (!email.is_empty()).then_some(email)
}

/// Digits only; a leading `00` international prefix is dropped so
/// `+55 11 ...` and `0055 11 ...` compare equal.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    let digits = digits.strip_prefix("00").unwrap_or(&digits);
    (!digits.is_empty()).then(|| digits.to_string())
}

pub fn normalize_name(raw: &str) -> Option<String> {
    let name = raw.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase();
    (!name.is_empty()).then_some(name)
}
