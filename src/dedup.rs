//! Turns scored candidates into a resolution, and owns the merge rule.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::matching::{MatchCandidate, MAX_CONFIDENCE};
use crate::models::{CanonicalLead, CustomerRecord, MergeTarget};

/// Cut points applied to the top candidate's confidence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(try_from = "RawThresholds")]
pub struct MatchThresholds {
    auto_merge: u8,
    review: u8,
}

#[derive(Deserialize)]
struct RawThresholds {
    auto_merge: u8,
    review: u8,
}

impl TryFrom<RawThresholds> for MatchThresholds {
    type Error = InvalidThresholds;

    fn try_from(raw: RawThresholds) -> Result<Self, Self::Error> {
        MatchThresholds::new(raw.auto_merge, raw.review)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidThresholds(String);

impl fmt::Display for InvalidThresholds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for InvalidThresholds {}

impl MatchThresholds {
    pub const DEFAULT_AUTO_MERGE: u8 = 90;
    pub const DEFAULT_REVIEW: u8 = 60;

    pub fn new(auto_merge: u8, review: u8) -> Result<Self, InvalidThresholds> {
        if auto_merge > MAX_CONFIDENCE || review > MAX_CONFIDENCE {
            return Err(InvalidThresholds(format!(
                "thresholds must be at most {} (auto_merge={}, review={})",
                MAX_CONFIDENCE, auto_merge, review
            )));
        }
        if auto_merge < review {
            return Err(InvalidThresholds(format!(
                "auto_merge threshold ({}) must be >= review threshold ({})",
                auto_merge, review
            )));
        }
        Ok(Self { auto_merge, review })
    }

    pub fn auto_merge(&self) -> u8 {
        self.auto_merge
    }

    pub fn review(&self) -> u8 {
        self.review
    }
}

impl Default for MatchThresholds {
    fn default() -> Self {
        Self {
            auto_merge: Self::DEFAULT_AUTO_MERGE,
            review: Self::DEFAULT_REVIEW,
        }
    }
}

/// What to do with a lead.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Create a new customer.
    NoMatch,
    /// Fold the lead into the top candidate.
    AutoMerge(MatchCandidate),
    /// Park the lead; every candidate at or above the review threshold, best first.
    ReviewRequired(Vec<MatchCandidate>),
}

impl Resolution {
    pub fn label(&self) -> &'static str {
        match self {
            Resolution::NoMatch => "no_match",
            Resolution::AutoMerge(_) => "auto_merge",
            Resolution::ReviewRequired(_) => "review_required",
        }
    }
}

/// Applies the thresholds to candidates already ordered best-first.
pub fn resolve(candidates: &[MatchCandidate], thresholds: &MatchThresholds) -> Resolution {
    let Some(top) = candidates.first() else {
        return Resolution::NoMatch;
    };

    if top.confidence >= thresholds.auto_merge {
        Resolution::AutoMerge(top.clone())
    } else if top.confidence >= thresholds.review {
        Resolution::ReviewRequired(
            candidates
                .iter()
                .filter(|c| c.confidence >= thresholds.review)
                .cloned()
                .collect(),
        )
    } else {
        Resolution::NoMatch
    }
}

/// Merge instruction for the top candidate of an auto-merge.
pub fn merge_target(candidate: &MatchCandidate) -> MergeTarget {
    MergeTarget {
        customer_id: candidate.customer.id,
        expected_version: candidate.customer.version,
        confidence: candidate.confidence,
        reason: candidate.reason.clone(),
    }
}

/// Folds the lead's contact fields into `record`.
///
/// Only empty fields are filled; populated fields are never overwritten and
/// never cleared. The lead reference is appended once. Returns the names of
/// the fields that were filled.
pub fn fold_lead_into(
    record: &mut CustomerRecord,
    lead: &CanonicalLead,
    now: DateTime<Utc>,
) -> Vec<&'static str> {
    let mut filled = Vec::new();

    fill(&mut record.first_name, &lead.first_name, "first_name", &mut filled);
    fill(&mut record.last_name, &lead.last_name, "last_name", &mut filled);
    fill(&mut record.email, &lead.email, "email", &mut filled);
    fill(&mut record.phone, &lead.phone, "phone", &mut filled);

    let lead_ref = lead.lead_ref();
    if !record.lead_refs.contains(&lead_ref) {
        record.lead_refs.push(lead_ref);
    }
    record.version += 1;
    record.updated_at = now;

    filled
}

fn fill(
    target: &mut Option<String>,
    incoming: &Option<String>,
    name: &'static str,
    filled: &mut Vec<&'static str>,
) {
    let empty = target.as_deref().map_or(true, |v| v.trim().is_empty());
    if !empty {
        return;
    }
    if let Some(value) = incoming.as_deref().filter(|v| !v.trim().is_empty()) {
        *target = Some(value.to_string());
        filled.push(name);
    }
}
