//! Provider field lists to canonical leads.
//!
//! The dictionary is fixed and provider-agnostic. Names are compared
//! case-insensitively so upper-case column ids (`FULL_NAME`, `PHONE_NUMBER`)
//! normalize the same way as lower-case form field names.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

use crate::models::{CanonicalLead, FieldData, InboundLeadEvent, LeadProvenance};

fn whitespace_run() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("static regex"))
}

/// Normalizes an inbound event into its canonical lead.
pub fn normalize_event(event: &InboundLeadEvent) -> CanonicalLead {
    normalize(&event.field_data, event.provenance.clone(), event.raw.clone())
}

/// Builds a `CanonicalLead` from a provider field list.
///
/// Never fails: a list with no recognised fields yields a lead whose contact
/// fields are all `None`.
pub fn normalize(fields: &[FieldData], provenance: LeadProvenance, raw: Value) -> CanonicalLead {
    let (split_first, split_last) = match first_value(fields, "full_name") {
        Some(full) => split_full_name(&full),
        None => (None, None),
    };

    let first_name = first_value(fields, "first_name")
        .map(|v| collapse_whitespace(&v))
        .or(split_first);
    let last_name = first_value(fields, "last_name")
        .map(|v| collapse_whitespace(&v))
        .or(split_last);
    let email = first_value(fields, "email");
    let phone = first_value(fields, "phone_number").or_else(|| first_value(fields, "phone"));

    CanonicalLead {
        first_name,
        last_name,
        email,
        phone,
        provenance,
        raw,
    }
}

/// First authoritative value of the first field called `name`, trimmed.
/// Blank values count as absent.
fn first_value(fields: &[FieldData], name: &str) -> Option<String> {
    fields
        .iter()
        .find(|f| f.name.trim().eq_ignore_ascii_case(name))
        .and_then(|f| f.values.first())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Splits on the first whitespace run; everything after it is the last name.
fn split_full_name(full: &str) -> (Option<String>, Option<String>) {
    let full = collapse_whitespace(full);
    match full.split_once(' ') {
        Some((first, rest)) => (Some(first.to_string()), Some(rest.to_string())),
        None if full.is_empty() => (None, None),
        None => (Some(full), None),
    }
}

fn collapse_whitespace(s: &str) -> String {
    whitespace_run().replace_all(s.trim(), " ").into_owned()
}
