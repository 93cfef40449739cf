use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::IngestError;
use crate::models::{FieldData, InboundLeadEvent, LeadProvenance};

pub const GOOGLE_ADS_PROVIDER: &str = "google_ads";

// ============ Lead webhook ============

/// Lead webhook body: `{"object": "<provider>", "entry": [...]}`.
///
/// Entries are kept as raw JSON so one malformed entry is rejected on its
/// own instead of failing the whole delivery.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LeadWebhookPayload {
    /// Provider name; becomes the first half of every entry's idempotency key.
    pub object: String,

    #[serde(default)]
    pub entry: Vec<Value>,
}

/// One lead notification inside a webhook delivery.
#[derive(Debug, Clone, Deserialize)]
pub struct LeadEntry {
    /// Provider lead id. Some providers send it as `id`.
    #[serde(default, alias = "id")]
    pub leadgen_id: Option<Value>,

    /// RFC 3339 string, `+0000`-offset string or unix seconds.
    #[serde(default)]
    pub created_time: Option<Value>,

    #[serde(default)]
    pub form_id: Option<Value>,
    #[serde(default)]
    pub campaign_id: Option<Value>,
    #[serde(default)]
    pub adset_id: Option<Value>,
    #[serde(default)]
    pub ad_id: Option<Value>,

    /// Absent in bare notifications; fields are then fetched by lead id.
    #[serde(default)]
    pub field_data: Option<Vec<FieldData>>,
}

/// An entry that passed structural validation. `needs_fetch` is set when
/// the provider sent no field list.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedEntry {
    pub event: InboundLeadEvent,
    pub needs_fetch: bool,
}

impl LeadWebhookPayload {
    pub fn provider(&self) -> Result<&str, IngestError> {
        let provider = self.object.trim();
        if provider.is_empty() {
            return Err(IngestError::MalformedPayload(
                "webhook 'object' (provider) is empty".to_string(),
            ));
        }
        Ok(provider)
    }

    /// Validates each entry independently, preserving delivery order.
    pub fn into_entries(self) -> Result<Vec<Result<ParsedEntry, IngestError>>, IngestError> {
        let provider = self.provider()?.to_string();
        Ok(self
            .entry
            .into_iter()
            .map(|raw| parse_entry(&provider, raw))
            .collect())
    }
}

fn parse_entry(provider: &str, raw: Value) -> Result<ParsedEntry, IngestError> {
    let entry: LeadEntry = serde_json::from_value(raw.clone())
        .map_err(|e| IngestError::MalformedPayload(format!("invalid lead entry: {}", e)))?;

    let lead_id = entry
        .leadgen_id
        .as_ref()
        .and_then(id_string)
        .ok_or_else(|| IngestError::MalformedPayload("lead entry has no lead id".to_string()))?;

    let created_time = match entry.created_time.as_ref() {
        Some(value) => parse_created_time(value)?,
        None => {
            return Err(IngestError::MalformedPayload(format!(
                "lead {} has no created_time",
                lead_id
            )))
        }
    };

    let provenance = LeadProvenance {
        provider: provider.to_string(),
        lead_id,
        form_id: entry.form_id.as_ref().and_then(id_string),
        campaign_id: entry.campaign_id.as_ref().and_then(id_string),
        adset_id: entry.adset_id.as_ref().and_then(id_string),
        ad_id: entry.ad_id.as_ref().and_then(id_string),
        created_time,
    };

    let needs_fetch = entry.field_data.is_none();
    Ok(ParsedEntry {
        event: InboundLeadEvent {
            provenance,
            field_data: entry.field_data.unwrap_or_default(),
            raw,
        },
        needs_fetch,
    })
}

/// Provider ids arrive as strings or as bare JSON numbers.
fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn parse_created_time(value: &Value) -> Result<DateTime<Utc>, IngestError> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .ok_or_else(|| {
                IngestError::MalformedPayload(format!("created_time {} is out of range", n))
            }),
        Value::String(s) => parse_timestamp(s.trim()),
        other => Err(IngestError::MalformedPayload(format!(
            "created_time must be a string or unix seconds, got {}",
            other
        ))),
    }
}

/// Parses provider timestamps, trying the formats seen in the wild in turn.
pub fn parse_timestamp(timestamp_str: &str) -> Result<DateTime<Utc>, IngestError> {
    // Try ISO 8601 / RFC3339 format first (standard)
    chrono::DateTime::parse_from_rfc3339(timestamp_str)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            // Lead ads style: 2024-05-01T10:00:00+0000
            chrono::DateTime::parse_from_str(timestamp_str, "%Y-%m-%dT%H:%M:%S%z")
                .map(|dt| dt.with_timezone(&Utc))
        })
        .or_else(|_| {
            chrono::DateTime::parse_from_str(timestamp_str, "%Y-%m-%d %H:%M:%S%.f %z")
                .map(|dt| dt.with_timezone(&Utc))
        })
        .or_else(|_| {
            // Naive datetime, assume UTC
            chrono::NaiveDateTime::parse_from_str(timestamp_str, "%Y-%m-%d %H:%M:%S%.f")
                .map(|ndt| DateTime::<Utc>::from_naive_utc_and_offset(ndt, Utc))
        })
        .or_else(|e| {
            timestamp_str
                .parse::<i64>()
                .ok()
                .and_then(|secs| DateTime::from_timestamp(secs, 0))
                .ok_or(e)
        })
        .map_err(|e| {
            IngestError::MalformedPayload(format!(
                "Invalid timestamp format '{}': {}. Expected ISO 8601 (RFC3339) or unix seconds",
                timestamp_str, e
            ))
        })
}

/// Response body for a lead webhook delivery.
#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub status: String,
    pub received: usize,
    pub processed: usize,
    pub duplicates: usize,
    pub failed: usize,
    pub results: Vec<crate::pipeline::EventReport>,
}

// ============ Google Ads lead forms ============

/// Google Ads Lead Form webhook payload
/// Documentation: https://developers.google.com/google-ads/api/docs/leads/webhooks
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GoogleAdsWebhookPayload {
    /// Unique lead identifier (used for deduplication)
    pub lead_id: String,

    #[serde(default)]
    pub api_version: Option<String>,

    pub form_id: i64,

    pub campaign_id: i64,

    #[serde(default)]
    pub adgroup_id: Option<i64>,

    #[serde(default)]
    pub creative_id: Option<i64>,

    /// Google Click ID (gcl_id) for conversion tracking
    #[serde(default)]
    pub gcl_id: Option<String>,

    /// Webhook verification key (REQUIRED for security)
    pub google_key: String,

    #[serde(default)]
    pub is_test: bool,

    /// Dynamic form fields submitted by the user
    #[serde(default)]
    pub user_column_data: Vec<UserColumnData>,
}

/// Individual form field data
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UserColumnData {
    /// Column identifier (e.g., "FULL_NAME", "EMAIL", "PHONE_NUMBER")
    pub column_id: String,

    #[serde(default)]
    pub column_name: Option<String>,

    #[serde(default)]
    pub string_value: String,
}

impl GoogleAdsWebhookPayload {
    /// Maps the form columns into the common field list. Column ids are kept
    /// as field names; the normalizer matches them case-insensitively.
    pub fn field_data(&self) -> Vec<FieldData> {
        self.user_column_data
            .iter()
            .map(|column| FieldData::new(column.column_id.clone(), column.string_value.clone()))
            .collect()
    }

    /// Converts the payload into a pipeline event. Google sends no submission
    /// timestamp, so receipt time stands in for it.
    pub fn into_event(self, received_at: DateTime<Utc>) -> Result<InboundLeadEvent, IngestError> {
        let lead_id = self.lead_id.trim().to_string();
        if lead_id.is_empty() {
            return Err(IngestError::MalformedPayload(
                "Google Ads lead has no lead_id".to_string(),
            ));
        }

        let field_data = self.field_data();
        let mut raw = serde_json::to_value(&self)
            .map_err(|e| IngestError::MalformedPayload(e.to_string()))?;
        // The verification key has no business in persisted payloads
        if let Some(obj) = raw.as_object_mut() {
            obj.remove("google_key");
        }

        Ok(InboundLeadEvent {
            provenance: LeadProvenance {
                provider: GOOGLE_ADS_PROVIDER.to_string(),
                lead_id,
                form_id: Some(self.form_id.to_string()),
                campaign_id: Some(self.campaign_id.to_string()),
                adset_id: self.adgroup_id.map(|id| id.to_string()),
                ad_id: self.creative_id.map(|id| id.to_string()),
                created_time: received_at,
            },
            field_data,
            raw,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn payload(entries: Value) -> LeadWebhookPayload {
        serde_json::from_value(json!({ "object": "page", "entry": entries })).unwrap()
    }

    #[test]
    fn test_parse_entry_with_fields() {
        let entries = payload(json!([{
            "leadgen_id": "L-100",
            "created_time": "2024-05-01T10:00:00+0000",
            "form_id": 42,
            "field_data": [{"name": "email", "values": ["jane@x.com"]}]
        }]))
        .into_entries()
        .unwrap();

        let parsed = entries.into_iter().next().unwrap().unwrap();
        assert!(!parsed.needs_fetch);
        assert_eq!(parsed.event.provenance.lead_id, "L-100");
        assert_eq!(parsed.event.provenance.form_id.as_deref(), Some("42"));
        assert_eq!(
            parsed.event.provenance.created_time,
            Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap()
        );
        assert_eq!(parsed.event.field_data.len(), 1);
    }

    #[test]
    fn test_bare_notification_needs_fetch() {
        let entries = payload(json!([{ "id": 9001, "created_time": 1714557600 }]))
            .into_entries()
            .unwrap();

        let parsed = entries.into_iter().next().unwrap().unwrap();
        assert!(parsed.needs_fetch);
        assert_eq!(parsed.event.provenance.lead_id, "9001");
        assert_eq!(parsed.event.provenance.created_time.timestamp(), 1714557600);
    }

    #[test]
    fn test_bad_entries_rejected_individually() {
        let entries = payload(json!([
            { "created_time": "2024-05-01T10:00:00Z" },
            { "leadgen_id": "L-2", "created_time": "yesterday" },
            { "leadgen_id": "L-3" },
            { "leadgen_id": "L-4", "created_time": "2024-05-01T10:00:00Z" }
        ]))
        .into_entries()
        .unwrap();

        assert_eq!(entries.len(), 4);
        for rejected in &entries[..3] {
            assert!(matches!(rejected, Err(IngestError::MalformedPayload(_))));
        }
        assert!(entries[3].is_ok());
    }

    #[test]
    fn test_empty_provider_is_malformed() {
        let payload: LeadWebhookPayload =
            serde_json::from_value(json!({ "object": "  ", "entry": [] })).unwrap();
        assert!(matches!(
            payload.into_entries(),
            Err(IngestError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2025, 1, 1, 12, 30, 0).unwrap();
        for input in [
            "2025-01-01T12:30:00Z",
            "2025-01-01T12:30:00+0000",
            "2025-01-01 12:30:00 +0000",
            "2025-01-01 12:30:00",
            "1735734600",
        ] {
            assert_eq!(parse_timestamp(input).unwrap(), expected, "{}", input);
        }
        assert!(parse_timestamp("not a date").is_err());
    }

    #[test]
    fn test_google_ads_payload_into_event() {
        let payload: GoogleAdsWebhookPayload = serde_json::from_value(json!({
            "lead_id": "G-1",
            "api_version": "1.0",
            "form_id": 123,
            "campaign_id": 456,
            "google_key": "secret",
            "is_test": true,
            "user_column_data": [
                {"column_id": "FULL_NAME", "column_name": "Full Name", "string_value": "João Silva"},
                {"column_id": "EMAIL", "string_value": "joao@example.com"}
            ]
        }))
        .unwrap();

        let now = Utc::now();
        let event = payload.into_event(now).unwrap();
        assert_eq!(event.provenance.provider, GOOGLE_ADS_PROVIDER);
        assert_eq!(event.provenance.campaign_id.as_deref(), Some("456"));
        assert_eq!(event.provenance.created_time, now);
        assert_eq!(event.field_data[0], FieldData::new("FULL_NAME", "João Silva"));
        assert!(event.raw.get("google_key").is_none());
    }
}
