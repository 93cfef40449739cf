use serde::Deserialize;
use std::time::Duration;

use crate::errors::AppError;
use crate::models::FieldData;

/// Fields requested from the Graph API for a single lead.
const GRAPH_LEAD_FIELDS: &str = "id,created_time,field_data";

/// Where field data comes from when a webhook entry only carries a lead id.
#[derive(Clone)]
pub enum LeadFetcher {
    /// Live Graph API lookups.
    Graph(GraphLeadClient),
    /// Deterministic fake fields. Never touches the network.
    Mock,
}

impl LeadFetcher {
    pub fn mode(&self) -> &'static str {
        match self {
            LeadFetcher::Graph(_) => "graph",
            LeadFetcher::Mock => "mock",
        }
    }

    pub async fn fetch_field_data(&self, lead_id: &str) -> Result<Vec<FieldData>, AppError> {
        match self {
            LeadFetcher::Graph(client) => client.fetch_field_data(lead_id).await,
            LeadFetcher::Mock => {
                tracing::debug!("Mock lead fetch for {}", lead_id);
                Ok(mock_field_data(lead_id))
            }
        }
    }
}

impl std::fmt::Debug for LeadFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeadFetcher::Graph(client) => f
                .debug_struct("Graph")
                .field("base_url", &client.base_url)
                .finish(),
            LeadFetcher::Mock => f.write_str("Mock"),
        }
    }
}

pub fn mock_field_data(lead_id: &str) -> Vec<FieldData> {
    vec![
        FieldData::new("full_name", "Test Lead"),
        FieldData::new("email", format!("test-lead-{}@example.com", lead_id)),
    ]
}

#[derive(Debug, Deserialize)]
struct GraphLeadResponse {
    #[serde(default)]
    field_data: Vec<FieldData>,
}

/// Client for the Graph API lead endpoint.
#[derive(Clone)]
pub struct GraphLeadClient {
    client: reqwest::Client,
    base_url: String,
    access_token: String,
}

impl GraphLeadClient {
    /// Creates a new `GraphLeadClient`.
    ///
    /// # Arguments
    ///
    /// * `base_url` - Graph API base URL including the version segment.
    /// * `access_token` - Page access token.
    pub fn new(base_url: String, access_token: String) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| {
                AppError::ExternalApiError(format!("Failed to create Graph client: {}", e))
            })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token,
        })
    }

    /// Gets the submitted form fields of a lead.
    pub async fn fetch_field_data(&self, lead_id: &str) -> Result<Vec<FieldData>, AppError> {
        let url = format!("{}/{}", self.base_url, lead_id);
        tracing::info!("Fetching lead {} from Graph API", lead_id);

        let response = self
            .client
            .get(&url)
            .query(&[
                ("fields", GRAPH_LEAD_FIELDS),
                ("access_token", self.access_token.as_str()),
            ])
            .send()
            .await
            .map_err(|e| {
                AppError::ExternalApiError(format!("Graph request failed: {}", e.without_url()))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AppError::ExternalApiError(format!(
                "Graph API returned {} for lead {}: {}",
                status, lead_id, error_text
            )));
        }

        let data: GraphLeadResponse = response.json().await.map_err(|e| {
            AppError::ExternalApiError(format!("Failed to parse Graph response: {}", e))
        })?;

        tracing::debug!(
            "Graph API returned {} field(s) for lead {}",
            data.field_data.len(),
            lead_id
        );
        Ok(data.field_data)
    }
}
