use axum::{routing::get, Router};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use clinic_lead_intake::config::{Config, LeadFetchMode};
use clinic_lead_intake::db::Database;
use clinic_lead_intake::handlers::{self, AppState};
use clinic_lead_intake::lead_fetch::{GraphLeadClient, LeadFetcher};
use clinic_lead_intake::pipeline::LeadPipeline;
use clinic_lead_intake::signature::SignatureVerifier;
use clinic_lead_intake::store::{LeadStore, MemoryLeadStore, PgLeadStore};

/// Main entry point for the application.
///
/// Initializes tracing, configuration, the lead store (Postgres when a
/// database URL is configured, in-memory otherwise), the lead fetcher and the
/// ingestion pipeline, then serves the HTTP routes behind CORS, tracing and
/// per-IP rate limiting.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "clinic_lead_intake=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;

    let store: Arc<dyn LeadStore> = match config.database_url.as_deref() {
        Some(url) => {
            let db = Database::new(url).await?;
            tracing::info!("✓ Postgres lead store ready");
            Arc::new(PgLeadStore::new(db.pool, config.candidate_limit))
        }
        None => {
            tracing::warn!(
                "⚠️  DATABASE_URL not set - using in-memory lead store (data is lost on restart)"
            );
            Arc::new(MemoryLeadStore::new())
        }
    };

    let fetcher = match &config.lead_fetch {
        LeadFetchMode::Graph {
            base_url,
            access_token,
        } => {
            let client = GraphLeadClient::new(base_url.clone(), access_token.clone())?;
            tracing::info!("✓ Graph API lead fetcher initialized: {}", base_url);
            LeadFetcher::Graph(client)
        }
        LeadFetchMode::Mock => {
            tracing::warn!("⚠️  Lead fetcher in MOCK mode - bare notifications get test-lead fields");
            LeadFetcher::Mock
        }
    };

    let verifier = SignatureVerifier::new(config.webhook_secret.clone());
    if !verifier.has_secret() {
        tracing::warn!("⚠️  LEAD_WEBHOOK_SECRET not set - webhook signatures will NOT be verified");
    }

    let pipeline = LeadPipeline::new(store, verifier, fetcher, config.pipeline_settings());

    // Log downstream events until a real consumer is wired in
    let mut events = pipeline.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            tracing::info!("📣 Lead event: {:?}", event);
        }
    });

    // Build application state
    let app_state = Arc::new(AppState {
        pipeline,
        config: config.clone(),
    });

    // Configure rate limiter: 10 requests/second per IP, burst of 20
    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(10)
            .burst_size(20)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .ok_or_else(|| anyhow::anyhow!("invalid rate limiter configuration"))?,
    );

    // Webhook and API routes behind the limiter
    let protected_routes = handlers::api_routes().layer(ServiceBuilder::new().layer(
        GovernorLayer {
            config: governor_conf,
        },
    ));

    // Health check bypasses rate limiting
    let app = Router::new()
        .route("/health", get(handlers::health))
        .merge(protected_routes)
        .with_state(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}
