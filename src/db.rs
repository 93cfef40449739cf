use sqlx::{postgres::PgPoolOptions, PgPool};

const SCHEMA: &str = include_str!("../migrations/0001_lead_intake.sql");

pub struct Database {
    pub pool: PgPool,
}

impl Database {
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;

        // Schema is idempotent (IF NOT EXISTS), safe to apply on every start
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        tracing::info!("✓ Lead intake schema applied");

        Ok(Self { pool })
    }
}
