use anyhow::{Context, Result};
use sqlx::{migrate::Migrator, postgres::PgPool};
use tracing::info;

/// Schema for itinerary locks, snapshots, history, collaborators and context records.
pub static MIGRATOR: Migrator = sqlx::migrate!("./src/db/migrations");

pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    MIGRATOR.run(pool).await.context("failed to apply relay postgres migrations")?;
    info!(migrations = MIGRATOR.iter().count(), "relay schema is up to date");
    Ok(())
}
