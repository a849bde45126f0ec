//! Brewtrack Shared
//!
//! Database plumbing and constants used by both the API server and the
//! sweep scheduler.

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

/// Header carrying the shared secret on `/internal/*` requests
pub const INTERNAL_ACCESS_HEADER: &str = "X-Internal-Access";

/// Create the PostgreSQL connection pool used for regular queries.
pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    tracing::info!("Connecting to PostgreSQL...");

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await?;

    tracing::info!("Successfully connected to PostgreSQL");
    Ok(pool)
}

/// Pool with longer timeouts and a single connection, for running migrations
/// against a direct (non-pooled) database URL.
pub async fn create_migration_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(120))
        .connect(database_url)
        .await
}

/// Apply the embedded migrations in `crates/shared/migrations`.
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("Database migrations completed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_header_is_valid_header_name() {
        assert!(INTERNAL_ACCESS_HEADER
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-'));
    }

    #[tokio::test]
    #[ignore] // Requires running PostgreSQL
    async fn test_create_pool() {
        let url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/brewtrack_test".to_string());
        assert!(create_pool(&url).await.is_ok());
    }
}
