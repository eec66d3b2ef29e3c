use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every hub table. Idempotent.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Source collections (filled by uploaders, read by the builder)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sources (
            name TEXT PRIMARY KEY,
            version TEXT,
            updated_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS source_documents (
            source TEXT NOT NULL,
            id TEXT NOT NULL,
            body TEXT NOT NULL,
            PRIMARY KEY (source, id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Target collections, one per build
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS collections (
            name TEXT PRIMARY KEY,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS collection_documents (
            collection TEXT NOT NULL,
            id TEXT NOT NULL,
            body TEXT NOT NULL,
            PRIMARY KEY (collection, id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Search indices with their mapping and metadata document
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS indices (
            name TEXT PRIMARY KEY,
            mapping_json TEXT NOT NULL DEFAULT '{}',
            metadata_json TEXT,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_documents (
            idx TEXT NOT NULL,
            id TEXT NOT NULL,
            body TEXT NOT NULL,
            PRIMARY KEY (idx, id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Pipeline metadata
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS builds (
            name TEXT PRIMARY KEY,
            config_name TEXT NOT NULL,
            started_at TEXT NOT NULL,
            record_json TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS diffs (
            id TEXT PRIMARY KEY,
            created_at TEXT NOT NULL,
            report_json TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS patch_sync (
            diff_id TEXT NOT NULL,
            seq INTEGER NOT NULL,
            target TEXT NOT NULL,
            synced_at TEXT NOT NULL,
            PRIMARY KEY (diff_id, seq, target)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS releases (
            id TEXT PRIMARY KEY,
            started_at TEXT NOT NULL,
            release_json TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_builds_config ON builds(config_name, started_at)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_releases_started_at ON releases(started_at)")
        .execute(pool)
        .await?;

    Ok(())
}
