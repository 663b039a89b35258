use anyhow::Result;
use sqlx::SqlitePool;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Embedded child chunks
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS child_chunks (
            id TEXT PRIMARY KEY,
            text TEXT NOT NULL,
            source_file TEXT NOT NULL,
            category TEXT,
            knowledge_type TEXT,
            folder TEXT,
            parent_id TEXT,
            embedding BLOB NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Parent passage payloads
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS parent_blobs (
            id TEXT PRIMARY KEY,
            body BLOB NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Turns parked at the human-approval gate
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS suspended_turns (
            id TEXT PRIMARY KEY,
            body TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_child_chunks_source ON child_chunks(source_file)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_child_chunks_parent ON child_chunks(parent_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
