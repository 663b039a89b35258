//! SQLite storage backend.
//!
//! Child chunks live in `child_chunks` with their embedding serialized as a
//! little-endian f32 BLOB; parent payloads live in `parent_blobs`. Nearest
//! neighbor queries scan the candidate rows and score cosine similarity in
//! Rust, which is fine for corpora in the tens of thousands of chunks.

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use crate::gateway::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::models::{Chunk, ChunkMetadata, MetadataFilter};
use crate::store::{BlobStore, ScoredChunk, TurnStore, VectorStore};

pub struct SqliteVectorStore {
    pool: SqlitePool,
}

impl SqliteVectorStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn push_filter(builder: &mut QueryBuilder<'_, Sqlite>, filter: &MetadataFilter) {
    builder.push(" WHERE 1=1");
    if let Some(ref source) = filter.source_file {
        builder.push(" AND source_file = ").push_bind(source.clone());
    }
    if let Some(ref category) = filter.category {
        builder.push(" AND category = ").push_bind(category.clone());
    }
    if let Some(ref kt) = filter.knowledge_type {
        builder.push(" AND knowledge_type = ").push_bind(kt.clone());
    }
    if let Some(ref folder) = filter.folder {
        builder.push(" AND folder = ").push_bind(folder.clone());
    }
}

fn row_to_chunk(row: &sqlx::sqlite::SqliteRow) -> Chunk {
    Chunk {
        id: row.get("id"),
        text: row.get("text"),
        metadata: ChunkMetadata {
            source_file: row.get("source_file"),
            category: row.get("category"),
            knowledge_type: row.get("knowledge_type"),
            folder: row.get("folder"),
        },
        parent_id: row.get("parent_id"),
    }
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    async fn add(&self, chunks: &[Chunk], vectors: &[Vec<f32>]) -> Result<()> {
        if chunks.len() != vectors.len() {
            anyhow::bail!(
                "Chunk/vector count mismatch: {} chunks, {} vectors",
                chunks.len(),
                vectors.len()
            );
        }

        let mut tx = self.pool.begin().await?;
        for (chunk, vector) in chunks.iter().zip(vectors.iter()) {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO child_chunks
                    (id, text, source_file, category, knowledge_type, folder, parent_id, embedding)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(&chunk.text)
            .bind(&chunk.metadata.source_file)
            .bind(&chunk.metadata.category)
            .bind(&chunk.metadata.knowledge_type)
            .bind(&chunk.metadata.folder)
            .bind(&chunk.parent_id)
            .bind(vec_to_blob(vector))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<ScoredChunk>> {
        let mut builder = QueryBuilder::new(
            "SELECT id, text, source_file, category, knowledge_type, folder, parent_id, embedding \
             FROM child_chunks",
        );
        push_filter(&mut builder, filter);

        let rows = builder.build().fetch_all(&self.pool).await?;

        let mut scored: Vec<ScoredChunk> = rows
            .iter()
            .map(|row| {
                let embedding: Vec<u8> = row.get("embedding");
                ScoredChunk {
                    chunk: row_to_chunk(row),
                    similarity: cosine_similarity(vector, &blob_to_vec(&embedding)),
                }
            })
            .collect();
        scored.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        scored.truncate(k);
        Ok(scored)
    }

    async fn get(&self, filter: &MetadataFilter) -> Result<Vec<Chunk>> {
        let mut builder = QueryBuilder::new(
            "SELECT id, text, source_file, category, knowledge_type, folder, parent_id \
             FROM child_chunks",
        );
        push_filter(&mut builder, filter);
        builder.push(" ORDER BY rowid");

        let rows = builder.build().fetch_all(&self.pool).await?;
        Ok(rows.iter().map(row_to_chunk).collect())
    }

    async fn delete_by_metadata(&self, filter: &MetadataFilter) -> Result<Vec<Chunk>> {
        let deleted = self.get(filter).await?;
        if deleted.is_empty() {
            return Ok(deleted);
        }

        let mut builder = QueryBuilder::new("DELETE FROM child_chunks");
        push_filter(&mut builder, filter);
        builder.build().execute(&self.pool).await?;

        Ok(deleted)
    }

    async fn count(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM child_chunks")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }
}

pub struct SqliteBlobStore {
    pool: SqlitePool,
}

impl SqliteBlobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BlobStore for SqliteBlobStore {
    async fn put(&self, id: &str, bytes: &[u8]) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO parent_blobs (id, body) VALUES (?, ?)")
            .bind(id)
            .bind(bytes)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query("SELECT body FROM parent_blobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get("body")))
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM parent_blobs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

pub struct SqliteTurnStore {
    pool: SqlitePool,
}

impl SqliteTurnStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TurnStore for SqliteTurnStore {
    async fn put(&self, turn_id: &str, body: &str) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO suspended_turns (id, body) VALUES (?, ?)")
            .bind(turn_id)
            .bind(body)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn take(&self, turn_id: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT body FROM suspended_turns WHERE id = ?")
            .bind(turn_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                sqlx::query("DELETE FROM suspended_turns WHERE id = ?")
                    .bind(turn_id)
                    .execute(&self.pool)
                    .await?;
                Ok(Some(row.get("body")))
            }
            None => Ok(None),
        }
    }
}
