//! Semantic cache: approved question/statement pairs stored in Postgres with
//! a pgvector embedding of the question. Lookups run a single nearest-neighbor
//! scan under cosine distance and only count as hits above the configured
//! similarity threshold.

use crate::config::CacheConfig;
use crate::error::{PilotError, Result};
use crate::llm::GenerationClient;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use std::time::Duration;
use tracing::{debug, info};

/// The nearest cached entry, when it cleared the threshold.
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub question: String,
    pub sql: String,
    pub explanation: String,
    pub similarity: f64,
}

pub struct SemanticCache {
    pool: PgPool,
    dim: usize,
    threshold: f64,
}

/// Hit decision: the nearest neighbor only counts at or above the threshold.
fn clears_threshold(similarity: f64, threshold: f64) -> bool {
    similarity >= threshold
}

/// pgvector input literal: `[v1,v2,...]`.
fn vector_literal(values: &[f32]) -> String {
    let body = values
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(",");
    format!("[{}]", body)
}

impl SemanticCache {
    /// Connect and make sure the backing table exists. Creation is idempotent
    /// so a fresh database works without any migration step.
    pub async fn connect(config: &CacheConfig, dim: usize) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&config.database_url)
            .await?;
        let cache = Self {
            pool,
            dim,
            threshold: config.threshold,
        };
        cache.ensure_schema().await?;
        Ok(cache)
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query("CREATE EXTENSION IF NOT EXISTS vector")
            .execute(&self.pool)
            .await?;
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS semantic_cache (
                 id SERIAL PRIMARY KEY,
                 query_text TEXT NOT NULL,
                 question_text TEXT NOT NULL,
                 explanation_text TEXT NOT NULL,
                 paraphrase_text TEXT NOT NULL,
                 question_embedding vector({}),
                 created_at TIMESTAMPTZ NOT NULL DEFAULT now()
             )",
            self.dim
        ))
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS semantic_cache_embedding_idx
             ON semantic_cache USING ivfflat (question_embedding vector_cosine_ops)
             WITH (lists = 100)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Single nearest neighbor under cosine distance; a hit only when the
    /// similarity clears the threshold.
    pub async fn lookup(
        &self,
        llm: &dyn GenerationClient,
        question: &str,
    ) -> Result<Option<CacheHit>> {
        let embedding = llm.embed(question).await?;
        if embedding.len() != self.dim {
            return Err(PilotError::Cache(format!(
                "embedding dimension mismatch: got {}, expected {}",
                embedding.len(),
                self.dim
            )));
        }

        let row = sqlx::query(
            "SELECT question_text, query_text, explanation_text,
                    1 - (question_embedding <=> $1::vector) AS similarity
             FROM semantic_cache
             ORDER BY question_embedding <=> $1::vector
             LIMIT 1",
        )
        .bind(vector_literal(&embedding))
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            debug!("cache is empty");
            return Ok(None);
        };
        let similarity: f64 = row.try_get("similarity")?;
        if !clears_threshold(similarity, self.threshold) {
            debug!("nearest cached question scored {:.3}; below threshold", similarity);
            return Ok(None);
        }
        Ok(Some(CacheHit {
            question: row.try_get("question_text")?,
            sql: row.try_get("query_text")?,
            explanation: row.try_get("explanation_text")?,
            similarity,
        }))
    }

    /// Store an approved pair. The explanation and paraphrase are derived at
    /// write time so later hits can be presented with context.
    pub async fn store(
        &self,
        llm: &dyn GenerationClient,
        question: &str,
        sql: &str,
    ) -> Result<()> {
        let (explanation, paraphrase) = llm.explain_and_paraphrase(question, sql).await?;
        let embedding = llm.embed(question).await?;
        sqlx::query(
            "INSERT INTO semantic_cache
                 (query_text, question_text, explanation_text, paraphrase_text, question_embedding)
             VALUES ($1, $2, $3, $4, $5::vector)",
        )
        .bind(sql)
        .bind(question)
        .bind(&explanation)
        .bind(&paraphrase)
        .bind(vector_literal(&embedding))
        .execute(&self.pool)
        .await?;
        info!("cached approved statement for question: {}", question);
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_literal_is_bracketed_and_comma_separated() {
        assert_eq!(vector_literal(&[1.0, -0.5, 0.25]), "[1,-0.5,0.25]");
        assert_eq!(vector_literal(&[]), "[]");
    }

    #[test]
    fn hits_require_the_similarity_floor() {
        assert!(clears_threshold(0.85, 0.85));
        assert!(clears_threshold(0.8501, 0.85));
        assert!(!clears_threshold(0.8499, 0.85));
        assert!(!clears_threshold(0.0, 0.85));
    }

    #[test]
    fn raising_the_threshold_never_adds_hits() {
        for similarity in [0.0, 0.5, 0.849, 0.85, 0.99, 1.0] {
            for (low, high) in [(0.5, 0.85), (0.85, 0.9), (0.0, 1.0)] {
                if clears_threshold(similarity, high) {
                    assert!(clears_threshold(similarity, low));
                }
            }
        }
    }
}
