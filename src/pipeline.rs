//! Question-to-answer pipeline: cache probe, schema extraction, generation,
//! rectification, normalization. Each stage hands a typed outcome to the next;
//! the caller gets one [`Answer`] per question.

use crate::backend::BackendAdapter;
use crate::cache::SemanticCache;
use crate::catalog::SchemaCatalog;
use crate::config::AppConfig;
use crate::guard::ExecutionGuard;
use crate::llm::GenerationClient;
use crate::normalize::{should_normalize, ValueNormalizer};
use crate::rectify::RectificationLoop;
use crate::result::ExecutionResult;
use crate::schema::Session;
use tracing::{info, warn};

/// The pipeline's final word on one question.
#[derive(Debug)]
pub struct Answer {
    pub question: String,
    pub sql: String,
    pub result: ExecutionResult,
    /// User-facing guidance when the result is empty or degraded.
    pub suggestion: Option<String>,
    /// Literal substitutions performed by the normalizer.
    pub replacements: Vec<String>,
    pub from_cache: bool,
    /// Stored explanation, present on cache hits.
    pub explanation: Option<String>,
}

pub struct Pipeline {
    adapter: Box<dyn BackendAdapter>,
    llm: Box<dyn GenerationClient>,
    cache: Option<SemanticCache>,
    catalog: SchemaCatalog,
    config: AppConfig,
}

impl Pipeline {
    pub fn new(
        adapter: Box<dyn BackendAdapter>,
        llm: Box<dyn GenerationClient>,
        cache: Option<SemanticCache>,
        config: AppConfig,
    ) -> Self {
        let catalog = SchemaCatalog::new(config.artifact_dir.clone());
        Self {
            adapter,
            llm,
            cache,
            catalog,
            config,
        }
    }

    /// Answer one question against one dataset.
    pub async fn answer(&self, question: &str, session: Session, dataset: &str) -> crate::error::Result<Answer> {
        if let Some(hit) = self.probe_cache(question).await {
            let result = ExecutionGuard::run(self.adapter.as_ref(), &hit.sql, &self.config.guard).await;
            if result.is_success() {
                info!("cache hit (similarity {:.3}) answered the question", hit.similarity);
                return Ok(Answer {
                    question: question.to_string(),
                    sql: hit.sql,
                    result,
                    suggestion: None,
                    replacements: Vec::new(),
                    from_cache: true,
                    explanation: Some(hit.explanation),
                });
            }
            // A stale cached statement falls through to fresh generation.
            warn!("cached statement no longer executes; regenerating");
        }

        let descriptor = self
            .catalog
            .extract(self.adapter.as_ref(), &self.config.metadata, session, dataset)
            .await?;
        let schema_text = descriptor.schema_text();

        let generated = self.llm.generate_sql(question, &schema_text).await?;
        let rectified = RectificationLoop::run_with_retries(
            self.adapter.as_ref(),
            &self.config.guard,
            self.llm.as_ref(),
            question,
            &generated,
            &schema_text,
            self.config.max_attempts,
        )
        .await;

        let mut sql = rectified.sql;
        let mut result = rectified.result;
        let mut suggestion = result.failure.as_ref().map(|f| f.message());
        let mut replacements = Vec::new();

        if should_normalize(&result, &self.config.normalize) {
            let normalized = ValueNormalizer::normalize(
                self.adapter.as_ref(),
                &self.config.guard,
                &descriptor,
                &sql,
                &self.config.normalize,
            )
            .await;
            sql = normalized.sql;
            if let Some(reexecuted) = normalized.result {
                result = reexecuted;
            }
            suggestion = normalized.suggestion;
            replacements = normalized.replacements;
        }

        Ok(Answer {
            question: question.to_string(),
            sql,
            result,
            suggestion,
            replacements,
            from_cache: false,
            explanation: None,
        })
    }

    /// Record a user-approved question/statement pair in the semantic cache.
    pub async fn approve(&self, question: &str, sql: &str) -> crate::error::Result<()> {
        let Some(cache) = self.cache.as_ref() else {
            warn!("no cache configured; approval discarded");
            return Ok(());
        };
        cache.store(self.llm.as_ref(), question, sql).await
    }

    async fn probe_cache(&self, question: &str) -> Option<crate::cache::CacheHit> {
        let cache = self.cache.as_ref()?;
        match cache.lookup(self.llm.as_ref(), question).await {
            Ok(hit) => hit,
            Err(e) => {
                // Cache problems never block answering from scratch.
                warn!("cache lookup failed: {}", e);
                None
            }
        }
    }

    pub async fn close(&self) -> crate::error::Result<()> {
        if let Some(cache) = self.cache.as_ref() {
            cache.close().await;
        }
        self.adapter.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sqlite::SqliteAdapter;
    use crate::backend::BackendKind;
    use crate::config::ConnectionConfig;
    use crate::error::{PilotError, Result};
    use crate::result::Value;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted generator: first response misspells the store literal, the
    /// correction path is never needed, so normalization has to repair it.
    struct ScriptedLlm {
        generations: AtomicUsize,
    }

    #[async_trait]
    impl GenerationClient for ScriptedLlm {
        async fn generate_sql(&self, _question: &str, schema_text: &str) -> Result<String> {
            assert!(schema_text.contains("*****TABLE sales starts*****"));
            self.generations.fetch_add(1, Ordering::SeqCst);
            Ok("SELECT SUM(amount) AS total FROM sales WHERE store = 'store1'".into())
        }

        async fn correct(
            &self,
            _kind: BackendKind,
            _question: &str,
            _sql: &str,
            _error: &str,
            _schema: &str,
        ) -> Result<String> {
            Err(PilotError::Llm("correction should not be needed".into()))
        }

        async fn explain_and_paraphrase(&self, _q: &str, _s: &str) -> Result<(String, String)> {
            Err(PilotError::Llm("not used".into()))
        }

        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Err(PilotError::Llm("not used".into()))
        }
    }

    #[tokio::test]
    async fn misspelled_literal_is_normalized_end_to_end() {
        let path = std::env::temp_dir().join(format!("datapilot-{}.db", uuid::Uuid::new_v4()));
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE sales (store TEXT, amount INTEGER);
             INSERT INTO sales VALUES ('Store1', 10), ('Store1', 5), ('Store2', 7);",
        )
        .unwrap();
        drop(conn);

        let connection = ConnectionConfig {
            db_file_path: Some(path.clone()),
            ..Default::default()
        };
        let adapter = SqliteAdapter::open(&connection).unwrap();
        let mut config = AppConfig::default();
        config.artifact_dir =
            std::env::temp_dir().join(format!("datapilot-artifacts-{}", uuid::Uuid::new_v4()));

        let artifact_dir = config.artifact_dir.clone();
        let pipeline = Pipeline::new(
            Box::new(adapter),
            Box::new(ScriptedLlm { generations: AtomicUsize::new(0) }),
            None,
            config,
        );

        let answer = pipeline
            .answer("total sales for store1", Session::New, "shop")
            .await
            .unwrap();
        assert!(!answer.from_cache);
        assert!(answer.sql.contains("'Store1'"));
        assert_eq!(answer.replacements, vec!["Replaced 'store1' with 'Store1'"]);
        assert!(answer.result.is_success());
        assert_eq!(answer.result.table.rows[0], vec![Value::Int(15)]);
        assert!(answer.suggestion.is_none());

        // The new session persisted a schema artifact for later reuse.
        assert!(artifact_dir.join("shop_schema_info.json").exists());

        std::fs::remove_dir_all(artifact_dir).unwrap();
        std::fs::remove_file(path).unwrap();
    }
}
