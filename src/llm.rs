//! Generation collaborator: SQL generation, error-driven correction,
//! explanation/paraphrase derivation and text embeddings.
//!
//! The pipeline only formats prompts and parses delimited tags out of the
//! responses; model internals are opaque.

use crate::backend::BackendKind;
use crate::config::LlmConfig;
use crate::error::{PilotError, Result};
use crate::tags;
use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

/// Seam for everything the core asks of the language/embedding service.
/// Tests substitute a scripted implementation.
#[async_trait]
pub trait GenerationClient: Send + Sync {
    /// Natural-language question + schema text → SQL statement.
    async fn generate_sql(&self, question: &str, schema_text: &str) -> Result<String>;

    /// Failed SQL + raw backend error → corrected SQL.
    async fn correct(
        &self,
        kind: BackendKind,
        question: &str,
        sql: &str,
        error: &str,
        schema_text: &str,
    ) -> Result<String>;

    /// Step-by-step explanation and a semantics-preserving rephrasing of the
    /// question, both derived at cache-write time.
    async fn explain_and_paraphrase(&self, question: &str, sql: &str) -> Result<(String, String)>;

    /// Fixed-dimension embedding of a text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// OpenAI-compatible chat-completions + embeddings client.
#[derive(Clone)]
pub struct LlmClient {
    config: LlmConfig,
    http: reqwest::Client,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
        }
    }

    async fn chat(&self, system: &str, prompt: &str) -> Result<String> {
        let body = json!({
            "model": self.config.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": prompt}
            ],
            "temperature": 0.0,
        });

        let response = self
            .http
            .post(format!("{}/chat/completions", self.config.base_url))
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| PilotError::Llm(format!("chat request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(PilotError::Llm(format!("chat API error ({}): {}", status, text)));
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| PilotError::Llm(format!("malformed chat response: {}", e)))?;

        let content = payload["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| PilotError::Llm("no content in chat response".to_string()))?;
        debug!("chat response: {}", content);
        Ok(content.to_string())
    }
}

fn system_prompt(kind: BackendKind) -> String {
    format!(
        "You are an expert {} SQL analyst. Answer with SQL only, enclosed in <sql></sql> tags. \
         Only SELECT or WITH statements are allowed.",
        kind.dialect_name()
    )
}

#[async_trait]
impl GenerationClient for LlmClient {
    async fn generate_sql(&self, question: &str, schema_text: &str) -> Result<String> {
        let prompt = format!(
            "Given the following database schema, write one SQL query answering the question.\n\n\
             {schema}\n\nQuestion: {question}\n\n\
             Return the query inside <sql></sql> tags.",
            schema = schema_text,
            question = question
        );
        let response = self.chat(&system_prompt(BackendKind::Postgres), &prompt).await?;
        tags::extract(&response, "sql")
    }

    async fn correct(
        &self,
        kind: BackendKind,
        question: &str,
        sql: &str,
        error: &str,
        schema_text: &str,
    ) -> Result<String> {
        let prompt = format!(
            "The SQL below was generated for the question but failed to execute.\n\n\
             Question: {question}\n\n<failed_sql>\n{sql}\n</failed_sql>\n\n\
             Error:\n{error}\n\nSchema:\n{schema}\n\n\
             Fix the query. Return only the corrected query inside <sql></sql> tags.",
            question = question,
            sql = sql,
            error = error,
            schema = schema_text
        );
        let response = self.chat(&system_prompt(kind), &prompt).await?;
        tags::extract(&response, "sql")
    }

    async fn explain_and_paraphrase(&self, question: &str, sql: &str) -> Result<(String, String)> {
        let prompt = format!(
            "For the SQL query inside <SQL> tags, provide a step by step description of how it \
             executes, enclosed in <explanation></explanation> tags.\n\
             For the text question inside <question> tags, rewrite it differently while keeping \
             the semantics and intent, enclosed in <question_gen></question_gen> tags.\n\n\
             <SQL>\n{sql}\n</SQL>\n\n<question>\n{question}\n</question>",
            sql = sql,
            question = question
        );
        let response = self
            .chat("You are an expert in describing SQL queries.", &prompt)
            .await?;
        let explanation = tags::extract(&response, "explanation")?;
        let paraphrase = tags::extract(&response, "question_gen")?;
        Ok((explanation, paraphrase))
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let body = json!({
            "model": self.config.embedding_model,
            "input": text,
        });

        let response = self
            .http
            .post(format!("{}/embeddings", self.config.base_url))
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| PilotError::Llm(format!("embedding request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(PilotError::Llm(format!(
                "embedding API error ({}): {}",
                status, text
            )));
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| PilotError::Llm(format!("malformed embedding response: {}", e)))?;

        let values = payload["data"][0]["embedding"]
            .as_array()
            .ok_or_else(|| PilotError::Llm("no embedding in response".to_string()))?;

        let embedding: Vec<f32> = values
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        if embedding.len() != self.config.embedding_dim {
            return Err(PilotError::Llm(format!(
                "embedding dimension mismatch: got {}, expected {}",
                embedding.len(),
                self.config.embedding_dim
            )));
        }
        Ok(embedding)
    }
}
