//! End-to-end pipeline scenarios against a real embedded database with a
//! scripted generation collaborator.

use async_trait::async_trait;
use datapilot::backend::sqlite::SqliteAdapter;
use datapilot::backend::BackendKind;
use datapilot::config::{AppConfig, ConnectionConfig};
use datapilot::error::{PilotError, Result};
use datapilot::llm::GenerationClient;
use datapilot::pipeline::Pipeline;
use datapilot::result::Value;
use datapilot::schema::Session;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct Fixture {
    db_path: PathBuf,
    artifact_dir: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let db_path = std::env::temp_dir().join(format!("datapilot-{}.db", uuid::Uuid::new_v4()));
        let conn = rusqlite::Connection::open(&db_path).unwrap();
        conn.execute_batch(
            "CREATE TABLE sales (store TEXT, amount INTEGER);
             INSERT INTO sales VALUES ('Store1', 10), ('Store1', 5), ('Store2', 7);",
        )
        .unwrap();
        drop(conn);
        let artifact_dir =
            std::env::temp_dir().join(format!("datapilot-artifacts-{}", uuid::Uuid::new_v4()));
        Self { db_path, artifact_dir }
    }

    fn adapter(&self) -> SqliteAdapter {
        let config = ConnectionConfig {
            db_file_path: Some(self.db_path.clone()),
            ..Default::default()
        };
        SqliteAdapter::open(&config).unwrap()
    }

    fn app_config(&self) -> AppConfig {
        let mut config = AppConfig::default();
        config.artifact_dir = self.artifact_dir.clone();
        config
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.db_path);
        let _ = std::fs::remove_dir_all(&self.artifact_dir);
    }
}

/// Generates a statement against a misspelled table, then corrects it when
/// handed the backend error.
struct SelfCorrectingLlm {
    generations: Arc<AtomicUsize>,
    corrections: Arc<AtomicUsize>,
}

#[async_trait]
impl GenerationClient for SelfCorrectingLlm {
    async fn generate_sql(&self, _question: &str, _schema_text: &str) -> Result<String> {
        self.generations.fetch_add(1, Ordering::SeqCst);
        Ok("SELECT SUM(amount) AS total FROM salez".into())
    }

    async fn correct(
        &self,
        kind: BackendKind,
        _question: &str,
        sql: &str,
        error: &str,
        _schema_text: &str,
    ) -> Result<String> {
        assert_eq!(kind, BackendKind::Sqlite);
        assert!(sql.contains("salez"));
        assert!(error.contains("salez"), "raw backend error should be preserved: {}", error);
        self.corrections.fetch_add(1, Ordering::SeqCst);
        Ok("SELECT SUM(amount) AS total FROM sales".into())
    }

    async fn explain_and_paraphrase(&self, _q: &str, _s: &str) -> Result<(String, String)> {
        Err(PilotError::Llm("not used".into()))
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Err(PilotError::Llm("not used".into()))
    }
}

#[tokio::test]
async fn backend_error_is_rectified_and_the_corrected_statement_answers() {
    let fixture = Fixture::new();
    let corrections = Arc::new(AtomicUsize::new(0));
    let llm = SelfCorrectingLlm {
        generations: Arc::new(AtomicUsize::new(0)),
        corrections: Arc::clone(&corrections),
    };
    let pipeline = Pipeline::new(
        Box::new(fixture.adapter()),
        Box::new(llm),
        None,
        fixture.app_config(),
    );

    let answer = pipeline
        .answer("total sales", Session::New, "shop")
        .await
        .unwrap();

    assert!(answer.result.is_success());
    assert_eq!(answer.sql, "SELECT SUM(amount) AS total FROM sales");
    assert_eq!(answer.result.table.rows[0], vec![Value::Int(22)]);
    assert_eq!(corrections.load(Ordering::SeqCst), 1);
}

/// Always emits a valid statement; used to exercise session artifact reuse.
struct StaticLlm {
    generations: Arc<AtomicUsize>,
}

#[async_trait]
impl GenerationClient for StaticLlm {
    async fn generate_sql(&self, _question: &str, schema_text: &str) -> Result<String> {
        assert!(schema_text.contains("sales"));
        // Tables created after the artifact was persisted never show up.
        assert!(!schema_text.contains("*****TABLE extra"));
        self.generations.fetch_add(1, Ordering::SeqCst);
        Ok("SELECT COUNT(*) AS n FROM sales".into())
    }

    async fn correct(
        &self,
        _kind: BackendKind,
        _question: &str,
        _sql: &str,
        _error: &str,
        _schema_text: &str,
    ) -> Result<String> {
        Err(PilotError::Llm("not used".into()))
    }

    async fn explain_and_paraphrase(&self, _q: &str, _s: &str) -> Result<(String, String)> {
        Err(PilotError::Llm("not used".into()))
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Err(PilotError::Llm("not used".into()))
    }
}

#[tokio::test]
async fn existing_sessions_reuse_the_persisted_schema_artifact() {
    let fixture = Fixture::new();
    let pipeline = Pipeline::new(
        Box::new(fixture.adapter()),
        Box::new(StaticLlm { generations: Arc::new(AtomicUsize::new(0)) }),
        None,
        fixture.app_config(),
    );

    let first = pipeline.answer("how many rows", Session::New, "shop").await.unwrap();
    assert!(first.result.is_success());
    let artifact = fixture.artifact_dir.join("shop_schema_info.json");
    assert!(artifact.exists());

    // Change the database under the artifact: an existing session must keep
    // using the persisted schema rather than re-extracting.
    let conn = rusqlite::Connection::open(&fixture.db_path).unwrap();
    conn.execute_batch("CREATE TABLE extra (x INTEGER); INSERT INTO extra VALUES (1);")
        .unwrap();
    drop(conn);

    let second = pipeline
        .answer("how many rows", Session::Existing, "shop")
        .await
        .unwrap();
    assert!(second.result.is_success());
    assert_eq!(second.result.table.rows[0], vec![Value::Int(3)]);
}
