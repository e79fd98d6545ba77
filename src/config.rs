//! Configuration objects passed into each component at construction.
//!
//! All defaulting is resolved once at process start (see `AppConfig::from_env`);
//! nothing reads the environment after that point.

use crate::error::{PilotError, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Connection parameters for one backend. Which fields matter depends on the
/// backend kind: `db_file_path` for the embedded file DB, host/port/user/
/// password/database for the network SQL backends, endpoint/bucket/
/// output_location for the object store + query service pair.
#[derive(Debug, Clone, Default)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub db_file_path: Option<PathBuf>,
    /// Base URL of the S3-compatible object store, e.g. `http://minio:9000`.
    pub store_endpoint: String,
    pub bucket: String,
    /// Base URL of the interactive query service, e.g. `http://trino:8080`.
    pub query_endpoint: String,
    /// Result-staging prefix required by the query service.
    pub output_location: String,
}

impl ConnectionConfig {
    pub fn postgres_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.database
        )
    }
}

/// Optional business-metadata sheet scoping schema extraction.
#[derive(Debug, Clone, Default)]
pub struct MetadataConfig {
    pub is_meta: bool,
    /// CSV sheet with a `Table Name` column; tables absent from it are dropped.
    pub table_sheet: Option<PathBuf>,
    /// CSV sheet with `Table Name`, `Column Name`, `Column Description`.
    pub column_sheet: Option<PathBuf>,
}

/// Limits enforced by the ExecutionGuard.
#[derive(Debug, Clone)]
pub struct GuardConfig {
    /// Maximum rows a result may hold before the query is refused.
    pub row_threshold: u64,
    /// Wall-clock budget for one execution.
    pub time_threshold: Duration,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            row_threshold: 10_000,
            time_threshold: Duration::from_secs(60),
        }
    }
}

/// Generation/embedding collaborator endpoints.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub embedding_model: String,
    /// Dimension fixed by the embedding model; the cache table is created
    /// with this width.
    pub embedding_dim: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            embedding_dim: 1536,
        }
    }
}

/// Semantic cache store (separate from the data backends).
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub database_url: String,
    /// Similarity floor for declaring a hit (0-1).
    pub threshold: f64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            threshold: 0.85,
        }
    }
}

/// Value-normalization knobs. The trigger heuristic ("0 rows, or 1 row of
/// null/zero") is best effort, so the degenerate-row half of it can be
/// switched off.
#[derive(Debug, Clone)]
pub struct NormalizeConfig {
    /// Token-set similarity floor for accepting a replacement (0-100).
    pub match_threshold: u32,
    /// Also trigger on a single all-null/zero row, not just zero rows.
    pub treat_degenerate_row_as_empty: bool,
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            match_threshold: 80,
            treat_degenerate_row_as_empty: true,
        }
    }
}

/// Everything the pipeline needs for one invocation.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub cache: CacheConfig,
    pub guard: GuardConfig,
    pub normalize: NormalizeConfig,
    pub metadata: MetadataConfig,
    /// Rectification budget per top-level question.
    pub max_attempts: u32,
    /// Directory holding persisted schema artifacts, keyed by dataset name.
    pub artifact_dir: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            llm: LlmConfig::default(),
            cache: CacheConfig::default(),
            guard: GuardConfig::default(),
            normalize: NormalizeConfig::default(),
            metadata: MetadataConfig::default(),
            max_attempts: 3,
            artifact_dir: PathBuf::from("artifacts"),
        }
    }
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| PilotError::Config(format!("{} is not set", key)))
}

impl AppConfig {
    /// Load from the environment. Call once at startup, after `dotenv`.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        cfg.llm.api_key = env_var("LLM_API_KEY")?;
        if let Ok(url) = std::env::var("LLM_BASE_URL") {
            cfg.llm.base_url = url;
        }
        if let Ok(model) = std::env::var("LLM_MODEL") {
            cfg.llm.model = model;
        }
        if let Ok(model) = std::env::var("EMBEDDING_MODEL") {
            cfg.llm.embedding_model = model;
        }
        if let Ok(dim) = std::env::var("EMBEDDING_DIM") {
            cfg.llm.embedding_dim = dim
                .parse()
                .map_err(|_| PilotError::Config("EMBEDDING_DIM must be an integer".into()))?;
        }
        cfg.cache.database_url = env_var("CACHE_DATABASE_URL")?;
        if let Ok(thresh) = std::env::var("CACHE_THRESHOLD") {
            cfg.cache.threshold = thresh
                .parse()
                .map_err(|_| PilotError::Config("CACHE_THRESHOLD must be a float".into()))?;
        }
        if let Ok(rows) = std::env::var("ROW_THRESHOLD") {
            cfg.guard.row_threshold = rows
                .parse()
                .map_err(|_| PilotError::Config("ROW_THRESHOLD must be an integer".into()))?;
        }
        if let Ok(secs) = std::env::var("TIME_THRESHOLD_SECS") {
            let secs: u64 = secs
                .parse()
                .map_err(|_| PilotError::Config("TIME_THRESHOLD_SECS must be an integer".into()))?;
            cfg.guard.time_threshold = Duration::from_secs(secs);
        }
        if let Ok(attempts) = std::env::var("RECTIFY_ATTEMPTS") {
            cfg.max_attempts = attempts
                .parse()
                .map_err(|_| PilotError::Config("RECTIFY_ATTEMPTS must be an integer".into()))?;
        }
        if let Ok(dir) = std::env::var("ARTIFACT_DIR") {
            cfg.artifact_dir = PathBuf::from(dir);
        }
        Ok(cfg)
    }
}
