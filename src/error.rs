use thiserror::Error;

#[derive(Error, Debug)]
pub enum PilotError {
    #[error("Schema extraction failed: {0}")]
    SchemaExtraction(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Missing <{0}> tag in model response")]
    TagMissing(String),

    #[error("Object store error: {0}")]
    ObjectStore(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Postgres error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, PilotError>;
