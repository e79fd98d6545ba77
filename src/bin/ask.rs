//! One-shot CLI: answer a single natural-language question against a backend.

use anyhow::Context;
use clap::Parser;
use datapilot::backend::{self, BackendKind};
use datapilot::cache::SemanticCache;
use datapilot::config::{AppConfig, ConnectionConfig};
use datapilot::llm::LlmClient;
use datapilot::pipeline::Pipeline;
use datapilot::result::Table;
use datapilot::schema::Session;
use std::path::PathBuf;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ask", about = "Answer a natural-language question with SQL")]
struct Args {
    /// Backend kind: sqlite, postgres, warehouse, s3
    #[arg(long)]
    backend: BackendKind,

    /// The question to answer
    #[arg(long)]
    question: String,

    /// Dataset name, keys the persisted schema artifact
    #[arg(long, default_value = "default")]
    dataset: String,

    /// Reuse the persisted schema artifact instead of re-extracting
    #[arg(long)]
    existing_session: bool,

    /// Path to the database file (sqlite backend)
    #[arg(long)]
    db_file: Option<PathBuf>,

    /// Server host (postgres / warehouse backends)
    #[arg(long, default_value = "localhost")]
    host: String,

    #[arg(long, default_value_t = 5432)]
    port: u16,

    #[arg(long, default_value = "")]
    database: String,

    #[arg(long, default_value = "")]
    user: String,

    #[arg(long, default_value = "", env = "BACKEND_PASSWORD", hide_env_values = true)]
    password: String,

    /// Object store base URL (s3 backend)
    #[arg(long, default_value = "")]
    store_endpoint: String,

    #[arg(long, default_value = "")]
    bucket: String,

    /// Interactive query service base URL (s3 backend)
    #[arg(long, default_value = "")]
    query_endpoint: String,

    #[arg(long, default_value = "")]
    output_location: String,

    /// Skip the semantic cache entirely
    #[arg(long)]
    no_cache: bool,

    /// Store the answered question/statement pair in the cache on success
    #[arg(long)]
    approve: bool,
}

fn render(table: &Table) -> String {
    let mut widths: Vec<usize> = table.columns.iter().map(String::len).collect();
    for row in &table.rows {
        for (idx, cell) in row.iter().enumerate() {
            if let Some(width) = widths.get_mut(idx) {
                *width = (*width).max(cell.render().len());
            }
        }
    }
    let mut out = String::new();
    let header: Vec<String> = table
        .columns
        .iter()
        .zip(&widths)
        .map(|(name, width)| format!("{:<width$}", name, width = *width))
        .collect();
    out.push_str(&header.join(" | "));
    out.push('\n');
    out.push_str(&widths.iter().map(|w| "-".repeat(*w)).collect::<Vec<_>>().join("-+-"));
    out.push('\n');
    for row in &table.rows {
        let cells: Vec<String> = row
            .iter()
            .zip(&widths)
            .map(|(cell, width)| format!("{:<width$}", cell.render(), width = *width))
            .collect();
        out.push_str(&cells.join(" | "));
        out.push('\n');
    }
    out
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = AppConfig::from_env().context("loading configuration")?;

    let connection = ConnectionConfig {
        host: args.host,
        port: args.port,
        database: args.database,
        user: args.user,
        password: args.password,
        db_file_path: args.db_file,
        store_endpoint: args.store_endpoint,
        bucket: args.bucket,
        query_endpoint: args.query_endpoint,
        output_location: args.output_location,
    };

    let adapter = backend::connect(args.backend, &connection)
        .await
        .context("connecting to the backend")?;

    let cache = if args.no_cache {
        None
    } else {
        match SemanticCache::connect(&config.cache, config.llm.embedding_dim).await {
            Ok(cache) => Some(cache),
            Err(e) => {
                warn!("semantic cache unavailable ({}); continuing without it", e);
                None
            }
        }
    };

    let llm = LlmClient::new(config.llm.clone());
    let pipeline = Pipeline::new(adapter, Box::new(llm), cache, config);

    let session = if args.existing_session {
        Session::Existing
    } else {
        Session::New
    };

    let answer = pipeline
        .answer(&args.question, session, &args.dataset)
        .await
        .context("answering the question")?;

    println!("SQL: {}", answer.sql);
    if answer.from_cache {
        println!("(answered from cache)");
    }
    if let Some(explanation) = &answer.explanation {
        println!("\n{}", explanation);
    }
    for replacement in &answer.replacements {
        println!("{}", replacement);
    }
    if answer.result.is_success() {
        println!("\n{}", render(&answer.result.table));
    }
    if let Some(suggestion) = &answer.suggestion {
        println!("{}", suggestion);
    }

    if args.approve && answer.result.is_success() {
        pipeline
            .approve(&answer.question, &answer.sql)
            .await
            .context("storing the approved statement")?;
        println!("Saved to the semantic cache.");
    }

    pipeline.close().await.context("closing connections")?;
    Ok(())
}
