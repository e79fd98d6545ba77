//! MPP warehouse adapter (Redshift-class server over the Postgres wire
//! protocol).
//!
//! The only warehouse-specific behavior is identifier preprocessing: the
//! generation service routinely emits bare `id` columns, which the warehouse
//! parses as a reserved word unless quoted.

use crate::backend::{postgres, BackendAdapter, BackendKind};
use crate::config::{ConnectionConfig, MetadataConfig};
use crate::error::Result;
use crate::result::Table;
use crate::schema::SchemaDescriptor;
use async_trait::async_trait;
use regex::Regex;
use sqlx::postgres::PgPool;
use tracing::debug;

pub struct WarehouseAdapter {
    pool: PgPool,
}

impl WarehouseAdapter {
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let pool = postgres::connect_pool(config).await?;
        Ok(Self { pool })
    }
}

fn quote_bare_id(fragment: &str) -> String {
    let re = Regex::new(r#"(?i)(^|[\s,\.\(])id([\s,\)\n]|$)"#).expect("static pattern");
    let mut out = fragment.to_string();
    // Repeated application handles adjacent matches like `(id, id)` where the
    // separators overlap.
    loop {
        let next = re.replace_all(&out, "${1}\"id\"${2}").to_string();
        if next == out {
            return out;
        }
        out = next;
    }
}

/// Quote standalone `id` identifiers (`id`, `alias.id`) that are not already
/// quoted. Single-quoted string literals are copied through untouched; only
/// the fragments between them are rewritten.
pub(crate) fn escape_reserved_identifiers(sql: &str) -> String {
    let literal = Regex::new(r"'(?:[^']|'')*'").expect("static pattern");
    let mut out = String::with_capacity(sql.len());
    let mut last = 0;
    for span in literal.find_iter(sql) {
        out.push_str(&quote_bare_id(&sql[last..span.start()]));
        out.push_str(span.as_str());
        last = span.end();
    }
    out.push_str(&quote_bare_id(&sql[last..]));
    if out != sql {
        debug!("escaped reserved identifiers: {}", out);
    }
    out
}

#[async_trait]
impl BackendAdapter for WarehouseAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Warehouse
    }

    async fn fetch_schema(&self, metadata: &MetadataConfig) -> Result<SchemaDescriptor> {
        postgres::introspect(&self.pool, metadata).await
    }

    async fn execute(&self, sql: &str) -> Result<Table> {
        let sql = escape_reserved_identifiers(sql);
        postgres::run_query(&self.pool, &sql).await
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}
