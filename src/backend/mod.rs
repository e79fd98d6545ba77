//! Uniform interface over the supported storage engines.

pub mod object_store;
pub mod postgres;
pub mod sqlite;
pub mod warehouse;

use crate::config::{ConnectionConfig, MetadataConfig};
use crate::error::Result;
use crate::result::Table;
use crate::schema::SchemaDescriptor;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Closed set of supported backend kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendKind {
    /// Embedded file database (SQLite).
    Sqlite,
    /// Relational server speaking the Postgres protocol.
    Postgres,
    /// MPP warehouse (Redshift-class, Postgres wire protocol).
    Warehouse,
    /// Object store + interactive query service.
    ObjectStore,
}

impl BackendKind {
    pub fn dialect_name(&self) -> &'static str {
        match self {
            BackendKind::Sqlite => "sqlite",
            BackendKind::Postgres => "postgresql",
            BackendKind::Warehouse => "redshift",
            BackendKind::ObjectStore => "presto",
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = crate::error::PilotError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "sqlite" => Ok(BackendKind::Sqlite),
            "postgres" | "postgresql" => Ok(BackendKind::Postgres),
            "warehouse" | "redshift" => Ok(BackendKind::Warehouse),
            "s3" | "object-store" | "object_store" => Ok(BackendKind::ObjectStore),
            other => Err(crate::error::PilotError::Config(format!(
                "unsupported backend kind: {}",
                other
            ))),
        }
    }
}

/// One adapter exclusively owns one backend connection for the lifetime of an
/// invocation; `close` releases it and must be called on every path.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Introspect the backend into a normalized descriptor. Per-table
    /// failures degrade; an empty descriptor is the caller's error.
    async fn fetch_schema(&self, metadata: &MetadataConfig) -> Result<SchemaDescriptor>;

    /// Run one statement and materialize the result.
    async fn execute(&self, sql: &str) -> Result<Table>;

    async fn close(&self) -> Result<()>;
}

/// Factory keyed on the kind enum.
pub async fn connect(
    kind: BackendKind,
    config: &ConnectionConfig,
) -> Result<Box<dyn BackendAdapter>> {
    match kind {
        BackendKind::Sqlite => Ok(Box::new(sqlite::SqliteAdapter::open(config)?)),
        BackendKind::Postgres => Ok(Box::new(postgres::PostgresAdapter::connect(config).await?)),
        BackendKind::Warehouse => Ok(Box::new(warehouse::WarehouseAdapter::connect(config).await?)),
        BackendKind::ObjectStore => {
            Ok(Box::new(object_store::ObjectStoreAdapter::connect(config).await?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_parsing_covers_aliases() {
        assert_eq!("postgresql".parse::<BackendKind>().unwrap(), BackendKind::Postgres);
        assert_eq!("redshift".parse::<BackendKind>().unwrap(), BackendKind::Warehouse);
        assert_eq!("s3".parse::<BackendKind>().unwrap(), BackendKind::ObjectStore);
        assert!("oracle".parse::<BackendKind>().is_err());
    }
}
