//! Relational-server adapter (Postgres over sqlx).

use crate::backend::{BackendAdapter, BackendKind};
use crate::config::{ConnectionConfig, MetadataConfig};
use crate::error::{PilotError, Result};
use crate::result::{Table, Value};
use crate::schema::{cap_distinct, ColumnInfo, ForeignKeyInfo, SchemaDescriptor, TableInfo, MAX_DISTINCT_VALUES};
use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Column, Row, TypeInfo};
use std::time::Duration;
use tracing::warn;

pub struct PostgresAdapter {
    pool: PgPool,
}

impl PostgresAdapter {
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let pool = connect_pool(config).await?;
        Ok(Self { pool })
    }
}

pub(crate) async fn connect_pool(config: &ConnectionConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(2)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&config.postgres_url())
        .await?;
    sqlx::query("SELECT 1").execute(&pool).await?;
    Ok(pool)
}

/// Decode one result cell by the column's wire type. NUMERIC values come back
/// as decimals and are lowered to floats, matching what analysts expect from
/// aggregate results.
fn decode_cell(row: &PgRow, idx: usize, type_name: &str) -> Value {
    match type_name {
        "INT2" => row
            .try_get::<Option<i16>, _>(idx)
            .ok()
            .flatten()
            .map(|v| Value::Int(v as i64))
            .unwrap_or(Value::Null),
        "INT4" => row
            .try_get::<Option<i32>, _>(idx)
            .ok()
            .flatten()
            .map(|v| Value::Int(v as i64))
            .unwrap_or(Value::Null),
        "INT8" => row
            .try_get::<Option<i64>, _>(idx)
            .ok()
            .flatten()
            .map(Value::Int)
            .unwrap_or(Value::Null),
        "FLOAT4" => row
            .try_get::<Option<f32>, _>(idx)
            .ok()
            .flatten()
            .map(|v| Value::Float(v as f64))
            .unwrap_or(Value::Null),
        "FLOAT8" => row
            .try_get::<Option<f64>, _>(idx)
            .ok()
            .flatten()
            .map(Value::Float)
            .unwrap_or(Value::Null),
        "NUMERIC" => row
            .try_get::<Option<rust_decimal::Decimal>, _>(idx)
            .ok()
            .flatten()
            .and_then(|d| d.to_f64())
            .map(Value::Float)
            .unwrap_or(Value::Null),
        "BOOL" => row
            .try_get::<Option<bool>, _>(idx)
            .ok()
            .flatten()
            .map(Value::Bool)
            .unwrap_or(Value::Null),
        "DATE" => row
            .try_get::<Option<chrono::NaiveDate>, _>(idx)
            .ok()
            .flatten()
            .map(|d| Value::Text(d.to_string()))
            .unwrap_or(Value::Null),
        "TIMESTAMP" => row
            .try_get::<Option<chrono::NaiveDateTime>, _>(idx)
            .ok()
            .flatten()
            .map(|d| Value::Text(d.to_string()))
            .unwrap_or(Value::Null),
        "TIMESTAMPTZ" => row
            .try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(idx)
            .ok()
            .flatten()
            .map(|d| Value::Text(d.to_rfc3339()))
            .unwrap_or(Value::Null),
        _ => row
            .try_get::<Option<String>, _>(idx)
            .ok()
            .flatten()
            .map(Value::Text)
            .unwrap_or(Value::Null),
    }
}

pub(crate) async fn run_query(pool: &PgPool, sql: &str) -> Result<Table> {
    let rows = sqlx::query(sql)
        .fetch_all(pool)
        .await
        .map_err(|e| PilotError::Backend(e.to_string()))?;

    let Some(first) = rows.first() else {
        return Ok(Table::default());
    };
    let columns: Vec<String> = first.columns().iter().map(|c| c.name().to_string()).collect();
    let mut table = Table::new(columns);
    for row in &rows {
        let cells = row
            .columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| decode_cell(row, idx, col.type_info().name()))
            .collect();
        table.rows.push(cells);
    }
    Ok(table)
}

/// Shared `information_schema` introspection for the Postgres-wire backends.
pub(crate) async fn introspect(
    pool: &PgPool,
    metadata: &MetadataConfig,
) -> Result<SchemaDescriptor> {
    let approved = crate::catalog::approved_tables(metadata)?;
    let descriptions = crate::catalog::column_descriptions(metadata)?;

    let column_rows = sqlx::query(
        "SELECT table_name, column_name, data_type, is_nullable
         FROM information_schema.columns
         WHERE table_schema = 'public'
         ORDER BY table_name, ordinal_position",
    )
    .fetch_all(pool)
    .await?;

    let mut descriptor = SchemaDescriptor::default();
    let mut pending: std::collections::BTreeMap<String, TableInfo> = Default::default();
    for row in column_rows {
        let table: String = row.try_get(0)?;
        if let Some(ref approved) = approved {
            if !approved.contains(&table) {
                continue;
            }
        }
        let name: String = row.try_get(1)?;
        let data_type: String = row.try_get(2)?;
        let is_nullable: String = row.try_get(3)?;
        let description = descriptions
            .get(&(table.clone(), name.clone()))
            .cloned()
            .unwrap_or_default();
        pending.entry(table).or_default().columns.push(ColumnInfo {
            name,
            data_type,
            nullable: is_nullable.eq_ignore_ascii_case("yes"),
            description,
        });
    }

    let pk_rows = sqlx::query(
        "SELECT kcu.table_name, kcu.column_name
         FROM information_schema.table_constraints tc
         JOIN information_schema.key_column_usage kcu
           ON tc.constraint_name = kcu.constraint_name
         WHERE tc.constraint_type = 'PRIMARY KEY' AND tc.table_schema = 'public'",
    )
    .fetch_all(pool)
    .await
    .unwrap_or_default();
    for row in pk_rows {
        let table: String = row.try_get(0)?;
        let column: String = row.try_get(1)?;
        if let Some(info) = pending.get_mut(&table) {
            info.primary_keys.push(column);
        }
    }

    let fk_rows = sqlx::query(
        "SELECT kcu.table_name, kcu.column_name, ccu.table_name, ccu.column_name
         FROM information_schema.table_constraints tc
         JOIN information_schema.key_column_usage kcu
           ON tc.constraint_name = kcu.constraint_name
         JOIN information_schema.constraint_column_usage ccu
           ON ccu.constraint_name = tc.constraint_name
         WHERE tc.constraint_type = 'FOREIGN KEY' AND tc.table_schema = 'public'",
    )
    .fetch_all(pool)
    .await
    .unwrap_or_default();
    for row in fk_rows {
        let table: String = row.try_get(0)?;
        let column: String = row.try_get(1)?;
        let referred_table: String = row.try_get(2)?;
        let referred_column: String = row.try_get(3)?;
        if let Some(info) = pending.get_mut(&table) {
            info.foreign_keys.push(ForeignKeyInfo {
                columns: vec![column],
                referred_table,
                referred_columns: vec![referred_column],
            });
        }
    }

    for (table, mut info) in pending {
        for column in info.columns.clone() {
            let sql = format!(
                "SELECT DISTINCT \"{}\" FROM \"{}\" LIMIT {}",
                column.name, table, MAX_DISTINCT_VALUES
            );
            match run_query(pool, &sql).await {
                Ok(result) => {
                    info.distinct_values.insert(
                        column.name,
                        cap_distinct(result.first_column_values(), MAX_DISTINCT_VALUES),
                    );
                }
                Err(e) => {
                    warn!("could not sample distinct values for {}.{}: {}", table, column.name, e);
                    info.distinct_values.insert(column.name, Vec::new());
                }
            }
        }
        descriptor.insert_table(table, info);
    }
    Ok(descriptor)
}

#[async_trait]
impl BackendAdapter for PostgresAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Postgres
    }

    async fn fetch_schema(&self, metadata: &MetadataConfig) -> Result<SchemaDescriptor> {
        introspect(&self.pool, metadata).await
    }

    async fn execute(&self, sql: &str) -> Result<Table> {
        run_query(&self.pool, sql).await
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}
