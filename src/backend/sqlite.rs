//! Embedded file database adapter (SQLite via rusqlite).

use crate::backend::{BackendAdapter, BackendKind};
use crate::config::{ConnectionConfig, MetadataConfig};
use crate::error::{PilotError, Result};
use crate::result::{Table, Value};
use crate::schema::{cap_distinct, ColumnInfo, ForeignKeyInfo, SchemaDescriptor, TableInfo, MAX_DISTINCT_VALUES};
use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::Connection;
use std::sync::{Arc, Mutex};
use tracing::warn;

pub struct SqliteAdapter {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteAdapter {
    pub fn open(config: &ConnectionConfig) -> Result<Self> {
        let path = config
            .db_file_path
            .as_ref()
            .ok_or_else(|| PilotError::Config("db_file_path is required for the sqlite backend".into()))?;
        let conn = Connection::open(path)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection on a blocking worker so the
    /// guard's timeout stays responsive.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| PilotError::Backend("sqlite connection poisoned".into()))?;
            f(&guard)
        })
        .await
        .map_err(|e| PilotError::Backend(format!("sqlite worker failed: {}", e)))?
    }
}

fn run_query(conn: &Connection, sql: &str) -> Result<Table> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let mut table = Table::new(columns);
    let column_count = stmt.column_count();
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let mut out = Vec::with_capacity(column_count);
        for idx in 0..column_count {
            let value = match row.get_ref(idx)? {
                ValueRef::Null => Value::Null,
                ValueRef::Integer(i) => Value::Int(i),
                ValueRef::Real(f) => Value::Float(f),
                ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).to_string()),
                ValueRef::Blob(_) => Value::Null,
            };
            out.push(value);
        }
        table.rows.push(out);
    }
    Ok(table)
}

fn table_schema(conn: &Connection, table: &str) -> Result<TableInfo> {
    let mut info = TableInfo::default();

    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        let data_type: String = row.get(2)?;
        let not_null: i64 = row.get(3)?;
        let pk: i64 = row.get(5)?;
        if pk > 0 {
            info.primary_keys.push(name.clone());
        }
        info.columns.push(ColumnInfo {
            name,
            data_type,
            nullable: not_null == 0,
            description: String::new(),
        });
    }

    let mut stmt = conn.prepare(&format!("PRAGMA foreign_key_list({})", table))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let referred_table: String = row.get(2)?;
        let from: String = row.get(3)?;
        let to: String = row.get(4)?;
        info.foreign_keys.push(ForeignKeyInfo {
            columns: vec![from],
            referred_table,
            referred_columns: vec![to],
        });
    }

    Ok(info)
}

fn sample_distinct(conn: &Connection, table: &str, column: &str) -> Vec<String> {
    let sql = format!(
        "SELECT DISTINCT \"{}\" FROM \"{}\" LIMIT {}",
        column, table, MAX_DISTINCT_VALUES
    );
    match run_query(conn, &sql) {
        Ok(result) => cap_distinct(result.first_column_values(), MAX_DISTINCT_VALUES),
        Err(e) => {
            warn!("could not sample distinct values for {}.{}: {}", table, column, e);
            Vec::new()
        }
    }
}

#[async_trait]
impl BackendAdapter for SqliteAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    async fn fetch_schema(&self, metadata: &MetadataConfig) -> Result<SchemaDescriptor> {
        let approved = crate::catalog::approved_tables(metadata)?;
        self.with_conn(move |conn| {
            let mut descriptor = SchemaDescriptor::default();
            let mut stmt =
                conn.prepare("SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%'")?;
            let names: Vec<String> = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<_, _>>()?;

            for name in names {
                if let Some(ref approved) = approved {
                    if !approved.contains(&name) {
                        continue;
                    }
                }
                let mut info = match table_schema(conn, &name) {
                    Ok(info) => info,
                    Err(e) => {
                        warn!("skipping table {}: {}", name, e);
                        continue;
                    }
                };
                for column in info.columns.clone() {
                    let values = sample_distinct(conn, &name, &column.name);
                    info.distinct_values.insert(column.name, values);
                }
                descriptor.insert_table(name, info);
            }
            Ok(descriptor)
        })
        .await
    }

    async fn execute(&self, sql: &str) -> Result<Table> {
        let sql = sql.to_string();
        self.with_conn(move |conn| {
            run_query(conn, &sql).map_err(|e| PilotError::Backend(e.to_string()))
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        // rusqlite closes on drop; nothing held beyond the connection.
        Ok(())
    }
}
