//! Object-store + interactive-query adapter.
//!
//! Data lives as delimited files under `{dataset}/data/{table}/` in an
//! S3-compatible bucket, one directory per table; queries run through a
//! Presto-style statement REST API. The engine only sees external tables, so
//! the adapter (re)creates one per discovered directory before any query can
//! succeed, pointing each table's LOCATION at that same directory, and
//! recreates them once when a query hits a table-not-found error.

use crate::backend::{BackendAdapter, BackendKind};
use crate::config::{ConnectionConfig, MetadataConfig};
use crate::error::{PilotError, Result};
use crate::result::{Table, Value};
use crate::schema::{ColumnInfo, SchemaDescriptor, TableInfo};
use async_trait::async_trait;
use regex::Regex;
use serde_json::Value as Json;
use std::sync::Mutex;
use tracing::{info, warn};

const SAMPLE_ROWS: usize = 100;
const SAMPLE_DISTINCT: usize = 5;

/// Thin S3-compatible REST client: key listing plus object download.
struct ObjectStoreClient {
    http: reqwest::Client,
    endpoint: String,
    bucket: String,
}

impl ObjectStoreClient {
    fn new(config: &ConnectionConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: config.store_endpoint.trim_end_matches('/').to_string(),
            bucket: config.bucket.clone(),
        }
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let url = format!(
            "{}/{}?list-type=2&prefix={}",
            self.endpoint, self.bucket, prefix
        );
        let body = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| PilotError::ObjectStore(format!("listing {} failed: {}", prefix, e)))?
            .error_for_status()
            .map_err(|e| PilotError::ObjectStore(format!("listing {} failed: {}", prefix, e)))?
            .text()
            .await
            .map_err(|e| PilotError::ObjectStore(e.to_string()))?;
        let re = Regex::new(r"<Key>([^<]+)</Key>").expect("static pattern");
        Ok(re
            .captures_iter(&body)
            .map(|cap| cap[1].to_string())
            .collect())
    }

    async fn get_object(&self, key: &str) -> Result<String> {
        let url = format!("{}/{}/{}", self.endpoint, self.bucket, key);
        self.http
            .get(&url)
            .send()
            .await
            .map_err(|e| PilotError::ObjectStore(format!("fetching {} failed: {}", key, e)))?
            .error_for_status()
            .map_err(|e| PilotError::ObjectStore(format!("fetching {} failed: {}", key, e)))?
            .text()
            .await
            .map_err(|e| PilotError::ObjectStore(e.to_string()))
    }
}

/// Presto-style statement API: POST the SQL, then follow `nextUri` until the
/// result set is complete or an error page arrives.
struct QueryServiceClient {
    http: reqwest::Client,
    endpoint: String,
    dataset: String,
    output_location: String,
}

impl QueryServiceClient {
    fn new(config: &ConnectionConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: config.query_endpoint.trim_end_matches('/').to_string(),
            dataset: config.database.clone(),
            output_location: config.output_location.clone(),
        }
    }

    async fn run(&self, sql: &str) -> Result<Table> {
        let mut page: Json = self
            .http
            .post(format!("{}/v1/statement", self.endpoint))
            .header("X-Query-User", "datapilot")
            .header("X-Query-Schema", &self.dataset)
            .header("X-Query-Output-Location", &self.output_location)
            .body(sql.to_string())
            .send()
            .await
            .map_err(|e| PilotError::Backend(format!("query submission failed: {}", e)))?
            .json()
            .await
            .map_err(|e| PilotError::Backend(format!("malformed query response: {}", e)))?;

        let mut columns: Vec<String> = Vec::new();
        let mut rows: Vec<Vec<Value>> = Vec::new();
        loop {
            if let Some(error) = page.get("error") {
                let name = error["errorName"].as_str().unwrap_or("QUERY_FAILED");
                let message = error["message"].as_str().unwrap_or("unknown error");
                return Err(PilotError::Backend(format!("{}: {}", name, message)));
            }
            if columns.is_empty() {
                if let Some(cols) = page["columns"].as_array() {
                    columns = cols
                        .iter()
                        .filter_map(|c| c["name"].as_str().map(str::to_string))
                        .collect();
                }
            }
            if let Some(data) = page["data"].as_array() {
                for row in data {
                    let cells = row
                        .as_array()
                        .map(|cells| cells.iter().map(decode_json_cell).collect())
                        .unwrap_or_default();
                    rows.push(cells);
                }
            }
            let Some(next) = page["nextUri"].as_str().map(str::to_string) else {
                break;
            };
            page = self
                .http
                .get(&next)
                .send()
                .await
                .map_err(|e| PilotError::Backend(format!("query polling failed: {}", e)))?
                .json()
                .await
                .map_err(|e| PilotError::Backend(format!("malformed query response: {}", e)))?;
        }
        let mut table = Table::new(columns);
        table.rows = rows;
        Ok(table)
    }
}

/// The engine stages results as text; decode numeric-looking cells back into
/// numbers where the round trip is lossless.
fn decode_json_cell(cell: &Json) -> Value {
    match cell {
        Json::Null => Value::Null,
        Json::Bool(b) => Value::Bool(*b),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else {
                Value::Float(n.as_f64().unwrap_or(0.0))
            }
        }
        Json::String(s) => Value::decode(s),
        other => Value::Text(other.to_string()),
    }
}

pub(crate) fn is_table_not_found(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("table_not_found")
        || lower.contains("table not found")
        || (lower.contains("table") && lower.contains("does not exist"))
}

fn looks_like_timestamp(raw: &str) -> bool {
    chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d").is_ok()
        || chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").is_ok()
        || chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S").is_ok()
}

/// Infer one table's shape from a bounded sample of CSV rows.
fn infer_table(csv_text: &str) -> Result<TableInfo> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(csv_text.as_bytes());
    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| PilotError::SchemaExtraction(e.to_string()))?
        .iter()
        .map(str::to_string)
        .collect();

    let mut samples: Vec<Vec<String>> = vec![Vec::new(); headers.len()];
    let mut saw_empty = vec![false; headers.len()];
    for record in reader.records().take(SAMPLE_ROWS) {
        let record = record.map_err(|e| PilotError::SchemaExtraction(e.to_string()))?;
        for (idx, cell) in record.iter().enumerate().take(headers.len()) {
            if cell.is_empty() {
                saw_empty[idx] = true;
            } else {
                samples[idx].push(cell.to_string());
            }
        }
    }

    let mut info = TableInfo::default();
    for (idx, name) in headers.into_iter().enumerate() {
        let cells = &samples[idx];
        let data_type = if !cells.is_empty() && cells.iter().all(|c| c.parse::<f64>().is_ok()) {
            // An all-integer numeric column is INT, anything else numeric is
            // DOUBLE.
            if cells.iter().all(|c| c.parse::<i64>().is_ok()) {
                "INT"
            } else {
                "DOUBLE"
            }
        } else if !cells.is_empty() && cells.iter().all(|c| looks_like_timestamp(c)) {
            "TIMESTAMP"
        } else {
            "STRING"
        };

        let mut distinct: Vec<String> = Vec::new();
        for cell in cells {
            if !distinct.contains(cell) {
                distinct.push(cell.clone());
                if distinct.len() == SAMPLE_DISTINCT {
                    break;
                }
            }
        }
        info.distinct_values.insert(name.clone(), distinct);
        info.columns.push(ColumnInfo {
            name,
            data_type: data_type.to_string(),
            nullable: saw_empty[idx],
            description: String::new(),
        });
    }
    Ok(info)
}

fn engine_type(data_type: &str) -> &'static str {
    match data_type {
        "INT" => "BIGINT",
        "DOUBLE" => "DOUBLE",
        "TIMESTAMP" => "TIMESTAMP",
        _ => "VARCHAR",
    }
}

pub struct ObjectStoreAdapter {
    query: QueryServiceClient,
    dataset: String,
    bucket: String,
    discovered: SchemaDescriptor,
    /// External tables may be dropped and rebuilt at most once per adapter.
    recreated: Mutex<bool>,
}

impl ObjectStoreAdapter {
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let store = ObjectStoreClient::new(config);
        let query = QueryServiceClient::new(config);
        let dataset = config.database.clone();

        let discovered = discover_schema(&store, &dataset).await?;
        let adapter = Self {
            query,
            dataset,
            bucket: config.bucket.clone(),
            discovered,
            recreated: Mutex::new(false),
        };
        adapter.create_external_tables().await?;
        Ok(adapter)
    }

    async fn create_external_tables(&self) -> Result<()> {
        self.query
            .run(&format!("CREATE SCHEMA IF NOT EXISTS {}", self.dataset))
            .await?;
        for (table, info) in &self.discovered.tables {
            let columns: Vec<String> = info
                .columns
                .iter()
                .map(|c| format!("`{}` {}", c.name, engine_type(&c.data_type)))
                .collect();
            let ddl = format!(
                "CREATE EXTERNAL TABLE IF NOT EXISTS `{table}` ({columns}) \
                 ROW FORMAT DELIMITED FIELDS TERMINATED BY ',' STORED AS TEXTFILE \
                 LOCATION 's3://{bucket}/{dataset}/data/{table}/' \
                 TBLPROPERTIES ('skip.header.line.count'='1')",
                table = table,
                columns = columns.join(", "),
                bucket = self.bucket,
                dataset = self.dataset,
            );
            self.query.run(&ddl).await?;
            info!("created or verified external table {}", table);
        }
        Ok(())
    }

    async fn drop_and_recreate(&self) -> Result<()> {
        warn!("table-not-found from query service; rebuilding external tables for {}", self.dataset);
        for table in self.discovered.tables.keys() {
            if let Err(e) = self.query.run(&format!("DROP TABLE IF EXISTS `{}`", table)).await {
                warn!("dropping external table {} failed: {}", table, e);
            }
        }
        self.create_external_tables().await
    }
}

/// Table name for one listed key, when the key sits in a per-table directory
/// under the prefix (`{prefix}{table}/<file>.csv`). The external tables are
/// created over those directories, so flat keys directly under the prefix
/// have no location a table could point at and are rejected here.
fn table_for_key(prefix: &str, key: &str) -> Option<String> {
    let rest = key.strip_prefix(prefix)?;
    let (table, file) = rest.split_once('/')?;
    if table.is_empty() || !file.ends_with(".csv") || file.contains('/') {
        return None;
    }
    Some(table.to_string())
}

async fn discover_schema(store: &ObjectStoreClient, dataset: &str) -> Result<SchemaDescriptor> {
    let prefix = format!("{}/data/", dataset);
    let keys = store.list_keys(&prefix).await?;

    // One sample file per table directory.
    let mut samples: std::collections::BTreeMap<String, String> = Default::default();
    for key in &keys {
        match table_for_key(&prefix, key) {
            Some(table) => {
                samples.entry(table).or_insert_with(|| key.clone());
            }
            None => warn!("ignoring {}: not a per-table delimited file", key),
        }
    }

    let mut descriptor = SchemaDescriptor::default();
    for (table, key) in samples {
        match store.get_object(&key).await.and_then(|text| infer_table(&text)) {
            Ok(info) => descriptor.insert_table(table, info),
            Err(e) => warn!("skipping {}: {}", key, e),
        }
    }
    if descriptor.is_empty() {
        return Err(PilotError::SchemaExtraction(format!(
            "no delimited files found under {}",
            prefix
        )));
    }
    Ok(descriptor)
}

#[async_trait]
impl BackendAdapter for ObjectStoreAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::ObjectStore
    }

    async fn fetch_schema(&self, metadata: &MetadataConfig) -> Result<SchemaDescriptor> {
        let approved = crate::catalog::approved_tables(metadata)?;
        let descriptions = crate::catalog::column_descriptions(metadata)?;
        let mut descriptor = self.discovered.clone();
        if let Some(approved) = approved {
            descriptor.tables.retain(|name, _| approved.contains(name));
        }
        for (table, info) in descriptor.tables.iter_mut() {
            for column in info.columns.iter_mut() {
                if let Some(desc) = descriptions.get(&(table.clone(), column.name.clone())) {
                    column.description = desc.clone();
                }
            }
        }
        Ok(descriptor)
    }

    async fn execute(&self, sql: &str) -> Result<Table> {
        match self.query.run(sql).await {
            Ok(table) => Ok(table),
            Err(PilotError::Backend(message)) if is_table_not_found(&message) => {
                {
                    let mut recreated = self
                        .recreated
                        .lock()
                        .map_err(|_| PilotError::Backend("adapter state poisoned".into()))?;
                    if *recreated {
                        return Err(PilotError::Backend(message));
                    }
                    *recreated = true;
                }
                self.drop_and_recreate().await?;
                self.query.run(sql).await
            }
            Err(e) => Err(e),
        }
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_inference_types_and_samples() {
        let csv = "store,amount,ratio,day\nStore1,10,1.5,2024-01-02\nStore2,7,2.0,2024-01-03\n,3,0.5,2024-01-04\n";
        let info = infer_table(csv).unwrap();
        let by_name = |n: &str| info.column(n).unwrap().clone();
        assert_eq!(by_name("store").data_type, "STRING");
        assert!(by_name("store").nullable);
        assert_eq!(by_name("amount").data_type, "INT");
        assert_eq!(by_name("ratio").data_type, "DOUBLE");
        assert_eq!(by_name("day").data_type, "TIMESTAMP");
        assert_eq!(info.distinct_values["store"], vec!["Store1", "Store2"]);
    }

    #[test]
    fn table_not_found_classification() {
        assert!(is_table_not_found("TABLE_NOT_FOUND: line 1:15"));
        assert!(is_table_not_found("Table 'sales' does not exist"));
        assert!(!is_table_not_found("Column 'store' cannot be resolved"));
    }

    #[test]
    fn engine_types_cover_inferred_types() {
        assert_eq!(engine_type("INT"), "BIGINT");
        assert_eq!(engine_type("STRING"), "VARCHAR");
        assert_eq!(engine_type("TIMESTAMP"), "TIMESTAMP");
    }

    #[test]
    fn tables_come_from_per_table_directories() {
        let prefix = "shop/data/";
        // The table directory doubles as the external table's LOCATION, so a
        // discovered key must always sit under one.
        assert_eq!(
            table_for_key(prefix, "shop/data/sales/part-000.csv"),
            Some("sales".to_string())
        );
        assert_eq!(
            table_for_key(prefix, "shop/data/customers/2024.csv"),
            Some("customers".to_string())
        );
        // Flat files directly under the prefix have no directory a table
        // could point at.
        assert_eq!(table_for_key(prefix, "shop/data/sales.csv"), None);
        // Nested subdirectories and non-delimited files are ignored.
        assert_eq!(table_for_key(prefix, "shop/data/sales/archive/old.csv"), None);
        assert_eq!(table_for_key(prefix, "shop/data/sales/readme.txt"), None);
        assert_eq!(table_for_key(prefix, "other/data/sales/part-000.csv"), None);
    }
}
