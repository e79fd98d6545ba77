//! Backend-agnostic schema descriptor, its prompt rendering, and the
//! per-dataset persisted artifact reused across "existing" sessions.

use crate::error::{PilotError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{info, warn};

pub const MAX_DISTINCT_VALUES: usize = 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForeignKeyInfo {
    pub columns: Vec<String>,
    pub referred_table: String,
    pub referred_columns: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableInfo {
    pub columns: Vec<ColumnInfo>,
    pub primary_keys: Vec<String>,
    pub foreign_keys: Vec<ForeignKeyInfo>,
    /// Bounded sample of distinct values per column.
    pub distinct_values: BTreeMap<String, Vec<String>>,
}

impl TableInfo {
    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// Normalized schema for one dataset: table name → description.
/// Invariant: every keyed table has at least one column.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    pub tables: BTreeMap<String, TableInfo>,
}

impl SchemaDescriptor {
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Insert a table, dropping it when the column list is empty.
    pub fn insert_table(&mut self, name: String, info: TableInfo) {
        if info.columns.is_empty() {
            warn!("skipping table {}: no columns extracted", name);
            return;
        }
        self.tables.insert(name, info);
    }

    pub fn table_names(&self) -> Vec<String> {
        self.tables.keys().cloned().collect()
    }

    /// Tables that contain the given column name.
    pub fn tables_with_column(&self, column: &str) -> Vec<String> {
        self.tables
            .iter()
            .filter(|(_, info)| info.column(column).is_some())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Human-readable rendering embedded into generation prompts.
    pub fn schema_text(&self) -> String {
        let mut out = String::from("Database Schema:\n");
        for (table, info) in &self.tables {
            out.push_str(&format!("*****TABLE {} starts*****\n", table));
            out.push_str("Columns:\n");
            for col in &info.columns {
                let nullable = if col.nullable { "nullable" } else { "not null" };
                out.push_str(&format!("  - {} ({}, {})", col.name, col.data_type, nullable));
                if !col.description.is_empty() {
                    out.push_str(&format!(", Column description: {}", col.description));
                }
                out.push('\n');
            }
            if !info.primary_keys.is_empty() {
                out.push_str("Primary Keys:\n");
                for pk in &info.primary_keys {
                    out.push_str(&format!("  - {}\n", pk));
                }
            }
            if !info.foreign_keys.is_empty() {
                out.push_str("Foreign Keys:\n");
                for fk in &info.foreign_keys {
                    out.push_str(&format!(
                        "  - {} -> {}({})\n",
                        fk.columns.join(", "),
                        fk.referred_table,
                        fk.referred_columns.join(", ")
                    ));
                }
            }
            if !info.distinct_values.is_empty() {
                out.push_str("Distinct Values:\n");
                for (column, values) in &info.distinct_values {
                    out.push_str(&format!("  - {}: {}\n", column, values.join(", ")));
                }
            }
            out.push_str(&format!("*****TABLE {} ends*****\n\n", table));
        }
        out
    }
}

/// Whether a question opens a fresh analysis session or continues a prior one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Session {
    New,
    Existing,
}

/// Filesystem store for the per-dataset schema artifact: a JSON descriptor
/// plus the plain-text rendering, written once per new session.
#[derive(Debug, Clone)]
pub struct SchemaArtifactStore {
    dir: PathBuf,
}

impl SchemaArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn json_path(&self, dataset: &str) -> PathBuf {
        self.dir.join(format!("{}_schema_info.json", dataset))
    }

    fn text_path(&self, dataset: &str) -> PathBuf {
        self.dir.join(format!("{}_schema.txt", dataset))
    }

    pub fn save(&self, dataset: &str, descriptor: &SchemaDescriptor) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let encoded = serde_json::to_string_pretty(descriptor)?;
        std::fs::write(self.json_path(dataset), encoded)?;
        std::fs::write(self.text_path(dataset), descriptor.schema_text())?;
        info!("persisted schema artifact for dataset {}", dataset);
        Ok(())
    }

    pub fn load(&self, dataset: &str) -> Result<SchemaDescriptor> {
        let path = self.json_path(dataset);
        let encoded = std::fs::read_to_string(&path)?;
        let descriptor: SchemaDescriptor = serde_json::from_str(&encoded)?;
        if descriptor.is_empty() {
            return Err(PilotError::SchemaExtraction(format!(
                "artifact {} holds no tables",
                path.display()
            )));
        }
        Ok(descriptor)
    }
}

/// Cap a distinct-value list to the descriptor bound.
pub fn cap_distinct(mut values: Vec<String>, cap: usize) -> Vec<String> {
    values.truncate(cap);
    values
}
