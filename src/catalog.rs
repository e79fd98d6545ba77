//! Schema catalog: one normalized descriptor per dataset, extracted through
//! the backend adapter, optionally scoped by a business-metadata sheet, and
//! reused verbatim across the questions of an "existing" session.

use crate::backend::BackendAdapter;
use crate::config::MetadataConfig;
use crate::error::{PilotError, Result};
use crate::schema::{SchemaArtifactStore, SchemaDescriptor, Session};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use tracing::{info, warn};

/// Tables approved by the metadata sheet, or `None` when extraction should
/// cover everything. Sheet problems degrade to "no scoping" rather than
/// failing the extraction.
pub fn approved_tables(metadata: &MetadataConfig) -> Result<Option<HashSet<String>>> {
    if !metadata.is_meta {
        return Ok(None);
    }
    let Some(path) = metadata.table_sheet.as_ref() else {
        return Ok(None);
    };
    match read_sheet_column(path, "Table Name") {
        Ok(tables) if !tables.is_empty() => Ok(Some(tables.into_iter().collect())),
        Ok(_) => {
            warn!("metadata sheet {} lists no tables; ignoring it", path.display());
            Ok(None)
        }
        Err(e) => {
            warn!("could not read metadata sheet {}: {}", path.display(), e);
            Ok(None)
        }
    }
}

/// (table, column) → business description from the column sheet.
pub fn column_descriptions(metadata: &MetadataConfig) -> Result<HashMap<(String, String), String>> {
    let mut out = HashMap::new();
    if !metadata.is_meta {
        return Ok(out);
    }
    let Some(path) = metadata.column_sheet.as_ref() else {
        return Ok(out);
    };
    let mut reader = match csv::Reader::from_path(path) {
        Ok(reader) => reader,
        Err(e) => {
            warn!("could not read column sheet {}: {}", path.display(), e);
            return Ok(out);
        }
    };
    let headers = reader
        .headers()
        .map_err(|e| PilotError::SchemaExtraction(e.to_string()))?
        .clone();
    let idx = |name: &str| headers.iter().position(|h| h == name);
    let (Some(table_idx), Some(column_idx), Some(desc_idx)) = (
        idx("Table Name"),
        idx("Column Name"),
        idx("Column Description"),
    ) else {
        warn!("column sheet {} is missing expected headers", path.display());
        return Ok(out);
    };
    for record in reader.records() {
        let Ok(record) = record else { continue };
        let (Some(table), Some(column)) = (record.get(table_idx), record.get(column_idx)) else {
            continue;
        };
        let description = record.get(desc_idx).unwrap_or_default();
        out.insert(
            (table.to_string(), column.to_string()),
            description.to_string(),
        );
    }
    Ok(out)
}

fn read_sheet_column(path: &PathBuf, header: &str) -> Result<Vec<String>> {
    let mut reader =
        csv::Reader::from_path(path).map_err(|e| PilotError::SchemaExtraction(e.to_string()))?;
    let headers = reader
        .headers()
        .map_err(|e| PilotError::SchemaExtraction(e.to_string()))?
        .clone();
    let Some(idx) = headers.iter().position(|h| h == header) else {
        return Err(PilotError::SchemaExtraction(format!(
            "sheet {} has no '{}' column",
            path.display(),
            header
        )));
    };
    let mut values = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| PilotError::SchemaExtraction(e.to_string()))?;
        if let Some(value) = record.get(idx) {
            if !value.is_empty() && !values.contains(&value.to_string()) {
                values.push(value.to_string());
            }
        }
    }
    Ok(values)
}

pub struct SchemaCatalog {
    store: SchemaArtifactStore,
}

impl SchemaCatalog {
    pub fn new(artifact_dir: impl Into<PathBuf>) -> Self {
        Self {
            store: SchemaArtifactStore::new(artifact_dir),
        }
    }

    /// Extract (or reuse) the descriptor for one dataset.
    ///
    /// "Existing" sessions load the persisted artifact and fall back to a
    /// full extraction when loading fails for any reason. "New" sessions
    /// always extract and persist the artifact for later questions.
    pub async fn extract(
        &self,
        adapter: &dyn BackendAdapter,
        metadata: &MetadataConfig,
        session: Session,
        dataset: &str,
    ) -> Result<SchemaDescriptor> {
        if session == Session::Existing {
            match self.store.load(dataset) {
                Ok(descriptor) => {
                    info!("reusing persisted schema for dataset {}", dataset);
                    return Ok(descriptor);
                }
                Err(e) => {
                    warn!("schema artifact for {} unavailable ({}); re-extracting", dataset, e);
                }
            }
        }

        let descriptor = adapter.fetch_schema(metadata).await?;
        if descriptor.is_empty() {
            return Err(PilotError::SchemaExtraction(format!(
                "no tables found in dataset {}",
                dataset
            )));
        }
        if let Err(e) = self.store.save(dataset, &descriptor) {
            // Persistence is an optimization for later questions, not a
            // correctness requirement for this one.
            warn!("could not persist schema artifact for {}: {}", dataset, e);
        }
        Ok(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_sheet(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("datapilot-{}-{}", uuid::Uuid::new_v4(), name));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn metadata_disabled_means_no_scoping() {
        let metadata = MetadataConfig::default();
        assert!(approved_tables(&metadata).unwrap().is_none());
        assert!(column_descriptions(&metadata).unwrap().is_empty());
    }

    #[test]
    fn approved_tables_come_from_the_sheet() {
        let sheet = write_sheet(
            "tables.csv",
            "Table Name,Description\nsales,Sales facts\ncustomers,Customer master\n",
        );
        let metadata = MetadataConfig {
            is_meta: true,
            table_sheet: Some(sheet.clone()),
            column_sheet: None,
        };
        let approved = approved_tables(&metadata).unwrap().unwrap();
        assert!(approved.contains("sales"));
        assert!(approved.contains("customers"));
        assert_eq!(approved.len(), 2);
        std::fs::remove_file(sheet).unwrap();
    }

    #[test]
    fn unreadable_sheet_degrades_to_no_scoping() {
        let metadata = MetadataConfig {
            is_meta: true,
            table_sheet: Some(PathBuf::from("/nonexistent/tables.csv")),
            column_sheet: None,
        };
        assert!(approved_tables(&metadata).unwrap().is_none());
    }

    #[test]
    fn column_descriptions_are_keyed_by_table_and_column() {
        let sheet = write_sheet(
            "columns.csv",
            "Table Name,Column Name,Column Description\nsales,store,Store identifier\n",
        );
        let metadata = MetadataConfig {
            is_meta: true,
            table_sheet: None,
            column_sheet: Some(sheet.clone()),
        };
        let descriptions = column_descriptions(&metadata).unwrap();
        assert_eq!(
            descriptions[&("sales".to_string(), "store".to_string())],
            "Store identifier"
        );
        std::fs::remove_file(sheet).unwrap();
    }
}
