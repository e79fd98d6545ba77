//! Value normalizer: when a statement runs cleanly but returns nothing (or a
//! single all-null/zero row), the filter literals are usually spelled
//! differently from the stored values. Extract the quoted equality filters,
//! fuzzy-match each literal against the column's distinct values, substitute
//! the best matches and re-execute once.

use crate::backend::BackendAdapter;
use crate::config::{GuardConfig, NormalizeConfig};
use crate::guard::ExecutionGuard;
use crate::result::ExecutionResult;
use crate::schema::SchemaDescriptor;
use itertools::Itertools;
use regex::Regex;
use std::collections::HashMap;
use tracing::{debug, info};

pub const NO_FILTERS_SUGGESTION: &str =
    "Normalization could not be performed as no filter conditions were found in the query.";
pub const NO_MATCHES_SUGGESTION: &str =
    "No similar values found in the database. Try rephrasing the query with different entities";
pub const STILL_EMPTY_SUGGESTION: &str =
    "No records exist even with suggested replacements. Try rephrasing the query with different entities";

/// One `column = 'literal'` filter lifted out of the statement.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FilterComponent {
    /// Table alias or name qualifying the column, when the statement had one.
    pub qualifier: Option<String>,
    pub column: String,
    pub value: String,
}

/// What the normalizer did with one statement.
#[derive(Debug)]
pub struct Normalization {
    pub sql: String,
    /// Present only when a substitution happened and the statement re-ran.
    pub result: Option<ExecutionResult>,
    pub suggestion: Option<String>,
    /// Human-readable log of the substitutions, e.g. `Replaced 'store1' with 'Store1'`.
    pub replacements: Vec<String>,
}

/// Whether the result shape warrants a normalization pass.
pub fn should_normalize(result: &ExecutionResult, config: &NormalizeConfig) -> bool {
    if !result.is_success() {
        return false;
    }
    result.table.is_empty()
        || (config.treat_degenerate_row_as_empty && result.table.is_degenerate())
}

/// Pull quoted equality filters out of a statement. Covers `col = 'v'`,
/// `alias.col = 'v'` and `fn(col) = 'v'`, with single or double quotes.
pub fn extract_filters(sql: &str) -> Vec<FilterComponent> {
    let plain = Regex::new(
        r#"(?i)([A-Za-z_][A-Za-z0-9_]*)(?:\.([A-Za-z_][A-Za-z0-9_]*))?\s*=\s*(?:'([^']*)'|"([^"]*)")"#,
    )
    .expect("static pattern");
    let wrapped = Regex::new(
        r#"(?i)[A-Za-z_][A-Za-z0-9_]*\(\s*(?:([A-Za-z_][A-Za-z0-9_]*)\.)?([A-Za-z_][A-Za-z0-9_]*)\s*\)\s*=\s*(?:'([^']*)'|"([^"]*)")"#,
    )
    .expect("static pattern");

    let mut filters = Vec::new();
    for caps in plain.captures_iter(sql) {
        let first = caps.get(1).map(|m| m.as_str().to_string());
        let second = caps.get(2).map(|m| m.as_str().to_string());
        let value = caps
            .get(3)
            .or_else(|| caps.get(4))
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();
        let (qualifier, column) = match (first, second) {
            (Some(q), Some(c)) => (Some(q), c),
            (Some(c), None) => (None, c),
            _ => continue,
        };
        filters.push(FilterComponent { qualifier, column, value });
    }
    for caps in wrapped.captures_iter(sql) {
        let qualifier = caps.get(1).map(|m| m.as_str().to_string());
        let Some(column) = caps.get(2).map(|m| m.as_str().to_string()) else {
            continue;
        };
        let value = caps
            .get(3)
            .or_else(|| caps.get(4))
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();
        filters.push(FilterComponent { qualifier, column, value });
    }
    filters.into_iter().filter(|f| !f.value.is_empty()).unique().collect()
}

const RESERVED_ALIASES: &[&str] = &[
    "where", "on", "join", "inner", "left", "right", "full", "outer", "cross", "group", "order",
    "limit", "having", "union", "select", "as", "using",
];

/// alias → table map built from the FROM/JOIN clauses.
pub fn alias_map(sql: &str) -> HashMap<String, String> {
    let re = Regex::new(
        r#"(?i)\b(?:FROM|JOIN)\s+([A-Za-z_][A-Za-z0-9_]*)(?:\s+(?:AS\s+)?([A-Za-z_][A-Za-z0-9_]*))?"#,
    )
    .expect("static pattern");
    let mut out = HashMap::new();
    for caps in re.captures_iter(sql) {
        let Some(table) = caps.get(1).map(|m| m.as_str().to_string()) else {
            continue;
        };
        out.insert(table.clone(), table.clone());
        if let Some(alias) = caps.get(2).map(|m| m.as_str()) {
            if !RESERVED_ALIASES.contains(&alias.to_lowercase().as_str()) {
                out.insert(alias.to_string(), table);
            }
        }
    }
    out
}

/// Token-set similarity on a 0..=100 scale, case-insensitive. Compares the
/// sorted token intersection against each side's full sorted token string and
/// keeps the best of the three scores.
pub fn token_set_ratio(a: &str, b: &str) -> u32 {
    let tokens = |s: &str| -> Vec<String> {
        s.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .sorted()
            .dedup()
            .collect()
    };
    let ta = tokens(a);
    let tb = tokens(b);
    if ta.is_empty() || tb.is_empty() {
        return 0;
    }
    let common: Vec<String> = ta.iter().filter(|t| tb.contains(t)).cloned().collect();
    let join = |ts: &[String]| ts.join(" ");
    let ratio = |x: &str, y: &str| (strsim::normalized_levenshtein(x, y) * 100.0).round() as u32;

    let base = join(&common);
    let full_a = join(&ta);
    let full_b = join(&tb);
    let mut best = ratio(&full_a, &full_b);
    if !base.is_empty() {
        best = best.max(ratio(&base, &full_a)).max(ratio(&base, &full_b));
    }
    best
}

/// Escape a literal for inline substitution into a quoted SQL string.
pub fn escape_sql_string(value: &str) -> String {
    value.replace('\'', "''")
}

struct Candidate {
    filter: FilterComponent,
    table: String,
}

fn resolve_tables(
    filters: &[FilterComponent],
    aliases: &HashMap<String, String>,
    descriptor: &SchemaDescriptor,
) -> Vec<Candidate> {
    let mut out = Vec::new();
    for filter in filters {
        let table = match filter.qualifier.as_ref().and_then(|q| aliases.get(q)) {
            Some(table) if descriptor.tables.get(table).map_or(false, |t| t.column(&filter.column).is_some()) => {
                Some(table.clone())
            }
            _ => descriptor.tables_with_column(&filter.column).into_iter().next(),
        };
        match table {
            Some(table) => out.push(Candidate { filter: filter.clone(), table }),
            None => debug!("filter column {} not found in any table; skipping", filter.column),
        }
    }
    out
}

pub struct ValueNormalizer;

impl ValueNormalizer {
    /// Attempt one normalization pass over `sql`. The caller decides whether
    /// the pass is warranted (see [`should_normalize`]).
    pub async fn normalize(
        adapter: &dyn BackendAdapter,
        guard: &GuardConfig,
        descriptor: &SchemaDescriptor,
        sql: &str,
        config: &NormalizeConfig,
    ) -> Normalization {
        let filters = extract_filters(sql);
        if filters.is_empty() {
            return Normalization {
                sql: sql.to_string(),
                result: None,
                suggestion: Some(NO_FILTERS_SUGGESTION.to_string()),
                replacements: Vec::new(),
            };
        }

        let aliases = alias_map(sql);
        let candidates = resolve_tables(&filters, &aliases, descriptor);

        let mut corrected = sql.to_string();
        let mut replacements = Vec::new();
        for candidate in &candidates {
            let distinct_sql = format!(
                "SELECT DISTINCT \"{}\" FROM \"{}\"",
                candidate.filter.column, candidate.table
            );
            let values = match adapter.execute(&distinct_sql).await {
                Ok(table) => table.first_column_values(),
                Err(e) => {
                    debug!(
                        "could not list values for {}.{}: {}",
                        candidate.table, candidate.filter.column, e
                    );
                    continue;
                }
            };

            let original = &candidate.filter.value;
            let best = values
                .iter()
                .filter(|v| v.as_str() != original)
                .map(|v| (token_set_ratio(original, v), v))
                .filter(|(score, _)| *score > config.match_threshold)
                .max_by_key(|(score, _)| *score);
            if let Some((score, replacement)) = best {
                info!(
                    "replacing '{}' with '{}' (score {})",
                    original, replacement, score
                );
                corrected = corrected.replace(
                    &format!("'{}'", original),
                    &format!("'{}'", escape_sql_string(replacement)),
                );
                corrected = corrected.replace(
                    &format!("\"{}\"", original),
                    &format!("'{}'", escape_sql_string(replacement)),
                );
                replacements.push(format!("Replaced '{}' with '{}'", original, replacement));
            }
        }

        if replacements.is_empty() {
            return Normalization {
                sql: sql.to_string(),
                result: None,
                suggestion: Some(NO_MATCHES_SUGGESTION.to_string()),
                replacements,
            };
        }

        let result = ExecutionGuard::run(adapter, &corrected, guard).await;
        let produced_rows = result.is_success()
            && !result.table.is_empty()
            && !(config.treat_degenerate_row_as_empty && result.table.is_degenerate());
        if produced_rows {
            return Normalization {
                sql: corrected,
                result: Some(result),
                suggestion: None,
                replacements,
            };
        }

        // The substitutions did not pan out: keep the caller's statement and
        // result, and report what was tried.
        let detail = match result.failure.as_ref() {
            Some(failure) => failure.message(),
            None => STILL_EMPTY_SUGGESTION.to_string(),
        };
        Normalization {
            sql: sql.to_string(),
            result: None,
            suggestion: Some(format!("{} (attempted: {})", detail, replacements.join(", "))),
            replacements,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::sqlite::SqliteAdapter;
    use crate::backend::BackendAdapter;
    use crate::config::{ConnectionConfig, MetadataConfig};
    use crate::result::{ExecutionFailure, Table, Value};
    use std::time::Duration;

    #[test]
    fn filters_are_extracted_from_all_supported_shapes() {
        let sql = "SELECT * FROM sales s JOIN stores st ON s.store = st.name \
                   WHERE s.store = 'store1' AND LOWER(region) = 'west' AND city = \"Austin\"";
        let filters = extract_filters(sql);
        assert!(filters.contains(&FilterComponent {
            qualifier: Some("s".into()),
            column: "store".into(),
            value: "store1".into(),
        }));
        assert!(filters.contains(&FilterComponent {
            qualifier: None,
            column: "region".into(),
            value: "west".into(),
        }));
        assert!(filters.contains(&FilterComponent {
            qualifier: None,
            column: "city".into(),
            value: "Austin".into(),
        }));
    }

    #[test]
    fn unquoted_comparisons_are_ignored() {
        assert!(extract_filters("SELECT * FROM t WHERE amount = 5").is_empty());
    }

    #[test]
    fn alias_map_covers_from_and_join() {
        let aliases = alias_map("SELECT * FROM sales s JOIN stores AS st ON s.id = st.id WHERE 1=1");
        assert_eq!(aliases["s"], "sales");
        assert_eq!(aliases["st"], "stores");
        assert_eq!(aliases["sales"], "sales");
        assert!(!aliases.contains_key("where"));
    }

    #[test]
    fn token_set_ratio_handles_case_and_reordering() {
        assert_eq!(token_set_ratio("Store1", "store1"), 100);
        assert_eq!(token_set_ratio("new york city", "city new york"), 100);
        assert!(token_set_ratio("store1", "Store1 Downtown") > 80);
        assert!(token_set_ratio("store1", "warehouse") < 50);
    }

    #[test]
    fn sql_string_escaping_doubles_quotes() {
        assert_eq!(escape_sql_string("O'Brien"), "O''Brien");
    }

    #[test]
    fn degenerate_single_row_triggers_normalization() {
        let config = NormalizeConfig::default();
        let mut table = Table::new(vec!["total".into()]);
        table.rows.push(vec![Value::Null]);
        assert!(should_normalize(&ExecutionResult::ok(table), &config));
        assert!(should_normalize(&ExecutionResult::ok(Table::default()), &config));
        assert!(!should_normalize(
            &ExecutionResult::failed(ExecutionFailure::InvalidStatement),
            &config
        ));
    }

    fn guard() -> GuardConfig {
        GuardConfig {
            row_threshold: 1000,
            time_threshold: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn misspelled_literal_is_replaced_and_reexecuted() {
        let path = std::env::temp_dir().join(format!("datapilot-{}.db", uuid::Uuid::new_v4()));
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE sales (store TEXT, amount INTEGER);
             INSERT INTO sales VALUES ('Store1', 10), ('Store1', 5), ('Store2', 7);",
        )
        .unwrap();
        drop(conn);

        let config = ConnectionConfig {
            db_file_path: Some(path.clone()),
            ..Default::default()
        };
        let adapter = SqliteAdapter::open(&config).unwrap();
        let descriptor = adapter.fetch_schema(&MetadataConfig::default()).await.unwrap();

        let sql = "SELECT SUM(amount) AS total FROM sales WHERE store = 'store1'";
        let out = ValueNormalizer::normalize(
            &adapter,
            &guard(),
            &descriptor,
            sql,
            &NormalizeConfig::default(),
        )
        .await;

        assert_eq!(out.replacements, vec!["Replaced 'store1' with 'Store1'"]);
        assert!(out.sql.contains("'Store1'"));
        let result = out.result.unwrap();
        assert!(result.is_success());
        assert_eq!(result.table.rows[0], vec![Value::Int(15)]);
        assert!(out.suggestion.is_none());
        std::fs::remove_file(path).unwrap();
    }

    #[tokio::test]
    async fn failed_reexecution_keeps_the_original_statement() {
        let path = std::env::temp_dir().join(format!("datapilot-{}.db", uuid::Uuid::new_v4()));
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE sales (store TEXT, amount INTEGER);
             INSERT INTO sales VALUES ('Store1', 10), ('Store1', 5);",
        )
        .unwrap();
        drop(conn);

        let config = ConnectionConfig {
            db_file_path: Some(path.clone()),
            ..Default::default()
        };
        let adapter = SqliteAdapter::open(&config).unwrap();
        let descriptor = adapter.fetch_schema(&MetadataConfig::default()).await.unwrap();

        // The substituted statement would match two rows, tripping the cap.
        let tight = GuardConfig {
            row_threshold: 1,
            time_threshold: Duration::from_secs(5),
        };
        let sql = "SELECT * FROM sales WHERE store = 'store1'";
        let out = ValueNormalizer::normalize(
            &adapter,
            &tight,
            &descriptor,
            sql,
            &NormalizeConfig::default(),
        )
        .await;

        assert_eq!(out.sql, sql);
        assert!(out.result.is_none());
        assert_eq!(out.replacements, vec!["Replaced 'store1' with 'Store1'"]);
        let suggestion = out.suggestion.unwrap();
        assert!(suggestion.contains("more than the threshold"));
        assert!(suggestion.contains("Replaced 'store1' with 'Store1'"));
        std::fs::remove_file(path).unwrap();
    }

    #[tokio::test]
    async fn still_empty_reexecution_falls_back_with_the_attempt_log() {
        let path = std::env::temp_dir().join(format!("datapilot-{}.db", uuid::Uuid::new_v4()));
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE sales (store TEXT, city TEXT);
             INSERT INTO sales VALUES ('Store1', 'London'), ('Store1', 'London');",
        )
        .unwrap();
        drop(conn);

        let config = ConnectionConfig {
            db_file_path: Some(path.clone()),
            ..Default::default()
        };
        let adapter = SqliteAdapter::open(&config).unwrap();
        let descriptor = adapter.fetch_schema(&MetadataConfig::default()).await.unwrap();

        // Only the store literal has a close match; the city filter still
        // excludes every row after substitution.
        let sql = "SELECT * FROM sales WHERE store = 'store3' AND city = 'Paris'";
        let out = ValueNormalizer::normalize(
            &adapter,
            &guard(),
            &descriptor,
            sql,
            &NormalizeConfig::default(),
        )
        .await;

        assert_eq!(out.sql, sql);
        assert!(out.result.is_none());
        assert_eq!(out.replacements, vec!["Replaced 'store3' with 'Store1'"]);
        let suggestion = out.suggestion.unwrap();
        assert!(suggestion.contains(STILL_EMPTY_SUGGESTION));
        assert!(suggestion.contains("Replaced 'store3' with 'Store1'"));
        std::fs::remove_file(path).unwrap();
    }

    #[tokio::test]
    async fn filterless_statement_yields_the_no_filters_suggestion() {
        let path = std::env::temp_dir().join(format!("datapilot-{}.db", uuid::Uuid::new_v4()));
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute_batch("CREATE TABLE sales (store TEXT, amount INTEGER);").unwrap();
        drop(conn);

        let config = ConnectionConfig {
            db_file_path: Some(path.clone()),
            ..Default::default()
        };
        let adapter = SqliteAdapter::open(&config).unwrap();
        let descriptor = SchemaDescriptor::default();

        let out = ValueNormalizer::normalize(
            &adapter,
            &guard(),
            &descriptor,
            "SELECT SUM(amount) FROM sales",
            &NormalizeConfig::default(),
        )
        .await;
        assert_eq!(out.suggestion.as_deref(), Some(NO_FILTERS_SUGGESTION));
        assert!(out.result.is_none());
        std::fs::remove_file(path).unwrap();
    }
}
