//! Tabular results and per-attempt execution outcomes.

use serde::{Deserialize, Serialize};

/// One result cell. Backends that only speak text (the interactive query
/// service in particular) decode numeric-looking cells back into numbers
/// where the round trip is lossless.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    /// Decode a raw text cell, preferring integer, then float, then text.
    pub fn decode(raw: &str) -> Value {
        if raw.is_empty() {
            return Value::Null;
        }
        if let Ok(i) = raw.parse::<i64>() {
            return Value::Int(i);
        }
        if let Ok(f) = raw.parse::<f64>() {
            if f.is_finite() {
                return Value::Float(f);
            }
        }
        Value::Text(raw.to_string())
    }

    pub fn is_null_or_zero(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Int(i) => *i == 0,
            Value::Float(f) => *f == 0.0,
            _ => false,
        }
    }

    pub fn render(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Text(s) => s.clone(),
        }
    }
}

/// A materialized query result: named columns plus row-major cells.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// The "probably a wrong filter literal" shape: exactly one row and every
    /// cell in it is null or zero.
    pub fn is_degenerate(&self) -> bool {
        self.rows.len() == 1 && self.rows[0].iter().all(Value::is_null_or_zero)
    }

    /// All values of the first column, rendered as text. Used when reading
    /// `SELECT DISTINCT <col>` results.
    pub fn first_column_values(&self) -> Vec<String> {
        self.rows
            .iter()
            .filter_map(|row| row.first())
            .filter(|v| !matches!(v, Value::Null))
            .map(Value::render)
            .collect()
    }
}

/// Why an execution attempt did not produce a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExecutionFailure {
    /// Statement is not SELECT/WITH; rejected before touching the backend.
    InvalidStatement,
    /// The counting wrapper estimated more rows than the configured cap.
    RecordThresholdExceeded { estimated: u64, threshold: u64 },
    /// Wall-clock budget exhausted.
    Timeout { seconds: u64 },
    /// Backend-level error, raw message preserved for rectification.
    Failed(String),
}

impl ExecutionFailure {
    /// Error text handed to the correction collaborator.
    pub fn message(&self) -> String {
        match self {
            ExecutionFailure::InvalidStatement => {
                "Error: Generated SQL not valid! Please retry with a different question.".to_string()
            }
            ExecutionFailure::RecordThresholdExceeded { estimated, threshold } => format!(
                "Number of data records is {} which is more than the threshold {}. Rephrase the question by adding a filter criteria",
                estimated, threshold
            ),
            ExecutionFailure::Timeout { seconds } => {
                format!("SQL execution timeout after {}s!", seconds)
            }
            ExecutionFailure::Failed(msg) => msg.clone(),
        }
    }

    /// Retryable failures are handed to the rectification loop; the statement
    /// gate is terminal by design.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ExecutionFailure::InvalidStatement)
    }
}

/// Outcome of one execution attempt. Never mutated: retries build a new one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub table: Table,
    pub failure: Option<ExecutionFailure>,
    pub truncated: bool,
}

impl ExecutionResult {
    pub fn ok(table: Table) -> Self {
        Self {
            table,
            failure: None,
            truncated: false,
        }
    }

    pub fn failed(failure: ExecutionFailure) -> Self {
        Self {
            table: Table::default(),
            failure: Some(failure),
            truncated: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_prefers_lossless_numerics() {
        assert_eq!(Value::decode("42"), Value::Int(42));
        assert_eq!(Value::decode("4.5"), Value::Float(4.5));
        assert_eq!(Value::decode("store1"), Value::Text("store1".to_string()));
        assert_eq!(Value::decode(""), Value::Null);
    }

    #[test]
    fn degenerate_detection() {
        let mut t = Table::new(vec!["total".into()]);
        t.rows.push(vec![Value::Null]);
        assert!(t.is_degenerate());

        t.rows[0] = vec![Value::Int(0)];
        assert!(t.is_degenerate());

        t.rows[0] = vec![Value::Int(3)];
        assert!(!t.is_degenerate());

        t.rows.push(vec![Value::Null]);
        assert!(!t.is_degenerate());
    }
}
