//! Execution guard: the safety gate in front of every statement the pipeline
//! runs. Refuses non-SELECT statements outright, estimates result size with a
//! counting wrapper before materializing anything, and enforces a wall-clock
//! budget around the real execution.

use crate::backend::BackendAdapter;
use crate::config::GuardConfig;
use crate::result::{ExecutionFailure, ExecutionResult};
use tracing::{debug, warn};

/// Only read statements pass the gate.
pub fn statement_allowed(sql: &str) -> bool {
    let upper = sql.trim().to_uppercase();
    upper.starts_with("SELECT") || upper.starts_with("WITH")
}

fn count_wrapper(sql: &str) -> String {
    // Only the statement terminator goes; semicolons inside literals stay.
    let clean = sql.trim().trim_end_matches(';').trim_end();
    format!("SELECT COUNT(*) FROM ({}) AS subquery", clean)
}

pub struct ExecutionGuard;

impl ExecutionGuard {
    /// Run one statement under the configured limits. Never raises across the
    /// component boundary: failures come back typed inside the result.
    pub async fn run(
        adapter: &dyn BackendAdapter,
        sql: &str,
        config: &GuardConfig,
    ) -> ExecutionResult {
        if !statement_allowed(sql) {
            warn!("refusing non-SELECT statement");
            return ExecutionResult::failed(ExecutionFailure::InvalidStatement);
        }

        let bounded = tokio::time::timeout(config.time_threshold, async {
            // Estimate before materializing: the full result set is never
            // fetched when the estimate is over the cap.
            let estimated = match adapter.execute(&count_wrapper(sql)).await {
                Ok(count_table) => count_table
                    .rows
                    .first()
                    .and_then(|row| row.first())
                    .and_then(|cell| match cell {
                        crate::result::Value::Int(i) => Some(*i as u64),
                        crate::result::Value::Float(f) => Some(*f as u64),
                        _ => None,
                    })
                    .unwrap_or(0),
                Err(e) => {
                    return ExecutionResult::failed(ExecutionFailure::Failed(e.to_string()));
                }
            };
            debug!("estimated {} result rows", estimated);
            if estimated > config.row_threshold {
                return ExecutionResult::failed(ExecutionFailure::RecordThresholdExceeded {
                    estimated,
                    threshold: config.row_threshold,
                });
            }

            match adapter.execute(sql).await {
                Ok(table) => ExecutionResult::ok(table),
                Err(e) => ExecutionResult::failed(ExecutionFailure::Failed(e.to_string())),
            }
        })
        .await;

        match bounded {
            Ok(result) => result,
            Err(_) => {
                warn!("execution exceeded {:?}", config.time_threshold);
                ExecutionResult::failed(ExecutionFailure::Timeout {
                    seconds: config.time_threshold.as_secs(),
                })
            }
        }
    }
}
