//! Rectification loop: feed a failed statement, its raw backend error and the
//! schema back to the generation collaborator, then re-execute the corrected
//! statement. Bounded by a fixed attempt budget.

use crate::backend::BackendAdapter;
use crate::config::GuardConfig;
use crate::guard::ExecutionGuard;
use crate::llm::GenerationClient;
use crate::result::ExecutionResult;
use tracing::{info, warn};

/// Outcome of the loop: the last execution result and the statement that
/// produced it (the corrected statement once any correction was applied).
pub struct Rectification {
    pub result: ExecutionResult,
    pub sql: String,
    pub attempts: u32,
}

pub struct RectificationLoop;

impl RectificationLoop {
    /// Execute `sql`, correcting and retrying on retryable failures until it
    /// succeeds or `max_attempts` executions have run. Non-retryable failures
    /// (the statement gate) end the loop immediately: regenerating from the
    /// same question would reproduce them.
    pub async fn run_with_retries(
        adapter: &dyn BackendAdapter,
        guard: &GuardConfig,
        llm: &dyn GenerationClient,
        question: &str,
        sql: &str,
        schema_text: &str,
        max_attempts: u32,
    ) -> Rectification {
        let mut current = sql.to_string();
        let mut attempts = 0;

        loop {
            attempts += 1;
            let result = ExecutionGuard::run(adapter, &current, guard).await;

            let Some(failure) = result.failure.as_ref() else {
                return Rectification { result, sql: current, attempts };
            };
            if !failure.is_retryable() || attempts >= max_attempts {
                return Rectification { result, sql: current, attempts };
            }

            info!("attempt {} failed ({}); asking for a correction", attempts, failure.message());
            match llm
                .correct(adapter.kind(), question, &current, &failure.message(), schema_text)
                .await
            {
                Ok(corrected) => current = corrected,
                Err(e) => {
                    warn!("correction request failed: {}", e);
                    return Rectification { result, sql: current, attempts };
                }
            }
        }
    }
}
