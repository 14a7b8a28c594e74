use super::client::{ExecutionClient, StatusProxyClient};
use super::types::*;
use crate::config::PollConfig;
use crate::error::{Result, StackError};
use std::time::Duration;
use tracing::{error, info};

/// Submits a run to the execution service and follows it through the
/// workbench status proxy until it reaches a terminal state.
pub struct JobRunVerifier {
    execution: ExecutionClient,
    proxy: StatusProxyClient,
    max_attempts: u32,
    interval: Duration,
}

/// Where the poll loop ended up.
#[derive(Debug, Clone, PartialEq)]
pub struct PollOutcome {
    pub record: RunRecord,
    pub attempts: u32,
    pub last_body: String,
}

impl JobRunVerifier {
    pub fn new(execution_base_url: &str, proxy_base_url: &str, poll: &PollConfig) -> Self {
        Self {
            execution: ExecutionClient::new(execution_base_url),
            proxy: StatusProxyClient::new(proxy_base_url, &poll.status_path_prefix),
            max_attempts: poll.max_attempts.max(1),
            interval: poll.interval,
        }
    }

    /// Validate, submit, poll, then check the payload. Any failure is fatal.
    pub async fn verify(&self, request: &RunRequest) -> Result<VerificationReport> {
        request.check()?;

        self.execution.validate(request).await?;
        info!(tool_id = %request.tool_id, "run request validated");

        let run_id = self.execution.submit(request).await?;
        info!(run_id = %run_id, "run submitted");

        let outcome = self.poll_until_terminal(&run_id).await?;
        let row_count = validate_payload(&outcome)?;
        info!(run_id = %run_id, attempts = outcome.attempts, rows = row_count, "run completed");

        Ok(VerificationReport {
            run_id,
            attempts: outcome.attempts,
            final_state: outcome.record.state,
            row_count,
        })
    }

    /// Poll the proxy until COMPLETED (Ok), FAILED (Err) or the attempt
    /// budget runs out (Err). UNKNOWN, PENDING and RUNNING keep polling.
    pub async fn poll_until_terminal(&self, run_id: &str) -> Result<PollOutcome> {
        let mut record = RunRecord::new(run_id);
        let mut last_body = String::new();

        for attempt in 1..=self.max_attempts {
            let snapshot = self.proxy.fetch(run_id).await;
            record.observe(&snapshot);
            info!(run_id, attempt, state = %snapshot.state, "polled run status");
            last_body = snapshot.body;

            match record.state {
                RunState::Completed => {
                    return Ok(PollOutcome {
                        record,
                        attempts: attempt,
                        last_body,
                    })
                }
                RunState::Failed => {
                    error!(run_id, body = %last_body, "run failed");
                    return Err(StackError::Verification {
                        run_id: run_id.to_string(),
                        reason: format!("run reported FAILED after {attempt} polls"),
                        last_body: Some(last_body),
                    });
                }
                RunState::Pending | RunState::Running | RunState::Unknown => {}
            }

            if attempt < self.max_attempts {
                tokio::time::sleep(self.interval).await;
            }
        }

        Err(StackError::Verification {
            run_id: run_id.to_string(),
            reason: format!(
                "no terminal state after {} polls (last state {})",
                self.max_attempts, record.state
            ),
            last_body: Some(last_body),
        })
    }
}

/// A COMPLETED run must carry at least one result row.
pub fn validate_payload(outcome: &PollOutcome) -> Result<usize> {
    let rows = outcome.record.result.as_ref().map(Vec::len).unwrap_or(0);
    if rows == 0 {
        return Err(StackError::Verification {
            run_id: outcome.record.run_id.clone(),
            reason: "run completed with no result rows".to_string(),
            last_body: Some(outcome.last_body.clone()),
        });
    }
    Ok(rows)
}
