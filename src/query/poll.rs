use std::time::Duration;

use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{QueryEngine, QueryId, QueryRequest, QueryState, QueryStatus, ResultSet};
use crate::error::{Error, Result};

/// Capped exponential backoff under an overall deadline.
#[derive(Debug, Clone, PartialEq)]
pub struct PollPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub timeout: Duration,
    pub page_size: usize,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(5),
            timeout: Duration::from_secs(15 * 60),
            page_size: 1000,
        }
    }
}

impl PollPolicy {
    /// Delay before status check number `attempt + 1`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
        self.initial_interval
            .checked_mul(factor)
            .unwrap_or(self.max_interval)
            .min(self.max_interval)
    }
}

/// Poll `id` until it reaches a terminal state. FAILED / CANCELLED become
/// `Error::QueryExecution` carrying the engine's reason. Cancelling the token
/// stops polling only; the query itself keeps running in the engine.
pub async fn wait_for_completion(
    engine: &(impl QueryEngine + ?Sized),
    id: &QueryId,
    policy: &PollPolicy,
    cancel: &CancellationToken,
) -> Result<QueryStatus> {
    let started = Instant::now();
    let deadline = started + policy.timeout;
    let mut attempt = 0u32;

    loop {
        let status = engine.status(id).await?;
        match status.state {
            QueryState::Succeeded => {
                debug!(query_id = %id, elapsed = ?started.elapsed(), "query succeeded");
                return Ok(status);
            }
            QueryState::Failed | QueryState::Cancelled => {
                let reason = status
                    .reason
                    .clone()
                    .unwrap_or_else(|| "Unknown error".to_string());
                warn!(query_id = %id, state = %status.state, %reason, "query did not succeed");
                return Err(Error::QueryExecution {
                    query_id: id.to_string(),
                    state: status.state,
                    reason,
                });
            }
            QueryState::Running => {}
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(Error::Timeout {
                what: format!("query {}", id),
                after: policy.timeout,
            });
        }
        let delay = policy.backoff(attempt).min(deadline - now);
        attempt = attempt.saturating_add(1);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(Error::Cancelled(format!("polling query {}", id)));
            }
            _ = sleep(delay) => {}
        }
    }
}

/// Submit, wait, then read every result page.
pub async fn run_query(
    engine: &(impl QueryEngine + ?Sized),
    request: QueryRequest,
    policy: &PollPolicy,
    cancel: &CancellationToken,
) -> Result<ResultSet> {
    let database = request.database.clone();
    let id = engine.submit(request).await?;
    debug!(query_id = %id, %database, "query submitted");
    if let Err(e) = wait_for_completion(engine, &id, policy, cancel).await {
        if matches!(e, Error::Timeout { .. } | Error::Cancelled(_)) {
            if let Err(release) = engine.release(&id).await {
                warn!(query_id = %id, error = %release, "could not release abandoned query");
            }
        }
        return Err(e);
    }

    let mut out = ResultSet::default();
    let mut token: Option<String> = None;
    loop {
        let page = engine
            .results(&id, token.as_deref(), policy.page_size.max(1))
            .await?;
        if out.columns.is_empty() {
            out.columns = page.columns;
        }
        out.rows.extend(page.rows);
        match page.next_token {
            Some(next) => token = Some(next),
            None => break,
        }
    }
    Ok(out)
}
