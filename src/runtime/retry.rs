use tracing::{debug, warn};

use super::registry::ActivityExecutor;
use crate::ActivityKind;
use crate::error::ActivityError;
use crate::options::RetryPolicy;

/// Run an activity until it succeeds, fails permanently, or exhausts the
/// policy. Returns the last error on exhaustion.
pub async fn execute_with_retry(
    executor: &dyn ActivityExecutor,
    instance: &str,
    id: u64,
    kind: ActivityKind,
    input: &str,
    policy: &RetryPolicy,
) -> Result<String, ActivityError> {
    let attempts = policy.attempts();
    let mut attempt = 1;
    loop {
        match executor.execute(kind, input.to_string()).await {
            Ok(out) => {
                debug!(instance, id, %kind, attempt, "activity succeeded");
                return Ok(out);
            }
            Err(e) if e.is_transient() && attempt < attempts => {
                let delay = policy.backoff(attempt);
                warn!(instance, id, %kind, attempt, error=%e, delay_ms = delay.as_millis() as u64, "transient activity failure; retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                warn!(instance, id, %kind, attempt, error=%e, "activity failed");
                return Err(e);
            }
        }
    }
}
