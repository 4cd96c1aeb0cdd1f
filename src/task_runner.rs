//! Task runner with exponential backoff.
//!
//! Retry policy lives here, with the callers of the pipeline. The cache and
//! the source client never retry on their own.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, warn};

use crate::domain::errors::PipelineResult;

/// Backoff configuration for periodic background tasks
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Pause between successful iterations
    pub interval: Duration,
    /// Initial delay between retries
    pub initial_retry_delay: Duration,
    /// Maximum delay between retries
    pub max_retry_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            initial_retry_delay: Duration::from_secs(5),
            max_retry_delay: Duration::from_secs(300),
        }
    }
}

#[derive(Debug)]
struct BackoffState {
    consecutive_failures: u32,
    current_retry_delay: Duration,
}

impl BackoffState {
    fn new(initial_delay: Duration) -> Self {
        Self {
            consecutive_failures: 0,
            current_retry_delay: initial_delay,
        }
    }

    /// Delay to wait before the next attempt, doubling up to `max_delay`
    fn record_failure(&mut self, max_delay: Duration) -> Duration {
        self.consecutive_failures += 1;
        let delay = self.current_retry_delay;
        self.current_retry_delay = std::cmp::min(self.current_retry_delay * 2, max_delay);
        delay
    }

    fn reset(&mut self, initial_delay: Duration) {
        self.consecutive_failures = 0;
        self.current_retry_delay = initial_delay;
    }
}

/// Run `task_fn` forever: every `interval` while it succeeds, with
/// exponential backoff while it fails. Stop it by aborting its task.
///
/// # Arguments
/// * `task_name` - Name of the task for logging purposes
/// * `config` - Interval and backoff bounds
/// * `task_fn` - Async function that executes one iteration of the task
pub async fn run_with_backoff<F, Fut>(task_name: &str, config: BackoffConfig, mut task_fn: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PipelineResult<()>>,
{
    let mut state = BackoffState::new(config.initial_retry_delay);

    loop {
        match task_fn().await {
            Ok(()) => {
                if state.consecutive_failures > 0 {
                    warn!(
                        task = task_name,
                        failures = state.consecutive_failures,
                        "Task recovered"
                    );
                }
                state.reset(config.initial_retry_delay);
                sleep(config.interval).await;
            }
            Err(e) => {
                let delay = state.record_failure(config.max_retry_delay);
                error!(
                    task = task_name,
                    attempt = state.consecutive_failures,
                    error = %e,
                    retry_in_ms = delay.as_millis() as u64,
                    "Task failed"
                );
                sleep(delay).await;
            }
        }
    }
}

/// Run `op`, and run it once more after `delay` if the first failure is
/// transient. Any second failure is returned as is.
pub async fn retry_once_with_backoff<T, F, Fut>(
    task_name: &str,
    delay: Duration,
    mut op: F,
) -> PipelineResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PipelineResult<T>>,
{
    match op().await {
        Err(e) if e.is_transient() => {
            warn!(
                task = task_name,
                error = %e,
                retry_in_ms = delay.as_millis() as u64,
                "Transient failure, retrying once"
            );
            sleep(delay).await;
            op().await
        }
        other => other,
    }
}
