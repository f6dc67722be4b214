//! Per-priority retry policies and the retry orchestrator.

use mason_error::{BuildError, Result};
use mason_exec::Priority;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Exponential backoff configuration:
/// `delay = min(max_delay, initial_delay · multiplier^(attempt−1))`
/// with ±15% jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    /// The standing per-priority table.
    pub fn for_priority(priority: Priority) -> Self {
        match priority {
            Priority::Critical => Self {
                max_attempts: 5,
                initial_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(5),
                multiplier: 1.5,
            },
            Priority::High => Self {
                max_attempts: 4,
                initial_delay: Duration::from_millis(200),
                max_delay: Duration::from_secs(10),
                multiplier: 2.0,
            },
            Priority::Normal => Self {
                max_attempts: 3,
                initial_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(30),
                multiplier: 2.0,
            },
            Priority::Low => Self {
                max_attempts: 2,
                initial_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(60),
                multiplier: 2.0,
            },
        }
    }

    /// Deterministic delay for `attempt` (1-based), before jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let millis = self.initial_delay.as_millis() as f64 * factor;
        Duration::from_millis(millis as u64).min(self.max_delay)
    }

    /// Delay with ±15% jitter applied.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt).as_millis() as f64;
        let jitter = rand::thread_rng().gen_range(0.85..=1.15);
        Duration::from_millis((base * jitter) as u64)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Runs operations under the priority-appropriate policy, retrying only
/// transient errors.
#[derive(Debug, Default)]
pub struct RetryOrchestrator;

impl RetryOrchestrator {
    pub fn new() -> Self {
        Self
    }

    /// Execute `op` until success, a permanent error, or attempt
    /// exhaustion. `op` receives the 1-based attempt number.
    pub async fn execute<T, F, Fut>(&self, priority: Priority, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let policy = RetryPolicy::for_priority(priority);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && policy.should_retry(attempt) => {
                    let delay = policy.delay(attempt);
                    tracing::debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(annotate_exhaustion(err, attempt, &policy)),
            }
        }
    }
}

fn annotate_exhaustion(err: BuildError, attempt: u32, policy: &RetryPolicy) -> BuildError {
    if attempt >= policy.max_attempts && err.is_transient() {
        err.push_context(mason_error::ContextFrame::new(
            "retry_exhausted",
            format!("{attempt} of {} attempts", policy.max_attempts),
        ))
    } else {
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mason_error::ErrorCode;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_policy_table_matches_contract() {
        let critical = RetryPolicy::for_priority(Priority::Critical);
        assert_eq!(critical.max_attempts, 5);
        assert_eq!(critical.initial_delay, Duration::from_millis(100));
        assert_eq!(critical.max_delay, Duration::from_secs(5));
        assert!((critical.multiplier - 1.5).abs() < f64::EPSILON);

        let low = RetryPolicy::for_priority(Priority::Low);
        assert_eq!(low.max_attempts, 2);
        assert_eq!(low.initial_delay, Duration::from_secs(1));
        assert_eq!(low.max_delay, Duration::from_secs(60));
    }

    #[test]
    fn test_base_delay_ladder() {
        let policy = RetryPolicy::for_priority(Priority::Normal);
        assert_eq!(policy.base_delay(1), Duration::from_millis(500));
        assert_eq!(policy.base_delay(2), Duration::from_millis(1000));
        assert_eq!(policy.base_delay(3), Duration::from_millis(2000));
        // Far past the cap.
        assert_eq!(policy.base_delay(12), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let policy = RetryPolicy::for_priority(Priority::High);
        for _ in 0..50 {
            let delay = policy.delay(2).as_millis() as f64;
            assert!((340.0..=460.0).contains(&delay), "delay {delay} out of band");
        }
    }

    #[tokio::test]
    async fn test_transient_errors_retry_until_success() {
        let attempts = Arc::new(AtomicU32::new(0));
        let orchestrator = RetryOrchestrator::new();
        let result = {
            let attempts = attempts.clone();
            orchestrator
                .execute(Priority::Critical, move |attempt| {
                    let attempts = attempts.clone();
                    async move {
                        attempts.store(attempt, Ordering::Release);
                        if attempt < 3 {
                            Err(BuildError::new(ErrorCode::NetworkError, "reset"))
                        } else {
                            Ok("done")
                        }
                    }
                })
                .await
        };
        assert_eq!(result.unwrap(), "done");
        assert_eq!(attempts.load(Ordering::Acquire), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_do_not_retry() {
        let attempts = Arc::new(AtomicU32::new(0));
        let orchestrator = RetryOrchestrator::new();
        let result: Result<()> = {
            let attempts = attempts.clone();
            orchestrator
                .execute(Priority::Critical, move |attempt| {
                    let attempts = attempts.clone();
                    async move {
                        attempts.store(attempt, Ordering::Release);
                        Err(BuildError::new(ErrorCode::CompilationFailed, "no"))
                    }
                })
                .await
        };
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::Acquire), 1);
    }

    #[tokio::test]
    async fn test_low_priority_gives_up_after_two() {
        let attempts = Arc::new(AtomicU32::new(0));
        let orchestrator = RetryOrchestrator::new();
        let result: Result<()> = {
            let attempts = attempts.clone();
            orchestrator
                .execute(Priority::Low, move |attempt| {
                    let attempts = attempts.clone();
                    async move {
                        attempts.store(attempt, Ordering::Release);
                        Err(BuildError::new(ErrorCode::Timeout, "slow"))
                    }
                })
                .await
        };
        let err = result.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Timeout);
        assert_eq!(attempts.load(Ordering::Acquire), 2);
        assert!(err
            .context_frames()
            .iter()
            .any(|f| f.operation == "retry_exhausted"));
    }
}
