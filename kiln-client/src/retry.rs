//! Retry policy for object store and registry calls

use std::future::Future;
use std::time::Duration;

use kiln_core::{CancelSignal, LogSink};

use crate::error::{ClientError, TransferError};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(10);

/// Fixed-backoff retry for transient failures
///
/// Only errors for which [`ClientError::is_retryable`] holds are retried;
/// everything else is returned on the first attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: DEFAULT_BACKOFF,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Run `op` until it succeeds, fails permanently, or the attempts run out.
    ///
    /// Both the call and the backoff sleep stop early on cancellation.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &str,
        cancel: &CancelSignal,
        sink: &dyn LogSink,
        mut op: F,
    ) -> Result<T, TransferError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = tokio::select! {
                result = op() => result,
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            };
            match outcome {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() => {
                    if attempt >= self.max_attempts {
                        return Err(TransferError::TransientNetwork {
                            operation: operation.to_string(),
                            attempts: attempt,
                            source: err,
                        });
                    }
                    tracing::warn!(operation, attempt, error = %err, "transient failure, retrying");
                    sink.warn(&format!(
                        "  {} failed (attempt {}/{}): {}; retrying in {}s",
                        operation,
                        attempt,
                        self.max_attempts,
                        err,
                        self.backoff.as_secs()
                    ));
                    cancel.sleep(self.backoff).await?;
                }
                Err(err) => {
                    return Err(TransferError::Api {
                        operation: operation.to_string(),
                        source: err,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::{MemorySink, cancel_channel};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_five_attempts_ten_seconds_apart() {
        let calls = AtomicU32::new(0);
        let sink = MemorySink::new();
        let start = Instant::now();

        let result: Result<(), _> = RetryPolicy::default()
            .run("upload part 3", &CancelSignal::never(), &sink, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ClientError::api_error(503, "unavailable"))
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(start.elapsed(), Duration::from_secs(40));
        match result {
            Err(TransferError::TransientNetwork {
                attempts, source, ..
            }) => {
                assert_eq!(attempts, 5);
                assert!(matches!(source, ClientError::ApiError { status: 503, .. }));
            }
            other => panic!("expected TransientNetwork, got {:?}", other),
        }
        assert_eq!(sink.entries().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_errors() {
        let calls = AtomicU32::new(0);
        let value = RetryPolicy::default()
            .run("get namespace", &CancelSignal::never(), &MemorySink::new(), || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ClientError::api_error(429, "slow down"))
                } else {
                    Ok("ns")
                }
            })
            .await
            .unwrap();
        assert_eq!(value, "ns");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = RetryPolicy::default()
            .run("create image", &CancelSignal::never(), &MemorySink::new(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ClientError::api_error(400, "bad request"))
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(TransferError::Api { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff() {
        let (handle, signal) = cancel_channel();
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::default();
        let sink = MemorySink::new();
        let run = policy.run("upload part 1", &signal, &sink, || async {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                handle.cancel();
            }
            Err::<(), _>(ClientError::api_error(502, "bad gateway"))
        });
        let result = run.await;
        assert!(matches!(result, Err(TransferError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
