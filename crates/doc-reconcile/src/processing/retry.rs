//! Retry Controller
//!
//! Wraps fallible operations with bounded exponential backoff. Counters are
//! keyed by operation kind and shared by every invocation of that kind, as
//! is the single pending retry timer.

use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::RetryConfig;
use crate::error::{Error, Result};

/// Backoff policy
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Consecutive failures tolerated before giving up
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Share of each delay that is randomized (0.0 = deterministic)
    pub jitter: f64,
}

impl RetryPolicy {
    /// Deterministic policy, mostly for tests
    pub fn fixed(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            jitter: 0.0,
        }
    }

    /// Delay before retrying after the given failed attempt (1-based):
    /// `min(base * 2^(attempt-1), cap)`, optionally jittered downwards.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self
            .base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        if self.jitter <= 0.0 {
            return delay;
        }
        let jitter = self.jitter.min(1.0);
        let fixed = delay.mul_f64(1.0 - jitter);
        let random = delay.mul_f64(jitter * rand::thread_rng().gen_range(0.0..=1.0));
        fixed + random
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.base_delay(),
            max_delay: config.max_delay(),
            jitter: config.jitter,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

/// Per-kind counter and its pending timer
#[derive(Debug, Default)]
struct RetryCounter {
    attempts: u32,
    exhausted: bool,
    generation: u64,
    pending: Option<(u64, CancellationToken)>,
}

impl RetryCounter {
    /// Cancel the pending timer, if any
    fn supersede(&mut self) {
        if let Some((_, token)) = self.pending.take() {
            token.cancel();
        }
    }
}

/// What to do after a failed attempt
enum Decision {
    Retry {
        attempt: u32,
        delay: Duration,
        generation: u64,
        token: CancellationToken,
    },
    GiveUp {
        attempts: u32,
    },
}

/// Retry Controller
///
/// Process-lifetime object, constructed once and shared by `Arc`.
pub struct RetryController {
    policy: RetryPolicy,
    counters: Mutex<HashMap<String, RetryCounter>>,
}

impl RetryController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// failure count for `kind` reaches the ceiling.
    ///
    /// Only `Error::TransientIo` is retried. Once a kind is exhausted every
    /// later call runs `op` a single time and reports exhaustion on failure,
    /// until [`reset`](Self::reset) or a success clears the counter. A call
    /// whose pending retry is replaced by a newer one for the same kind
    /// returns `Error::RetrySuperseded`.
    pub async fn execute<T, F, Fut>(&self, kind: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        // A fresh invocation takes over from any retry still waiting
        if let Some(counter) = self.counters.lock().get_mut(kind) {
            counter.supersede();
        }

        loop {
            let err = match op().await {
                Ok(value) => {
                    self.succeeded(kind);
                    return Ok(value);
                }
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => e,
            };

            match self.failed(kind) {
                Decision::GiveUp { attempts } => {
                    tracing::error!("{} gave up after {} attempts: {}", kind, attempts, err);
                    return Err(Error::RetriesExhausted {
                        operation: kind.to_string(),
                        attempts,
                        reason: err.to_string(),
                    });
                }
                Decision::Retry {
                    attempt,
                    delay,
                    generation,
                    token,
                } => {
                    tracing::warn!(
                        "{} failed (attempt {}), retrying in {:?}: {}",
                        kind,
                        attempt,
                        delay,
                        err
                    );
                    tokio::select! {
                        _ = token.cancelled() => {
                            tracing::debug!("Pending retry of {} superseded", kind);
                            return Err(Error::RetrySuperseded(kind.to_string()));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    self.timer_fired(kind, generation);
                }
            }
        }
    }

    /// Consecutive failures recorded for a kind
    pub fn attempts(&self, kind: &str) -> u32 {
        self.counters.lock().get(kind).map(|c| c.attempts).unwrap_or(0)
    }

    /// Whether a kind has spent its budget
    pub fn is_exhausted(&self, kind: &str) -> bool {
        self.counters.lock().get(kind).is_some_and(|c| c.exhausted)
    }

    /// Clear a kind's counter so it may be retried automatically again
    pub fn reset(&self, kind: &str) {
        if let Some(mut counter) = self.counters.lock().remove(kind) {
            counter.supersede();
        }
    }

    /// Drop every counter scoped to one document (`{kind}:{id}`)
    ///
    /// Used once a document's operations are over: a finished delete or an
    /// upload that never committed. Pending timers for it are cancelled.
    pub fn release_document(&self, id: Uuid) {
        let suffix = format!(":{}", id);
        self.counters.lock().retain(|kind, counter| {
            if kind.ends_with(&suffix) {
                counter.supersede();
                false
            } else {
                true
            }
        });
    }

    /// Number of kinds with a live counter
    pub fn tracked_kinds(&self) -> usize {
        self.counters.lock().len()
    }

    fn succeeded(&self, kind: &str) {
        if let Some(mut counter) = self.counters.lock().remove(kind) {
            counter.supersede();
        }
    }

    fn failed(&self, kind: &str) -> Decision {
        let mut counters = self.counters.lock();
        let counter = counters.entry(kind.to_string()).or_default();
        counter.attempts = counter.attempts.saturating_add(1);

        if counter.exhausted || counter.attempts >= self.policy.max_retries {
            counter.exhausted = true;
            counter.supersede();
            return Decision::GiveUp {
                attempts: counter.attempts,
            };
        }

        counter.supersede();
        counter.generation += 1;
        let token = CancellationToken::new();
        counter.pending = Some((counter.generation, token.clone()));

        Decision::Retry {
            attempt: counter.attempts,
            delay: self.policy.delay_for_attempt(counter.attempts),
            generation: counter.generation,
            token,
        }
    }

    fn timer_fired(&self, kind: &str, generation: u64) {
        if let Some(counter) = self.counters.lock().get_mut(kind) {
            if matches!(counter.pending, Some((g, _)) if g == generation) {
                counter.pending = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn controller(max_retries: u32) -> RetryController {
        RetryController::new(RetryPolicy::fixed(
            max_retries,
            Duration::from_secs(1),
            Duration::from_secs(30),
        ))
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(6), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(30));
    }

    #[test]
    fn jittered_delay_stays_within_bounds() {
        let mut policy = RetryPolicy::default();
        policy.jitter = 0.5;
        for _ in 0..50 {
            let delay = policy.delay_for_attempt(3);
            assert!(delay >= Duration::from_secs(2));
            assert!(delay <= Duration::from_secs(4));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn success_after_transient_failures_resets_counter() {
        let retry = controller(3);
        let calls = AtomicU32::new(0);

        let value = retry
            .execute("object_put", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::transient("connection reset"))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(retry.attempts("object_put"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn ceiling_stops_automatic_retries() {
        let retry = controller(3);
        let calls = AtomicU32::new(0);

        let err = retry
            .execute("metadata_insert", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::transient("timeout"))
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(err, Error::RetriesExhausted { attempts: 3, .. }));
        assert!(retry.is_exhausted("metadata_insert"));

        // Exhausted: one attempt, no automatic retry
        let err = retry
            .execute("metadata_insert", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::transient("timeout"))
            })
            .await
            .unwrap_err();
        assert!(err.is_exhausted());
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        retry.reset("metadata_insert");
        assert_eq!(retry.attempts("metadata_insert"), 0);
        assert!(!retry.is_exhausted("metadata_insert"));
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_errors_surface_immediately() {
        let retry = controller(3);
        let calls = AtomicU32::new(0);

        let err = retry
            .execute("metadata_insert", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::conflict("duplicate key"))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Conflict(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(retry.attempts("metadata_insert"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn released_document_counters_are_dropped() {
        let retry = controller(1);
        let (gone, kept) = (Uuid::new_v4(), Uuid::new_v4());
        let kinds = [
            format!("object_put:{}", gone),
            format!("metadata_insert:{}", gone),
            format!("object_put:{}", kept),
        ];
        for kind in kinds {
            let _ = retry
                .execute(&kind, || async { Err::<(), _>(Error::transient("down")) })
                .await;
        }
        assert_eq!(retry.tracked_kinds(), 3);

        retry.release_document(gone);
        assert_eq!(retry.tracked_kinds(), 1);
        assert!(!retry.is_exhausted(&format!("object_put:{}", gone)));
        assert!(retry.is_exhausted(&format!("object_put:{}", kept)));
    }

    #[tokio::test(start_paused = true)]
    async fn newer_invocation_supersedes_pending_retry() {
        let retry = Arc::new(controller(5));

        let first = {
            let retry = Arc::clone(&retry);
            tokio::spawn(async move {
                retry
                    .execute("invoke_job", || async {
                        Err::<(), _>(Error::transient("unavailable"))
                    })
                    .await
            })
        };
        // Let the first call fail once and park on its timer
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(retry.attempts("invoke_job"), 1);

        let second = retry.execute("invoke_job", || async { Ok(()) }).await;
        assert!(second.is_ok());

        let first = first.await.unwrap();
        assert!(matches!(first, Err(Error::RetrySuperseded(_))));
        assert_eq!(retry.attempts("invoke_job"), 0);
    }
}
