//! Retry scheduling for a single check.
//!
//! A [`RetryScheduler`] owns one check from `Pending` until it reaches a
//! terminal [`CheckState`]. `run` consumes the scheduler, so an outcome is
//! produced exactly once and no attempt can follow it.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use readygate_core::{AttemptResult, CheckOutcome, CheckSpec, CheckState};

use crate::checker::Prober;

/// Drives repeated attempts of one check.
pub struct RetryScheduler<P> {
    spec: CheckSpec,
    prober: Arc<P>,
}

impl<P: Prober> RetryScheduler<P> {
    pub fn new(spec: CheckSpec, prober: Arc<P>) -> Self {
        Self { spec, prober }
    }

    pub fn spec(&self) -> &CheckSpec {
        &self.spec
    }

    /// Probe until the check is ready, out of attempts, past its deadline,
    /// or `cancel` flips to `true`.
    ///
    /// `on_attempt` sees every attempt, in order, as soon as it completes.
    /// A cancelled check ends `TimedOut`; the attempt in flight at the time
    /// is dropped and not recorded.
    pub async fn run<F>(self, mut cancel: watch::Receiver<bool>, mut on_attempt: F) -> CheckOutcome
    where
        F: FnMut(&AttemptResult) + Send,
    {
        let spec = &self.spec;
        let started = Instant::now();
        // A budget too large to represent as an instant is no deadline at all.
        let deadline = spec
            .time_budget()
            .and_then(|budget| started.checked_add(budget));
        let limit = spec.max_attempts().limit();
        let mut attempts: Vec<AttemptResult> = Vec::new();

        debug!(
            check = %spec.name(),
            kind = %spec.kind(),
            target = %spec.target(),
            budget = ?spec.time_budget(),
            "check pending"
        );

        let state = loop {
            let index = attempts.len() as u32;

            let result = tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => {
                    debug!(check = %spec.name(), attempt = index, "cancelled while probing");
                    break CheckState::TimedOut;
                }
                result = self.prober.attempt(spec, index) => result,
            };

            on_attempt(&result);
            let success = result.success;
            let timed_out = result.timed_out;
            attempts.push(result);

            if success {
                break CheckState::Ready;
            }

            let now = Instant::now();
            let deadline_passed = deadline.is_some_and(|d| now >= d);
            if let Some(state) =
                settle_failure(attempts.len() as u32, limit, deadline_passed, timed_out)
            {
                break state;
            }

            let mut wait = spec.backoff().delay(spec.interval(), index + 1);
            if let Some(d) = deadline {
                wait = wait.min(d.saturating_duration_since(now));
            }

            tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => {
                    debug!(check = %spec.name(), "cancelled while waiting");
                    break CheckState::TimedOut;
                }
                _ = tokio::time::sleep(wait) => {}
            }

            if deadline.is_some_and(|d| Instant::now() >= d) {
                break CheckState::TimedOut;
            }
        };

        let total_elapsed_ms = started.elapsed().as_millis() as u64;
        match state {
            CheckState::Ready => info!(
                check = %spec.name(),
                attempts = attempts.len(),
                elapsed_ms = total_elapsed_ms,
                "check ready"
            ),
            _ => warn!(
                check = %spec.name(),
                state = %state,
                attempts = attempts.len(),
                elapsed_ms = total_elapsed_ms,
                "check not ready"
            ),
        }

        CheckOutcome {
            check_name: spec.name().to_string(),
            state,
            attempts,
            total_elapsed_ms,
        }
    }
}

/// Decide whether a failed attempt ends the check.
///
/// When the attempt budget and the deadline run out together, a probe
/// timeout makes the check `TimedOut`; any other failure makes it `Failed`.
pub fn settle_failure(
    attempts_made: u32,
    limit: Option<u32>,
    deadline_passed: bool,
    last_timed_out: bool,
) -> Option<CheckState> {
    let exhausted = limit.is_some_and(|max| attempts_made >= max);
    match (exhausted, deadline_passed) {
        (true, true) if last_timed_out => Some(CheckState::TimedOut),
        (true, _) => Some(CheckState::Failed),
        (false, true) => Some(CheckState::TimedOut),
        (false, false) => None,
    }
}

/// Resolves once `cancel` is `true`. Never resolves if the sender is gone.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let closed = cancel.wait_for(|c| *c).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use readygate_core::{Backoff, CheckKind, MaxAttempts};

    use crate::checker::ProbeError;

    /// Fails until `succeed_from` calls have been made, each call taking `delay`.
    pub(crate) struct Scripted {
        pub(crate) succeed_from: Option<u32>,
        pub(crate) delay: Duration,
        pub(crate) calls: AtomicU32,
    }

    impl Scripted {
        pub(crate) fn failing() -> Self {
            Self::succeeding_from(None)
        }

        pub(crate) fn succeeding_from(n: Option<u32>) -> Self {
            Self {
                succeed_from: n,
                delay: Duration::ZERO,
                calls: AtomicU32::new(0),
            }
        }

        pub(crate) fn slow(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    impl Prober for Scripted {
        async fn probe(&self, _spec: &CheckSpec) -> Result<(), ProbeError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            match self.succeed_from {
                Some(from) if n >= from => Ok(()),
                _ => Err(ProbeError::Request("scripted failure".to_string())),
            }
        }
    }

    fn spec(interval_ms: u64, max_attempts: MaxAttempts) -> CheckSpec {
        CheckSpec::builder("svc", CheckKind::Tcp, "localhost:9")
            .interval(Duration::from_millis(interval_ms))
            .timeout(Duration::from_millis(500))
            .max_attempts(max_attempts)
            .build()
            .unwrap()
    }

    async fn run(spec: CheckSpec, prober: Scripted) -> CheckOutcome {
        let (_tx, rx) = watch::channel(false);
        RetryScheduler::new(spec, Arc::new(prober))
            .run(rx, |_| {})
            .await
    }

    fn assert_contiguous(outcome: &CheckOutcome) {
        for (i, a) in outcome.attempts.iter().enumerate() {
            assert_eq!(a.attempt_index, i as u32);
            assert_eq!(a.check_name, outcome.check_name);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ready_after_one_successful_attempt() {
        let outcome = run(
            spec(100, MaxAttempts::Limited(5)),
            Scripted::succeeding_from(Some(0)),
        )
        .await;
        assert_eq!(outcome.state, CheckState::Ready);
        assert_eq!(outcome.attempts.len(), 1);
        assert!(outcome.attempts[0].success);
    }

    #[tokio::test(start_paused = true)]
    async fn ready_on_second_attempt() {
        let outcome = run(
            spec(100, MaxAttempts::Limited(5)),
            Scripted::succeeding_from(Some(1)),
        )
        .await;
        assert_eq!(outcome.state, CheckState::Ready);
        assert_eq!(outcome.attempts.len(), 2);
        assert!(!outcome.attempts[0].success);
        assert!(outcome.attempts[1].success);
        assert_contiguous(&outcome);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_after_exhausting_attempts() {
        let outcome = run(spec(100, MaxAttempts::Limited(4)), Scripted::failing()).await;
        assert_eq!(outcome.state, CheckState::Failed);
        assert_eq!(outcome.attempts.len(), 4);
        assert_contiguous(&outcome);
        // (N - 1) intervals between N instant attempts.
        assert!(
            (300..=310).contains(&outcome.total_elapsed_ms),
            "elapsed {}",
            outcome.total_elapsed_ms
        );
        assert_eq!(
            outcome.attempts[3].error_detail.as_deref(),
            Some("http request failed: scripted failure")
        );
    }

    fn with_deadline(interval_ms: u64, max: u32, deadline_ms: u64) -> CheckSpec {
        CheckSpec::builder("svc", CheckKind::Tcp, "localhost:9")
            .interval(Duration::from_millis(interval_ms))
            .timeout(Duration::from_millis(100))
            .max_attempts(MaxAttempts::Limited(max))
            .deadline(Duration::from_millis(deadline_ms))
            .build()
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn slow_failures_run_into_deadline() {
        // The first attempt alone takes 50ms of a 30ms deadline.
        let outcome = run(
            with_deadline(10, 3, 30),
            Scripted::failing().slow(Duration::from_millis(50)),
        )
        .await;
        assert_eq!(outcome.state, CheckState::TimedOut);
        assert_eq!(outcome.attempts.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_failures_within_timeout_exhaust_attempts() {
        // Derived budget leaves room for every attempt to use its timeout.
        let outcome = run(
            spec(10, MaxAttempts::Limited(3)),
            Scripted::failing().slow(Duration::from_millis(400)),
        )
        .await;
        assert_eq!(outcome.state, CheckState::Failed);
        assert_eq!(outcome.attempts.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_timeout_on_last_attempt_past_deadline_is_timed_out() {
        let outcome = run(
            with_deadline(10, 1, 50),
            Scripted::failing().slow(Duration::from_secs(1)),
        )
        .await;
        assert_eq!(outcome.state, CheckState::TimedOut);
        assert_eq!(outcome.attempts.len(), 1);
        assert!(outcome.attempts[0].timed_out);
    }

    #[tokio::test(start_paused = true)]
    async fn plain_failure_on_last_attempt_past_deadline_is_failed() {
        let outcome = run(
            with_deadline(10, 1, 10),
            Scripted::failing().slow(Duration::from_millis(50)),
        )
        .await;
        assert_eq!(outcome.state, CheckState::Failed);
        assert!(!outcome.attempts[0].timed_out);
    }

    #[tokio::test(start_paused = true)]
    async fn exponential_backoff_spaces_attempts() {
        let spec = CheckSpec::builder("svc", CheckKind::Tcp, "localhost:9")
            .interval(Duration::from_secs(1))
            .max_attempts(MaxAttempts::Limited(5))
            .backoff(Backoff::Exponential {
                max_interval: Duration::from_secs(4),
            })
            .build()
            .unwrap();

        let (_tx, rx) = watch::channel(false);
        let started = Instant::now();
        let mut starts = Vec::new();
        let outcome = RetryScheduler::new(spec, Arc::new(Scripted::failing()))
            .run(rx, |_| starts.push(started.elapsed().as_millis() as u64))
            .await;

        assert_eq!(outcome.state, CheckState::Failed);
        assert_contiguous(&outcome);
        // Waits of 1s, 2s, 4s, then capped at 4s.
        let expected = [0, 1_000, 3_000, 7_000, 11_000];
        assert_eq!(starts.len(), expected.len());
        for (got, want) in starts.iter().zip(expected) {
            assert!((want..=want + 10).contains(got), "attempt at {got}ms, expected {want}ms");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn wait_is_clipped_to_deadline() {
        let spec = CheckSpec::builder("svc", CheckKind::Tcp, "localhost:9")
            .interval(Duration::from_millis(300))
            .max_attempts(MaxAttempts::UntilDeadline)
            .deadline(Duration::from_secs(1))
            .build()
            .unwrap();
        let outcome = run(spec, Scripted::failing()).await;

        // Attempts at 0, 300, 600, 900ms; the last wait stops at 1000ms.
        assert_eq!(outcome.state, CheckState::TimedOut);
        assert_eq!(outcome.attempts.len(), 4);
        assert!(
            (1_000..=1_010).contains(&outcome.total_elapsed_ms),
            "elapsed {}",
            outcome.total_elapsed_ms
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unrepresentable_deadline_does_not_panic() {
        let spec = CheckSpec::builder("svc", CheckKind::Tcp, "localhost:9")
            .deadline(Duration::from_secs(u64::MAX))
            .build()
            .unwrap();
        let outcome = run(spec, Scripted::succeeding_from(Some(0))).await;
        assert_eq!(outcome.state, CheckState::Ready);
        assert_eq!(outcome.attempts.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn until_deadline_retries_until_explicit_deadline() {
        let spec = CheckSpec::builder("svc", CheckKind::Tcp, "localhost:9")
            .interval(Duration::from_millis(100))
            .max_attempts(MaxAttempts::UntilDeadline)
            .deadline(Duration::from_secs(1))
            .build()
            .unwrap();
        let outcome = run(spec, Scripted::failing()).await;
        assert_eq!(outcome.state, CheckState::TimedOut);
        assert_eq!(outcome.attempts.len(), 10);
        assert_contiguous(&outcome);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_keeps_completed_attempts() {
        let (tx, rx) = watch::channel(false);
        let scheduler = RetryScheduler::new(
            spec(1_000, MaxAttempts::Limited(100)),
            Arc::new(Scripted::failing()),
        );
        let handle = tokio::spawn(scheduler.run(rx, |_| {}));

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        tx.send(true).unwrap();

        let outcome = handle.await.unwrap();
        assert_eq!(outcome.state, CheckState::TimedOut);
        assert_eq!(outcome.attempts.len(), 3);
        assert_contiguous(&outcome);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_drops_in_flight_attempt() {
        let (tx, rx) = watch::channel(false);
        let scheduler = RetryScheduler::new(
            spec(10, MaxAttempts::Limited(5)),
            Arc::new(Scripted::failing().slow(Duration::from_millis(400))),
        );
        let handle = tokio::spawn(scheduler.run(rx, |_| {}));

        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();

        let outcome = handle.await.unwrap();
        assert_eq!(outcome.state, CheckState::TimedOut);
        assert!(outcome.attempts.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn on_attempt_sees_every_attempt_in_order() {
        let (_tx, rx) = watch::channel(false);
        let mut seen = Vec::new();
        let outcome = RetryScheduler::new(
            spec(10, MaxAttempts::Limited(5)),
            Arc::new(Scripted::succeeding_from(Some(3))),
        )
        .run(rx, |a| seen.push(a.attempt_index))
        .await;
        assert_eq!(seen, vec![0, 1, 2, 3]);
        assert_eq!(outcome.attempts.len(), 4);
    }

    #[test]
    fn settle_failure_table() {
        assert_eq!(settle_failure(1, Some(3), false, false), None);
        assert_eq!(settle_failure(3, Some(3), false, true), Some(CheckState::Failed));
        assert_eq!(settle_failure(1, Some(3), true, false), Some(CheckState::TimedOut));
        assert_eq!(settle_failure(3, Some(3), true, true), Some(CheckState::TimedOut));
        assert_eq!(settle_failure(3, Some(3), true, false), Some(CheckState::Failed));
        assert_eq!(settle_failure(500, None, false, false), None);
    }
}
