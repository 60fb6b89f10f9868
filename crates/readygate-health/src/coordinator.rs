//! Coordinator — runs every check concurrently and aggregates outcomes.
//!
//! Each check gets its own task driving a [`RetryScheduler`]. Schedulers
//! report back over one channel: attempt events first, then a single
//! terminal event per check. An overall deadline or an external shutdown
//! signal cancels whatever is still running; cancelled checks end
//! `TimedOut` with the attempts they completed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

use readygate_core::{AttemptResult, CheckOutcome, CheckSpec, CheckState, OverallResult};

use crate::checker::Prober;
use crate::report::ProgressSink;
use crate::scheduler::RetryScheduler;

/// Events sent from scheduler tasks to the coordinator.
#[derive(Debug)]
enum ProgressEvent {
    Attempt(AttemptResult),
    Finished(CheckOutcome),
}

/// Outcomes and in-progress attempts gathered from scheduler events.
#[derive(Default)]
struct Collected {
    outcomes: HashMap<String, CheckOutcome>,
    partial: HashMap<String, Vec<AttemptResult>>,
}

impl Collected {
    fn record<S>(&mut self, event: ProgressEvent, sink: &mut S)
    where
        S: ProgressSink + ?Sized,
    {
        match event {
            ProgressEvent::Attempt(attempt) => {
                sink.on_attempt(&attempt);
                self.partial
                    .entry(attempt.check_name.clone())
                    .or_default()
                    .push(attempt);
            }
            ProgressEvent::Finished(outcome) => {
                sink.on_outcome(&outcome);
                self.partial.remove(&outcome.check_name);
                self.outcomes.insert(outcome.check_name.clone(), outcome);
            }
        }
    }

    /// Record every event already queued without waiting for more.
    fn drain<S>(&mut self, events: &mut mpsc::UnboundedReceiver<ProgressEvent>, sink: &mut S)
    where
        S: ProgressSink + ?Sized,
    {
        while let Ok(event) = events.try_recv() {
            self.record(event, sink);
        }
    }
}

/// Runs a set of checks to completion.
pub struct Coordinator<P> {
    prober: Arc<P>,
    overall_deadline: Option<Duration>,
}

impl<P: Prober> Coordinator<P> {
    pub fn new(prober: P) -> Self {
        Self {
            prober: Arc::new(prober),
            overall_deadline: None,
        }
    }

    /// Hard cap on the whole run.
    pub fn with_overall_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.overall_deadline = deadline;
        self
    }

    /// Run `specs` without an external shutdown signal.
    pub async fn run_to_completion<S>(&self, specs: Vec<CheckSpec>, sink: &mut S) -> OverallResult
    where
        S: ProgressSink + ?Sized,
    {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        self.run(specs, sink, shutdown_rx).await
    }

    /// Run every check concurrently until all are terminal.
    ///
    /// Setting `shutdown` to `true` cancels the remaining checks and marks
    /// the result as interrupted. Every spawned task is joined before this
    /// returns.
    pub async fn run<S>(
        &self,
        specs: Vec<CheckSpec>,
        sink: &mut S,
        mut shutdown: watch::Receiver<bool>,
    ) -> OverallResult
    where
        S: ProgressSink + ?Sized,
    {
        let started = Instant::now();
        let names: Vec<String> = specs.iter().map(|s| s.name().to_string()).collect();

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let mut tasks = JoinSet::new();

        for spec in specs {
            let span = info_span!("check", name = %spec.name());
            let scheduler = RetryScheduler::new(spec, self.prober.clone());
            let cancel = cancel_rx.clone();
            let events = event_tx.clone();

            tasks.spawn(
                async move {
                    let attempt_events = events.clone();
                    let outcome = scheduler
                        .run(cancel, move |attempt| {
                            let _ = attempt_events.send(ProgressEvent::Attempt(attempt.clone()));
                        })
                        .await;
                    let _ = events.send(ProgressEvent::Finished(outcome));
                }
                .instrument(span),
            );
        }
        drop(event_tx);

        info!(
            checks = names.len(),
            overall_deadline = ?self.overall_deadline,
            "waiting for checks"
        );

        let deadline_at = self
            .overall_deadline
            .and_then(|d| started.checked_add(d));
        let overall = async move {
            match deadline_at {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(overall);

        let mut collected = Collected::default();
        let mut deadline_fired = false;
        let mut deadline_exceeded = false;
        let mut interrupted = false;
        let mut shutdown_open = true;

        if *shutdown.borrow_and_update() {
            interrupted = true;
            let _ = cancel_tx.send(true);
        }

        loop {
            tokio::select! {
                event = event_rx.recv() => match event {
                    Some(event) => collected.record(event, sink),
                    None => break,
                },
                _ = &mut overall, if !deadline_fired => {
                    deadline_fired = true;
                    // Checks that finished before the deadline may still be queued.
                    collected.drain(&mut event_rx, sink);
                    if collected.outcomes.len() < names.len() {
                        warn!(
                            pending = names.len() - collected.outcomes.len(),
                            "overall deadline reached, cancelling remaining checks"
                        );
                        deadline_exceeded = true;
                        let _ = cancel_tx.send(true);
                    }
                }
                changed = shutdown.changed(), if shutdown_open && !interrupted => {
                    match changed {
                        Ok(()) => {
                            if *shutdown.borrow_and_update() {
                                warn!("shutdown requested, cancelling remaining checks");
                                interrupted = true;
                                let _ = cancel_tx.send(true);
                            }
                        }
                        Err(_) => shutdown_open = false,
                    }
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "check task did not finish cleanly");
            }
        }

        // A scheduler task that died without reporting still gets an outcome.
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let Collected {
            mut outcomes,
            mut partial,
        } = collected;
        for name in &names {
            if !outcomes.contains_key(name) {
                let attempts = partial.remove(name).unwrap_or_default();
                debug!(check = %name, attempts = attempts.len(), "check ended without an outcome");
                outcomes.insert(
                    name.clone(),
                    CheckOutcome {
                        check_name: name.clone(),
                        state: CheckState::Failed,
                        attempts,
                        total_elapsed_ms: elapsed_ms,
                    },
                );
            }
        }

        let result = OverallResult::from_outcomes(
            outcomes.into_values(),
            started.elapsed().as_millis() as u64,
            deadline_exceeded,
            interrupted,
        );
        info!(
            all_ready = result.all_ready,
            ready = result.ready_count(),
            total = result.outcomes.len(),
            elapsed_ms = result.total_elapsed_ms,
            "readiness run finished"
        );
        result
    }
}
