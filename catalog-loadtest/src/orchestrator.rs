//! Runs phases in order against the catalog service.
//!
//! Each [`Phase`] runs as one or more waves, each with its own pool of workers. Workers claim
//! sequence numbers from the wave's [`PhaseProgress`], wait for a valid credential and issue one
//! action per claim. The next wave, and the next phase, starts only after every worker of the
//! previous one has returned.
//!
//! A shared [`CancellationToken`] stops all workers from claiming more work. It is cancelled by
//! the token manager when the credential is lost, by a worker that finds no credential, or from
//! the outside (Ctrl-C). In-flight actions are allowed to finish or time out.

use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::auth::CredentialReader;
use crate::catalog::{ActionError, BoxedCatalog, CatalogApi};
use crate::dataset::DatasetWalker;
use crate::error::Error;
use crate::report::{PhaseMetrics, PhaseReport, RunReport};
use crate::workload::{Phase, PhaseProgress};

/// Default upper bound for a single catalog action.
pub const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(30);

/// Drives a sequence of [`Phase`]s.
#[derive(Debug)]
pub struct Orchestrator {
    catalog: Arc<dyn CatalogApi>,
    walker: Arc<DatasetWalker>,
    credentials: CredentialReader,
    cancel: CancellationToken,
    action_timeout: Duration,
    progress: bool,
}

impl Orchestrator {
    /// Creates an orchestrator issuing actions against `catalog` with credentials read from
    /// `credentials`.
    pub fn new(catalog: BoxedCatalog, walker: DatasetWalker, credentials: CredentialReader) -> Self {
        Self {
            catalog: Arc::from(catalog),
            walker: Arc::new(walker),
            credentials,
            cancel: CancellationToken::new(),
            action_timeout: DEFAULT_ACTION_TIMEOUT,
            progress: false,
        }
    }

    /// Uses `cancel` as the run's cancellation signal.
    ///
    /// Pass the token given to [`TokenManager::start`](crate::auth::TokenManager::start) so a
    /// lost credential stops the run.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Bounds every catalog action by `timeout`. Exceeding it is an [`ActionError::Timeout`].
    pub fn with_action_timeout(mut self, timeout: Duration) -> Self {
        self.action_timeout = timeout;
        self
    }

    /// Shows a progress bar for each phase on stderr.
    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    /// Runs `phases` strictly in order and reports on each one that started.
    ///
    /// Stops before the next phase once the run is cancelled; [`RunReport::aborted`] then names
    /// the phase that was reached and the cause.
    pub async fn run(&self, phases: Vec<Phase>) -> RunReport {
        let start = Instant::now();
        let mut report = RunReport::default();

        for phase in phases {
            if self.cancel.is_cancelled() {
                report.aborted = Some(self.abort_reason(phase.name()));
                break;
            }

            let span = tracing::info_span!("phase", phase = phase.name());
            let phase_report = self.run_phase(Arc::new(phase)).instrument(span).await;
            let name = phase_report.name.clone();
            report.phases.push(phase_report);

            if self.cancel.is_cancelled() {
                report.aborted = Some(self.abort_reason(&name));
                break;
            }
        }

        report.elapsed = start.elapsed();
        report
    }

    async fn run_phase(&self, phase: Arc<Phase>) -> PhaseReport {
        tracing::info!(
            action = %phase.action(),
            kind = %phase.kind(),
            target = phase.target(),
            concurrency = phase.concurrency(),
            "starting phase"
        );

        let bar = self.progress_bar(&phase);
        let start = Instant::now();

        let mut metrics = PhaseMetrics::default();
        for wave in phase.waves(&self.walker) {
            if self.cancel.is_cancelled() {
                break;
            }
            tracing::debug!(start = wave.start, end = wave.end, "starting wave");
            metrics.merge(&self.run_wave(&phase, wave, &bar).await);
        }
        bar.finish_and_clear();

        let report = PhaseReport::new(&phase, metrics, start.elapsed());
        tracing::info!(
            successes = report.metrics.successes,
            failures = report.metrics.failure_count(),
            elapsed = ?report.elapsed,
            "phase finished"
        );
        report
    }

    async fn run_wave(
        &self,
        phase: &Arc<Phase>,
        wave: Range<u64>,
        bar: &ProgressBar,
    ) -> PhaseMetrics {
        let progress = Arc::new(PhaseProgress::new(wave));

        let workers: Vec<_> = (0..phase.concurrency())
            .map(|id| {
                let worker = Worker {
                    id,
                    phase: Arc::clone(phase),
                    progress: Arc::clone(&progress),
                    catalog: Arc::clone(&self.catalog),
                    walker: Arc::clone(&self.walker),
                    credentials: self.credentials.clone(),
                    cancel: self.cancel.clone(),
                    timeout: self.action_timeout,
                    bar: bar.clone(),
                };
                tokio::spawn(worker.run().in_current_span())
            })
            .collect();

        let mut metrics = PhaseMetrics::default();
        for result in futures::future::join_all(workers).await {
            match result {
                Ok(worker_metrics) => metrics.merge(&worker_metrics),
                Err(error) => tracing::error!(%error, "worker panicked"),
            }
        }
        metrics
    }

    fn progress_bar(&self, phase: &Phase) -> ProgressBar {
        if !self.progress {
            return ProgressBar::hidden();
        }

        let bar = ProgressBar::new(phase.target()).with_message(phase.name().to_owned());
        if let Ok(style) = ProgressStyle::with_template("{msg}\n{wide_bar} {pos}/{len} {elapsed}")
        {
            bar.set_style(style);
        }
        bar.enable_steady_tick(Duration::from_millis(100));
        bar
    }

    fn abort_reason(&self, phase: &str) -> Error {
        let source = match self.credentials.failure() {
            Some(error) => error,
            None if self.credentials.current().is_none() => Error::AuthenticationExhausted {
                attempts: 0,
                reason: format!("no credential available ({:?})", self.credentials.state()),
            },
            None => Error::Interrupted,
        };

        Error::Aborted {
            phase: phase.to_owned(),
            source: Box::new(source),
        }
    }
}

/// Context of one worker within a phase.
struct Worker {
    id: usize,
    phase: Arc<Phase>,
    progress: Arc<PhaseProgress>,
    catalog: Arc<dyn CatalogApi>,
    walker: Arc<DatasetWalker>,
    credentials: CredentialReader,
    cancel: CancellationToken,
    timeout: Duration,
    bar: ProgressBar,
}

impl Worker {
    async fn run(mut self) -> PhaseMetrics {
        let mut metrics = PhaseMetrics::default();
        let mut pacer = self.phase.pacer();

        while !self.cancel.is_cancelled() {
            let Some(sequence) = self.progress.claim() else {
                break;
            };

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = pacer.wait() => {}
            }

            let credential = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                credential = self.credentials.wait_current() => credential,
            };
            let Some(credential) = credential else {
                tracing::error!(
                    worker = self.id,
                    state = ?self.credentials.state(),
                    "no credential available, aborting run"
                );
                self.cancel.cancel();
                break;
            };

            let Some(entity) = self.phase.entity(&self.walker, sequence) else {
                tracing::warn!(worker = self.id, sequence, "no entity for sequence number");
                continue;
            };

            let started = Instant::now();
            let action = self.phase.perform(
                self.catalog.as_ref(),
                &self.walker,
                &credential,
                &entity,
                sequence,
            );
            let result = match tokio::time::timeout(self.timeout, action).await {
                Ok(result) => result,
                Err(_) => Err(ActionError::Timeout),
            };

            match result {
                Ok(()) => metrics.record_success(started.elapsed()),
                Err(error) => {
                    tracing::debug!(
                        worker = self.id,
                        kind = %entity.kind,
                        ordinal = entity.ordinal,
                        %error,
                        "action failed"
                    );
                    metrics.record_failure(&error, started.elapsed());
                }
            }

            self.bar.inc(1);
        }

        metrics
    }
}
