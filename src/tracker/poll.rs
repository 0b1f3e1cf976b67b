//! Pull-side tracking: one poll loop per request.
//!
//! The loop queries the status endpoint on a fixed interval until the
//! request reaches a terminal state, the ceiling elapses, or the tracker
//! shuts down. It also watches the request's progress feed so a push-side
//! terminal stops it before the next tick.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep_until, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::listener::SubscriptionLease;
use super::reconciler::Reconciler;
use crate::ids::RequestId;
use crate::service::StatusQuery;
use crate::state_machine::{GenerationStatus, StatusUpdate, UpdateKind, UpdateSource};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_POLL_CEILING: Duration = Duration::from_secs(300);

/// Why a poll loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The request reached this terminal status (by either path).
    Terminal(GenerationStatus),
    /// The ceiling elapsed first; the request was failed with a timeout.
    TimedOut,
    Cancelled,
    /// The request was never registered.
    Untracked,
}

#[derive(Clone)]
pub struct PollDriver {
    status: Arc<dyn StatusQuery>,
    reconciler: Reconciler,
    interval: Duration,
    ceiling: Duration,
}

impl PollDriver {
    pub fn new(
        status: Arc<dyn StatusQuery>,
        reconciler: Reconciler,
        interval: Duration,
        ceiling: Duration,
    ) -> Self {
        Self {
            status,
            reconciler,
            interval,
            ceiling,
        }
    }

    /// Polls `request_id` until it settles. The lease is released on return.
    pub async fn run(
        &self,
        request_id: RequestId,
        _lease: SubscriptionLease,
        shutdown: CancellationToken,
    ) -> PollOutcome {
        let registry = Arc::clone(self.reconciler.registry());
        let Some(mut progress) = registry.subscribe(&request_id) else {
            return PollOutcome::Untracked;
        };
        let started = Instant::now();
        let deadline = started + self.ceiling;
        let mut ticker = interval_at(started + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!(
            request_id = %request_id,
            interval_ms = self.interval.as_millis() as u64,
            ceiling_secs = self.ceiling.as_secs(),
            "Polling started"
        );

        loop {
            if let Some(status) = registry.status(&request_id)
                && status.is_terminal()
            {
                debug!(request_id = %request_id, %status, "Polling stopped");
                return PollOutcome::Terminal(status);
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    debug!(request_id = %request_id, "Polling cancelled");
                    return PollOutcome::Cancelled;
                }
                _ = sleep_until(deadline) => {
                    return self.expire(&request_id);
                }
                changed = progress.changed() => {
                    if changed.is_err() {
                        return PollOutcome::Untracked;
                    }
                }
                _ = ticker.tick() => {
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => {
                            debug!(request_id = %request_id, "Polling cancelled during status query");
                            return PollOutcome::Cancelled;
                        }
                        _ = self.poll_once(&request_id, deadline) => {}
                    }
                }
            }
        }
    }

    async fn poll_once(&self, request_id: &RequestId, deadline: Instant) {
        match timeout_at(deadline, self.status.get_status(request_id)).await {
            Err(_) => trace!(request_id = %request_id, "Status query cut off at ceiling"),
            Ok(Err(err)) if err.is_transient() => {
                debug!(request_id = %request_id, error = %err, "Transient status query failure");
            }
            Ok(Err(err)) => {
                warn!(request_id = %request_id, error = %err, "Status query failed");
            }
            Ok(Ok(update)) if update.request_id != *request_id => {
                warn!(
                    request_id = %request_id,
                    reported = %update.request_id,
                    "Status answer for a different request ignored"
                );
            }
            Ok(Ok(update)) => {
                self.reconciler.apply(&update, UpdateSource::Poll);
            }
        }
    }

    fn expire(&self, request_id: &RequestId) -> PollOutcome {
        let update = StatusUpdate::new(request_id.clone(), UpdateKind::timeout());
        if self.reconciler.apply(&update, UpdateSource::Poll) {
            info!(
                request_id = %request_id,
                ceiling_secs = self.ceiling.as_secs(),
                "Generation timed out"
            );
            return PollOutcome::TimedOut;
        }
        // Something else got there first.
        match self.reconciler.registry().status(request_id) {
            Some(status) => PollOutcome::Terminal(status),
            None => PollOutcome::Untracked,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{DocumentParameters, DocumentType};
    use crate::error::TrackingError;
    use crate::ids::{DocumentId, ScopeId};
    use crate::registry::JobRegistry;
    use crate::service::{InMemoryBackend, ScriptStep, ServiceError, SubmissionService};
    use crate::state_machine::{FailureReason, GenerationRequest, Progress, RetryConfig};
    use crate::tracker::{DocumentStore, ResultMaterializer, ScopeListeners};
    use tokio_util::task::TaskTracker;

    struct Fixture {
        backend: Arc<InMemoryBackend>,
        registry: Arc<JobRegistry>,
        driver: PollDriver,
        listeners: ScopeListeners,
        tasks: TaskTracker,
        shutdown: CancellationToken,
    }

    fn fixture() -> Fixture {
        let backend = Arc::new(InMemoryBackend::default());
        let registry = Arc::new(JobRegistry::new());
        let tasks = TaskTracker::new();
        let shutdown = CancellationToken::new();
        let materializer = Arc::new(ResultMaterializer::new(
            backend.clone(),
            Arc::new(DocumentStore::default()),
            RetryConfig::default(),
        ));
        let reconciler = Reconciler::new(registry.clone(), materializer, tasks.clone(), shutdown.clone());
        let listeners = ScopeListeners::new(
            backend.clone(),
            reconciler.clone(),
            tasks.clone(),
            shutdown.clone(),
            DEFAULT_POLL_INTERVAL,
        );
        let driver = PollDriver::new(
            backend.clone(),
            reconciler,
            DEFAULT_POLL_INTERVAL,
            DEFAULT_POLL_CEILING,
        );
        Fixture {
            backend,
            registry,
            driver,
            listeners,
            tasks,
            shutdown,
        }
    }

    fn params() -> DocumentParameters {
        DocumentParameters::ActionPlan {
            goals: vec!["Open second location".into()],
            timeframe_weeks: 12,
        }
    }

    async fn submit(f: &Fixture, steps: Vec<ScriptStep>) -> RequestId {
        f.backend.enqueue_script(steps);
        let scope = ScopeId::new("s1");
        let submitted = f.backend.submit(&scope, &params()).await.unwrap();
        f.registry
            .register(GenerationRequest::new(submitted.id.clone(), scope, params()))
            .unwrap();
        submitted.id
    }

    fn spawn_run(f: &Fixture, id: &RequestId) -> tokio::task::JoinHandle<PollOutcome> {
        let driver = f.driver.clone();
        let lease = f.listeners.acquire(&ScopeId::new("s1"));
        let shutdown = f.shutdown.clone();
        let id = id.clone();
        tokio::spawn(async move { driver.run(id, lease, shutdown).await })
    }

    #[tokio::test(start_paused = true)]
    async fn never_terminal_times_out_exactly_once() {
        let f = fixture();
        let id = submit(&f, vec![ScriptStep::Report(UpdateKind::Processing)]).await;

        let outcome = spawn_run(&f, &id).await.unwrap();

        assert_eq!(outcome, PollOutcome::TimedOut);
        let record = f.registry.get(&id).unwrap();
        assert_eq!(record.status, GenerationStatus::Failed);
        assert_eq!(record.failure, Some(FailureReason::Timeout));
        let timeouts = record
            .history
            .iter()
            .filter(|t| t.to == GenerationStatus::Failed)
            .count();
        assert_eq!(timeouts, 1);
        assert_eq!(
            f.registry.progress(&id),
            Some(Progress::Failed(TrackingError::Timeout))
        );
        // Roughly one query per interval, none after the ceiling.
        let calls = f.backend.status_calls(&id);
        assert!((140..=150).contains(&calls), "unexpected query count {calls}");
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_keep_polling() {
        let f = fixture();
        let doc = DocumentId::new("doc-1");
        f.backend
            .insert_placeholder_document(&doc, &ScopeId::new("s1"), DocumentType::ActionPlan);
        let id = submit(
            &f,
            vec![
                ScriptStep::Unreachable,
                ScriptStep::Unreachable,
                ScriptStep::Report(UpdateKind::Completed { document_id: doc.clone() }),
            ],
        )
        .await;

        let outcome = spawn_run(&f, &id).await.unwrap();

        assert_eq!(outcome, PollOutcome::Terminal(GenerationStatus::Completed));
        assert_eq!(f.backend.status_calls(&id), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn push_terminal_stops_polling_before_first_tick() {
        let f = fixture();
        let id = submit(&f, vec![]).await;
        let handle = spawn_run(&f, &id);
        tokio::time::sleep(Duration::from_millis(500)).await;

        f.backend.publish_update(&StatusUpdate::new(
            id.clone(),
            UpdateKind::Failed {
                reason: FailureReason::Generation("rejected".into()),
            },
        ));

        let outcome = handle.await.unwrap();
        assert_eq!(outcome, PollOutcome::Terminal(GenerationStatus::Failed));
        assert_eq!(f.backend.status_calls(&id), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_and_releases_lease() {
        let f = fixture();
        let id = submit(&f, vec![]).await;
        let handle = spawn_run(&f, &id);
        tokio::time::sleep(Duration::from_secs(5)).await;

        f.shutdown.cancel();
        assert_eq!(handle.await.unwrap(), PollOutcome::Cancelled);
        assert!(!f.listeners.is_listening(&ScopeId::new("s1")));
        assert_eq!(f.registry.status(&id), Some(GenerationStatus::Pending));
        f.tasks.close();
        f.tasks.wait().await;
    }

    struct HangingStatus;

    #[async_trait::async_trait]
    impl StatusQuery for HangingStatus {
        async fn get_status(&self, _request: &RequestId) -> Result<StatusUpdate, ServiceError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_a_hung_status_query() {
        let f = fixture();
        let id = submit(&f, vec![]).await;
        let driver = PollDriver {
            status: Arc::new(HangingStatus),
            ..f.driver.clone()
        };
        let lease = f.listeners.acquire(&ScopeId::new("s1"));
        let shutdown = f.shutdown.clone();
        let run_id = id.clone();
        let handle = tokio::spawn(async move { driver.run(run_id, lease, shutdown).await });
        tokio::time::sleep(Duration::from_secs(3)).await;

        let cancelled_at = Instant::now();
        f.shutdown.cancel();
        assert_eq!(handle.await.unwrap(), PollOutcome::Cancelled);
        assert!(cancelled_at.elapsed() < Duration::from_secs(1));
        assert!(!f.listeners.is_listening(&ScopeId::new("s1")));
        assert_eq!(f.registry.status(&id), Some(GenerationStatus::Pending));
    }

    #[tokio::test]
    async fn untracked_request_returns_immediately() {
        let f = fixture();
        let outcome = spawn_run(&f, &RequestId::new("ghost")).await.unwrap();
        assert_eq!(outcome, PollOutcome::Untracked);
    }
}
