//! Owning scope for admission and tracking.
//!
//! An [`Orchestrator`] is created when a session starts and shut down when
//! it ends. It gates submissions through the [`UsageValidator`], registers
//! accepted requests, and starts one poll task plus a scope lease for each.
//! Everything it spawns lives on one `TaskTracker` under one cancellation
//! token, so [`Orchestrator::shutdown`] tears it all down together.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::TrackerConfig;
use crate::document::{DocumentParameters, GeneratedDocument};
use crate::error::{QuotaflowError, TrackingError};
use crate::ids::{DocumentId, RequestId, ScopeId, UserId};
use crate::registry::JobRegistry;
use crate::service::Backend;
use crate::state_machine::{AuditRecord, GenerationRequest, GenerationStatus, Progress};
use crate::tracker::{DocumentStore, PollDriver, Reconciler, ResultMaterializer, ScopeListeners};
use crate::usage::{Action, ActionKind, UsageValidator, ValidationResult};

/// Caller-side view of one submitted request.
///
/// Dropping the handle only detaches the caller; tracking continues.
#[derive(Debug, Clone)]
pub struct RequestHandle {
    id: RequestId,
    admission: Option<ValidationResult>,
    progress: watch::Receiver<Progress>,
}

impl RequestHandle {
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// The admission decision, including any non-blocking warnings.
    /// `None` on handles reattached with [`Orchestrator::handle`].
    pub fn admission(&self) -> Option<&ValidationResult> {
        self.admission.as_ref()
    }

    pub fn progress(&self) -> Progress {
        self.progress.borrow().clone()
    }

    /// Waits for the next progress change. `None` once the feed is gone.
    pub async fn changed(&mut self) -> Option<Progress> {
        self.progress.changed().await.ok()?;
        Some(self.progress.borrow_and_update().clone())
    }

    /// Waits until the request settles.
    pub async fn wait(mut self) -> Result<Arc<GeneratedDocument>, TrackingError> {
        loop {
            match self.progress.borrow_and_update().clone() {
                Progress::Ready(document) => return Ok(document),
                Progress::Failed(err) | Progress::MaterializationFailed(err) => return Err(err),
                Progress::Detached => return Err(TrackingError::Abandoned),
                Progress::Pending | Progress::Processing | Progress::Materializing { .. } => {}
            }
            if self.progress.changed().await.is_err() {
                return Err(TrackingError::Abandoned);
            }
        }
    }
}

pub struct Orchestrator {
    backend: Backend,
    validator: UsageValidator,
    registry: Arc<JobRegistry>,
    store: Arc<DocumentStore>,
    reconciler: Reconciler,
    listeners: ScopeListeners,
    poller: PollDriver,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl Orchestrator {
    /// Must be called inside a tokio runtime.
    pub fn new(backend: Backend, config: TrackerConfig) -> Self {
        let registry = Arc::new(JobRegistry::new());
        let store = Arc::new(DocumentStore::default());
        let tasks = TaskTracker::new();
        let shutdown = CancellationToken::new();

        let materializer = Arc::new(ResultMaterializer::new(
            Arc::clone(&backend.documents),
            Arc::clone(&store),
            config.fetch_retry.clone(),
        ));
        let reconciler = Reconciler::new(
            Arc::clone(&registry),
            materializer,
            tasks.clone(),
            shutdown.clone(),
        );
        let listeners = ScopeListeners::new(
            Arc::clone(&backend.broadcast),
            reconciler.clone(),
            tasks.clone(),
            shutdown.clone(),
            config.poll_interval,
        );
        let poller = PollDriver::new(
            Arc::clone(&backend.status),
            reconciler.clone(),
            config.poll_interval,
            config.timeout,
        );

        Self {
            backend,
            validator: UsageValidator::new(config.warning_threshold),
            registry,
            store,
            reconciler,
            listeners,
            poller,
            tasks,
            shutdown,
        }
    }

    /// Read-only usage summary. Never consumes quota or creates a request.
    pub async fn usage_summary(&self, user: &UserId, kind: ActionKind) -> ValidationResult {
        self.check(user, &Action::probe(kind)).await
    }

    /// Fetches a fresh snapshot and validates `action` against it.
    pub async fn check(&self, user: &UserId, action: &Action) -> ValidationResult {
        let snapshot = self.backend.quota.usage_snapshot(user).await;
        if let Err(err) = &snapshot {
            warn!(user_id = %user, error = %err, "Quota snapshot unavailable");
        }
        let result = self.validator.validate_fetched(snapshot, action);
        for warning in &result.warnings {
            info!(user_id = %user, %warning, "Approaching quota limit");
        }
        result
    }

    /// Admits, submits and starts tracking one generation request.
    pub async fn submit(
        &self,
        user: &UserId,
        scope: &ScopeId,
        parameters: DocumentParameters,
        estimated_tokens: u64,
    ) -> Result<RequestHandle, QuotaflowError> {
        if self.shutdown.is_cancelled() {
            return Err(QuotaflowError::ShuttingDown);
        }
        parameters.validate()?;

        let admission = self
            .check(user, &Action::document_generation(estimated_tokens))
            .await
            .into_admission()
            .inspect_err(|err| info!(user_id = %user, error = %err, "Submission blocked"))?;

        let submitted = self.backend.submission.submit(scope, &parameters).await?;
        let request = GenerationRequest::new(submitted.id.clone(), scope.clone(), parameters);
        let progress = self.registry.register(request)?;
        info!(
            request_id = %submitted.id,
            scope_id = %scope,
            active_in_scope = self.registry.active_in_scope(scope),
            "Generation submitted"
        );

        self.start_tracking(submitted.id.clone(), scope);
        Ok(RequestHandle {
            id: submitted.id,
            admission: Some(admission),
            progress,
        })
    }

    fn start_tracking(&self, id: RequestId, scope: &ScopeId) {
        let lease = self.listeners.acquire(scope);
        let poller = self.poller.clone();
        let shutdown = self.shutdown.clone();
        self.tasks.spawn(async move {
            let outcome = poller.run(id.clone(), lease, shutdown).await;
            debug!(request_id = %id, ?outcome, "Tracking finished");
        });
    }

    /// Resubmits a FAILED request under a fresh id.
    pub async fn retry(
        &self,
        user: &UserId,
        id: &RequestId,
        estimated_tokens: u64,
    ) -> Result<RequestHandle, QuotaflowError> {
        let request = self.require(id)?;
        if request.status != GenerationStatus::Failed {
            return Err(QuotaflowError::InvalidState {
                id: id.clone(),
                status: request.status.to_string(),
                action: "retry",
                expected: "FAILED",
            });
        }
        info!(request_id = %id, "Retrying failed generation as a new request");
        self.submit(user, &request.scope_id, request.parameters, estimated_tokens)
            .await
    }

    /// Fetches the artifact of a COMPLETED request again, without resubmitting.
    pub async fn retry_materialization(
        &self,
        id: &RequestId,
    ) -> Result<Arc<GeneratedDocument>, QuotaflowError> {
        let request = self.require(id)?;
        let Some(document_id) = request
            .result_document_id
            .filter(|_| request.status == GenerationStatus::Completed)
        else {
            return Err(QuotaflowError::InvalidState {
                id: id.clone(),
                status: request.status.to_string(),
                action: "retry_materialization",
                expected: "COMPLETED",
            });
        };
        Ok(self.reconciler.materialize(id, &document_id).await?)
    }

    fn require(&self, id: &RequestId) -> Result<GenerationRequest, QuotaflowError> {
        self.registry
            .get(id)
            .ok_or_else(|| QuotaflowError::RequestNotFound(id.clone()))
    }

    pub fn request(&self, id: &RequestId) -> Option<GenerationRequest> {
        self.registry.get(id)
    }

    /// Reattaches to a tracked request.
    pub fn handle(&self, id: &RequestId) -> Option<RequestHandle> {
        Some(RequestHandle {
            id: id.clone(),
            admission: None,
            progress: self.registry.subscribe(id)?,
        })
    }

    pub fn document(&self, id: &DocumentId) -> Option<Arc<GeneratedDocument>> {
        self.store.get(id)
    }

    pub fn audit(&self, id: &RequestId) -> Option<AuditRecord> {
        self.registry.get(id).map(|request| AuditRecord::from_request(&request))
    }

    pub fn active_requests(&self) -> usize {
        self.registry.active_count()
    }

    pub fn is_listening(&self, scope: &ScopeId) -> bool {
        self.listeners.is_listening(scope)
    }

    /// Cancels every poll loop, listener and fetch, and waits for them.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        let detached = self.registry.detach_unsettled();
        info!(detached, "Tracker shut down");
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
