//! The single entry point for status observations.
//!
//! Both the poll driver and the push listener hand their validated updates
//! to [`Reconciler::apply`]. It runs the update through the registry and
//! reacts to the transitions that matter: FAILED retires the request, and
//! COMPLETED starts materialization exactly once.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::materializer::ResultMaterializer;
use crate::document::GeneratedDocument;
use crate::error::{MaterializationError, TrackingError};
use crate::ids::{DocumentId, RequestId};
use crate::registry::JobRegistry;
use crate::state_machine::{Progress, StatusUpdate, Transition, UpdateKind, UpdateSource};

#[derive(Clone)]
pub struct Reconciler {
    registry: Arc<JobRegistry>,
    materializer: Arc<ResultMaterializer>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl Reconciler {
    pub fn new(
        registry: Arc<JobRegistry>,
        materializer: Arc<ResultMaterializer>,
        tasks: TaskTracker,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry,
            materializer,
            tasks,
            shutdown,
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Offers one observation. Returns true when it changed the request.
    pub fn apply(&self, update: &StatusUpdate, source: UpdateSource) -> bool {
        let id = &update.request_id;
        let transition = self.registry.apply(id, &update.kind, source);
        match (&transition, &update.kind) {
            (Transition::Advanced { .. }, UpdateKind::Completed { document_id }) => {
                info!(request_id = %id, source = %source, document_id = %document_id, "Generation completed");
                self.spawn_materialization(id.clone(), document_id.clone());
            }
            (Transition::Advanced { .. }, UpdateKind::Failed { reason }) => {
                warn!(request_id = %id, source = %source, reason = %reason, "Generation failed");
                self.registry.retire(id);
            }
            (Transition::Unknown, _) => {
                debug!(request_id = %id, source = %source, "Ignoring update for untracked request");
            }
            _ => {}
        }
        transition.changed()
    }

    fn spawn_materialization(&self, request_id: RequestId, document_id: DocumentId) {
        let this = self.clone();
        let shutdown = self.shutdown.clone();
        self.tasks.spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!(request_id = %request_id, "Materialization abandoned on shutdown");
                }
                _ = this.materialize(&request_id, &document_id) => {}
            }
        });
    }

    /// Fetches the artifact for a COMPLETED request and publishes the outcome.
    ///
    /// The request is retired either way; a failed fetch leaves it COMPLETED
    /// and retryable.
    pub async fn materialize(
        &self,
        request_id: &RequestId,
        document_id: &DocumentId,
    ) -> Result<Arc<GeneratedDocument>, MaterializationError> {
        self.registry.set_progress(
            request_id,
            Progress::Materializing {
                document_id: document_id.clone(),
            },
        );
        let result = self.materializer.materialize(document_id).await;
        match &result {
            Ok(document) => {
                self.registry
                    .set_progress(request_id, Progress::Ready(Arc::clone(document)));
            }
            Err(err) => {
                warn!(
                    request_id = %request_id,
                    document_id = %document_id,
                    attempts = err.attempts,
                    error = %err.source,
                    "Materialization failed"
                );
                self.registry.set_progress(
                    request_id,
                    Progress::MaterializationFailed(TrackingError::from(err)),
                );
            }
        }
        self.registry.retire(request_id);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{DocumentParameters, DocumentType};
    use crate::ids::ScopeId;
    use crate::service::InMemoryBackend;
    use crate::state_machine::{FailureReason, GenerationRequest, GenerationStatus, RetryConfig};
    use crate::tracker::DocumentStore;

    struct Fixture {
        backend: Arc<InMemoryBackend>,
        registry: Arc<JobRegistry>,
        reconciler: Reconciler,
        tasks: TaskTracker,
    }

    fn fixture() -> Fixture {
        let backend = Arc::new(InMemoryBackend::default());
        let registry = Arc::new(JobRegistry::new());
        let materializer = Arc::new(ResultMaterializer::new(
            backend.clone(),
            Arc::new(DocumentStore::default()),
            RetryConfig {
                max_retries: 0,
                base_delay_ms: 10,
            },
        ));
        let tasks = TaskTracker::new();
        let reconciler = Reconciler::new(
            registry.clone(),
            materializer,
            tasks.clone(),
            CancellationToken::new(),
        );
        Fixture {
            backend,
            registry,
            reconciler,
            tasks,
        }
    }

    fn register(registry: &JobRegistry, id: &str) -> RequestId {
        let id = RequestId::new(id);
        registry
            .register(GenerationRequest::new(
                id.clone(),
                ScopeId::new("s1"),
                DocumentParameters::SwotAnalysis {
                    subject: "Bike repair".into(),
                    context: None,
                },
            ))
            .unwrap();
        id
    }

    async fn settle(tasks: &TaskTracker) {
        tasks.close();
        tasks.wait().await;
        tasks.reopen();
    }

    #[tokio::test]
    async fn completion_materializes_once_and_retires() {
        let f = fixture();
        let id = register(&f.registry, "r1");
        let doc = DocumentId::new("doc-1");
        f.backend
            .insert_placeholder_document(&doc, &ScopeId::new("s1"), DocumentType::SwotAnalysis);

        let completed = StatusUpdate::new(id.clone(), UpdateKind::Completed { document_id: doc.clone() });
        assert!(f.reconciler.apply(&completed, UpdateSource::Push));
        assert!(!f.reconciler.apply(&completed, UpdateSource::Poll));
        settle(&f.tasks).await;

        assert_eq!(f.backend.fetch_calls(&doc), 1);
        assert!(matches!(f.registry.progress(&id), Some(Progress::Ready(_))));
        assert!(!f.registry.is_active(&id));
    }

    #[tokio::test]
    async fn failure_retires_without_fetching() {
        let f = fixture();
        let id = register(&f.registry, "r1");
        let failed = StatusUpdate::new(
            id.clone(),
            UpdateKind::Failed {
                reason: FailureReason::Generation("quota exceeded upstream".into()),
            },
        );

        assert!(f.reconciler.apply(&failed, UpdateSource::Poll));
        settle(&f.tasks).await;

        assert_eq!(f.registry.status(&id), Some(GenerationStatus::Failed));
        assert!(!f.registry.is_active(&id));
        assert!(matches!(
            f.registry.progress(&id),
            Some(Progress::Failed(TrackingError::TerminalGeneration { .. }))
        ));
    }

    #[tokio::test]
    async fn fetch_failure_keeps_completed_status() {
        let f = fixture();
        let id = register(&f.registry, "r1");
        let doc = DocumentId::new("doc-missing");

        f.reconciler.apply(
            &StatusUpdate::new(id.clone(), UpdateKind::Completed { document_id: doc.clone() }),
            UpdateSource::Push,
        );
        settle(&f.tasks).await;

        assert_eq!(f.registry.status(&id), Some(GenerationStatus::Completed));
        assert!(matches!(
            f.registry.progress(&id),
            Some(Progress::MaterializationFailed(TrackingError::Materialization { .. }))
        ));
    }

    #[tokio::test]
    async fn untracked_request_is_ignored() {
        let f = fixture();
        let update = StatusUpdate::new(RequestId::new("someone-else"), UpdateKind::Processing);
        assert!(!f.reconciler.apply(&update, UpdateSource::Push));
        assert!(f.registry.is_empty());
    }
}
