//! Fetches finished artifacts and caches them locally.
//!
//! Concurrent requests for the same document share one fetch: the first
//! caller initializes a per-document `OnceCell` and everyone else awaits
//! it. Transient fetch errors are retried with exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::OnceCell;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::document::GeneratedDocument;
use crate::error::MaterializationError;
use crate::ids::DocumentId;
use crate::service::{DocumentFetcher, ServiceError};
use crate::state_machine::RetryConfig;

/// Local cache of materialized documents. Only the materializer writes.
#[derive(Default)]
pub struct DocumentStore {
    documents: DashMap<DocumentId, Arc<GeneratedDocument>>,
}

impl DocumentStore {
    pub fn get(&self, id: &DocumentId) -> Option<Arc<GeneratedDocument>> {
        self.documents.get(id).map(|r| Arc::clone(r.value()))
    }

    pub fn contains(&self, id: &DocumentId) -> bool {
        self.documents.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    fn insert(&self, document: Arc<GeneratedDocument>) {
        self.documents.insert(document.id.clone(), document);
    }
}

type FetchCell = Arc<OnceCell<Arc<GeneratedDocument>>>;

pub struct ResultMaterializer {
    fetcher: Arc<dyn DocumentFetcher>,
    store: Arc<DocumentStore>,
    in_flight: DashMap<DocumentId, FetchCell>,
    retry: RetryConfig,
}

impl ResultMaterializer {
    pub fn new(fetcher: Arc<dyn DocumentFetcher>, store: Arc<DocumentStore>, retry: RetryConfig) -> Self {
        Self {
            fetcher,
            store,
            in_flight: DashMap::new(),
            retry,
        }
    }

    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }

    /// Returns the cached document or fetches it, at most once at a time per id.
    pub async fn materialize(
        &self,
        document_id: &DocumentId,
    ) -> Result<Arc<GeneratedDocument>, MaterializationError> {
        if let Some(document) = self.store.get(document_id) {
            debug!(document_id = %document_id, "Document already materialized");
            return Ok(document);
        }

        let cell: FetchCell = Arc::clone(&self.in_flight.entry(document_id.clone()).or_default());
        let result = cell
            .get_or_try_init(|| self.fetch_into_store(document_id))
            .await
            .cloned();

        // A failed cell stays uninitialized; drop it so a later retry starts clean.
        self.in_flight
            .remove_if(document_id, |_, current| Arc::ptr_eq(current, &cell));
        result
    }

    /// Runs inside the in-flight cell. The store is checked again because an
    /// earlier fetch may have finished and released its cell since the caller
    /// missed the store.
    async fn fetch_into_store(
        &self,
        document_id: &DocumentId,
    ) -> Result<Arc<GeneratedDocument>, MaterializationError> {
        if let Some(document) = self.store.get(document_id) {
            return Ok(document);
        }
        let document = self.fetch_with_retry(document_id).await?;
        self.store.insert(Arc::clone(&document));
        Ok(document)
    }

    async fn fetch_with_retry(
        &self,
        document_id: &DocumentId,
    ) -> Result<Arc<GeneratedDocument>, MaterializationError> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.fetcher.get_document(document_id).await {
                Ok(document) => {
                    info!(document_id = %document_id, attempt, "Document materialized");
                    return Ok(Arc::new(document));
                }
                Err(err) if err.is_transient() && attempt <= self.retry.max_retries => {
                    let delay_ms = match &err {
                        ServiceError::RateLimited { retry_after_ms } => {
                            (*retry_after_ms).max(self.retry.delay_for_attempt(attempt))
                        }
                        _ => self.retry.delay_for_attempt(attempt),
                    };
                    warn!(
                        document_id = %document_id,
                        attempt,
                        max_retries = self.retry.max_retries,
                        delay_ms,
                        error = %err,
                        "Document fetch failed, retrying"
                    );
                    sleep(Duration::from_millis(delay_ms)).await;
                }
                Err(err) => {
                    return Err(MaterializationError {
                        document_id: document_id.clone(),
                        attempts: attempt,
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
    use crate::document::DocumentType;
    use crate::ids::ScopeId;
    use crate::service::InMemoryBackend;

    fn setup(retry: RetryConfig) -> (Arc<InMemoryBackend>, ResultMaterializer) {
        let backend = Arc::new(InMemoryBackend::default());
        let materializer =
            ResultMaterializer::new(backend.clone(), Arc::new(DocumentStore::default()), retry);
        (backend, materializer)
    }

    #[tokio::test]
    async fn second_call_is_served_from_store() {
        let (backend, materializer) = setup(RetryConfig::default());
        let id = DocumentId::new("doc-1");
        backend.insert_placeholder_document(&id, &ScopeId::new("s1"), DocumentType::BusinessPlan);

        let first = materializer.materialize(&id).await.unwrap();
        let second = materializer.materialize(&id).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(backend.fetch_calls(&id), 1);
        assert!(materializer.store().contains(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_fetch() {
        let (backend, materializer) = setup(RetryConfig::default());
        let id = DocumentId::new("doc-1");
        backend.insert_placeholder_document(&id, &ScopeId::new("s1"), DocumentType::ActionPlan);
        // The first attempt fails, so the fetch is still in flight when the
        // second caller arrives.
        backend.fail_fetches(&id, 1);

        let (a, b) = tokio::join!(materializer.materialize(&id), materializer.materialize(&id));

        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
        assert_eq!(backend.fetch_calls(&id), 2);
    }

    #[tokio::test]
    async fn late_caller_reuses_document_stored_by_finished_fetch() {
        let (backend, materializer) = setup(RetryConfig::default());
        let id = DocumentId::new("doc-1");
        backend.insert_placeholder_document(&id, &ScopeId::new("s1"), DocumentType::BusinessPlan);
        let first = materializer.materialize(&id).await.unwrap();
        assert!(materializer.in_flight.is_empty());

        // A caller that missed the store before the first fetch finished
        // lands in a fresh cell; it must not fetch again.
        let late = materializer.fetch_into_store(&id).await.unwrap();

        assert!(Arc::ptr_eq(&first, &late));
        assert_eq!(backend.fetch_calls(&id), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_exhaust_retries() {
        let (backend, materializer) = setup(RetryConfig {
            max_retries: 2,
            base_delay_ms: 100,
        });
        let id = DocumentId::new("doc-1");
        backend.insert_placeholder_document(&id, &ScopeId::new("s1"), DocumentType::ActionPlan);
        backend.fail_fetches(&id, 10);

        let err = materializer.materialize(&id).await.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(backend.fetch_calls(&id), 3);
        assert!(!materializer.store().contains(&id));
    }

    #[tokio::test]
    async fn permanent_error_is_not_retried() {
        let (backend, materializer) = setup(RetryConfig::default());
        let id = DocumentId::new("missing");

        let err = materializer.materialize(&id).await.unwrap_err();
        assert_eq!(err.attempts, 1);
        assert!(matches!(err.source, ServiceError::NotFound(_)));
        assert_eq!(backend.fetch_calls(&id), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_materialization_can_be_retried() {
        let (backend, materializer) = setup(RetryConfig {
            max_retries: 0,
            base_delay_ms: 100,
        });
        let id = DocumentId::new("doc-1");
        backend.insert_placeholder_document(&id, &ScopeId::new("s1"), DocumentType::SwotAnalysis);
        backend.fail_fetches(&id, 1);

        assert!(materializer.materialize(&id).await.is_err());
        assert!(materializer.materialize(&id).await.is_ok());
        assert_eq!(backend.fetch_calls(&id), 2);
    }
}
