//! In-process backend with scriptable behaviour.
//!
//! Each submitted request takes the next queued script; each status query
//! consumes one step of it (the last step repeats). Push payloads are
//! published explicitly with [`InMemoryBackend::publish`]. Call counters
//! let callers check how often each collaborator was hit.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::error::ServiceError;
use super::types::{RawStatusPayload, SubmittedRequest};
use super::{BroadcastChannel, DocumentFetcher, QuotaProvider, StatusQuery, SubmissionService};
use crate::document::{DocumentParameters, DocumentType, GeneratedDocument};
use crate::ids::{DocumentId, RequestId, ScopeId, UserId};
use crate::state_machine::{GenerationStatus, StatusUpdate, UpdateKind};
use crate::usage::{Dimension, UsageSnapshot};

const SUBSCRIPTION_BUFFER: usize = 64;

/// One scripted answer to a status query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptStep {
    Report(UpdateKind),
    /// The query fails with a transient error.
    Unreachable,
}

#[derive(Default)]
struct State {
    snapshot: Option<UsageSnapshot>,
    quota_down: bool,
    queued_scripts: VecDeque<Vec<ScriptStep>>,
    scripts: HashMap<RequestId, VecDeque<ScriptStep>>,
    scopes: HashMap<RequestId, ScopeId>,
    documents: HashMap<DocumentId, GeneratedDocument>,
    fetch_failures: HashMap<DocumentId, u32>,
    subscribers: HashMap<ScopeId, Vec<mpsc::Sender<RawStatusPayload>>>,
    subscriptions_opened: HashMap<ScopeId, usize>,
    submissions: Vec<(RequestId, DocumentParameters)>,
    status_calls: HashMap<RequestId, usize>,
    fetch_calls: HashMap<DocumentId, usize>,
}

#[derive(Default)]
pub struct InMemoryBackend {
    state: Mutex<State>,
}

impl InMemoryBackend {
    pub fn new(snapshot: UsageSnapshot) -> Self {
        let backend = Self::default();
        backend.lock().snapshot = Some(snapshot);
        backend
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes the quota provider fail until switched back.
    pub fn set_quota_down(&self, down: bool) {
        self.lock().quota_down = down;
    }

    /// Script for the next submission that has none yet.
    pub fn enqueue_script(&self, steps: Vec<ScriptStep>) {
        self.lock().queued_scripts.push_back(steps);
    }

    pub fn insert_document(&self, document: GeneratedDocument) {
        self.lock().documents.insert(document.id.clone(), document);
    }

    /// Stores a placeholder document for `id`.
    pub fn insert_placeholder_document(&self, id: &DocumentId, scope: &ScopeId, kind: DocumentType) {
        self.insert_document(GeneratedDocument {
            id: id.clone(),
            scope_id: scope.clone(),
            document_type: kind,
            content: format!("# {kind}\n\nGenerated content for {id}."),
            created_at: Utc::now(),
        });
    }

    /// The next `count` fetches of `id` fail with a transient error.
    pub fn fail_fetches(&self, id: &DocumentId, count: u32) {
        self.lock().fetch_failures.insert(id.clone(), count);
    }

    /// Delivers a payload to every live subscriber of `scope`.
    /// Returns how many subscribers received it.
    pub fn publish(&self, scope: &ScopeId, payload: RawStatusPayload) -> usize {
        let senders = {
            let mut state = self.lock();
            let senders = state.subscribers.entry(scope.clone()).or_default();
            senders.retain(|tx| !tx.is_closed());
            senders.clone()
        };
        senders
            .iter()
            .filter(|tx| tx.try_send(payload.clone()).is_ok())
            .count()
    }

    /// Publishes a typed update on the scope the request was submitted to.
    pub fn publish_update(&self, update: &StatusUpdate) -> usize {
        let scope = self.lock().scopes.get(&update.request_id).cloned();
        match scope {
            Some(scope) => self.publish(&scope, RawStatusPayload::from(update)),
            None => 0,
        }
    }

    pub fn submissions(&self) -> Vec<(RequestId, DocumentParameters)> {
        self.lock().submissions.clone()
    }

    pub fn status_calls(&self, id: &RequestId) -> usize {
        self.lock().status_calls.get(id).copied().unwrap_or(0)
    }

    pub fn fetch_calls(&self, id: &DocumentId) -> usize {
        self.lock().fetch_calls.get(id).copied().unwrap_or(0)
    }

    pub fn subscriptions_opened(&self, scope: &ScopeId) -> usize {
        self.lock().subscriptions_opened.get(scope).copied().unwrap_or(0)
    }

    pub fn open_subscriptions(&self, scope: &ScopeId) -> usize {
        self.lock()
            .subscribers
            .get(scope)
            .map(|senders| senders.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl QuotaProvider for InMemoryBackend {
    async fn usage_snapshot(&self, _user: &UserId) -> Result<UsageSnapshot, ServiceError> {
        let state = self.lock();
        if state.quota_down {
            return Err(ServiceError::Api {
                status: 503,
                message: "quota service unavailable".to_string(),
            });
        }
        state
            .snapshot
            .clone()
            .ok_or_else(|| ServiceError::NotFound("usage snapshot".to_string()))
    }
}

#[async_trait]
impl SubmissionService for InMemoryBackend {
    async fn submit(
        &self,
        scope: &ScopeId,
        parameters: &DocumentParameters,
    ) -> Result<SubmittedRequest, ServiceError> {
        let id = RequestId::new(format!("req-{}", Uuid::new_v4()));
        let mut state = self.lock();
        let script = state.queued_scripts.pop_front().unwrap_or_default();
        state.scripts.insert(id.clone(), script.into());
        state.scopes.insert(id.clone(), scope.clone());
        state.submissions.push((id.clone(), parameters.clone()));
        if let Some(snapshot) = state.snapshot.take() {
            let documents = snapshot.used.get(Dimension::Documents).unwrap_or(0);
            state.snapshot = Some(snapshot.with_usage(Dimension::Documents, documents + 1));
        }
        Ok(SubmittedRequest {
            id,
            status: GenerationStatus::Pending,
        })
    }
}

#[async_trait]
impl StatusQuery for InMemoryBackend {
    async fn get_status(&self, request: &RequestId) -> Result<StatusUpdate, ServiceError> {
        let mut state = self.lock();
        *state.status_calls.entry(request.clone()).or_default() += 1;
        let Some(script) = state.scripts.get_mut(request) else {
            return Err(ServiceError::NotFound(format!("generation {request}")));
        };
        let step = if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().cloned()
        };
        match step {
            Some(ScriptStep::Report(kind)) => Ok(StatusUpdate::new(request.clone(), kind)),
            Some(ScriptStep::Unreachable) => Err(ServiceError::Api {
                status: 503,
                message: "status service unavailable".to_string(),
            }),
            None => Ok(StatusUpdate::new(request.clone(), UpdateKind::Pending)),
        }
    }
}

#[async_trait]
impl DocumentFetcher for InMemoryBackend {
    async fn get_document(&self, document: &DocumentId) -> Result<GeneratedDocument, ServiceError> {
        let mut state = self.lock();
        *state.fetch_calls.entry(document.clone()).or_default() += 1;
        if let Some(remaining) = state.fetch_failures.get_mut(document)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(ServiceError::Api {
                status: 503,
                message: "document store unavailable".to_string(),
            });
        }
        state
            .documents
            .get(document)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(format!("document {document}")))
    }
}

#[async_trait]
impl BroadcastChannel for InMemoryBackend {
    async fn subscribe(
        &self,
        scope: &ScopeId,
    ) -> Result<mpsc::Receiver<RawStatusPayload>, ServiceError> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let mut state = self.lock();
        state.subscribers.entry(scope.clone()).or_default().push(tx);
        *state.subscriptions_opened.entry(scope.clone()).or_default() += 1;
        Ok(rx)
    }
}
