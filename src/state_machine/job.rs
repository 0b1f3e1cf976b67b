use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::{FailureReason, GenerationStatus, StateMachine, Transition, UpdateKind, UpdateSource};
use crate::document::{DocumentParameters, DocumentType, GeneratedDocument};
use crate::error::TrackingError;
use crate::ids::{DocumentId, RequestId, ScopeId};

/// Configuration for retry behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
        }
    }
}

impl RetryConfig {
    /// Calculate the delay for a given retry attempt using exponential backoff.
    /// delay = base_delay_ms * 2^(attempt - 1)
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        self.base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
    }
}

/// One recorded status change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: GenerationStatus,
    pub to: GenerationStatus,
    pub source: UpdateSource,
    pub at: DateTime<Utc>,
}

/// A submitted generation job as tracked locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub id: RequestId,
    pub scope_id: ScopeId,
    pub document_type: DocumentType,
    pub parameters: DocumentParameters,
    pub status: GenerationStatus,
    /// Set only on COMPLETED.
    pub result_document_id: Option<DocumentId>,
    /// Set only on FAILED.
    pub failure: Option<FailureReason>,
    pub created_at: DateTime<Utc>,
    /// Set once, on the first terminal transition.
    pub terminal_at: Option<DateTime<Utc>>,
    pub history: Vec<TransitionRecord>,
}

impl GenerationRequest {
    pub fn new(id: RequestId, scope_id: ScopeId, parameters: DocumentParameters) -> Self {
        Self {
            id,
            scope_id,
            document_type: parameters.document_type(),
            parameters,
            status: GenerationStatus::Pending,
            result_document_id: None,
            failure: None,
            created_at: Utc::now(),
            terminal_at: None,
            history: Vec::new(),
        }
    }

    /// Offers an update; mutates only when the transition table allows it.
    pub fn apply(&mut self, update: &UpdateKind, source: UpdateSource) -> Transition {
        let transition = StateMachine::next(self.status, update.status());
        if let Transition::Advanced { from, to } = transition {
            let now = Utc::now();
            self.status = to;
            match update {
                UpdateKind::Completed { document_id } => {
                    self.result_document_id = Some(document_id.clone());
                }
                UpdateKind::Failed { reason } => self.failure = Some(reason.clone()),
                UpdateKind::Pending | UpdateKind::Processing => {}
            }
            if to.is_terminal() {
                self.terminal_at = Some(now);
            }
            self.history.push(TransitionRecord {
                from,
                to,
                source,
                at: now,
            });
        }
        transition
    }

    /// The error a FAILED request surfaces, if any.
    pub fn tracking_error(&self) -> Option<TrackingError> {
        match (&self.status, &self.failure) {
            (GenerationStatus::Failed, Some(FailureReason::Timeout)) => Some(TrackingError::Timeout),
            (GenerationStatus::Failed, Some(FailureReason::Generation(reason))) => {
                Some(TrackingError::TerminalGeneration {
                    reason: reason.clone(),
                })
            }
            _ => None,
        }
    }
}

/// What the presentation layer observes for one request.
#[derive(Debug, Clone, PartialEq)]
pub enum Progress {
    Pending,
    Processing,
    /// COMPLETED; the artifact fetch is under way.
    Materializing { document_id: DocumentId },
    Ready(Arc<GeneratedDocument>),
    Failed(TrackingError),
    /// COMPLETED, but the artifact could not be fetched. Retryable.
    MaterializationFailed(TrackingError),
    /// Local tracking was torn down first.
    Detached,
}

impl Progress {
    /// True once nothing further will happen without an explicit retry.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            Progress::Ready(_)
                | Progress::Failed(_)
                | Progress::MaterializationFailed(_)
                | Progress::Detached
        )
    }

    pub fn from_request(request: &GenerationRequest) -> Self {
        match request.status {
            GenerationStatus::Pending => Progress::Pending,
            GenerationStatus::Processing => Progress::Processing,
            GenerationStatus::Completed => match &request.result_document_id {
                Some(document_id) => Progress::Materializing {
                    document_id: document_id.clone(),
                },
                None => Progress::Processing,
            },
            GenerationStatus::Failed => Progress::Failed(
                request.tracking_error().unwrap_or(TrackingError::TerminalGeneration {
                    reason: "unknown".to_string(),
                }),
            ),
        }
    }
}

/// Structured audit record produced once a request settles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub request_id: RequestId,
    pub scope_id: ScopeId,
    pub document_type: DocumentType,
    pub status: GenerationStatus,
    pub transitions: Vec<TransitionRecord>,
    pub terminal_source: Option<UpdateSource>,
    pub result_document_id: Option<DocumentId>,
    pub failure: Option<FailureReason>,
    pub created_at: DateTime<Utc>,
    pub terminal_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

impl AuditRecord {
    pub fn from_request(request: &GenerationRequest) -> Self {
        let terminal_source = request
            .history
            .iter()
            .find(|t| t.to.is_terminal())
            .map(|t| t.source);
        Self {
            request_id: request.id.clone(),
            scope_id: request.scope_id.clone(),
            document_type: request.document_type,
            status: request.status,
            transitions: request.history.clone(),
            terminal_source,
            result_document_id: request.result_document_id.clone(),
            failure: request.failure.clone(),
            created_at: request.created_at,
            terminal_at: request.terminal_at,
            duration_ms: request
                .terminal_at
                .map(|at| (at - request.created_at).num_milliseconds()),
        }
    }
}
