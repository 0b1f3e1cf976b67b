//! Wire shapes exchanged with the generation backend.
//!
//! Status payloads arrive loosely typed from both the status endpoint and
//! the push channel. [`RawStatusPayload::into_update`] is the single place
//! they are checked and turned into a [`StatusUpdate`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::document::DocumentParameters;
use crate::ids::{DocumentId, RequestId};
use crate::state_machine::{FailureReason, GenerationStatus, StatusUpdate, UpdateKind};

/// Status message as sent by the backend: `{request_id, status, result_document_id?, error?}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawStatusPayload {
    #[serde(default, alias = "requestId")]
    pub request_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, alias = "resultDocumentId")]
    pub result_document_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("payload has no request id")]
    MissingRequestId,
    #[error("payload has no status")]
    MissingStatus,
    #[error("unknown status `{0}`")]
    UnknownStatus(String),
    #[error("COMPLETED payload has no result document id")]
    MissingDocumentId,
}

fn parse_status(raw: &str) -> Option<GenerationStatus> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "pending" | "queued" => Some(GenerationStatus::Pending),
        "processing" | "in_progress" | "running" => Some(GenerationStatus::Processing),
        "completed" | "succeeded" => Some(GenerationStatus::Completed),
        "failed" | "error" => Some(GenerationStatus::Failed),
        _ => None,
    }
}

impl RawStatusPayload {
    pub fn new(request_id: &RequestId, kind: &UpdateKind) -> Self {
        let (result_document_id, error) = match kind {
            UpdateKind::Completed { document_id } => (Some(document_id.to_string()), None),
            UpdateKind::Failed { reason } => (None, Some(reason.to_string())),
            UpdateKind::Pending | UpdateKind::Processing => (None, None),
        };
        Self {
            request_id: Some(request_id.to_string()),
            status: Some(kind.status().to_string()),
            result_document_id,
            error,
        }
    }

    /// Validates the payload. `known_id` fills in a missing request id when
    /// the caller already knows which request was asked about.
    pub fn into_update(self, known_id: Option<&RequestId>) -> Result<StatusUpdate, PayloadError> {
        let request_id = match (self.request_id, known_id) {
            (Some(id), _) if !id.trim().is_empty() => RequestId::new(id),
            (_, Some(known)) => known.clone(),
            _ => return Err(PayloadError::MissingRequestId),
        };
        let raw_status = self.status.ok_or(PayloadError::MissingStatus)?;
        let status = parse_status(&raw_status).ok_or(PayloadError::UnknownStatus(raw_status))?;
        let kind = match status {
            GenerationStatus::Pending => UpdateKind::Pending,
            GenerationStatus::Processing => UpdateKind::Processing,
            GenerationStatus::Completed => UpdateKind::Completed {
                document_id: self
                    .result_document_id
                    .filter(|id| !id.trim().is_empty())
                    .map(DocumentId::new)
                    .ok_or(PayloadError::MissingDocumentId)?,
            },
            GenerationStatus::Failed => UpdateKind::Failed {
                reason: FailureReason::Generation(
                    self.error.unwrap_or_else(|| "generation failed".to_string()),
                ),
            },
        };
        Ok(StatusUpdate::new(request_id, kind))
    }
}

impl From<&StatusUpdate> for RawStatusPayload {
    fn from(update: &StatusUpdate) -> Self {
        Self::new(&update.request_id, &update.kind)
    }
}

/// Body of a submission call.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitRequestBody<'a> {
    #[serde(flatten)]
    pub parameters: &'a DocumentParameters,
}

/// What the submission service hands back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmittedRequest {
    pub id: RequestId,
    #[serde(default = "pending")]
    pub status: GenerationStatus,
}

fn pending() -> GenerationStatus {
    GenerationStatus::Pending
}
