use thiserror::Error;

use crate::document::DocumentType;
use crate::ids::{DocumentId, RequestId};
use crate::service::ServiceError;
use crate::usage::QuotaViolation;

#[derive(Debug, Error)]
pub enum QuotaflowError {
    #[error("Config error: {0}")]
    Config(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Parameters(#[from] ParameterError),

    #[error(transparent)]
    Materialization(#[from] MaterializationError),

    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    #[error("Request not found: {0}")]
    RequestNotFound(RequestId),

    #[error("Request already registered: {0}")]
    DuplicateRequest(RequestId),

    #[error("Request {id} is {status}; {action} needs it to be {expected}")]
    InvalidState {
        id: RequestId,
        status: String,
        action: &'static str,
        expected: &'static str,
    },

    #[error("Tracker is shutting down")]
    ShuttingDown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Admission denied. Raised before any generation request exists.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("admission denied: {} ({})", join_violations(.violations), admission_hint(.tier, .violations))]
pub struct ValidationError {
    pub tier: String,
    pub violations: Vec<QuotaViolation>,
}

impl ValidationError {
    pub fn new(tier: String, violations: Vec<QuotaViolation>) -> Self {
        Self { tier, violations }
    }

    /// True when every violation stems from missing quota data.
    pub fn is_unavailable(&self) -> bool {
        all_unavailable(&self.violations)
    }

    /// Remediation shown next to the denial.
    pub fn hint(&self) -> String {
        admission_hint(&self.tier, &self.violations)
    }
}

fn all_unavailable(violations: &[QuotaViolation]) -> bool {
    !violations.is_empty() && violations.iter().all(QuotaViolation::is_unavailable)
}

fn admission_hint(tier: &str, violations: &[QuotaViolation]) -> String {
    if all_unavailable(violations) {
        "quota data could not be read; try again shortly".to_string()
    } else {
        format!("upgrade from the {tier} plan to continue")
    }
}

fn join_violations(violations: &[QuotaViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParameterError {
    #[error("{document_type}: `{field}` is required")]
    Missing {
        document_type: DocumentType,
        field: &'static str,
    },

    #[error("{document_type}: `{field}` = {value} is outside {min}..={max}")]
    OutOfRange {
        document_type: DocumentType,
        field: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },
}

/// Final observable failure of a tracked request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrackingError {
    /// The generation service reported FAILED. Resubmit to try again.
    #[error("generation failed: {reason}")]
    TerminalGeneration { reason: String },

    /// No terminal status arrived before the local ceiling.
    #[error("timeout: no terminal status before the local tracking ceiling")]
    Timeout,

    /// Generation succeeded but the artifact could not be fetched.
    #[error("document {document_id} could not be fetched: {message}")]
    Materialization {
        document_id: DocumentId,
        message: String,
    },

    /// The owning tracker shut down before the request settled.
    #[error("tracking stopped before the request settled")]
    Abandoned,
}

/// The artifact fetch for a COMPLETED request failed after all retries.
#[derive(Debug, Error)]
#[error("failed to fetch document {document_id} after {attempts} attempt(s): {source}")]
pub struct MaterializationError {
    pub document_id: DocumentId,
    pub attempts: u32,
    #[source]
    pub source: ServiceError,
}

impl From<&MaterializationError> for TrackingError {
    fn from(err: &MaterializationError) -> Self {
        TrackingError::Materialization {
            document_id: err.document_id.clone(),
            message: err.source.to_string(),
        }
    }
}
