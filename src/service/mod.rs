//! Collaborator contracts consumed by the tracker.
//!
//! Each external service is a small object-safe trait so the orchestrator
//! can hold them as `Arc<dyn ...>`. [`HttpBackend`] talks to the real
//! backend over HTTP; [`InMemoryBackend`] is a scriptable stand-in used by
//! the `demo` command and the tests.

pub mod client;
pub mod error;
pub mod memory;
pub mod types;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::document::{DocumentParameters, GeneratedDocument};
use crate::ids::{DocumentId, RequestId, ScopeId, UserId};
use crate::state_machine::StatusUpdate;
use crate::usage::UsageSnapshot;

pub use client::HttpBackend;
pub use error::ServiceError;
pub use memory::{InMemoryBackend, ScriptStep};
pub use types::{PayloadError, RawStatusPayload, SubmittedRequest};

/// Reads the caller's current quota state.
#[async_trait]
pub trait QuotaProvider: Send + Sync {
    async fn usage_snapshot(&self, user: &UserId) -> Result<UsageSnapshot, ServiceError>;
}

/// Starts a generation job on the backend.
#[async_trait]
pub trait SubmissionService: Send + Sync {
    async fn submit(
        &self,
        scope: &ScopeId,
        parameters: &DocumentParameters,
    ) -> Result<SubmittedRequest, ServiceError>;
}

/// Pull-side status lookup used by the poll driver.
#[async_trait]
pub trait StatusQuery: Send + Sync {
    async fn get_status(&self, request: &RequestId) -> Result<StatusUpdate, ServiceError>;
}

/// Fetches a finished artifact.
#[async_trait]
pub trait DocumentFetcher: Send + Sync {
    async fn get_document(&self, document: &DocumentId) -> Result<GeneratedDocument, ServiceError>;
}

/// Push-side status stream for one scope.
///
/// Payloads are delivered unvalidated; the event listener checks them.
/// Dropping the receiver ends the subscription.
#[async_trait]
pub trait BroadcastChannel: Send + Sync {
    async fn subscribe(
        &self,
        scope: &ScopeId,
    ) -> Result<mpsc::Receiver<RawStatusPayload>, ServiceError>;
}

/// The full set of collaborators the orchestrator needs.
#[derive(Clone)]
pub struct Backend {
    pub quota: Arc<dyn QuotaProvider>,
    pub submission: Arc<dyn SubmissionService>,
    pub status: Arc<dyn StatusQuery>,
    pub documents: Arc<dyn DocumentFetcher>,
    pub broadcast: Arc<dyn BroadcastChannel>,
}

impl Backend {
    /// Uses one implementation for every collaborator.
    pub fn from_shared<T>(service: Arc<T>) -> Self
    where
        T: QuotaProvider
            + SubmissionService
            + StatusQuery
            + DocumentFetcher
            + BroadcastChannel
            + 'static,
    {
        Self {
            quota: service.clone(),
            submission: service.clone(),
            status: service.clone(),
            documents: service.clone(),
            broadcast: service,
        }
    }
}
