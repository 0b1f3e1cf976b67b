//! Registry of generation requests.
//!
//! Each request lives in its own slot behind its own mutex, so updates to
//! one id are serialized while distinct ids never contend on a shared lock.
//! The outer `DashMap` is only touched to look a slot up.
//!
//! A slot also carries a `watch` channel of [`Progress`] that the
//! presentation layer observes. Retired requests stay queryable but drop
//! out of the active index, so active scans never touch settled slots.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::error::QuotaflowError;
use crate::ids::{RequestId, ScopeId};
use crate::state_machine::{
    GenerationRequest, GenerationStatus, Progress, Transition, UpdateKind, UpdateSource,
};

struct Slot {
    request: GenerationRequest,
    progress: watch::Sender<Progress>,
}

#[derive(Default)]
pub struct JobRegistry {
    slots: DashMap<RequestId, Arc<Mutex<Slot>>>,
    active: DashMap<RequestId, ScopeId>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a freshly submitted request and returns its progress feed.
    pub fn register(
        &self,
        request: GenerationRequest,
    ) -> Result<watch::Receiver<Progress>, QuotaflowError> {
        match self.slots.entry(request.id.clone()) {
            Entry::Occupied(_) => Err(QuotaflowError::DuplicateRequest(request.id)),
            Entry::Vacant(vacant) => {
                let (progress, rx) = watch::channel(Progress::from_request(&request));
                debug!(
                    request_id = %request.id,
                    scope_id = %request.scope_id,
                    document_type = %request.document_type,
                    "Registered generation request"
                );
                self.active.insert(request.id.clone(), request.scope_id.clone());
                vacant.insert(Arc::new(Mutex::new(Slot { request, progress })));
                Ok(rx)
            }
        }
    }

    fn slot(&self, id: &RequestId) -> Option<Arc<Mutex<Slot>>> {
        self.slots.get(id).map(|r| Arc::clone(r.value()))
    }

    fn lock(slot: &Mutex<Slot>) -> MutexGuard<'_, Slot> {
        slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Offers a status update for `id`. Returns what happened.
    ///
    /// Updates that do not advance the transition table are no-ops and are
    /// logged as conflicting observations rather than errors.
    pub fn apply(&self, id: &RequestId, update: &UpdateKind, source: UpdateSource) -> Transition {
        let Some(slot) = self.slot(id) else {
            trace!(request_id = %id, source = %source, "Update for unknown request");
            return Transition::Unknown;
        };
        let mut slot = Self::lock(&slot);
        let transition = slot.request.apply(update, source);
        match &transition {
            Transition::Advanced { from, to } => {
                debug!(request_id = %id, source = %source, %from, %to, "Status advanced");
                let progress = Progress::from_request(&slot.request);
                slot.progress.send_replace(progress);
            }
            Transition::Ignored { current, incoming } if current != incoming => {
                debug!(
                    request_id = %id,
                    source = %source,
                    current = %current,
                    incoming = %incoming,
                    "Conflicting observation ignored"
                );
            }
            Transition::Ignored { current, .. } => {
                trace!(request_id = %id, source = %source, status = %current, "Duplicate observation");
            }
            Transition::Unknown => {}
        }
        transition
    }

    fn with_slot<R>(&self, id: &RequestId, f: impl FnOnce(&mut Slot) -> R) -> Option<R> {
        let slot = self.slot(id)?;
        let mut guard = Self::lock(&slot);
        Some(f(&mut guard))
    }

    pub fn get(&self, id: &RequestId) -> Option<GenerationRequest> {
        self.with_slot(id, |slot| slot.request.clone())
    }

    pub fn status(&self, id: &RequestId) -> Option<GenerationStatus> {
        self.with_slot(id, |slot| slot.request.status)
    }

    pub fn is_terminal(&self, id: &RequestId) -> bool {
        self.status(id).is_some_and(|s| s.is_terminal())
    }

    pub fn progress(&self, id: &RequestId) -> Option<Progress> {
        self.with_slot(id, |slot| slot.progress.borrow().clone())
    }

    /// A new receiver on the request's progress feed.
    pub fn subscribe(&self, id: &RequestId) -> Option<watch::Receiver<Progress>> {
        self.with_slot(id, |slot| slot.progress.subscribe())
    }

    /// Publishes a post-terminal progress value (materialization outcome).
    pub fn set_progress(&self, id: &RequestId, progress: Progress) -> bool {
        self.with_slot(id, |slot| {
            slot.progress.send_replace(progress);
        })
        .is_some()
    }

    /// Removes the request from the active set. Its record stays queryable.
    pub fn retire(&self, id: &RequestId) {
        if self.active.remove(id).is_some() {
            debug!(request_id = %id, status = ?self.status(id), "Request retired");
        }
    }

    pub fn is_active(&self, id: &RequestId) -> bool {
        self.active.contains_key(id)
    }

    pub fn active_in_scope(&self, scope: &ScopeId) -> usize {
        self.active.iter().filter(|entry| entry.value() == scope).count()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Marks every unsettled progress feed as detached. Used on teardown.
    ///
    /// Retired requests are always settled, so only the active index is walked.
    pub fn detach_unsettled(&self) -> usize {
        // Collect first so no shard guard is held while slot mutexes are taken.
        let ids: Vec<RequestId> = self.active.iter().map(|entry| entry.key().clone()).collect();
        ids.iter()
            .filter_map(|id| self.slot(id))
            .filter(|slot| {
                let slot = Self::lock(slot);
                if slot.progress.borrow().is_settled() {
                    return false;
                }
                slot.progress.send_replace(Progress::Detached);
                true
            })
            .count()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
