//! Push-side listener, one subscription per scope.
//!
//! Every tracked request holds a [`SubscriptionLease`] on its scope. The
//! first lease opens the subscription and the last one to drop closes it.
//! While any lease is held, an ended stream is reopened after a short delay.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::reconciler::Reconciler;
use crate::ids::ScopeId;
use crate::service::{BroadcastChannel, RawStatusPayload};
use crate::state_machine::UpdateSource;

struct ScopeEntry {
    leases: usize,
    token: CancellationToken,
}

struct Shared {
    broadcast: Arc<dyn BroadcastChannel>,
    reconciler: Reconciler,
    scopes: Mutex<HashMap<ScopeId, ScopeEntry>>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
    resubscribe_delay: Duration,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, HashMap<ScopeId, ScopeEntry>> {
        self.scopes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, scope: &ScopeId) {
        let mut scopes = self.lock();
        let Some(entry) = scopes.get_mut(scope) else {
            return;
        };
        entry.leases = entry.leases.saturating_sub(1);
        if entry.leases == 0
            && let Some(entry) = scopes.remove(scope)
        {
            debug!(scope_id = %scope, "Last lease released, closing push subscription");
            entry.token.cancel();
        }
    }
}

/// Holds a scope's push subscription open while alive.
pub struct SubscriptionLease {
    shared: Arc<Shared>,
    scope: ScopeId,
}

impl Drop for SubscriptionLease {
    fn drop(&mut self) {
        self.shared.release(&self.scope);
    }
}

#[derive(Clone)]
pub struct ScopeListeners {
    shared: Arc<Shared>,
}

impl ScopeListeners {
    pub fn new(
        broadcast: Arc<dyn BroadcastChannel>,
        reconciler: Reconciler,
        tasks: TaskTracker,
        shutdown: CancellationToken,
        resubscribe_delay: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                broadcast,
                reconciler,
                scopes: Mutex::new(HashMap::new()),
                tasks,
                shutdown,
                resubscribe_delay,
            }),
        }
    }

    /// Takes a lease on `scope`, opening its subscription if none is live.
    pub fn acquire(&self, scope: &ScopeId) -> SubscriptionLease {
        let mut scopes = self.shared.lock();
        match scopes.entry(scope.clone()) {
            Entry::Occupied(mut occupied) => occupied.get_mut().leases += 1,
            Entry::Vacant(vacant) => {
                let token = self.shared.shutdown.child_token();
                let listener = Listener {
                    broadcast: Arc::clone(&self.shared.broadcast),
                    reconciler: self.shared.reconciler.clone(),
                    scope: scope.clone(),
                    token: token.clone(),
                    resubscribe_delay: self.shared.resubscribe_delay,
                };
                self.shared.tasks.spawn(listener.run());
                vacant.insert(ScopeEntry { leases: 1, token });
            }
        }
        SubscriptionLease {
            shared: Arc::clone(&self.shared),
            scope: scope.clone(),
        }
    }

    pub fn is_listening(&self, scope: &ScopeId) -> bool {
        self.shared.lock().contains_key(scope)
    }

    pub fn lease_count(&self, scope: &ScopeId) -> usize {
        self.shared.lock().get(scope).map_or(0, |entry| entry.leases)
    }
}

struct Listener {
    broadcast: Arc<dyn BroadcastChannel>,
    reconciler: Reconciler,
    scope: ScopeId,
    token: CancellationToken,
    resubscribe_delay: Duration,
}

impl Listener {
    async fn run(self) {
        loop {
            let subscribed = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                subscribed = self.broadcast.subscribe(&self.scope) => subscribed,
            };
            match subscribed {
                Ok(mut events) => {
                    info!(scope_id = %self.scope, "Push subscription open");
                    loop {
                        let payload = tokio::select! {
                            biased;
                            _ = self.token.cancelled() => {
                                debug!(scope_id = %self.scope, "Push subscription closed");
                                return;
                            }
                            payload = events.recv() => payload,
                        };
                        match payload {
                            Some(payload) => self.forward(payload),
                            None => {
                                warn!(scope_id = %self.scope, "Push stream ended");
                                break;
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(scope_id = %self.scope, error = %err, "Push subscription failed");
                }
            }

            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                _ = sleep(self.resubscribe_delay) => {
                    debug!(scope_id = %self.scope, "Resubscribing to push updates");
                }
            }
        }
        debug!(scope_id = %self.scope, "Push listener stopped");
    }

    fn forward(&self, payload: RawStatusPayload) {
        match payload.into_update(None) {
            Ok(update) => {
                self.reconciler.apply(&update, UpdateSource::Push);
            }
            Err(err) => {
                warn!(scope_id = %self.scope, error = %err, "Dropping malformed push payload");
            }
        }
    }
}
