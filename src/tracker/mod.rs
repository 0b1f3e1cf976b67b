//! Dual-path status tracking.
//!
//! Each submitted request is watched by a [`PollDriver`] loop and by the
//! push [`ScopeListeners`] for its scope. Both feed the [`Reconciler`],
//! which owns every state change and hands COMPLETED requests to the
//! [`ResultMaterializer`].

pub mod listener;
pub mod materializer;
pub mod poll;
pub mod reconciler;

pub use listener::{ScopeListeners, SubscriptionLease};
pub use materializer::{DocumentStore, ResultMaterializer};
pub use poll::{DEFAULT_POLL_CEILING, DEFAULT_POLL_INTERVAL, PollDriver, PollOutcome};
pub use reconciler::Reconciler;
