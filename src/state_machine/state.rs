use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ids::{DocumentId, RequestId};

/// Lifecycle status of a generation request.
///
/// Requests flow PENDING → PROCESSING → {COMPLETED | FAILED}; PENDING may
/// jump straight to a terminal status. Nothing leaves a terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GenerationStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl GenerationStatus {
    /// Position in the transition order. Both terminal statuses share a rank.
    pub fn rank(&self) -> u8 {
        match self {
            GenerationStatus::Pending => 0,
            GenerationStatus::Processing => 1,
            GenerationStatus::Completed | GenerationStatus::Failed => 2,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, GenerationStatus::Completed | GenerationStatus::Failed)
    }
}

impl fmt::Display for GenerationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GenerationStatus::Pending => write!(f, "PENDING"),
            GenerationStatus::Processing => write!(f, "PROCESSING"),
            GenerationStatus::Completed => write!(f, "COMPLETED"),
            GenerationStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// Why a request ended in FAILED.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum FailureReason {
    /// Reported by the generation service.
    Generation(String),
    /// The local tracking ceiling expired.
    Timeout,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Generation(msg) => write!(f, "{msg}"),
            FailureReason::Timeout => write!(f, "timeout"),
        }
    }
}

/// A validated status observation for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateKind {
    Pending,
    Processing,
    Completed { document_id: DocumentId },
    Failed { reason: FailureReason },
}

impl UpdateKind {
    pub fn status(&self) -> GenerationStatus {
        match self {
            UpdateKind::Pending => GenerationStatus::Pending,
            UpdateKind::Processing => GenerationStatus::Processing,
            UpdateKind::Completed { .. } => GenerationStatus::Completed,
            UpdateKind::Failed { .. } => GenerationStatus::Failed,
        }
    }

    pub fn timeout() -> Self {
        UpdateKind::Failed {
            reason: FailureReason::Timeout,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub request_id: RequestId,
    #[serde(flatten)]
    pub kind: UpdateKind,
}

impl StatusUpdate {
    pub fn new(request_id: RequestId, kind: UpdateKind) -> Self {
        Self { request_id, kind }
    }
}

/// Which channel an update arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateSource {
    Poll,
    Push,
}

impl fmt::Display for UpdateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateSource::Poll => write!(f, "poll"),
            UpdateSource::Push => write!(f, "push"),
        }
    }
}

/// The result of offering an update to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// The update moved the request forward.
    Advanced {
        from: GenerationStatus,
        to: GenerationStatus,
    },
    /// The update did not advance the request (duplicate, stale, or after terminal).
    Ignored {
        current: GenerationStatus,
        incoming: GenerationStatus,
    },
    /// No such request is registered.
    Unknown,
}

impl Transition {
    pub fn changed(&self) -> bool {
        matches!(self, Transition::Advanced { .. })
    }
}

/// Transition table over [`GenerationStatus`].
pub struct StateMachine;

impl StateMachine {
    /// Computes the transition for `incoming` given `current`.
    ///
    /// An update advances only when it strictly raises the rank, which
    /// admits exactly PENDING→{PROCESSING, COMPLETED, FAILED} and
    /// PROCESSING→{COMPLETED, FAILED}.
    pub fn next(current: GenerationStatus, incoming: GenerationStatus) -> Transition {
        if incoming.rank() > current.rank() {
            Transition::Advanced {
                from: current,
                to: incoming,
            }
        } else {
            Transition::Ignored { current, incoming }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use GenerationStatus::*;

    const ALL: [GenerationStatus; 4] = [Pending, Processing, Completed, Failed];

    #[test]
    fn allowed_transitions_match_table() {
        let allowed = [
            (Pending, Processing),
            (Pending, Completed),
            (Pending, Failed),
            (Processing, Completed),
            (Processing, Failed),
        ];
        for from in ALL {
            for to in ALL {
                let t = StateMachine::next(from, to);
                assert_eq!(
                    t.changed(),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn terminal_states_never_move() {
        for terminal in [Completed, Failed] {
            for incoming in ALL {
                assert_eq!(
                    StateMachine::next(terminal, incoming),
                    Transition::Ignored {
                        current: terminal,
                        incoming
                    }
                );
            }
        }
    }

    #[test]
    fn rank_orders_statuses() {
        assert!(Pending.rank() < Processing.rank());
        assert!(Processing.rank() < Completed.rank());
        assert_eq!(Completed.rank(), Failed.rank());
    }

    #[test]
    fn status_display() {
        assert_eq!(Pending.to_string(), "PENDING");
        assert_eq!(Processing.to_string(), "PROCESSING");
        assert_eq!(Completed.to_string(), "COMPLETED");
        assert_eq!(Failed.to_string(), "FAILED");
    }

    #[test]
    fn timeout_reason_displays_as_timeout() {
        assert_eq!(FailureReason::Timeout.to_string(), "timeout");
        assert_eq!(UpdateKind::timeout().status(), Failed);
    }

    #[test]
    fn status_update_serializes_flat() {
        let update = StatusUpdate::new(
            RequestId::new("req-1"),
            UpdateKind::Completed {
                document_id: DocumentId::new("doc-1"),
            },
        );
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["status"], "COMPLETED");
        assert_eq!(json["request_id"], "req-1");
        assert_eq!(json["document_id"], "doc-1");
    }
}
