//! Admission control over a quota snapshot.
//!
//! [`UsageValidator::validate`] is pure: it reads a [`UsageSnapshot`] and an
//! [`Action`], and derives a [`ValidationResult`]. Unknown quota data always
//! denies.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::snapshot::{Dimension, Limit, UsageSnapshot};
use crate::error::ValidationError;
use crate::service::ServiceError;

/// Usage fraction at which a non-blocking warning is emitted.
pub const DEFAULT_WARNING_THRESHOLD: f64 = 0.8;

/// What the caller wants to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Conversation,
    DocumentGeneration,
}

impl ActionKind {
    /// The count-based dimension consumed by one action of this kind.
    pub fn count_dimension(&self) -> Dimension {
        match self {
            ActionKind::Conversation => Dimension::Sessions,
            ActionKind::DocumentGeneration => Dimension::Documents,
        }
    }

    /// The dimension the estimated cost is charged against.
    pub fn cost_dimension(&self) -> Dimension {
        match self {
            ActionKind::Conversation => Dimension::Minutes,
            ActionKind::DocumentGeneration => Dimension::Tokens,
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionKind::Conversation => write!(f, "conversation"),
            ActionKind::DocumentGeneration => write!(f, "document_generation"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EstimatedCost {
    #[serde(default)]
    pub minutes: Option<u64>,
    #[serde(default)]
    pub tokens: Option<u64>,
}

impl EstimatedCost {
    fn for_dimension(&self, dimension: Dimension) -> u64 {
        match dimension {
            Dimension::Minutes => self.minutes.unwrap_or(0),
            Dimension::Tokens => self.tokens.unwrap_or(0),
            Dimension::Sessions | Dimension::Documents => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    pub kind: ActionKind,
    pub estimated_cost: EstimatedCost,
}

impl Action {
    pub fn conversation(minutes: u64) -> Self {
        Self {
            kind: ActionKind::Conversation,
            estimated_cost: EstimatedCost {
                minutes: Some(minutes),
                tokens: None,
            },
        }
    }

    pub fn document_generation(tokens: u64) -> Self {
        Self {
            kind: ActionKind::DocumentGeneration,
            estimated_cost: EstimatedCost {
                minutes: None,
                tokens: Some(tokens),
            },
        }
    }

    /// Zero-cost read of the usage summary. Never consumes quota.
    pub fn probe(kind: ActionKind) -> Self {
        Self {
            kind,
            estimated_cost: EstimatedCost::default(),
        }
    }
}

/// What is left of one dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Remaining {
    Limited(u64),
    Unlimited,
    Unknown,
}

impl Remaining {
    fn compute(used: Option<u64>, limit: Option<Limit>) -> Self {
        match (used, limit) {
            (None, _) => Remaining::Unknown,
            (_, Some(Limit::Unlimited)) => Remaining::Unlimited,
            (Some(used), Some(Limit::Limited(limit))) => {
                Remaining::Limited(limit.saturating_sub(used))
            }
            _ => Remaining::Unknown,
        }
    }

    pub fn covers(&self, cost: u64) -> bool {
        match self {
            Remaining::Limited(left) => *left >= cost,
            Remaining::Unlimited => true,
            Remaining::Unknown => false,
        }
    }
}

impl fmt::Display for Remaining {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Remaining::Limited(n) => write!(f, "{n}"),
            Remaining::Unlimited => write!(f, "unlimited"),
            Remaining::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemainingQuota {
    pub sessions: Remaining,
    pub minutes: Remaining,
    pub documents: Remaining,
    pub tokens: Remaining,
}

impl RemainingQuota {
    pub fn unknown() -> Self {
        Self {
            sessions: Remaining::Unknown,
            minutes: Remaining::Unknown,
            documents: Remaining::Unknown,
            tokens: Remaining::Unknown,
        }
    }

    fn from_snapshot(snapshot: &UsageSnapshot) -> Self {
        let remaining =
            |d: Dimension| Remaining::compute(snapshot.used.get(d), snapshot.limits.get(d));
        Self {
            sessions: remaining(Dimension::Sessions),
            minutes: remaining(Dimension::Minutes),
            documents: remaining(Dimension::Documents),
            tokens: remaining(Dimension::Tokens),
        }
    }

    pub fn get(&self, dimension: Dimension) -> Remaining {
        match dimension {
            Dimension::Sessions => self.sessions,
            Dimension::Minutes => self.minutes,
            Dimension::Documents => self.documents,
            Dimension::Tokens => self.tokens,
        }
    }
}

/// A blocking reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QuotaViolation {
    /// The estimated cost exceeds what is left.
    Exceeded {
        dimension: Dimension,
        requested: u64,
        remaining: u64,
    },
    /// A count-based quota has nothing left.
    Exhausted { dimension: Dimension, limit: u64 },
    /// The tier does not include this kind of action.
    FeatureDisabled { feature: ActionKind, tier: String },
    /// Quota data is missing, malformed, or could not be fetched.
    Unavailable {
        dimension: Option<Dimension>,
        detail: Option<String>,
    },
}

impl QuotaViolation {
    pub fn dimension(&self) -> Option<Dimension> {
        match self {
            QuotaViolation::Exceeded { dimension, .. }
            | QuotaViolation::Exhausted { dimension, .. } => Some(*dimension),
            QuotaViolation::Unavailable { dimension, .. } => *dimension,
            QuotaViolation::FeatureDisabled { .. } => None,
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, QuotaViolation::Unavailable { .. })
    }
}

impl fmt::Display for QuotaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaViolation::Exceeded {
                dimension,
                requested,
                remaining,
            } => write!(
                f,
                "{dimension} quota exceeded: requested {requested}, remaining {remaining}"
            ),
            QuotaViolation::Exhausted { dimension, limit } => {
                write!(f, "{dimension} quota exhausted (limit {limit})")
            }
            QuotaViolation::FeatureDisabled { feature, tier } => {
                write!(f, "{feature} is not included in the {tier} plan")
            }
            QuotaViolation::Unavailable { dimension, detail } => {
                write!(f, "quota data unavailable")?;
                if let Some(dimension) = dimension {
                    write!(f, " for {dimension}")?;
                }
                if let Some(detail) = detail {
                    write!(f, ": {detail}")?;
                }
                Ok(())
            }
        }
    }
}

/// A non-blocking "approaching the limit" notice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaWarning {
    pub dimension: Dimension,
    pub used: u64,
    pub limit: u64,
}

impl QuotaWarning {
    pub fn fraction(&self) -> f64 {
        self.used as f64 / self.limit as f64
    }
}

impl fmt::Display for QuotaWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} at {:.0}% of limit ({}/{})",
            self.dimension,
            self.fraction() * 100.0,
            self.used,
            self.limit
        )
    }
}

/// Derived admission decision. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub allowed: bool,
    pub tier: String,
    pub remaining: RemainingQuota,
    pub warnings: Vec<QuotaWarning>,
    pub errors: Vec<QuotaViolation>,
    pub upgrade_required: bool,
}

impl ValidationResult {
    /// Denied result for a snapshot that could not be obtained.
    pub fn unavailable(detail: impl Into<String>) -> Self {
        Self {
            allowed: false,
            tier: "unknown".to_string(),
            remaining: RemainingQuota::unknown(),
            warnings: Vec::new(),
            errors: vec![QuotaViolation::Unavailable {
                dimension: None,
                detail: Some(detail.into()),
            }],
            upgrade_required: true,
        }
    }

    /// Turns a denial into a [`ValidationError`]; an allowed result passes through.
    pub fn into_admission(self) -> Result<ValidationResult, ValidationError> {
        if self.allowed {
            Ok(self)
        } else {
            Err(ValidationError::new(self.tier, self.errors))
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct UsageValidator {
    warning_threshold: f64,
}

impl Default for UsageValidator {
    fn default() -> Self {
        Self {
            warning_threshold: DEFAULT_WARNING_THRESHOLD,
        }
    }
}

impl UsageValidator {
    pub fn new(warning_threshold: f64) -> Self {
        Self {
            warning_threshold: warning_threshold.clamp(0.0, 1.0),
        }
    }

    pub fn warning_threshold(&self) -> f64 {
        self.warning_threshold
    }

    pub fn validate(&self, snapshot: &UsageSnapshot, action: &Action) -> ValidationResult {
        let remaining = RemainingQuota::from_snapshot(snapshot);
        let mut errors = Vec::new();

        let feature_enabled = match action.kind {
            ActionKind::Conversation => snapshot.features.conversations,
            ActionKind::DocumentGeneration => snapshot.features.document_generation,
        };
        if !feature_enabled {
            errors.push(QuotaViolation::FeatureDisabled {
                feature: action.kind,
                tier: snapshot.tier.clone(),
            });
        }

        let count_dimension = action.kind.count_dimension();
        match remaining.get(count_dimension) {
            Remaining::Unknown => errors.push(QuotaViolation::Unavailable {
                dimension: Some(count_dimension),
                detail: None,
            }),
            Remaining::Limited(0) => errors.push(QuotaViolation::Exhausted {
                dimension: count_dimension,
                limit: match snapshot.limits.get(count_dimension) {
                    Some(Limit::Limited(limit)) => limit,
                    _ => 0,
                },
            }),
            Remaining::Limited(_) | Remaining::Unlimited => {}
        }

        let cost_dimension = action.kind.cost_dimension();
        let cost = action.estimated_cost.for_dimension(cost_dimension);
        match remaining.get(cost_dimension) {
            Remaining::Unknown => errors.push(QuotaViolation::Unavailable {
                dimension: Some(cost_dimension),
                detail: None,
            }),
            Remaining::Limited(left) if left < cost => errors.push(QuotaViolation::Exceeded {
                dimension: cost_dimension,
                requested: cost,
                remaining: left,
            }),
            Remaining::Limited(_) | Remaining::Unlimited => {}
        }

        let allowed = errors.is_empty();
        let warnings = if allowed {
            [count_dimension, cost_dimension]
                .into_iter()
                .filter_map(|dimension| self.warning_for(snapshot, dimension))
                .collect()
        } else {
            Vec::new()
        };

        ValidationResult {
            allowed,
            tier: snapshot.tier.clone(),
            remaining,
            warnings,
            errors,
            upgrade_required: !allowed,
        }
    }

    /// Validates the outcome of a snapshot fetch; a fetch failure denies.
    pub fn validate_fetched(
        &self,
        snapshot: Result<UsageSnapshot, ServiceError>,
        action: &Action,
    ) -> ValidationResult {
        match snapshot {
            Ok(snapshot) => self.validate(&snapshot, action),
            Err(err) => ValidationResult::unavailable(err.to_string()),
        }
    }

    fn warning_for(&self, snapshot: &UsageSnapshot, dimension: Dimension) -> Option<QuotaWarning> {
        let used = snapshot.used.get(dimension)?;
        let Limit::Limited(limit) = snapshot.limits.get(dimension)? else {
            return None;
        };
        if limit == 0 {
            return None;
        }
        let warning = QuotaWarning {
            dimension,
            used,
            limit,
        };
        (warning.fraction() >= self.warning_threshold).then_some(warning)
    }
}

/// Validates with the default warning threshold.
pub fn validate(snapshot: &UsageSnapshot, action: &Action) -> ValidationResult {
    UsageValidator::default().validate(snapshot, action)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usage::snapshot::{FeatureFlags, RawUsageSnapshot};

    fn documents_snapshot(tokens_used: u64, max_tokens: u64) -> UsageSnapshot {
        UsageSnapshot::new("free")
            .with_usage(Dimension::Documents, 0)
            .with_limit(Dimension::Documents, Limit::Limited(5))
            .with_usage(Dimension::Tokens, tokens_used)
            .with_limit(Dimension::Tokens, Limit::Limited(max_tokens))
    }

    #[test]
    fn token_cost_over_remaining_is_denied() {
        let snapshot = documents_snapshot(1900, 2000);
        let result = validate(&snapshot, &Action::document_generation(200));

        assert!(!result.allowed);
        assert!(result.upgrade_required);
        assert_eq!(result.remaining.tokens, Remaining::Limited(100));
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].dimension(), Some(Dimension::Tokens));
        assert!(result.errors[0].to_string().contains("tokens"));
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn cost_within_remaining_is_allowed() {
        let snapshot = documents_snapshot(100, 2000);
        let result = validate(&snapshot, &Action::document_generation(200));
        assert!(result.allowed);
        assert!(!result.upgrade_required);
        assert!(result.errors.is_empty());
        assert_eq!(result.remaining.documents, Remaining::Limited(5));
    }

    #[test]
    fn denied_whenever_any_relevant_dimension_falls_short() {
        for used in [0u64, 500, 1000, 1500, 1999, 2000, 2500] {
            for cost in [0u64, 1, 100, 501, 2000, 3000] {
                let snapshot = documents_snapshot(used, 2000);
                let result = validate(&snapshot, &Action::document_generation(cost));
                let remaining = 2000u64.saturating_sub(used);
                assert_eq!(result.allowed, remaining >= cost, "used={used} cost={cost}");
            }
        }
    }

    #[test]
    fn remaining_never_negative() {
        let snapshot = documents_snapshot(2500, 2000);
        let result = validate(&snapshot, &Action::document_generation(0));
        assert_eq!(result.remaining.tokens, Remaining::Limited(0));
    }

    #[test]
    fn exhausted_count_quota_denies_even_a_free_action() {
        let snapshot = UsageSnapshot::new("free")
            .with_usage(Dimension::Sessions, 3)
            .with_limit(Dimension::Sessions, Limit::Limited(3));
        let result = validate(&snapshot, &Action::conversation(0));
        assert!(!result.allowed);
        assert_eq!(
            result.errors,
            vec![QuotaViolation::Exhausted {
                dimension: Dimension::Sessions,
                limit: 3
            }]
        );
    }

    #[test]
    fn unlimited_dimensions_always_cover() {
        let snapshot = UsageSnapshot::new("enterprise").with_usage(Dimension::Tokens, u64::MAX);
        let result = validate(&snapshot, &Action::document_generation(1_000_000));
        assert!(result.allowed);
        assert_eq!(result.remaining.tokens, Remaining::Unlimited);
    }

    #[test]
    fn warning_at_eighty_percent_when_still_allowed() {
        let snapshot = UsageSnapshot::new("basic")
            .with_usage(Dimension::Sessions, 8)
            .with_limit(Dimension::Sessions, Limit::Limited(10))
            .with_usage(Dimension::Minutes, 10)
            .with_limit(Dimension::Minutes, Limit::Limited(600));
        let result = validate(&snapshot, &Action::conversation(30));

        assert!(result.allowed);
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.warnings[0].dimension, Dimension::Sessions);
        assert_eq!(result.warnings[0].to_string(), "sessions at 80% of limit (8/10)");
    }

    #[test]
    fn custom_threshold_changes_warnings() {
        let snapshot = UsageSnapshot::new("basic")
            .with_usage(Dimension::Minutes, 300)
            .with_limit(Dimension::Minutes, Limit::Limited(600));
        let strict = UsageValidator::new(0.5);
        assert_eq!(strict.validate(&snapshot, &Action::conversation(5)).warnings.len(), 1);
        assert!(validate(&snapshot, &Action::conversation(5)).warnings.is_empty());
    }

    #[test]
    fn missing_limit_denies_as_unavailable() {
        let raw: RawUsageSnapshot = serde_json::from_str(
            r#"{"tier": "free", "documents_generated": 0, "max_documents": 5, "tokens_used": 10}"#,
        )
        .unwrap();
        let result = validate(&UsageSnapshot::from(raw), &Action::document_generation(10));

        assert!(!result.allowed);
        assert_eq!(result.remaining.tokens, Remaining::Unknown);
        assert!(result.errors.iter().all(QuotaViolation::is_unavailable));
        assert!(result.errors[0].to_string().starts_with("quota data unavailable"));
    }

    #[test]
    fn missing_usage_denies_even_when_unlimited() {
        for tokens_used in ["", r#", "tokens_used": -40"#] {
            let json = format!(
                r#"{{"tier": "pro", "documents_generated": 0, "max_documents": 5, "max_tokens": -1{tokens_used}}}"#
            );
            let raw: RawUsageSnapshot = serde_json::from_str(&json).unwrap();
            let result = validate(&UsageSnapshot::from(raw), &Action::document_generation(500));

            assert!(!result.allowed, "admitted with tokens_used={tokens_used:?}");
            assert_eq!(result.remaining.tokens, Remaining::Unknown);
            assert_eq!(
                result.errors,
                vec![QuotaViolation::Unavailable {
                    dimension: Some(Dimension::Tokens),
                    detail: None,
                }]
            );
        }
    }

    #[test]
    fn disabled_feature_denies() {
        let snapshot = UsageSnapshot::new("starter").with_features(FeatureFlags {
            conversations: true,
            document_generation: false,
        });
        let result = validate(&snapshot, &Action::document_generation(1));
        assert!(!result.allowed);
        assert!(matches!(
            result.errors[0],
            QuotaViolation::FeatureDisabled {
                feature: ActionKind::DocumentGeneration,
                ..
            }
        ));
    }

    #[test]
    fn provider_failure_denies_with_unavailable() {
        let validator = UsageValidator::default();
        let result = validator.validate_fetched(
            Err(ServiceError::Api {
                status: 503,
                message: "down".into(),
            }),
            &Action::probe(ActionKind::DocumentGeneration),
        );
        assert!(!result.allowed);
        let err = result.into_admission().unwrap_err();
        assert!(err.is_unavailable());
        assert!(err.to_string().contains("quota data unavailable"));
    }

    #[test]
    fn probe_matches_zero_cost_action() {
        let snapshot = documents_snapshot(1999, 2000);
        let probe = validate(&snapshot, &Action::probe(ActionKind::DocumentGeneration));
        let zero = validate(&snapshot, &Action::document_generation(0));
        assert_eq!(probe, zero);
        assert!(probe.allowed);
    }

    #[test]
    fn validate_is_deterministic() {
        let snapshot = documents_snapshot(1700, 2000);
        let action = Action::document_generation(100);
        assert_eq!(validate(&snapshot, &action), validate(&snapshot, &action));
    }
}
