mod snapshot;
mod validator;

pub use snapshot::{
    Dimension, FeatureFlags, Limit, PerDimension, RawUsageSnapshot, UNLIMITED_SENTINEL,
    UsageSnapshot,
};
pub use validator::{
    Action, ActionKind, DEFAULT_WARNING_THRESHOLD, EstimatedCost, QuotaViolation, QuotaWarning,
    Remaining, RemainingQuota, UsageValidator, ValidationResult, validate,
};
