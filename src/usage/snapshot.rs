//! Quota snapshot types and their wire boundary.
//!
//! [`RawUsageSnapshot`] mirrors what the quota provider sends; converting it
//! into a [`UsageSnapshot`] is where loosely typed numbers become either a
//! known value or `None` (unknown). The validator treats unknown as deny.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Wire sentinel for "no limit".
pub const UNLIMITED_SENTINEL: i64 = -1;

/// One countable quota resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Sessions,
    Minutes,
    Documents,
    Tokens,
}

impl Dimension {
    pub const ALL: [Dimension; 4] = [
        Dimension::Sessions,
        Dimension::Minutes,
        Dimension::Documents,
        Dimension::Tokens,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::Sessions => "sessions",
            Dimension::Minutes => "minutes",
            Dimension::Documents => "documents",
            Dimension::Tokens => "tokens",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A per-dimension ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    Limited(u64),
    Unlimited,
}

impl Limit {
    /// Interprets a wire value: `-1` is unlimited, other negatives are unknown.
    pub fn from_wire(value: i64) -> Option<Self> {
        match value {
            UNLIMITED_SENTINEL => Some(Limit::Unlimited),
            v if v >= 0 => Some(Limit::Limited(v as u64)),
            _ => None,
        }
    }

    pub fn to_wire(self) -> i64 {
        match self {
            Limit::Limited(v) => i64::try_from(v).unwrap_or(i64::MAX),
            Limit::Unlimited => UNLIMITED_SENTINEL,
        }
    }
}

/// Values per dimension. `None` means the provider did not report it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PerDimension<T> {
    pub sessions: Option<T>,
    pub minutes: Option<T>,
    pub documents: Option<T>,
    pub tokens: Option<T>,
}

impl<T: Copy> PerDimension<T> {
    pub fn get(&self, dimension: Dimension) -> Option<T> {
        match dimension {
            Dimension::Sessions => self.sessions,
            Dimension::Minutes => self.minutes,
            Dimension::Documents => self.documents,
            Dimension::Tokens => self.tokens,
        }
    }
}

/// Tier feature switches. Flags only restrict; absent means enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlags {
    #[serde(default = "enabled")]
    pub conversations: bool,
    #[serde(default = "enabled")]
    pub document_generation: bool,
}

fn enabled() -> bool {
    true
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            conversations: true,
            document_generation: true,
        }
    }
}

/// Immutable quota state captured for one validation call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageSnapshot {
    pub tier: String,
    pub used: PerDimension<u64>,
    pub limits: PerDimension<Limit>,
    pub features: FeatureFlags,
}

impl UsageSnapshot {
    /// Snapshot with every dimension known and zero usage.
    pub fn new(tier: impl Into<String>) -> Self {
        Self {
            tier: tier.into(),
            used: PerDimension {
                sessions: Some(0),
                minutes: Some(0),
                documents: Some(0),
                tokens: Some(0),
            },
            limits: PerDimension {
                sessions: Some(Limit::Unlimited),
                minutes: Some(Limit::Unlimited),
                documents: Some(Limit::Unlimited),
                tokens: Some(Limit::Unlimited),
            },
            features: FeatureFlags::default(),
        }
    }

    pub fn with_usage(mut self, dimension: Dimension, used: u64) -> Self {
        let slot = match dimension {
            Dimension::Sessions => &mut self.used.sessions,
            Dimension::Minutes => &mut self.used.minutes,
            Dimension::Documents => &mut self.used.documents,
            Dimension::Tokens => &mut self.used.tokens,
        };
        *slot = Some(used);
        self
    }

    pub fn with_limit(mut self, dimension: Dimension, limit: Limit) -> Self {
        let slot = match dimension {
            Dimension::Sessions => &mut self.limits.sessions,
            Dimension::Minutes => &mut self.limits.minutes,
            Dimension::Documents => &mut self.limits.documents,
            Dimension::Tokens => &mut self.limits.tokens,
        };
        *slot = Some(limit);
        self
    }

    pub fn with_features(mut self, features: FeatureFlags) -> Self {
        self.features = features;
        self
    }
}

/// Quota snapshot as reported by the provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawUsageSnapshot {
    #[serde(default)]
    pub tier: Option<String>,
    #[serde(default)]
    pub sessions_used: Option<i64>,
    #[serde(default)]
    pub minutes_used: Option<i64>,
    #[serde(default)]
    pub documents_generated: Option<i64>,
    #[serde(default)]
    pub tokens_used: Option<i64>,
    #[serde(default)]
    pub max_sessions: Option<i64>,
    #[serde(default)]
    pub max_minutes: Option<i64>,
    #[serde(default)]
    pub max_documents: Option<i64>,
    #[serde(default)]
    pub max_tokens: Option<i64>,
    #[serde(default)]
    pub features: Option<FeatureFlags>,
}

fn used_from_wire(value: Option<i64>) -> Option<u64> {
    value.and_then(|v| u64::try_from(v).ok())
}

impl From<RawUsageSnapshot> for UsageSnapshot {
    fn from(raw: RawUsageSnapshot) -> Self {
        Self {
            tier: raw.tier.unwrap_or_else(|| "unknown".to_string()),
            used: PerDimension {
                sessions: used_from_wire(raw.sessions_used),
                minutes: used_from_wire(raw.minutes_used),
                documents: used_from_wire(raw.documents_generated),
                tokens: used_from_wire(raw.tokens_used),
            },
            limits: PerDimension {
                sessions: raw.max_sessions.and_then(Limit::from_wire),
                minutes: raw.max_minutes.and_then(Limit::from_wire),
                documents: raw.max_documents.and_then(Limit::from_wire),
                tokens: raw.max_tokens.and_then(Limit::from_wire),
            },
            features: raw.features.unwrap_or_default(),
        }
    }
}

impl From<&UsageSnapshot> for RawUsageSnapshot {
    fn from(snapshot: &UsageSnapshot) -> Self {
        let used = |d: Dimension| snapshot.used.get(d).map(|v| i64::try_from(v).unwrap_or(i64::MAX));
        let limit = |d: Dimension| snapshot.limits.get(d).map(Limit::to_wire);
        Self {
            tier: Some(snapshot.tier.clone()),
            sessions_used: used(Dimension::Sessions),
            minutes_used: used(Dimension::Minutes),
            documents_generated: used(Dimension::Documents),
            tokens_used: used(Dimension::Tokens),
            max_sessions: limit(Dimension::Sessions),
            max_minutes: limit(Dimension::Minutes),
            max_documents: limit(Dimension::Documents),
            max_tokens: limit(Dimension::Tokens),
            features: Some(snapshot.features),
        }
    }
}
