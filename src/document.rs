//! Document types, their per-type parameters, and the generated artifact.
//!
//! [`DocumentParameters`] is a tagged union: each document type carries its
//! own concrete parameter struct, and [`DocumentParameters::validate`] runs
//! before admission control so malformed requests never reach the backend.

use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ParameterError, QuotaflowError};
use crate::ids::{DocumentId, ScopeId};

/// The kinds of document the generation service can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    BusinessPlan,
    MarketingStrategy,
    ActionPlan,
    SwotAnalysis,
}

impl DocumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::BusinessPlan => "business_plan",
            DocumentType::MarketingStrategy => "marketing_strategy",
            DocumentType::ActionPlan => "action_plan",
            DocumentType::SwotAnalysis => "swot_analysis",
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters for a generation request, one variant per [`DocumentType`].
///
/// Serialized as `{"document_type": "...", "parameters": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "document_type", content = "parameters", rename_all = "snake_case")]
pub enum DocumentParameters {
    BusinessPlan {
        company_name: String,
        industry: String,
        #[serde(default)]
        target_market: Option<String>,
        horizon_years: u8,
    },
    MarketingStrategy {
        product: String,
        audience: String,
        channels: Vec<String>,
        #[serde(default)]
        monthly_budget: Option<u64>,
    },
    ActionPlan {
        goals: Vec<String>,
        timeframe_weeks: u16,
    },
    SwotAnalysis {
        subject: String,
        #[serde(default)]
        context: Option<String>,
    },
}

impl DocumentParameters {
    /// Reads parameters from a `.json` or `.toml` file.
    pub fn from_path(path: &Path) -> Result<Self, QuotaflowError> {
        let contents = std::fs::read_to_string(path)?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Ok(toml::from_str(&contents)?),
            Some("json") => Ok(serde_json::from_str(&contents)?),
            _ => Err(QuotaflowError::Config(format!(
                "unsupported parameters file (expected .json or .toml): {}",
                path.display()
            ))),
        }
    }

    pub fn document_type(&self) -> DocumentType {
        match self {
            DocumentParameters::BusinessPlan { .. } => DocumentType::BusinessPlan,
            DocumentParameters::MarketingStrategy { .. } => DocumentType::MarketingStrategy,
            DocumentParameters::ActionPlan { .. } => DocumentType::ActionPlan,
            DocumentParameters::SwotAnalysis { .. } => DocumentType::SwotAnalysis,
        }
    }

    /// Checks the variant's fields; called at submission time.
    pub fn validate(&self) -> Result<(), ParameterError> {
        let document_type = self.document_type();
        match self {
            DocumentParameters::BusinessPlan {
                company_name,
                industry,
                horizon_years,
                ..
            } => {
                require_text(document_type, "company_name", company_name)?;
                require_text(document_type, "industry", industry)?;
                require_range(document_type, "horizon_years", u64::from(*horizon_years), 1, 10)
            }
            DocumentParameters::MarketingStrategy {
                product,
                audience,
                channels,
                ..
            } => {
                require_text(document_type, "product", product)?;
                require_text(document_type, "audience", audience)?;
                require_items(document_type, "channels", channels)
            }
            DocumentParameters::ActionPlan {
                goals,
                timeframe_weeks,
            } => {
                require_items(document_type, "goals", goals)?;
                require_range(
                    document_type,
                    "timeframe_weeks",
                    u64::from(*timeframe_weeks),
                    1,
                    104,
                )
            }
            DocumentParameters::SwotAnalysis { subject, .. } => {
                require_text(document_type, "subject", subject)
            }
        }
    }
}

fn require_text(
    document_type: DocumentType,
    field: &'static str,
    value: &str,
) -> Result<(), ParameterError> {
    if value.trim().is_empty() {
        return Err(ParameterError::Missing {
            document_type,
            field,
        });
    }
    Ok(())
}

fn require_items(
    document_type: DocumentType,
    field: &'static str,
    values: &[String],
) -> Result<(), ParameterError> {
    if values.iter().all(|v| v.trim().is_empty()) {
        return Err(ParameterError::Missing {
            document_type,
            field,
        });
    }
    Ok(())
}

fn require_range(
    document_type: DocumentType,
    field: &'static str,
    value: u64,
    min: u64,
    max: u64,
) -> Result<(), ParameterError> {
    if value < min || value > max {
        return Err(ParameterError::OutOfRange {
            document_type,
            field,
            value,
            min,
            max,
        });
    }
    Ok(())
}

/// A finished artifact. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedDocument {
    pub id: DocumentId,
    pub scope_id: ScopeId,
    pub document_type: DocumentType,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameters_use_document_type_tag() {
        let json = r#"{
            "document_type": "swot_analysis",
            "parameters": {"subject": "Coffee shop expansion"}
        }"#;
        let params: DocumentParameters = serde_json::from_str(json).unwrap();
        assert_eq!(params.document_type(), DocumentType::SwotAnalysis);
        assert!(params.validate().is_ok());
    }

    #[test]
    fn parameters_load_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.toml");
        std::fs::write(
            &path,
            "document_type = \"action_plan\"\n\n[parameters]\ngoals = [\"Hire a baker\"]\ntimeframe_weeks = 6\n",
        )
        .unwrap();

        let params = DocumentParameters::from_path(&path).unwrap();
        assert_eq!(params.document_type(), DocumentType::ActionPlan);
        assert!(DocumentParameters::from_path(&dir.path().join("plan.yaml")).is_err());
    }

    #[test]
    fn unknown_document_type_is_rejected_at_parse() {
        let json = r#"{"document_type": "poem", "parameters": {}}"#;
        assert!(serde_json::from_str::<DocumentParameters>(json).is_err());
    }

    #[test]
    fn blank_required_field_fails_validation() {
        let params = DocumentParameters::BusinessPlan {
            company_name: "  ".into(),
            industry: "retail".into(),
            target_market: None,
            horizon_years: 3,
        };
        let err = params.validate().unwrap_err();
        assert!(err.to_string().contains("company_name"));
    }

    #[test]
    fn horizon_out_of_range_fails_validation() {
        let params = DocumentParameters::BusinessPlan {
            company_name: "Acme".into(),
            industry: "retail".into(),
            target_market: None,
            horizon_years: 0,
        };
        assert!(matches!(
            params.validate(),
            Err(ParameterError::OutOfRange { field: "horizon_years", .. })
        ));
    }

    #[test]
    fn action_plan_needs_a_goal() {
        let params = DocumentParameters::ActionPlan {
            goals: vec![String::new()],
            timeframe_weeks: 12,
        };
        assert!(params.validate().is_err());

        let params = DocumentParameters::ActionPlan {
            goals: vec!["Hire a designer".into()],
            timeframe_weeks: 12,
        };
        assert!(params.validate().is_ok());
    }

    #[test]
    fn marketing_strategy_from_toml() {
        let toml_str = r#"
            document_type = "marketing_strategy"
            [parameters]
            product = "Mentoring app"
            audience = "first-time founders"
            channels = ["newsletter", "podcasts"]
        "#;
        let params: DocumentParameters = toml::from_str(toml_str).unwrap();
        assert_eq!(params.document_type(), DocumentType::MarketingStrategy);
        assert!(params.validate().is_ok());
    }
}
