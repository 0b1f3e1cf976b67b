//! Terminal output: spinners and colored summaries.
//!
//! Uses `indicatif` for the progress spinner and `console` for colors.
//! [`TrackingProgress`] follows one request's progress feed on screen.

use std::sync::Arc;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::document::GeneratedDocument;
use crate::error::TrackingError;
use crate::ids::RequestId;
use crate::state_machine::{AuditRecord, GenerationStatus, Progress};
use crate::usage::{Dimension, ValidationResult};

/// Spinner for a request being tracked.
///
/// Green for a ready document, red for failures, yellow for warnings.
pub struct TrackingProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
}

impl TrackingProgress {
    pub fn start(request_id: &RequestId) -> Self {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            pb.set_style(style);
        }
        pb.set_message(format!("{request_id}: PENDING"));
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    pub fn update(&self, request_id: &RequestId, progress: &Progress) {
        let label = match progress {
            Progress::Pending => "PENDING".to_string(),
            Progress::Processing => "PROCESSING".to_string(),
            Progress::Materializing { document_id } => format!("COMPLETED, fetching {document_id}"),
            Progress::Ready(_) => "ready".to_string(),
            Progress::Failed(_) | Progress::MaterializationFailed(_) => "failed".to_string(),
            Progress::Detached => "detached".to_string(),
        };
        self.pb.set_message(format!("{request_id}: {label}"));
    }

    pub fn warn(&self, message: &str) {
        self.pb
            .println(format!("  {} {message}", self.yellow.apply_to("!")));
    }

    /// Stops the spinner and prints the final outcome.
    pub fn complete(&self, outcome: &Result<Arc<GeneratedDocument>, TrackingError>) {
        self.pb.finish_and_clear();
        match outcome {
            Ok(document) => println!(
                "  {} {} ready ({})",
                self.green.apply_to("✓"),
                document.document_type,
                document.id
            ),
            Err(err @ TrackingError::Materialization { .. }) => println!(
                "  {} Generated, but {err}",
                self.yellow.apply_to("↻")
            ),
            Err(err) => println!("  {} {err}", self.red.apply_to("✗")),
        }
    }

    pub fn print_audit(&self, record: &AuditRecord) {
        let status_style = match record.status {
            GenerationStatus::Completed => &self.green,
            GenerationStatus::Failed => &self.red,
            _ => &self.yellow,
        };
        println!();
        println!("{}", status_style.apply_to("─── Audit Record ───"));
        println!("{}", serde_json::to_string_pretty(record).unwrap_or_default());
    }
}

/// Prints an admission decision: remaining quota, warnings and errors.
pub fn print_validation(result: &ValidationResult) {
    let green = Style::new().green().bold();
    let red = Style::new().red().bold();
    let yellow = Style::new().yellow();

    let verdict = if result.allowed {
        green.apply_to("allowed")
    } else {
        red.apply_to("denied")
    };
    println!("Plan: {}  ({verdict})", result.tier);
    for dimension in Dimension::ALL {
        println!("  {:<10} {}", dimension.as_str(), result.remaining.get(dimension));
    }
    for warning in &result.warnings {
        println!("  {} {warning}", yellow.apply_to("!"));
    }
    for error in &result.errors {
        println!("  {} {error}", red.apply_to("✗"));
    }
    if let Err(err) = result.clone().into_admission() {
        println!("  Hint: {}", err.hint());
    }
}
