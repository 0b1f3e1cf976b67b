use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::debug;

use quotaflow::cli::{Cli, Command};
use quotaflow::config::{QuotaflowConfig, TrackerConfig};
use quotaflow::document::{DocumentParameters, DocumentType};
use quotaflow::error::QuotaflowError;
use quotaflow::ids::{DocumentId, RequestId, ScopeId, UserId};
use quotaflow::logging;
use quotaflow::orchestrator::{Orchestrator, RequestHandle};
use quotaflow::service::{Backend, HttpBackend, InMemoryBackend, ScriptStep, StatusQuery};
use quotaflow::state_machine::{FailureReason, StatusUpdate, UpdateKind};
use quotaflow::ui::{self, TrackingProgress};
use quotaflow::usage::{ActionKind, Dimension, Limit, UsageSnapshot};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose);

    let mut config =
        QuotaflowConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(url) = cli.base_url {
        config.base_url = url;
    }
    debug!(base_url = %config.base_url, "Configuration loaded");

    match cli.command {
        Command::Usage { user, kind } => {
            let orchestrator = http_orchestrator(&config)?;
            let result = orchestrator
                .usage_summary(&UserId::new(user), ActionKind::from(kind))
                .await;
            ui::print_validation(&result);
            orchestrator.shutdown().await;
        }
        Command::Generate {
            user,
            scope,
            params,
            tokens,
            audit,
        } => {
            let parameters = DocumentParameters::from_path(&params)
                .with_context(|| format!("Failed to read {}", params.display()))?;
            let orchestrator = http_orchestrator(&config)?;
            let handle = orchestrator
                .submit(&UserId::new(user), &ScopeId::new(scope), parameters, tokens)
                .await?;
            let succeeded = follow(&orchestrator, handle, audit).await;
            orchestrator.shutdown().await;
            if !succeeded {
                bail!("Generation did not produce a document");
            }
        }
        Command::Status { request_id } => {
            let backend = HttpBackend::new(config.base_url.clone(), config.api_key())?;
            let update = backend.get_status(&RequestId::new(request_id)).await?;
            println!("{}", serde_json::to_string_pretty(&update)?);
        }
        Command::Demo => run_demo().await?,
    }

    Ok(())
}

fn http_orchestrator(config: &QuotaflowConfig) -> Result<Orchestrator> {
    let backend = HttpBackend::new(config.base_url.clone(), config.api_key())
        .context("Failed to build HTTP client")?;
    Ok(Orchestrator::new(
        Backend::from_shared(Arc::new(backend)),
        config.tracker(),
    ))
}

/// Shows a spinner until the request settles. Returns true on a ready document.
async fn follow(orchestrator: &Orchestrator, mut handle: RequestHandle, audit: bool) -> bool {
    let id = handle.id().clone();
    let progress = TrackingProgress::start(&id);
    if let Some(admission) = handle.admission() {
        for warning in &admission.warnings {
            progress.warn(&warning.to_string());
        }
    }

    let mut current = handle.progress();
    while !current.is_settled() {
        progress.update(&id, &current);
        match handle.changed().await {
            Some(next) => current = next,
            None => break,
        }
    }

    let outcome = handle.wait().await;
    progress.complete(&outcome);
    if let Ok(document) = &outcome {
        println!();
        println!("{}", document.content);
    }
    if audit && let Some(record) = orchestrator.audit(&id) {
        progress.print_audit(&record);
    }
    outcome.is_ok()
}

fn demo_snapshot() -> UsageSnapshot {
    UsageSnapshot::new("starter")
        .with_usage(Dimension::Documents, 3)
        .with_limit(Dimension::Documents, Limit::Limited(5))
        .with_usage(Dimension::Tokens, 6_000)
        .with_limit(Dimension::Tokens, Limit::Limited(10_000))
        .with_usage(Dimension::Sessions, 2)
        .with_limit(Dimension::Sessions, Limit::Unlimited)
}

fn demo_plan() -> DocumentParameters {
    DocumentParameters::BusinessPlan {
        company_name: "Harbor Street Bakery".into(),
        industry: "Food service".into(),
        target_market: Some("Commuters and nearby offices".into()),
        horizon_years: 3,
    }
}

async fn run_demo() -> Result<()> {
    let backend = Arc::new(InMemoryBackend::new(demo_snapshot()));
    let config = TrackerConfig {
        poll_interval: Duration::from_millis(250),
        timeout: Duration::from_secs(10),
        ..TrackerConfig::default()
    };
    let orchestrator = Orchestrator::new(Backend::from_shared(backend.clone()), config);
    let user = UserId::new("demo-user");
    let scope = ScopeId::new("demo-consultation");

    println!("── Usage summary");
    ui::print_validation(
        &orchestrator
            .usage_summary(&user, ActionKind::DocumentGeneration)
            .await,
    );

    println!("\n── Completed via polling");
    let document_id = DocumentId::new("doc-demo-1");
    backend.insert_placeholder_document(&document_id, &scope, DocumentType::BusinessPlan);
    backend.enqueue_script(vec![
        ScriptStep::Report(UpdateKind::Processing),
        ScriptStep::Unreachable,
        ScriptStep::Report(UpdateKind::Completed { document_id }),
    ]);
    let handle = orchestrator.submit(&user, &scope, demo_plan(), 1_500).await?;
    follow(&orchestrator, handle, true).await;

    println!("\n── Failed via push");
    backend.enqueue_script(vec![ScriptStep::Report(UpdateKind::Processing)]);
    let handle = orchestrator.submit(&user, &scope, demo_plan(), 1_500).await?;
    let publisher = Arc::clone(&backend);
    let request_id = handle.id().clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(600)).await;
        publisher.publish_update(&StatusUpdate::new(
            request_id,
            UpdateKind::Failed {
                reason: FailureReason::Generation("content policy violation".into()),
            },
        ));
    });
    follow(&orchestrator, handle, false).await;

    println!("\n── Over budget");
    match orchestrator.submit(&user, &scope, demo_plan(), 50_000).await {
        Err(QuotaflowError::Validation(err)) => println!("  Blocked: {err}"),
        Err(err) => return Err(err.into()),
        Ok(handle) => println!("  Unexpectedly admitted {}", handle.id()),
    }

    orchestrator.shutdown().await;
    Ok(())
}
