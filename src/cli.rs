//! Command-line interface built on clap.
//!
//! [`Cli`] carries the subcommands in [`Command`] (usage, generate, status,
//! demo) and the global flags (--config, --base-url, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::usage::ActionKind;

/// quotaflow: quota-gated document generation with dual-path tracking.
#[derive(Debug, Parser)]
#[command(name = "quotaflow", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to a config file (defaults to ./quotaflow.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Backend URL; overrides the config file and QUOTAFLOW_BASE_URL.
    #[arg(long, global = true)]
    pub base_url: Option<String>,

    /// Enables debug logging.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

/// Action kinds accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum KindArg {
    Conversation,
    Document,
}

impl From<KindArg> for ActionKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Conversation => ActionKind::Conversation,
            KindArg::Document => ActionKind::DocumentGeneration,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Shows remaining quota without consuming any.
    Usage {
        #[arg(long)]
        user: String,

        #[arg(long, value_enum, default_value_t = KindArg::Document)]
        kind: KindArg,
    },

    /// Submits a document generation request and tracks it to the end.
    Generate {
        #[arg(long)]
        user: String,

        /// Consultation or session the document belongs to.
        #[arg(long)]
        scope: String,

        /// JSON or TOML file with the document type and its parameters.
        #[arg(long)]
        params: PathBuf,

        /// Estimated token cost used for admission.
        #[arg(long, default_value_t = 2000)]
        tokens: u64,

        /// Prints the audit record as JSON when done.
        #[arg(long, default_value_t = false)]
        audit: bool,
    },

    /// Queries the backend once for a request's status.
    Status {
        request_id: String,
    },

    /// Runs a scripted session against an in-process backend.
    Demo,
}
