//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Stackyard - cross-stack dependency resolution and deployment ordering.
#[derive(Parser, Debug)]
#[command(name = "stackyard")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true, env = "STACKYARD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Maximum stacks provisioned concurrently within a batch.
    #[arg(long, global = true)]
    pub concurrency: Option<usize>,

    /// Overall run timeout in seconds.
    #[arg(long, global = true)]
    pub timeout: Option<u64>,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new Stackyard project.
    Init {
        /// Directory to initialize (defaults to current directory).
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Force overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },

    /// Validate the stack declarations.
    Validate {
        /// Show all warnings, not just errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Show the deployment plan and what would change.
    Diff {
        /// Restrict to these stacks and their predecessors.
        #[arg(short, long = "stack")]
        stacks: Vec<String>,
    },

    /// Deploy stacks in dependency order.
    Deploy {
        /// Restrict to these stacks and their predecessors.
        #[arg(short, long = "stack")]
        stacks: Vec<String>,

        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Tear stacks down in reverse dependency order.
    Destroy {
        /// Restrict to these stacks and their dependents.
        #[arg(short, long = "stack")]
        stacks: Vec<String>,

        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Manage recorded state.
    State {
        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// State management subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Show deployment records.
    Show,

    /// Unlock the state.
    Unlock {
        /// Lock ID to unlock.
        #[arg(long)]
        lock_id: Option<String>,

        /// Force unlock (dangerous).
        #[arg(long)]
        force: bool,
    },

    /// Delete records of destroyed stacks.
    Prune,
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}
