use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub mod commands;

#[derive(Parser)]
#[command(name = "merge-conductor")]
#[command(about = "Conflict-aware merge queue with quality gates and automatic rollback")]
#[command(long_about = "merge-conductor discovers open pull requests across repositories, analyzes them \
                       for conflicts, schedules them into a priority-ordered merge queue and merges them \
                       through pre- and post-merge quality gates, rolling back when a post-merge gate fails.")]
pub struct Cli {
    /// Configuration file (default: merge-conductor.toml when present)
    #[arg(long, global = true, help = "Path to a configuration file")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Discover open pull requests and report conflicts without queueing anything
    Analyze {
        /// Only analyze one repository
        #[arg(long, help = "Limit analysis to one owner/name repository")]
        repo: Option<String>,
        /// Print reports as JSON
        #[arg(long, help = "Emit conflict reports as JSON on stdout")]
        json: bool,
    },
    /// Analyze, enqueue and merge the next batch
    #[command(alias = "run")]
    Process {
        /// Maximum merges in this batch
        #[arg(long, help = "Override scheduling.max_concurrent_merges for this run")]
        max_concurrent: Option<usize>,
        /// Show what would be merged without merging
        #[arg(long, help = "Select a batch and report it without executing merges")]
        dry_run: bool,
    },
    /// Display merge queue, merge window and history overview
    Status {
        /// Print status as JSON
        #[arg(long, help = "Emit the status report as JSON on stdout")]
        json: bool,
    },
    /// Return a manual_required pull request to normal scheduling
    Clear {
        /// Pull request as owner/name#number
        #[arg(help = "Pull request to clear, e.g. acme/widgets#42")]
        id: String,
    },
}
