use anyhow::Result;
use chrono::Local;

use crate::cli::commands::connect;
use crate::config::MergeConductorConfig;
use crate::orchestrator::{DrainOptions, ProcessReport, RunStatus};

pub struct ProcessCommand {
    pub max_concurrent: Option<usize>,
    pub dry_run: bool,
}

impl ProcessCommand {
    pub fn new(max_concurrent: Option<usize>, dry_run: bool) -> Self {
        Self {
            max_concurrent,
            dry_run,
        }
    }

    pub async fn execute(&self, config: &MergeConductorConfig) -> Result<RunStatus> {
        let orchestrator = connect(config).await?;
        let options = DrainOptions {
            max_concurrent: self
                .max_concurrent
                .unwrap_or_else(|| orchestrator.max_concurrent()),
            dry_run: self.dry_run,
        };

        if self.dry_run {
            println!("🧪 DRY RUN: nothing will be merged");
        }
        let report = orchestrator.process(&Local::now(), options).await?;
        print_report(&report);
        Ok(report.status())
    }
}

fn print_report(report: &ProcessReport) {
    println!();
    println!("🚂 MERGE RUN {}", report.drain.run_id);
    println!("─────────────────────");
    println!(
        "📥 Queue: {} added, {} updated, {} closed",
        report.enqueued.inserted,
        report.enqueued.updated,
        report.enqueued.removed.len()
    );
    for (repository, error) in &report.analysis.discovery.failed_repositories {
        println!("❌ {repository}: {error}");
    }

    if report.drain.selected.is_empty() {
        println!("📭 Nothing eligible to merge right now");
        println!();
        return;
    }

    if report.drain.dry_run {
        for id in &report.drain.selected {
            println!("👀 Would merge {id}");
        }
        println!();
        return;
    }

    for op in report.drain.merged() {
        let sha = op.merge_sha.as_deref().unwrap_or("unknown");
        println!("✅ {} merged ({sha})", op.change_request);
    }
    for op in report.drain.failed() {
        println!("❌ {} {}", op.change_request, op.failure_summary());
        if op.manual_recovery_required {
            println!("   🚨 rollback failed, manual recovery required");
        } else if op.rollback_performed {
            println!("   ↩️  rolled back");
        }
    }
    for id in &report.drain.skipped {
        println!("⏭️  {id} skipped");
    }
    println!();
}
