use anyhow::Result;
use chrono::Local;

use crate::config::MergeConductorConfig;
use crate::orchestrator::{RunStatus, StateStore, StatusReport};
use crate::priority::PriorityBand;
use crate::queue::ConflictStatus;

pub struct StatusCommand {
    pub json: bool,
}

impl StatusCommand {
    pub fn new() -> Self {
        Self { json: false }
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    /// Reads local state only; no GitHub token needed
    pub async fn execute(&self, config: &MergeConductorConfig) -> Result<RunStatus> {
        let state = StateStore::open(config);
        state.load().await?;
        let now = Local::now();
        let report = state.status(&now).await?;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
            return Ok(RunStatus::Success);
        }

        println!("🚂 MERGE CONDUCTOR STATUS");
        println!("=========================");
        println!();
        print!("{}", config.scheduling.merge_window.format_window_display(&now));
        println!();
        print_queue(&report);
        print_history(&report);

        for item in state.queue().items().await {
            if item.is_manual_required() {
                let reason = item.last_error.as_deref().unwrap_or("conflicts need a human");
                println!("🛑 {} held: {reason}", item.id);
                println!("   💡 merge-conductor clear {}", item.id);
            }
        }
        Ok(RunStatus::Success)
    }
}

impl Default for StatusCommand {
    fn default() -> Self {
        Self::new()
    }
}

fn print_queue(report: &StatusReport) {
    let queue = &report.queue;
    println!("📋 MERGE QUEUE:");
    println!("──────────────");
    if queue.total == 0 {
        println!("📭 Queue is empty");
        println!();
        return;
    }

    println!("📊 {} queued, {} in flight", queue.total, queue.leased);
    for (status, count) in &queue.by_conflict_status {
        println!("   {} {count} {status}", conflict_emoji(*status));
    }
    for (priority, count) in queue.by_priority.iter().rev() {
        println!("   🎯 {count} at priority {priority} ({})", PriorityBand::from_score(*priority));
    }
    for (repository, count) in &queue.by_repository {
        println!("   📦 {repository}: {count}");
    }
    println!();
}

fn print_history(report: &StatusReport) {
    let history = &report.history;
    println!("📜 HISTORY:");
    println!("──────────");
    if history.total == 0 {
        println!("   No merges attempted yet");
        println!();
        return;
    }
    println!(
        "   ✅ {} merged, ❌ {} failed, ↩️  {} rolled back",
        history.succeeded, history.failed, history.rolled_back
    );
    if history.manual_recovery_required > 0 {
        println!(
            "   🚨 {} operations need manual recovery",
            history.manual_recovery_required
        );
    }
    if let Some(last) = history.last_finished_at {
        println!("   🕒 last finished {}", last.format("%Y-%m-%d %H:%M UTC"));
    }
    println!();
}

fn conflict_emoji(status: ConflictStatus) -> &'static str {
    match status {
        ConflictStatus::Unknown => "❓",
        ConflictStatus::Clean => "🟢",
        ConflictStatus::AutoResolvable => "🟡",
        ConflictStatus::ManualRequired => "🛑",
    }
}
