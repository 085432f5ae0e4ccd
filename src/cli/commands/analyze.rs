use anyhow::Result;
use serde::Serialize;

use crate::cli::commands::connect;
use crate::config::MergeConductorConfig;
use crate::conflict::{ConflictReport, Severity};
use crate::orchestrator::{AnalysisRun, RunStatus};

pub struct AnalyzeCommand {
    pub repository: Option<String>,
    pub json: bool,
}

#[derive(Serialize)]
struct AnalysisRow<'a> {
    title: &'a str,
    priority: u8,
    report: &'a ConflictReport,
}

impl AnalyzeCommand {
    pub fn new(repository: Option<String>) -> Self {
        Self {
            repository,
            json: false,
        }
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    pub async fn execute(&self, config: &MergeConductorConfig) -> Result<RunStatus> {
        let orchestrator = connect(config).await?;
        let run = orchestrator.analyze(self.repository.as_deref()).await?;

        if self.json {
            let rows: Vec<AnalysisRow<'_>> = run
                .analyzed
                .iter()
                .map(|change| AnalysisRow {
                    title: &change.change_request.title,
                    priority: change.priority,
                    report: &change.report,
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
        } else {
            print_analysis(&run);
        }

        Ok(run.status())
    }
}

fn print_analysis(run: &AnalysisRun) {
    println!();
    println!("🔍 CONFLICT ANALYSIS:");
    println!("─────────────────────");

    if run.analyzed.is_empty() {
        println!("📭 No open pull requests found");
    }
    for change in &run.analyzed {
        let report = &change.report;
        println!(
            "{} {} {} (priority {})",
            severity_emoji(report.severity),
            report.change_request,
            change.change_request.title,
            change.priority
        );
        if report.has_conflicts() {
            println!(
                "   ⚔️  {} conflicting: {}",
                report.conflicting_resources.len(),
                report.conflicting_resources.join(", ")
            );
            println!(
                "   🛠️  strategy {} ({}), ~{}m",
                report.resolution_strategy,
                if report.auto_resolvable { "automatic" } else { "manual" },
                report.estimated_resolution_minutes
            );
        }
        if let Some(error) = &report.analysis_error {
            println!("   ⚠️  analysis degraded: {error}");
        }
        if !report.dependencies.is_empty() {
            let deps: Vec<String> = report.dependencies.iter().map(|d| d.to_string()).collect();
            println!("   🔗 depends on {}", deps.join(", "));
        }
    }

    for (repository, error) in &run.discovery.failed_repositories {
        println!("❌ {repository}: {error}");
    }
    for id in &run.discovery.skipped {
        println!("⏭️  {id}: touched files unavailable, skipped");
    }
    println!();
}

fn severity_emoji(severity: Severity) -> &'static str {
    match severity {
        Severity::None => "🟢",
        Severity::Low => "🟡",
        Severity::Medium => "🟠",
        Severity::High => "🔴",
        Severity::Critical => "🚨",
        Severity::Unknown => "❓",
    }
}
