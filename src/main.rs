use anyhow::Result;
use clap::Parser;

use merge_conductor::cli::commands::{
    analyze::AnalyzeCommand, clear::ClearCommand, process::ProcessCommand, status::StatusCommand,
};
use merge_conductor::cli::{Cli, Commands};
use merge_conductor::{init_telemetry, MergeConductorConfig, RunStatus};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let code = match run(cli).await {
        Ok(status) => status.exit_code(),
        Err(e) => {
            eprintln!("❌ {e:#}");
            RunStatus::Failure.exit_code()
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<RunStatus> {
    MergeConductorConfig::load_env_file()?;
    let config = MergeConductorConfig::load_from(cli.config.as_deref())?;
    init_telemetry(&config.observability.log_level, config.observability.json_logs)?;
    config.validate()?;

    match cli.command {
        Commands::Analyze { repo, json } => {
            AnalyzeCommand::new(repo).with_json(json).execute(&config).await
        }
        Commands::Process {
            max_concurrent,
            dry_run,
        } => ProcessCommand::new(max_concurrent, dry_run).execute(&config).await,
        Commands::Status { json } => StatusCommand::new().with_json(json).execute(&config).await,
        Commands::Clear { id } => ClearCommand::new(id).execute(&config).await,
    }
}
