use anyhow::Result;
use std::io::Write;

use crate::config::MergeConductorConfig;
use crate::orchestrator::Orchestrator;

pub mod analyze;
pub mod clear;
pub mod process;
pub mod status;

/// Build the orchestrator and load persisted state, reporting progress
pub async fn connect(config: &MergeConductorConfig) -> Result<Orchestrator> {
    print!("🔄 Connecting to GitHub... ");
    std::io::stdout().flush()?;

    match Orchestrator::from_config(config) {
        Ok(orchestrator) => {
            println!("✅");
            orchestrator.load_state().await?;
            Ok(orchestrator)
        }
        Err(e) => {
            println!("❌");
            Err(e.into())
        }
    }
}
