use anyhow::{Context, Result};

use crate::config::MergeConductorConfig;
use crate::orchestrator::{RunStatus, StateStore};
use crate::provider::ChangeRequestId;

pub struct ClearCommand {
    pub id: String,
}

impl ClearCommand {
    pub fn new(id: String) -> Self {
        Self { id }
    }

    pub async fn execute(&self, config: &MergeConductorConfig) -> Result<RunStatus> {
        let id: ChangeRequestId = self
            .id
            .parse()
            .with_context(|| format!("'{}' is not owner/name#number", self.id))?;

        let state = StateStore::open(config);
        state.load().await?;
        state.clear(&id).await?;

        println!("✅ {id} returned to the merge queue");
        Ok(RunStatus::Success)
    }
}
