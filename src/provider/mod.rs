//! Change-request provider abstraction
//!
//! The collaboration platform is consumed only through [`ChangeRequestProvider`].
//! Transport, authentication and rate limiting live behind the trait so the
//! orchestrator and coordinator can be driven by fakes in tests.

pub mod github;
pub mod types;

use async_trait::async_trait;
use thiserror::Error;

pub use github::GitHubProvider;
pub use types::{ChangeRequest, ChangeRequestId, MergeMethod, MergeReceipt, ParseIdError, ReviewState};

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("GitHub API error: {0}")]
    Api(#[from] octocrab::Error),
    #[error("Invalid repository '{0}': expected owner/name")]
    InvalidRepository(String),
    #[error("Change request {id} was not merged: {reason}")]
    NotMerged { id: ChangeRequestId, reason: String },
    #[error("Provider unavailable: {0}")]
    Unavailable(String),
}

/// Operations consumed from the remote collaboration platform
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
#[async_trait]
pub trait ChangeRequestProvider: Send + Sync {
    /// List open change requests for `owner/name`
    async fn list_open(&self, repository: &str) -> Result<Vec<ChangeRequest>, ProviderError>;

    /// Resources (file paths) touched by the change request
    async fn touched_resources(&self, id: &ChangeRequestId) -> Result<Vec<String>, ProviderError>;

    async fn review_state(&self, id: &ChangeRequestId) -> Result<ReviewState, ProviderError>;

    async fn merge(
        &self,
        id: &ChangeRequestId,
        method: MergeMethod,
    ) -> Result<MergeReceipt, ProviderError>;

    async fn comment(&self, id: &ChangeRequestId, body: &str) -> Result<(), ProviderError>;
}
