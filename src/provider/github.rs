use async_trait::async_trait;
use chrono::Utc;
use governor::{DefaultDirectRateLimiter, Jitter, Quota, RateLimiter};
use octocrab::models::pulls::{PullRequest, Review, ReviewState as GitHubReviewState};
use octocrab::params::pulls::MergeMethod as GitHubMergeMethod;
use octocrab::{Octocrab, Page};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::types::{ChangeRequest, ChangeRequestId, MergeMethod, MergeReceipt, ReviewState};
use super::{ChangeRequestProvider, ProviderError};

/// GitHub pull requests as change requests, with client-side rate limiting
#[derive(Debug)]
pub struct GitHubProvider {
    octocrab: Octocrab,
    rate_limiter: Arc<DefaultDirectRateLimiter>,
}

impl GitHubProvider {
    pub fn new(token: String, requests_per_second: u32, burst: u32) -> Result<Self, ProviderError> {
        Self::with_base_uri(token, requests_per_second, burst, None)
    }

    /// As [`new`](Self::new), against a GitHub Enterprise or test API root
    pub fn with_base_uri(
        token: String,
        requests_per_second: u32,
        burst: u32,
        base_uri: Option<&str>,
    ) -> Result<Self, ProviderError> {
        let per_second = NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::per_second(per_second).allow_burst(burst);
        let rate_limiter = Arc::new(RateLimiter::direct(quota));

        let mut builder = Octocrab::builder().personal_token(token);
        if let Some(base_uri) = base_uri {
            builder = builder.base_uri(base_uri)?;
        }
        let octocrab = builder.build()?;

        Ok(Self {
            octocrab,
            rate_limiter,
        })
    }

    async fn throttle(&self) {
        self.rate_limiter
            .until_ready_with_jitter(Jitter::up_to(Duration::from_millis(100)))
            .await;
    }

    /// Items of `page` and of every page its `next` links lead to. Each
    /// follow-up request waits on the rate limiter.
    async fn collect_pages<T: DeserializeOwned>(&self, mut page: Page<T>) -> Result<Vec<T>, ProviderError> {
        let mut items = page.take_items();
        while page.next.is_some() {
            self.throttle().await;
            match self.octocrab.get_page::<T>(&page.next).await? {
                Some(mut next) => {
                    items.append(&mut next.take_items());
                    page = next;
                }
                None => break,
            }
        }
        Ok(items)
    }

    fn split_repository(repository: &str) -> Result<(&str, &str), ProviderError> {
        match repository.split_once('/') {
            Some((owner, name)) if !owner.is_empty() && !name.is_empty() => Ok((owner, name)),
            _ => Err(ProviderError::InvalidRepository(repository.to_string())),
        }
    }

    fn to_change_request(repository: &str, pr: PullRequest) -> ChangeRequest {
        ChangeRequest {
            id: ChangeRequestId::new(repository, pr.number),
            title: pr.title.unwrap_or_default(),
            description: pr.body.unwrap_or_default(),
            source_branch: pr.head.ref_field.clone(),
            target_branch: pr.base.ref_field.clone(),
            author: pr.user.map(|user| user.login).unwrap_or_default(),
            created_at: pr.created_at.unwrap_or_else(Utc::now),
            labels: pr
                .labels
                .unwrap_or_default()
                .into_iter()
                .map(|label| label.name)
                .collect(),
            mergeable: pr.mergeable,
        }
    }
}

#[async_trait]
impl ChangeRequestProvider for GitHubProvider {
    async fn list_open(&self, repository: &str) -> Result<Vec<ChangeRequest>, ProviderError> {
        let (owner, repo) = Self::split_repository(repository)?;
        self.throttle().await;

        let page = self
            .octocrab
            .pulls(owner, repo)
            .list()
            .state(octocrab::params::State::Open)
            .per_page(100)
            .send()
            .await?;

        let requests: Vec<ChangeRequest> = self
            .collect_pages(page)
            .await?
            .into_iter()
            .map(|pr| Self::to_change_request(repository, pr))
            .collect();

        info!(
            repository = %repository,
            count = requests.len(),
            "Fetched open pull requests"
        );
        Ok(requests)
    }

    async fn touched_resources(&self, id: &ChangeRequestId) -> Result<Vec<String>, ProviderError> {
        let (owner, repo) = Self::split_repository(&id.repository)?;
        self.throttle().await;

        let first = self.octocrab.pulls(owner, repo).list_files(id.number).await?;
        let paths: Vec<String> = self
            .collect_pages(first)
            .await?
            .into_iter()
            .map(|f| f.filename)
            .collect();

        debug!(change_request = %id, files = paths.len(), "Fetched touched resources");
        Ok(paths)
    }

    async fn review_state(&self, id: &ChangeRequestId) -> Result<ReviewState, ProviderError> {
        let (owner, repo) = Self::split_repository(&id.repository)?;
        self.throttle().await;

        let reviews = self
            .octocrab
            .pulls(owner, repo)
            .list_reviews(id.number)
            .send()
            .await?;

        // Only the latest review from each reviewer counts
        let mut latest: HashMap<octocrab::models::UserId, Review> = HashMap::new();
        for review in reviews.items {
            if let Some(user) = &review.user {
                let newer = latest
                    .get(&user.id)
                    .map_or(true, |existing| review.submitted_at >= existing.submitted_at);
                if newer {
                    latest.insert(user.id, review);
                }
            }
        }

        let mut state = ReviewState::default();
        for review in latest.values() {
            match review.state {
                Some(GitHubReviewState::Approved) => state.approvals += 1,
                Some(GitHubReviewState::ChangesRequested) => state.changes_requested += 1,
                _ => {}
            }
        }
        Ok(state)
    }

    async fn merge(
        &self,
        id: &ChangeRequestId,
        method: MergeMethod,
    ) -> Result<MergeReceipt, ProviderError> {
        let (owner, repo) = Self::split_repository(&id.repository)?;
        self.throttle().await;

        let result = self
            .octocrab
            .pulls(owner, repo)
            .merge(id.number)
            .method(match method {
                MergeMethod::Merge => GitHubMergeMethod::Merge,
                MergeMethod::Rebase => GitHubMergeMethod::Rebase,
                MergeMethod::Squash => GitHubMergeMethod::Squash,
            })
            .send()
            .await?;

        if !result.merged {
            return Err(ProviderError::NotMerged {
                id: id.clone(),
                reason: result
                    .message
                    .unwrap_or_else(|| "merge rejected by provider".to_string()),
            });
        }

        info!(change_request = %id, sha = ?result.sha, method = %method, "Merged pull request");
        Ok(MergeReceipt {
            merged: true,
            sha: result.sha,
        })
    }

    async fn comment(&self, id: &ChangeRequestId, body: &str) -> Result<(), ProviderError> {
        let (owner, repo) = Self::split_repository(&id.repository)?;
        self.throttle().await;

        self.octocrab
            .issues(owner, repo)
            .create_comment(id.number, body)
            .await?;

        debug!(change_request = %id, "Posted comment");
        Ok(())
    }
}
