//! Merge operation coordinator
//!
//! Drives one change request through
//! backup_creation → pre_merge_gates → conflict_detection →
//! [conflict_resolution] → merge_execution → post_merge_gates, ending in
//! complete or failed. Each operation works in its own workspace, which is
//! discarded at the end whatever the outcome. Only a post-merge failure
//! triggers a rollback: the merge is reverted on the target branch and the
//! workspace backup restored.

pub mod types;

use std::sync::Arc;
use tracing::{error, info, warn, Instrument};

use crate::backup::{BackupHandle, SnapshotManager};
use crate::conflict::{ConflictAnalyzer, ConflictReport};
use crate::gates::{QualityGate, QualityGateRunner};
use crate::provider::{ChangeRequest, ChangeRequestProvider};
use crate::queue::QueueItem;
use crate::telemetry::create_merge_span;
use crate::workspace::{MergeWorkspace, PreparedMerge};

pub use types::{MergeOperation, MergePhase};

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub pre_merge_gates: Vec<QualityGate>,
    pub post_merge_gates: Vec<QualityGate>,
    pub rollback_enabled: bool,
    /// Refuse to merge without an approving review
    pub require_approval: bool,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            pre_merge_gates: vec![QualityGate::Lint, QualityGate::TestSuite],
            post_merge_gates: vec![QualityGate::SmokeTest],
            rollback_enabled: true,
            require_approval: false,
        }
    }
}

pub struct MergeCoordinator {
    analyzer: Arc<ConflictAnalyzer>,
    gates: Arc<QualityGateRunner>,
    backups: Arc<dyn SnapshotManager>,
    workspace: Arc<dyn MergeWorkspace>,
    provider: Arc<dyn ChangeRequestProvider>,
    settings: CoordinatorSettings,
}

impl MergeCoordinator {
    pub fn new(
        analyzer: Arc<ConflictAnalyzer>,
        gates: Arc<QualityGateRunner>,
        backups: Arc<dyn SnapshotManager>,
        workspace: Arc<dyn MergeWorkspace>,
        provider: Arc<dyn ChangeRequestProvider>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            analyzer,
            gates,
            backups,
            workspace,
            provider,
            settings,
        }
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.settings
    }

    /// Run the full pipeline for one queue item. Always returns a terminal
    /// operation; failures are recorded on it rather than returned.
    pub async fn execute(&self, item: &QueueItem, change_request: &ChangeRequest) -> MergeOperation {
        let mut op = MergeOperation::new(item.id.clone(), &item.source_branch, &item.target_branch);
        let span = create_merge_span(&op.id.to_string(), &item.id.key());

        async {
            self.run_phases(&mut op, item, change_request).await;
            if op.succeeded() {
                info!(sha = ?op.merge_sha, "Merge operation complete");
            } else {
                warn!(
                    failed_at = ?op.failed_at,
                    errors = ?op.errors,
                    rollback_performed = op.rollback_performed,
                    "Merge operation failed"
                );
            }
        }
        .instrument(span)
        .await;

        op
    }

    async fn run_phases(&self, op: &mut MergeOperation, item: &QueueItem, change_request: &ChangeRequest) {
        op.enter(MergePhase::BackupCreation);
        let prepared = match self.workspace.open(op.id, change_request).await {
            Ok(prepared) => prepared,
            Err(e) => return op.fail(format!("could not prepare workspace: {e}")),
        };
        self.run_in_workspace(op, item, change_request, &prepared).await;
        self.workspace.discard(&prepared).await;
    }

    async fn run_in_workspace(
        &self,
        op: &mut MergeOperation,
        item: &QueueItem,
        change_request: &ChangeRequest,
        prepared: &PreparedMerge,
    ) {
        let backup = match self.backups.snapshot(&prepared.dir).await {
            Ok(handle) => handle,
            Err(e) => return op.fail(e.to_string()),
        };
        op.backup = Some(backup.clone());

        op.enter(MergePhase::PreMergeGates);
        if self.settings.require_approval {
            match self.provider.review_state(&item.id).await {
                Ok(review) if review.is_approved() => {}
                Ok(review) => {
                    return op.fail(format!(
                        "not approved: {} approvals, {} changes requested",
                        review.approvals, review.changes_requested
                    ))
                }
                Err(e) => return op.fail(format!("could not read reviews: {e}")),
            }
        }
        let pre = self
            .gates
            .run_sequence_in(&self.settings.pre_merge_gates, &prepared.dir)
            .await;
        op.pre_merge_results = pre.results;
        if let Some(gate) = pre.failed_gate {
            return op.fail(format!("pre-merge gate {gate} failed"));
        }

        op.enter(MergePhase::ConflictDetection);
        let touched = match self.provider.touched_resources(&item.id).await {
            Ok(touched) => touched,
            Err(e) => return op.fail(format!("could not list touched resources: {e}")),
        };
        let report = self.analyzer.analyze(change_request, &touched).await;
        op.conflict_detected = report.has_conflicts();
        if report.requires_manual() {
            return op.fail(manual_reason(&report));
        }
        let local = match self.workspace.merge(prepared).await {
            Ok(local) => local,
            Err(e) => return op.fail(format!("local merge failed: {e}")),
        };

        if local.has_conflicts() {
            op.conflict_detected = true;
            let conflicts = self.analyzer.assess_conflicted(change_request, &local.conflicted);
            if conflicts.requires_manual() {
                return op.fail(manual_reason(&conflicts));
            }
            op.enter(MergePhase::ConflictResolution);
            if let Err(reason) = self.resolve_locally(op, prepared, &conflicts).await {
                return op.fail(reason);
            }
        }

        op.enter(MergePhase::MergeExecution);
        match self.provider.merge(&item.id, item.merge_method).await {
            Ok(receipt) => {
                op.merge_completed = true;
                op.merge_sha = receipt.sha;
            }
            Err(e) => return op.fail(e.to_string()),
        }

        op.enter(MergePhase::PostMergeGates);
        let (failure, checked_out) = match self
            .workspace
            .checkout_merged(prepared, op.merge_sha.as_deref())
            .await
        {
            Ok(sha) => {
                let post = self
                    .gates
                    .run_sequence_in(&self.settings.post_merge_gates, &prepared.dir)
                    .await;
                op.post_merge_results = post.results;
                (post.failed_gate.map(|gate| format!("post-merge gate {gate} failed")), Some(sha))
            }
            Err(e) => (Some(format!("could not check out the merged target: {e}")), None),
        };
        let Some(failure) = failure else {
            return op.complete();
        };

        let rollback_errors = if self.settings.rollback_enabled {
            let merged = op.merge_sha.clone().or(checked_out);
            self.roll_back(op, prepared, &backup, merged).await
        } else {
            Vec::new()
        };
        op.fail(failure);
        op.errors.extend(rollback_errors);
    }

    /// Resolve the conflicts left in the workspace and publish the result
    /// to the source branch so the provider merge is clean
    async fn resolve_locally(
        &self,
        op: &mut MergeOperation,
        prepared: &PreparedMerge,
        report: &ConflictReport,
    ) -> Result<(), String> {
        let contents = self
            .workspace
            .read_conflicted(prepared, &report.conflicting_resources)
            .await
            .map_err(|e| e.to_string())?;
        let resolved = self
            .analyzer
            .resolve(report, &contents)
            .map_err(|e| e.to_string())?;
        self.workspace
            .write_resolved(prepared, &resolved)
            .await
            .map_err(|e| e.to_string())?;

        let paths: Vec<String> = resolved.into_iter().map(|r| r.path).collect();
        let sha = self
            .workspace
            .publish_resolution(prepared, &paths)
            .await
            .map_err(|e| format!("could not publish resolution: {e}"))?;
        info!(resources = paths.len(), sha = %sha, "Resolution published to source branch");
        op.conflict_resolved = true;
        op.resolved_resources = paths;
        op.resolution_sha = Some(sha);
        Ok(())
    }

    /// Revert the merge on the target branch, then restore the workspace
    /// backup exactly once. Returns the errors of whichever step failed.
    async fn roll_back(
        &self,
        op: &mut MergeOperation,
        prepared: &PreparedMerge,
        backup: &BackupHandle,
        merge_sha: Option<String>,
    ) -> Vec<String> {
        op.rollback_performed = true;
        let mut errors = Vec::new();

        match merge_sha {
            Some(sha) => match self.workspace.revert_merge(prepared, &sha).await {
                Ok(revert) => op.revert_sha = Some(revert),
                Err(e) => errors.push(format!("rollback: could not revert {sha}: {e}")),
            },
            None => errors.push("rollback: merge commit unknown, nothing to revert".to_string()),
        }

        let outcome = self.backups.restore(backup).await;
        if outcome.success {
            if let Some(handle) = op.backup.as_mut() {
                handle.restore_method = outcome.method;
            }
        } else {
            errors.extend(outcome.errors.into_iter().map(|e| format!("rollback: {e}")));
        }

        if errors.is_empty() {
            info!(
                backup_id = %backup.id,
                revert_sha = ?op.revert_sha,
                method = ?outcome.method,
                "Rolled back after post-merge failure"
            );
        } else {
            op.rollback_failed = true;
            op.manual_recovery_required = true;
            error!(
                backup_id = %backup.id,
                errors = ?errors,
                "Rollback failed, manual recovery required"
            );
        }
        errors
    }
}

fn manual_reason(report: &ConflictReport) -> String {
    match &report.analysis_error {
        Some(error) => format!("manual resolution required: conflict analysis unavailable ({error})"),
        None => format!(
            "manual resolution required: {} conflicting resources, severity {}",
            report.conflicting_resources.len(),
            report.severity
        ),
    }
}
