use chrono::Utc;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::cache::ReportCache;
use super::classify::ResourceClassifier;
use super::resolver::resolve_conflicts;
use super::source::ConflictSource;
use super::types::{
    ConflictError, ConflictReport, ConflictedResource, ResolutionStrategy, ResolvedResource,
    ResourceClass, Severity, SeverityThresholds,
};
use crate::provider::{ChangeRequest, ChangeRequestId};

const DEPENDENCY_PATTERN: &str =
    r"(?i)\b(?:depends on|requires|blocked by|after)\s+((?:[\w.-]+/[\w.-]+)?#\d+)";

/// Estimate used when the conflict source could not be consulted
const UNKNOWN_ESTIMATE_MINUTES: u32 = 30;

#[derive(Debug, Clone)]
pub struct AnalyzerSettings {
    pub thresholds: SeverityThresholds,
    pub auto_resolvable_classes: BTreeSet<ResourceClass>,
    pub strategies: BTreeMap<ResourceClass, ResolutionStrategy>,
    pub expedite_labels: Vec<String>,
}

impl Default for AnalyzerSettings {
    fn default() -> Self {
        Self {
            thresholds: SeverityThresholds::default(),
            auto_resolvable_classes: [ResourceClass::Documentation, ResourceClass::Configuration]
                .into_iter()
                .collect(),
            strategies: default_strategies(),
            expedite_labels: vec!["hotfix".to_string(), "security".to_string()],
        }
    }
}

pub fn default_strategies() -> BTreeMap<ResourceClass, ResolutionStrategy> {
    BTreeMap::from([
        (ResourceClass::Documentation, ResolutionStrategy::PreferIncoming),
        (ResourceClass::Configuration, ResolutionStrategy::MergeBoth),
        (ResourceClass::Test, ResolutionStrategy::PreferMostRecent),
        (ResourceClass::Code, ResolutionStrategy::RequireManual),
    ])
}

pub struct ConflictAnalyzer {
    source: Arc<dyn ConflictSource>,
    classifier: ResourceClassifier,
    settings: AnalyzerSettings,
    dependency_pattern: Regex,
}

impl ConflictAnalyzer {
    pub fn new(
        source: Arc<dyn ConflictSource>,
        classifier: ResourceClassifier,
        settings: AnalyzerSettings,
    ) -> Result<Self, ConflictError> {
        let dependency_pattern =
            Regex::new(DEPENDENCY_PATTERN).map_err(|source| ConflictError::InvalidPattern {
                pattern: DEPENDENCY_PATTERN.to_string(),
                source,
            })?;
        Ok(Self {
            source,
            classifier,
            settings,
            dependency_pattern,
        })
    }

    pub fn settings(&self) -> &AnalyzerSettings {
        &self.settings
    }

    /// Analyze a change request given the resources it touches. Never fails:
    /// an unreachable conflict source yields an `unknown` severity report.
    pub async fn analyze(&self, change_request: &ChangeRequest, touched: &[String]) -> ConflictReport {
        match self.source.modified_on_target(change_request).await {
            Ok(modified) => self.assess(change_request, touched, &modified),
            Err(e) => {
                warn!(
                    change_request = %change_request.id,
                    error = %e,
                    "Conflict source unavailable, reporting unknown severity"
                );
                self.unknown_report(change_request, e.to_string())
            }
        }
    }

    /// `analyze`, served from `cache` while the cached report is fresh.
    /// Degraded reports are never cached so the next run retries the source.
    pub async fn analyze_cached(
        &self,
        cache: &ReportCache,
        change_request: &ChangeRequest,
        touched: &[String],
    ) -> ConflictReport {
        if let Some(report) = cache.get_fresh(&change_request.id, Utc::now()).await {
            debug!(change_request = %change_request.id, "Using cached conflict report");
            return report;
        }

        let report = self.analyze(change_request, touched).await;
        if report.analysis_error.is_none() {
            cache.insert(report.clone()).await;
        }
        report
    }

    /// Pure part of the analysis, given both sides' changed resources
    pub fn assess(
        &self,
        change_request: &ChangeRequest,
        touched: &[String],
        modified_on_target: &[String],
    ) -> ConflictReport {
        let modified: BTreeSet<&str> = modified_on_target.iter().map(String::as_str).collect();
        let mut conflicting: Vec<String> = Vec::new();
        for resource in touched {
            if modified.contains(resource.as_str()) && !conflicting.contains(resource) {
                conflicting.push(resource.clone());
            }
        }

        let severity = Severity::classify(conflicting.len(), &self.settings.thresholds);
        let auto_resolvable = severity.permits_auto_resolution()
            && conflicting.iter().all(|resource| {
                self.classifier
                    .classify(resource)
                    .is_some_and(|class| self.settings.auto_resolvable_classes.contains(&class))
            });
        let resolution_strategy = self.strategy_for(change_request, &conflicting);
        let estimated_resolution_minutes = estimate_minutes(conflicting.len(), auto_resolvable);
        let dependencies = self.dependencies(change_request);

        info!(
            change_request = %change_request.id,
            conflicts = conflicting.len(),
            severity = %severity,
            auto_resolvable,
            strategy = %resolution_strategy,
            "Conflict analysis complete"
        );

        ConflictReport {
            change_request: change_request.id.clone(),
            source_branch: change_request.source_branch.clone(),
            target_branch: change_request.target_branch.clone(),
            conflicting_resources: conflicting,
            severity,
            auto_resolvable,
            resolution_strategy,
            estimated_resolution_minutes,
            dependencies,
            analyzed_at: Utc::now(),
            analysis_error: None,
        }
    }

    /// Explicit back-references in the description, e.g. `depends on #12`
    /// or `blocked by acme/api#7`. Self-references are dropped.
    pub fn dependencies(&self, change_request: &ChangeRequest) -> Vec<ChangeRequestId> {
        let mut dependencies: Vec<ChangeRequestId> = Vec::new();
        for capture in self
            .dependency_pattern
            .captures_iter(&change_request.description)
        {
            let reference = &capture[1];
            let qualified = if reference.starts_with('#') {
                format!("{}{}", change_request.id.repository, reference)
            } else {
                reference.to_string()
            };
            let Ok(id) = qualified.parse::<ChangeRequestId>() else {
                continue;
            };
            if id != change_request.id && !dependencies.contains(&id) {
                dependencies.push(id);
            }
        }
        dependencies
    }

    /// Report for the conflicts an actual merge left behind. Only the
    /// conflicted paths count, so resources both sides changed but git
    /// merged cleanly are ignored.
    pub fn assess_conflicted(&self, change_request: &ChangeRequest, conflicted: &[String]) -> ConflictReport {
        self.assess(change_request, conflicted, conflicted)
    }

    /// Mechanically resolve an auto-resolvable report's conflicted content.
    /// Returns the rewritten resources.
    pub fn resolve(
        &self,
        report: &ConflictReport,
        contents: &[ConflictedResource],
    ) -> Result<Vec<ResolvedResource>, ConflictError> {
        if !report.auto_resolvable {
            return Err(ConflictError::UnresolvableConflict {
                resource: report
                    .conflicting_resources
                    .first()
                    .cloned()
                    .unwrap_or_default(),
                reason: format!("severity {} is not auto-resolvable", report.severity),
            });
        }

        let resolved = resolve_conflicts(contents, report.resolution_strategy)?;
        info!(
            change_request = %report.change_request,
            resources = resolved.len(),
            strategy = %report.resolution_strategy,
            "Conflicts resolved"
        );
        Ok(resolved)
    }

    fn strategy_for(&self, change_request: &ChangeRequest, conflicting: &[String]) -> ResolutionStrategy {
        if self
            .settings
            .expedite_labels
            .iter()
            .any(|label| change_request.has_label(label))
        {
            return ResolutionStrategy::PrioritizeIncoming;
        }

        let Some(first) = conflicting.first() else {
            return ResolutionStrategy::AutoMerge;
        };
        self.classifier
            .classify(first)
            .and_then(|class| self.settings.strategies.get(&class).copied())
            .unwrap_or(ResolutionStrategy::RequireManual)
    }

    fn unknown_report(&self, change_request: &ChangeRequest, error: String) -> ConflictReport {
        ConflictReport {
            change_request: change_request.id.clone(),
            source_branch: change_request.source_branch.clone(),
            target_branch: change_request.target_branch.clone(),
            conflicting_resources: vec![],
            severity: Severity::Unknown,
            auto_resolvable: false,
            resolution_strategy: ResolutionStrategy::RequireManual,
            estimated_resolution_minutes: UNKNOWN_ESTIMATE_MINUTES,
            dependencies: self.dependencies(change_request),
            analyzed_at: Utc::now(),
            analysis_error: Some(error),
        }
    }
}

fn estimate_minutes(conflicts: usize, auto_resolvable: bool) -> u32 {
    let count = u32::try_from(conflicts).unwrap_or(u32::MAX);
    match (conflicts, auto_resolvable) {
        (0, _) => 5,
        (_, true) => count.saturating_mul(2).saturating_add(10),
        (_, false) => count.saturating_mul(10).saturating_add(30),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::source::MockConflictSource;
    use std::time::Duration;

    fn change_request(description: &str, labels: &[&str]) -> ChangeRequest {
        ChangeRequest {
            id: ChangeRequestId::new("acme/widgets", 10),
            title: "Change".to_string(),
            description: description.to_string(),
            source_branch: "feature".to_string(),
            target_branch: "main".to_string(),
            author: "dev".to_string(),
            created_at: Utc::now(),
            labels: labels.iter().map(|l| l.to_string()).collect(),
            mergeable: None,
        }
    }

    fn analyzer_with(source: MockConflictSource) -> ConflictAnalyzer {
        ConflictAnalyzer::new(
            Arc::new(source),
            ResourceClassifier::default(),
            AnalyzerSettings::default(),
        )
        .unwrap()
    }

    fn analyzer() -> ConflictAnalyzer {
        analyzer_with(MockConflictSource::new())
    }

    fn paths(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_documentation_conflicts_are_auto_resolvable() {
        let report = analyzer().assess(
            &change_request("", &[]),
            &paths(&["README.md", "docs/a.md", "docs/b.md", "src/lib.rs"]),
            &paths(&["README.md", "docs/a.md", "docs/b.md"]),
        );

        assert_eq!(report.conflicting_resources.len(), 3);
        assert_eq!(report.severity, Severity::Low);
        assert!(report.auto_resolvable);
        assert_eq!(report.resolution_strategy, ResolutionStrategy::PreferIncoming);
        assert_eq!(report.estimated_resolution_minutes, 16);
    }

    #[test]
    fn test_any_code_resource_forces_manual() {
        let report = analyzer().assess(
            &change_request("", &[]),
            &paths(&["README.md", "src/lib.rs"]),
            &paths(&["README.md", "src/lib.rs"]),
        );

        assert_eq!(report.severity, Severity::Low);
        assert!(!report.auto_resolvable);
        assert!(report.requires_manual());
        assert_eq!(report.resolution_strategy, ResolutionStrategy::PreferIncoming);
        assert_eq!(report.estimated_resolution_minutes, 50);
    }

    #[test]
    fn test_high_severity_is_never_auto_resolvable() {
        let docs: Vec<String> = (0..20).map(|i| format!("docs/page{i}.md")).collect();
        let report = analyzer().assess(&change_request("", &[]), &docs, &docs);

        assert_eq!(report.severity, Severity::High);
        assert!(!report.auto_resolvable);
        assert_eq!(report.estimated_resolution_minutes, 230);
    }

    #[test]
    fn test_no_conflicts_means_auto_merge() {
        let report = analyzer().assess(
            &change_request("", &[]),
            &paths(&["src/lib.rs"]),
            &paths(&["README.md"]),
        );

        assert_eq!(report.severity, Severity::None);
        assert!(report.auto_resolvable);
        assert!(!report.requires_manual());
        assert_eq!(report.resolution_strategy, ResolutionStrategy::AutoMerge);
        assert_eq!(report.estimated_resolution_minutes, 5);
    }

    #[test]
    fn test_expedite_label_prioritizes_incoming() {
        let report = analyzer().assess(
            &change_request("", &["Hotfix"]),
            &paths(&["config/app.yaml"]),
            &paths(&["config/app.yaml"]),
        );
        assert_eq!(report.resolution_strategy, ResolutionStrategy::PrioritizeIncoming);
    }

    #[test]
    fn test_configuration_and_test_strategies() {
        let config = analyzer().assess(
            &change_request("", &[]),
            &paths(&["settings.toml"]),
            &paths(&["settings.toml"]),
        );
        assert_eq!(config.resolution_strategy, ResolutionStrategy::MergeBoth);

        let tests = analyzer().assess(
            &change_request("", &[]),
            &paths(&["tests/queue.rs"]),
            &paths(&["tests/queue.rs"]),
        );
        assert_eq!(tests.resolution_strategy, ResolutionStrategy::PreferMostRecent);
        assert!(!tests.auto_resolvable);

        let unmatched = analyzer().assess(
            &change_request("", &[]),
            &paths(&["assets/logo.png"]),
            &paths(&["assets/logo.png"]),
        );
        assert_eq!(unmatched.resolution_strategy, ResolutionStrategy::RequireManual);
        assert!(!unmatched.auto_resolvable);
    }

    #[test]
    fn test_conflicts_keep_request_order_without_duplicates() {
        let report = analyzer().assess(
            &change_request("", &[]),
            &paths(&["b.md", "a.md", "b.md"]),
            &paths(&["a.md", "b.md"]),
        );
        assert_eq!(report.conflicting_resources, paths(&["b.md", "a.md"]));
    }

    #[test]
    fn test_dependencies_from_description() {
        let cr = change_request(
            "Depends on #3, blocked by acme/api#7.\nRequires #3 again. after #10 (self). Mentions #99.",
            &[],
        );
        let deps = analyzer().dependencies(&cr);
        assert_eq!(
            deps,
            vec![
                ChangeRequestId::new("acme/widgets", 3),
                ChangeRequestId::new("acme/api", 7),
            ]
        );
    }

    #[tokio::test]
    async fn test_unavailable_source_degrades_to_unknown() {
        let mut source = MockConflictSource::new();
        source
            .expect_modified_on_target()
            .returning(|_| Err(ConflictError::SourceUnavailable("offline".to_string())));
        let analyzer = analyzer_with(source);

        let report = analyzer.analyze(&change_request("", &[]), &paths(&["README.md"])).await;
        assert_eq!(report.severity, Severity::Unknown);
        assert!(!report.auto_resolvable);
        assert_eq!(report.resolution_strategy, ResolutionStrategy::RequireManual);
        assert_eq!(report.estimated_resolution_minutes, 30);
        assert!(report.requires_manual());
        assert!(report.analysis_error.unwrap().contains("offline"));
    }

    #[tokio::test]
    async fn test_cached_analysis_skips_source_while_fresh() {
        let mut source = MockConflictSource::new();
        source
            .expect_modified_on_target()
            .times(1)
            .returning(|_| Ok(vec!["README.md".to_string()]));
        let analyzer = analyzer_with(source);
        let cache = ReportCache::new(Duration::from_secs(1800));
        let cr = change_request("", &[]);

        let first = analyzer.analyze_cached(&cache, &cr, &paths(&["README.md"])).await;
        let second = analyzer.analyze_cached(&cache, &cr, &paths(&["README.md"])).await;
        assert_eq!(first, second);
    }

    #[test]
    fn test_resolve_rewrites_conflicted_content() {
        let analyzer = analyzer();
        let cr = change_request("", &[]);
        let report = analyzer.assess_conflicted(&cr, &paths(&["README.md"]));
        let contents = vec![ConflictedResource {
            path: "README.md".to_string(),
            content: "<<<<<<< HEAD\nold\n=======\nnew\n>>>>>>> feature\n".to_string(),
        }];

        let resolved = analyzer.resolve(&report, &contents).unwrap();
        assert_eq!(
            resolved,
            vec![ResolvedResource {
                path: "README.md".to_string(),
                content: "new\n".to_string(),
            }]
        );
    }

    #[test]
    fn test_resolve_refuses_manual_reports() {
        let analyzer = analyzer();
        let cr = change_request("", &[]);
        let report = analyzer.assess_conflicted(&cr, &paths(&["src/lib.rs"]));
        assert!(!report.auto_resolvable);
        assert!(matches!(
            analyzer.resolve(&report, &[]),
            Err(ConflictError::UnresolvableConflict { .. })
        ));
    }

    #[test]
    fn test_assess_conflicted_counts_only_conflicted_paths() {
        let analyzer = analyzer();
        let cr = change_request("", &[]);
        let report = analyzer.assess_conflicted(&cr, &paths(&["docs/a.md", "docs/b.md"]));
        assert_eq!(report.conflicting_resources, paths(&["docs/a.md", "docs/b.md"]));
        assert_eq!(report.severity, Severity::Low);
        assert!(report.auto_resolvable);

        let clean = analyzer.assess_conflicted(&cr, &[]);
        assert!(!clean.has_conflicts());
        assert_eq!(clean.resolution_strategy, ResolutionStrategy::AutoMerge);
    }
}
