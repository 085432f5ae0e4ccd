use config::{Config, Environment, File};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::backup::default_essential_patterns;
use crate::conflict::{
    default_resource_classes, AnalyzerSettings, ConflictError, ResolutionStrategy, ResourceClass,
    ResourceClassifier, SeverityThresholds,
};
use crate::coordinator::CoordinatorSettings;
use crate::gates::{GateError, QualityGate};
use crate::merge_window::MergeWindow;
use crate::priority::{default_priority_weights, PriorityCalculator, MAX_PRIORITY, MIN_PRIORITY};
use crate::provider::MergeMethod;

const CONFIG_FILE_STEM: &str = "merge-conductor";
const ENV_PREFIX: &str = "MERGE_CONDUCTOR";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("Invalid configuration value for {key}: {reason}")]
    Invalid { key: String, reason: String },
    #[error("Invalid quality gate configuration: {0}")]
    Gate(#[from] GateError),
    #[error("Invalid conflict configuration: {0}")]
    Conflict(#[from] ConflictError),
    #[error("Failed to write configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
}

impl ConfigError {
    fn invalid(key: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

/// Main configuration structure for merge-conductor
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MergeConductorConfig {
    /// Repositories to watch, `owner/name`
    pub repositories: Vec<String>,
    /// Local clone used for conflict detection; merges run in worktrees of it
    pub repository_path: PathBuf,
    /// Queue, cache, history, backups and the drain lock live here
    pub state_dir: PathBuf,
    pub github: GitHubConfig,
    pub observability: ObservabilityConfig,
    pub scheduling: SchedulingConfig,
    pub conflicts: ConflictConfig,
    pub gates: GateConfig,
    pub backup: BackupConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GitHubConfig {
    /// GitHub API token (falls back to GITHUB_TOKEN)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// API root for GitHub Enterprise; unset means api.github.com
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
    pub requests_per_second: u32,
    pub burst_capacity: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    /// JSON lines instead of human-readable output
    pub json_logs: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulingConfig {
    pub max_concurrent_merges: usize,
    /// Label → priority weight
    pub priority_weights: BTreeMap<String, u8>,
    /// Authors whose requests get a priority bonus
    pub maintainers: Vec<String>,
    pub merge_window: MergeWindow,
    pub default_merge_method: MergeMethod,
    pub require_approval: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConflictConfig {
    pub severity_thresholds: SeverityThresholds,
    /// Class → regex patterns
    pub resource_classes: BTreeMap<ResourceClass, Vec<String>>,
    pub auto_resolvable_classes: Vec<ResourceClass>,
    /// Class → strategy name
    pub auto_resolution_strategies: BTreeMap<ResourceClass, String>,
    /// Labels that make the incoming side win
    pub expedite_labels: Vec<String>,
    pub cache_staleness_minutes: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GateConfig {
    pub required_pre_merge_gates: Vec<String>,
    pub required_post_merge_gates: Vec<String>,
    /// Gate name → argv overrides
    pub commands: BTreeMap<String, Vec<String>>,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackupConfig {
    pub rollback_enabled: bool,
    /// Regexes selecting files for the file-copy fallback
    pub essential_patterns: Vec<String>,
    pub keep_backups: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Discovery rendezvous timeout
    pub timeout_seconds: u64,
    /// Drain rendezvous timeout; covers the slowest merge in a batch
    pub drain_timeout_seconds: u64,
}

impl Default for MergeConductorConfig {
    fn default() -> Self {
        Self {
            repositories: Vec::new(),
            repository_path: PathBuf::from("."),
            state_dir: PathBuf::from(".merge-conductor"),
            github: GitHubConfig::default(),
            observability: ObservabilityConfig::default(),
            scheduling: SchedulingConfig::default(),
            conflicts: ConflictConfig::default(),
            gates: GateConfig::default(),
            backup: BackupConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            token: None,
            api_url: None,
            requests_per_second: 10,
            burst_capacity: 20,
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            max_concurrent_merges: 3,
            priority_weights: default_priority_weights(),
            maintainers: Vec::new(),
            merge_window: MergeWindow::default(),
            default_merge_method: MergeMethod::Squash,
            require_approval: false,
        }
    }
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            severity_thresholds: SeverityThresholds::default(),
            resource_classes: default_resource_classes(),
            auto_resolvable_classes: vec![ResourceClass::Documentation, ResourceClass::Configuration],
            auto_resolution_strategies: crate::conflict::default_strategies()
                .into_iter()
                .map(|(class, strategy)| (class, strategy.to_string()))
                .collect(),
            expedite_labels: vec!["hotfix".to_string(), "security".to_string()],
            cache_staleness_minutes: 30,
        }
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            required_pre_merge_gates: vec!["lint".to_string(), "test-suite".to_string()],
            required_post_merge_gates: vec!["smoke-test".to_string()],
            commands: BTreeMap::new(),
            timeout_seconds: 600,
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            rollback_enabled: true,
            essential_patterns: default_essential_patterns(),
            keep_backups: 10,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 120,
            drain_timeout_seconds: 3600,
        }
    }
}

impl MergeConductorConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. `merge-conductor.toml` in the working directory
    /// 3. Environment variables (`MERGE_CONDUCTOR_` prefix, `__` between sections)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(None)
    }

    /// As [`load`](Self::load), with an explicit file replacing the default one
    pub fn load_from(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        match path {
            Some(path) => builder = builder.add_source(File::from(path).required(true)),
            None => {
                if Path::new(&format!("{CONFIG_FILE_STEM}.toml")).exists() {
                    builder = builder.add_source(File::with_name(CONFIG_FILE_STEM));
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("repositories")
                .try_parsing(true),
        );

        let mut loaded: MergeConductorConfig = builder.build()?.try_deserialize()?;

        // Special handling for GitHub token
        if loaded.github.token.is_none() {
            if let Ok(token) = std::env::var("GITHUB_TOKEN") {
                loaded.github.token = Some(token);
            }
        }

        Ok(loaded)
    }

    /// Save configuration to file. The token is never written.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let mut redacted = self.clone();
        redacted.github.token = None;
        let toml_content = toml::to_string_pretty(&redacted)?;
        std::fs::write(path, toml_content)?;
        Ok(())
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<(), ConfigError> {
        if Path::new(".env").exists() {
            dotenvy::dotenv().map_err(|e| ConfigError::invalid(".env", e.to_string()))?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }

    /// Check everything that can be wrong before any work starts
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduling.max_concurrent_merges == 0 {
            return Err(ConfigError::invalid("scheduling.max_concurrent_merges", "must be at least 1"));
        }
        for repository in &self.repositories {
            let valid = repository
                .split_once('/')
                .is_some_and(|(owner, name)| !owner.is_empty() && !name.is_empty() && !name.contains('/'));
            if !valid {
                return Err(ConfigError::invalid(
                    "repositories",
                    format!("'{repository}' is not owner/name"),
                ));
            }
        }
        for (label, weight) in &self.scheduling.priority_weights {
            if !(MIN_PRIORITY..=MAX_PRIORITY).contains(weight) {
                return Err(ConfigError::invalid(
                    "scheduling.priority_weights",
                    format!("weight {weight} for '{label}' is outside 1..=10"),
                ));
            }
        }
        let window = &self.scheduling.merge_window;
        if window.start_hour > 23 || window.end_hour > 23 {
            return Err(ConfigError::invalid(
                "scheduling.merge_window",
                "hours must be between 0 and 23",
            ));
        }
        if !self.conflicts.severity_thresholds.is_ascending() {
            return Err(ConfigError::invalid(
                "conflicts.severity_thresholds",
                "low < medium < high < critical is required",
            ));
        }
        if self.gates.timeout_seconds == 0 {
            return Err(ConfigError::invalid("gates.timeout_seconds", "must be positive"));
        }
        for pattern in &self.backup.essential_patterns {
            Regex::new(pattern)
                .map_err(|e| ConfigError::invalid("backup.essential_patterns", e.to_string()))?;
        }

        self.pre_merge_gates()?;
        self.post_merge_gates()?;
        for name in self.gates.commands.keys() {
            name.parse::<QualityGate>()?;
        }
        self.strategies()?;
        self.classifier()?;
        Ok(())
    }

    pub fn pre_merge_gates(&self) -> Result<Vec<QualityGate>, ConfigError> {
        parse_gates(&self.gates.required_pre_merge_gates)
    }

    pub fn post_merge_gates(&self) -> Result<Vec<QualityGate>, ConfigError> {
        parse_gates(&self.gates.required_post_merge_gates)
    }

    pub fn strategies(&self) -> Result<BTreeMap<ResourceClass, ResolutionStrategy>, ConfigError> {
        self.conflicts
            .auto_resolution_strategies
            .iter()
            .map(|(class, name)| Ok((*class, name.parse::<ResolutionStrategy>()?)))
            .collect()
    }

    pub fn classifier(&self) -> Result<ResourceClassifier, ConfigError> {
        Ok(ResourceClassifier::new(&self.conflicts.resource_classes)?)
    }

    pub fn analyzer_settings(&self) -> Result<AnalyzerSettings, ConfigError> {
        Ok(AnalyzerSettings {
            thresholds: self.conflicts.severity_thresholds,
            auto_resolvable_classes: self.conflicts.auto_resolvable_classes.iter().copied().collect(),
            strategies: self.strategies()?,
            expedite_labels: self.conflicts.expedite_labels.clone(),
        })
    }

    pub fn coordinator_settings(&self) -> Result<CoordinatorSettings, ConfigError> {
        Ok(CoordinatorSettings {
            pre_merge_gates: self.pre_merge_gates()?,
            post_merge_gates: self.post_merge_gates()?,
            rollback_enabled: self.backup.rollback_enabled,
            require_approval: self.scheduling.require_approval,
        })
    }

    pub fn priority_calculator(&self) -> PriorityCalculator {
        PriorityCalculator::new(&self.scheduling.priority_weights, &self.scheduling.maintainers)
    }

    pub fn gate_timeout(&self) -> Duration {
        Duration::from_secs(self.gates.timeout_seconds)
    }

    pub fn cache_staleness(&self) -> Duration {
        Duration::from_secs(self.conflicts.cache_staleness_minutes * 60)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync.timeout_seconds)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.sync.drain_timeout_seconds)
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.state_dir.join("backups")
    }

    /// Per-operation merge worktrees live here
    pub fn worktree_dir(&self) -> PathBuf {
        self.state_dir.join("worktrees")
    }
}

fn parse_gates(names: &[String]) -> Result<Vec<QualityGate>, ConfigError> {
    names
        .iter()
        .map(|name| name.parse::<QualityGate>().map_err(ConfigError::from))
        .collect()
}
