//! Quality gate runner
//!
//! Each gate maps to one external command. A gate passes when its command
//! exits 0 within the wall-clock ceiling; everything else (timeout, spawn
//! failure, non-zero exit) produces a failed result rather than an error.

pub mod types;

use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::external::{CommandError, CommandExecutor};

pub use types::{GateCommand, GateError, QualityGate, QualityGateResult, SequenceOutcome};

pub const DEFAULT_GATE_TIMEOUT: Duration = Duration::from_secs(600);

pub fn default_gate_commands() -> HashMap<QualityGate, GateCommand> {
    HashMap::from([
        (
            QualityGate::Lint,
            GateCommand::new("cargo", &["clippy", "--all-targets", "--", "-D", "warnings"]),
        ),
        (QualityGate::TestSuite, GateCommand::new("cargo", &["test"])),
        (QualityGate::SecurityScan, GateCommand::new("cargo", &["audit"])),
        (
            QualityGate::IntegrationTest,
            GateCommand::new("cargo", &["test", "--tests"]),
        ),
        (
            QualityGate::DeployTest,
            GateCommand::new("cargo", &["build", "--release"]),
        ),
        (QualityGate::SmokeTest, GateCommand::new("cargo", &["check"])),
        (
            QualityGate::RollbackValidation,
            GateCommand::new("git", &["status", "--porcelain"]),
        ),
    ])
}

pub struct QualityGateRunner {
    executor: Arc<dyn CommandExecutor>,
    commands: HashMap<QualityGate, GateCommand>,
    timeout: Duration,
    working_dir: Option<PathBuf>,
}

impl QualityGateRunner {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            executor,
            commands: default_gate_commands(),
            timeout: DEFAULT_GATE_TIMEOUT,
            working_dir: None,
        }
    }

    /// Layer configured `gate name -> argv` overrides over the defaults.
    /// Unknown names and empty command lines are rejected.
    pub fn with_overrides(mut self, overrides: &BTreeMap<String, Vec<String>>) -> Result<Self, GateError> {
        for (name, argv) in overrides {
            let gate: QualityGate = name.parse()?;
            let command =
                GateCommand::from_argv(argv).ok_or_else(|| GateError::EmptyCommand(name.clone()))?;
            self.commands.insert(gate, command);
        }
        Ok(self)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn command_for(&self, gate: QualityGate) -> Option<&GateCommand> {
        self.commands.get(&gate)
    }

    pub async fn run_gate(&self, gate: QualityGate) -> QualityGateResult {
        self.run_gate_at(gate, self.working_dir.as_deref()).await
    }

    async fn run_gate_at(&self, gate: QualityGate, dir: Option<&Path>) -> QualityGateResult {
        let timestamp = Utc::now();
        let started = Instant::now();

        let Some(command) = self.commands.get(&gate) else {
            return failed(gate.name(), timestamp, started.elapsed(), "no command configured".to_string());
        };

        let execution = self
            .executor
            .execute(
                &command.program,
                &command.args,
                dir,
                self.timeout,
            )
            .await;
        let duration = started.elapsed();

        let result = match execution {
            Ok(output) => {
                let mut errors = Vec::new();
                if !output.success() {
                    errors.push(format!("`{command}` exited with status {}", output.status_code));
                }
                if gate.requires_empty_output() && !output.stdout.trim().is_empty() {
                    let dirty = output.stdout.lines().filter(|l| !l.trim().is_empty()).count();
                    errors.push(format!("working tree is not clean: {dirty} changed paths"));
                }
                QualityGateResult {
                    gate: gate.name().to_string(),
                    timestamp,
                    success: errors.is_empty(),
                    duration,
                    output: combine_output(&output.stdout, &output.stderr),
                    errors,
                }
            }
            Err(CommandError::Timeout { timeout_ms }) => failed(
                gate.name(),
                timestamp,
                duration,
                format!("`{command}` timed out after {timeout_ms}ms"),
            ),
            Err(e) => failed(gate.name(), timestamp, duration, format!("`{command}` failed to run: {e}")),
        };

        if result.success {
            info!(gate = %gate, duration_ms = duration.as_millis() as u64, "Quality gate passed");
        } else {
            warn!(
                gate = %gate,
                duration_ms = duration.as_millis() as u64,
                errors = ?result.errors,
                "Quality gate failed"
            );
        }
        result
    }

    /// Run a gate by its configured name; unknown names fail
    pub async fn run_gate_named(&self, name: &str) -> QualityGateResult {
        match name.parse::<QualityGate>() {
            Ok(gate) => self.run_gate(gate).await,
            Err(e) => failed(name, Utc::now(), Duration::ZERO, format!("unknown gate: {e}")),
        }
    }

    /// Run gates in order, stopping at the first failure
    pub async fn run_sequence(&self, gates: &[QualityGate]) -> SequenceOutcome {
        self.sequence_at(gates, self.working_dir.as_deref()).await
    }

    /// As [`run_sequence`](Self::run_sequence), inside `dir` instead of the
    /// configured working directory
    pub async fn run_sequence_in(&self, gates: &[QualityGate], dir: &Path) -> SequenceOutcome {
        self.sequence_at(gates, Some(dir)).await
    }

    async fn sequence_at(&self, gates: &[QualityGate], dir: Option<&Path>) -> SequenceOutcome {
        let mut outcome = SequenceOutcome::default();
        for gate in gates {
            let result = self.run_gate_at(*gate, dir).await;
            let passed = result.success;
            outcome.results.push(result);
            if !passed {
                outcome.failed_gate = Some(gate.name().to_string());
                break;
            }
        }
        outcome
    }
}

fn failed(
    gate: &str,
    timestamp: chrono::DateTime<Utc>,
    duration: Duration,
    error: String,
) -> QualityGateResult {
    QualityGateResult {
        gate: gate.to_string(),
        timestamp,
        success: false,
        duration,
        output: String::new(),
        errors: vec![error],
    }
}

fn combine_output(stdout: &str, stderr: &str) -> String {
    match (stdout.trim(), stderr.trim()) {
        ("", err) => err.to_string(),
        (out, "") => out.to_string(),
        (out, err) => format!("{out}\n{err}"),
    }
}
