use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Every gate the runner knows how to execute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QualityGate {
    Lint,
    TestSuite,
    SecurityScan,
    IntegrationTest,
    DeployTest,
    SmokeTest,
    /// Post-rollback check that the working tree is clean
    RollbackValidation,
}

impl QualityGate {
    pub const ALL: [QualityGate; 7] = [
        QualityGate::Lint,
        QualityGate::TestSuite,
        QualityGate::SecurityScan,
        QualityGate::IntegrationTest,
        QualityGate::DeployTest,
        QualityGate::SmokeTest,
        QualityGate::RollbackValidation,
    ];

    pub fn name(self) -> &'static str {
        match self {
            QualityGate::Lint => "lint",
            QualityGate::TestSuite => "test-suite",
            QualityGate::SecurityScan => "security-scan",
            QualityGate::IntegrationTest => "integration-test",
            QualityGate::DeployTest => "deploy-test",
            QualityGate::SmokeTest => "smoke-test",
            QualityGate::RollbackValidation => "rollback-validation",
        }
    }

    /// Whether success also requires the command to print nothing
    pub fn requires_empty_output(self) -> bool {
        self == QualityGate::RollbackValidation
    }
}

impl fmt::Display for QualityGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for QualityGate {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        QualityGate::ALL
            .into_iter()
            .find(|gate| gate.name() == s)
            .ok_or_else(|| GateError::UnknownGate(s.to_string()))
    }
}

/// Program plus arguments, run without a shell
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl GateCommand {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// First element is the program
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

impl fmt::Display for GateCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityGateResult {
    pub gate: String,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub duration: Duration,
    pub output: String,
    pub errors: Vec<String>,
}

/// Results of a fail-fast run; `failed_gate` names the gate that stopped it
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SequenceOutcome {
    pub results: Vec<QualityGateResult>,
    pub failed_gate: Option<String>,
}

impl SequenceOutcome {
    pub fn passed(&self) -> bool {
        self.failed_gate.is_none()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GateError {
    #[error("Unknown quality gate '{0}'")]
    UnknownGate(String),
    #[error("Gate '{0}' has an empty command line")]
    EmptyCommand(String),
}
