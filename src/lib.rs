// merge-conductor - conflict-aware merge orchestration
// Exposes the core components for the CLI, testing and integration

pub mod backup;
pub mod cli;
pub mod config;
pub mod conflict;
pub mod coordinator;
pub mod external;
pub mod gates;
pub mod git;
pub mod merge_window;
pub mod orchestrator;
pub mod persistence;
pub mod priority;
pub mod provider;
pub mod queue;
pub mod sync;
pub mod telemetry;
pub mod workspace;

// Re-export key types for easy access
pub use backup::{BackupHandle, BackupManager, SnapshotManager};
pub use config::{ConfigError, MergeConductorConfig};
pub use conflict::{ConflictAnalyzer, ConflictReport, ConflictSource, Severity};
pub use coordinator::{MergeCoordinator, MergeOperation, MergePhase};
pub use gates::{QualityGate, QualityGateRunner};
pub use merge_window::MergeWindow;
pub use orchestrator::{Orchestrator, RunStatus, StateStore};
pub use provider::{ChangeRequest, ChangeRequestId, ChangeRequestProvider};
pub use queue::{MergeQueue, QueueItem};
pub use sync::BarrierSynchronizer;
pub use telemetry::{create_merge_span, create_run_span, generate_correlation_id, init_telemetry};
pub use workspace::{Git2Workspace, MergeWorkspace};
