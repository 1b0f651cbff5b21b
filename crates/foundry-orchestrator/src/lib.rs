//! Orchestration core of the Foundry control plane.
//!
//! Drives agents through their lifecycle, gates dependent work on human
//! review, and reconciles state left behind by a previous process. All
//! services share one [`Context`]: state changes commit in a store
//! transaction first and publish their events afterwards.
//!
//! # Main types
//!
//! - [`ControlPlane`]: Wires the store, event bus, job queue and every service below.
//! - [`LifecycleManager`]: The agent state machine, including intervention activation.
//! - [`DependencyScheduler`]: Checkpoint- and asset-gated start decisions and phase advancement.
//! - [`CheckpointWorkflow`]: Review checkpoints and assets.
//! - [`AutoApprovalHandler`]: Per-category rules that skip review.
//! - [`RecoveryService`]: Startup reconciliation of orphaned agents and jobs.

/// Auto-approval rules and their retroactive application.
pub mod auto_approval;
/// Review checkpoints and generated assets.
pub mod checkpoint;
/// Shared service handles and the commit-then-publish helper.
pub mod context;
/// The `ControlPlane` facade.
pub mod engine;
/// Human interventions.
pub mod intervention;
/// Agent state machine.
pub mod lifecycle;
/// Project status machine.
pub mod projects;
/// Per-type quality settings.
pub mod quality;
/// Startup recovery.
pub mod recovery;
/// Dependency scheduling and phase advancement.
pub mod scheduler;
/// Workflow snapshots and rollback.
pub mod snapshot;
/// Worker fan-out under leaders.
pub mod spawner;

pub use auto_approval::{AutoApprovalHandler, AutoApprovalSummary};
pub use checkpoint::{CheckpointWorkflow, OutputOutcome, ResolveOutcome};
pub use context::Context;
pub use engine::{ControlPlane, InterventionOutcome};
pub use intervention::InterventionService;
pub use lifecycle::{
    Activation, ActivationOutcome, LifecycleManager, CANCELLED_JOB_REASON, CANCELLED_REASON,
};
pub use projects::ProjectService;
pub use quality::QualitySettings;
pub use recovery::{RecoveryReport, RecoveryService};
pub use scheduler::DependencyScheduler;
pub use snapshot::{Rollback, SnapshotService};
pub use spawner::{SpawnRequest, WorkerSpawner};
