//! Core types and error definitions for the Foundry control plane.
//!
//! This crate provides the foundational types shared across all Foundry crates:
//! the domain records, the error taxonomy, typed configuration and the event bus.
//!
//! # Main types
//!
//! - [`FoundryError`]: Unified error enum, split into validation, state-conflict,
//!   budget-exceeded, transient-provider and ambient failures.
//! - [`FoundryResult`]: Convenience alias for `Result<T, FoundryError>`.
//! - [`Agent`], [`Checkpoint`], [`Asset`], [`Intervention`], [`LlmJob`]: Domain records.
//! - [`PipelineConfig`], [`QueueConfig`]: Typed configuration loaded at startup.
//! - [`EventBus`]: In-process publish/subscribe for [`DomainEvent`]s.
//! - [`OwnershipRegistry`]: Which work this process currently owns.

#[macro_use]
mod macros;

/// Typed pipeline and queue configuration.
pub mod config;
/// Error taxonomy.
pub mod error;
/// Domain events and the event bus.
pub mod events;
/// Out-of-band human interventions.
pub mod intervention;
/// Generation-provider jobs.
pub mod job;
/// In-process ownership of running work.
pub mod ownership;
/// Agents, projects, checkpoints, assets and related records.
pub mod types;

pub use config::{
    AgentTypeConfig, BudgetConfig, BudgetEnforcement, PhaseConfig, PipelineConfig, ProviderGroup,
    ProviderLimit, QueueConfig,
};
pub use error::{FoundryError, FoundryResult};
pub use events::{DomainEvent, EventBus, EventHandler, EventKind, SubscriptionId};
pub use intervention::{
    Intervention, InterventionPriority, InterventionResponse, InterventionStatus,
};
pub use job::{ChatMessage, ChatRole, JobStatus, LlmJob};
pub use ownership::OwnershipRegistry;
pub use types::{
    Agent, AgentStatus, AgentType, Asset, AssetStatus, Checkpoint, CheckpointStatus, Project,
    ProjectStatus, QualitySetting, Resolution, WorkerTask, WorkflowSnapshot,
};
