//! Job queue for calls to external generation providers.
//!
//! Jobs are persisted in the store, polled in priority order, gated by
//! per-provider and per-group admission control, and executed on a bounded
//! pool of tokio tasks. Transient provider failures are retried up to a
//! fixed bound; submissions are refused once a project's hard token budget
//! is spent.
//!
//! # Main types
//!
//! - [`JobQueue`]: Poller, dispatcher and retry loop.
//! - [`ProviderClient`]: Trait implemented by generation providers.
//! - [`AdmissionController`]: Concurrency ceilings per provider and group.
//! - [`BudgetGuard`]: Per-project token accounting.

/// Per-provider and per-group concurrency ceilings.
pub mod admission;
/// Per-project token budget enforcement.
pub mod budget;
/// Provider client trait and registry.
pub mod provider;
/// Poller, worker pool and job outcome handling.
pub mod queue;

pub use admission::{AdmissionController, AdmissionPermit};
pub use budget::BudgetGuard;
pub use provider::{ChatResponse, ProviderClient, ProviderRegistry};
pub use queue::{CompletionCallback, JobQueue, JobRequest};
