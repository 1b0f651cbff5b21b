//! In-process publish/subscribe for domain state changes.
//!
//! Components publish [`DomainEvent`]s; observers (transport, logging,
//! metrics) subscribe per [`EventKind`]. Delivery is synchronous and in
//! subscription order. A failing or panicking handler is logged and skipped,
//! so it never stops the remaining handlers or the publisher.

use crate::error::FoundryResult;
use crate::job::JobStatus;
use crate::types::{AgentStatus, CheckpointStatus, Resolution};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, warn};
use uuid::Uuid;

/// Subscription key: one per [`DomainEvent`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// See [`DomainEvent::AgentStarted`].
    AgentStarted,
    /// See [`DomainEvent::AgentProgress`].
    AgentProgress,
    /// See [`DomainEvent::AgentPaused`].
    AgentPaused,
    /// See [`DomainEvent::AgentResumed`].
    AgentResumed,
    /// See [`DomainEvent::AgentWaiting`].
    AgentWaiting,
    /// See [`DomainEvent::AgentCompleted`].
    AgentCompleted,
    /// See [`DomainEvent::AgentFailed`].
    AgentFailed,
    /// See [`DomainEvent::AgentRetried`].
    AgentRetried,
    /// See [`DomainEvent::AgentInterrupted`].
    AgentInterrupted,
    /// See [`DomainEvent::AgentActivated`].
    AgentActivated,
    /// See [`DomainEvent::CheckpointCreated`].
    CheckpointCreated,
    /// See [`DomainEvent::CheckpointResolved`].
    CheckpointResolved,
    /// See [`DomainEvent::AssetCreated`].
    AssetCreated,
    /// See [`DomainEvent::AssetResolved`].
    AssetResolved,
    /// See [`DomainEvent::PhaseAdvanced`].
    PhaseAdvanced,
    /// See [`DomainEvent::ProjectStatusChanged`].
    ProjectStatusChanged,
    /// See [`DomainEvent::InterventionCreated`].
    InterventionCreated,
    /// See [`DomainEvent::InterventionResponded`].
    InterventionResponded,
    /// See [`DomainEvent::JobSubmitted`].
    JobSubmitted,
    /// See [`DomainEvent::JobStarted`].
    JobStarted,
    /// See [`DomainEvent::JobRetried`].
    JobRetried,
    /// See [`DomainEvent::JobCompleted`].
    JobCompleted,
    /// See [`DomainEvent::JobFailed`].
    JobFailed,
    /// See [`DomainEvent::JobRequeued`].
    JobRequeued,
}

impl EventKind {
    /// Every kind, in declaration order.
    pub const ALL: &'static [EventKind] = &[
        EventKind::AgentStarted,
        EventKind::AgentProgress,
        EventKind::AgentPaused,
        EventKind::AgentResumed,
        EventKind::AgentWaiting,
        EventKind::AgentCompleted,
        EventKind::AgentFailed,
        EventKind::AgentRetried,
        EventKind::AgentInterrupted,
        EventKind::AgentActivated,
        EventKind::CheckpointCreated,
        EventKind::CheckpointResolved,
        EventKind::AssetCreated,
        EventKind::AssetResolved,
        EventKind::PhaseAdvanced,
        EventKind::ProjectStatusChanged,
        EventKind::InterventionCreated,
        EventKind::InterventionResponded,
        EventKind::JobSubmitted,
        EventKind::JobStarted,
        EventKind::JobRetried,
        EventKind::JobCompleted,
        EventKind::JobFailed,
        EventKind::JobRequeued,
    ];
}

/// A domain state change, as seen by observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    /// An agent entered `running` from `pending` or a cold start.
    AgentStarted {
        /// Owning project.
        project_id: Uuid,
        /// Agent concerned.
        agent_id: Uuid,
        /// When it happened.
        at: DateTime<Utc>,
    },
    /// An agent reported progress or changed its task label.
    AgentProgress {
        /// Owning project.
        project_id: Uuid,
        /// Agent concerned.
        agent_id: Uuid,
        /// Progress in percent.
        progress: u8,
        /// Task label, if any.
        current_task: Option<String>,
    },
    /// A running agent was paused.
    AgentPaused {
        /// Owning project.
        project_id: Uuid,
        /// Agent concerned.
        agent_id: Uuid,
        /// Why it happened.
        reason: String,
    },
    /// A paused or waiting agent is running again.
    AgentResumed {
        /// Owning project.
        project_id: Uuid,
        /// Agent concerned.
        agent_id: Uuid,
    },
    /// Agent moved to `waiting_approval` or `waiting_response`.
    AgentWaiting {
        /// Owning project.
        project_id: Uuid,
        /// Agent concerned.
        agent_id: Uuid,
        /// New status.
        status: AgentStatus,
    },
    /// An agent reached `completed`.
    AgentCompleted {
        /// Owning project.
        project_id: Uuid,
        /// Agent concerned.
        agent_id: Uuid,
        /// When it happened.
        at: DateTime<Utc>,
    },
    /// An agent reached `failed`.
    AgentFailed {
        /// Owning project.
        project_id: Uuid,
        /// Agent concerned.
        agent_id: Uuid,
        /// Why it happened.
        reason: String,
    },
    /// A failed or interrupted agent was reset to `pending`.
    AgentRetried {
        /// Owning project.
        project_id: Uuid,
        /// Agent concerned.
        agent_id: Uuid,
        /// Retries used so far.
        retry_count: u32,
    },
    /// Recovery found the agent running without an owner.
    AgentInterrupted {
        /// Owning project.
        project_id: Uuid,
        /// Agent concerned.
        agent_id: Uuid,
        /// Status before the change.
        previous_status: AgentStatus,
    },
    /// An agent was brought to `running` for an intervention.
    AgentActivated {
        /// Owning project.
        project_id: Uuid,
        /// Agent concerned.
        agent_id: Uuid,
        /// Intervention concerned.
        intervention_id: Uuid,
    },
    /// A checkpoint was opened, possibly already auto-approved.
    CheckpointCreated {
        /// Owning project.
        project_id: Uuid,
        /// Agent concerned.
        agent_id: Uuid,
        /// Checkpoint concerned.
        checkpoint_id: Uuid,
        /// Checkpoint category.
        checkpoint_type: String,
        /// New status.
        status: CheckpointStatus,
    },
    /// A pending checkpoint was approved, rejected or sent back.
    CheckpointResolved {
        /// Owning project.
        project_id: Uuid,
        /// Agent concerned.
        agent_id: Uuid,
        /// Checkpoint concerned.
        checkpoint_id: Uuid,
        /// How it was resolved.
        resolution: Resolution,
        /// Agent status after the resolution was applied.
        agent_status: AgentStatus,
    },
    /// A generated asset was recorded.
    AssetCreated {
        /// Owning project.
        project_id: Uuid,
        /// Asset concerned.
        asset_id: Uuid,
        /// Asset category.
        category: String,
        /// Whether a rule approved it on creation.
        auto_approved: bool,
    },
    /// A pending asset was approved or rejected.
    AssetResolved {
        /// Owning project.
        project_id: Uuid,
        /// Asset concerned.
        asset_id: Uuid,
        /// `true` when approved.
        approved: bool,
    },
    /// The project moved to its next phase.
    PhaseAdvanced {
        /// Owning project.
        project_id: Uuid,
        /// Phase ordinal left.
        from: u32,
        /// Phase ordinal entered.
        to: u32,
    },
    /// The project status changed.
    ProjectStatusChanged {
        /// Owning project.
        project_id: Uuid,
        /// New status.
        status: String,
        /// Why it happened.
        reason: Option<String>,
    },
    /// A human intervention was recorded.
    InterventionCreated {
        /// Owning project.
        project_id: Uuid,
        /// Intervention concerned.
        intervention_id: Uuid,
        /// Targeted agent; `None` for every agent.
        target_agent_id: Option<Uuid>,
        /// Whether it paused the project.
        urgent: bool,
    },
    /// A reply was appended to an intervention thread.
    InterventionResponded {
        /// Owning project.
        project_id: Uuid,
        /// Intervention concerned.
        intervention_id: Uuid,
        /// Who replied.
        author: String,
    },
    /// A provider job was queued.
    JobSubmitted {
        /// Owning project.
        project_id: Uuid,
        /// Job concerned.
        job_id: Uuid,
        /// Provider the job runs against.
        provider_id: String,
    },
    /// A provider job was claimed and dispatched.
    JobStarted {
        /// Owning project.
        project_id: Uuid,
        /// Job concerned.
        job_id: Uuid,
        /// Provider the job runs against.
        provider_id: String,
    },
    /// A provider job failed transiently and is pending again.
    JobRetried {
        /// Owning project.
        project_id: Uuid,
        /// Job concerned.
        job_id: Uuid,
        /// Retries used so far.
        retry_count: u32,
        /// Error text.
        error: String,
    },
    /// A provider job finished with a response.
    JobCompleted {
        /// Owning project.
        project_id: Uuid,
        /// Job concerned.
        job_id: Uuid,
        /// Prompt tokens billed.
        input_tokens: u64,
        /// Completion tokens billed.
        output_tokens: u64,
    },
    /// A provider job failed for good.
    JobFailed {
        /// Owning project.
        project_id: Uuid,
        /// Job concerned.
        job_id: Uuid,
        /// Error text.
        error: String,
    },
    /// Recovery returned an orphaned job to `pending`.
    JobRequeued {
        /// Owning project.
        project_id: Uuid,
        /// Job concerned.
        job_id: Uuid,
        /// Status before the change.
        previous_status: JobStatus,
    },
}

impl DomainEvent {
    /// Subscription key of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            DomainEvent::AgentStarted { .. } => EventKind::AgentStarted,
            DomainEvent::AgentProgress { .. } => EventKind::AgentProgress,
            DomainEvent::AgentPaused { .. } => EventKind::AgentPaused,
            DomainEvent::AgentResumed { .. } => EventKind::AgentResumed,
            DomainEvent::AgentWaiting { .. } => EventKind::AgentWaiting,
            DomainEvent::AgentCompleted { .. } => EventKind::AgentCompleted,
            DomainEvent::AgentFailed { .. } => EventKind::AgentFailed,
            DomainEvent::AgentRetried { .. } => EventKind::AgentRetried,
            DomainEvent::AgentInterrupted { .. } => EventKind::AgentInterrupted,
            DomainEvent::AgentActivated { .. } => EventKind::AgentActivated,
            DomainEvent::CheckpointCreated { .. } => EventKind::CheckpointCreated,
            DomainEvent::CheckpointResolved { .. } => EventKind::CheckpointResolved,
            DomainEvent::AssetCreated { .. } => EventKind::AssetCreated,
            DomainEvent::AssetResolved { .. } => EventKind::AssetResolved,
            DomainEvent::PhaseAdvanced { .. } => EventKind::PhaseAdvanced,
            DomainEvent::ProjectStatusChanged { .. } => EventKind::ProjectStatusChanged,
            DomainEvent::InterventionCreated { .. } => EventKind::InterventionCreated,
            DomainEvent::InterventionResponded { .. } => EventKind::InterventionResponded,
            DomainEvent::JobSubmitted { .. } => EventKind::JobSubmitted,
            DomainEvent::JobStarted { .. } => EventKind::JobStarted,
            DomainEvent::JobRetried { .. } => EventKind::JobRetried,
            DomainEvent::JobCompleted { .. } => EventKind::JobCompleted,
            DomainEvent::JobFailed { .. } => EventKind::JobFailed,
            DomainEvent::JobRequeued { .. } => EventKind::JobRequeued,
        }
    }

    /// Every event belongs to exactly one project.
    pub fn project_id(&self) -> Uuid {
        match self {
            DomainEvent::AgentStarted { project_id, .. }
            | DomainEvent::AgentProgress { project_id, .. }
            | DomainEvent::AgentPaused { project_id, .. }
            | DomainEvent::AgentResumed { project_id, .. }
            | DomainEvent::AgentWaiting { project_id, .. }
            | DomainEvent::AgentCompleted { project_id, .. }
            | DomainEvent::AgentFailed { project_id, .. }
            | DomainEvent::AgentRetried { project_id, .. }
            | DomainEvent::AgentInterrupted { project_id, .. }
            | DomainEvent::AgentActivated { project_id, .. }
            | DomainEvent::CheckpointCreated { project_id, .. }
            | DomainEvent::CheckpointResolved { project_id, .. }
            | DomainEvent::AssetCreated { project_id, .. }
            | DomainEvent::AssetResolved { project_id, .. }
            | DomainEvent::PhaseAdvanced { project_id, .. }
            | DomainEvent::ProjectStatusChanged { project_id, .. }
            | DomainEvent::InterventionCreated { project_id, .. }
            | DomainEvent::InterventionResponded { project_id, .. }
            | DomainEvent::JobSubmitted { project_id, .. }
            | DomainEvent::JobStarted { project_id, .. }
            | DomainEvent::JobRetried { project_id, .. }
            | DomainEvent::JobCompleted { project_id, .. }
            | DomainEvent::JobFailed { project_id, .. }
            | DomainEvent::JobRequeued { project_id, .. } => *project_id,
        }
    }
}

/// A subscriber callback. Returning `Err` is logged and isolated.
pub type EventHandler = Arc<dyn Fn(&DomainEvent) -> FoundryResult<()> + Send + Sync>;

/// Handle returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Synchronous, thread-safe event bus. Pass it explicitly (`Arc<EventBus>`)
/// to every component that publishes or subscribes.
pub struct EventBus {
    next_id: AtomicU64,
    subscribers: RwLock<HashMap<EventKind, Vec<(SubscriptionId, EventHandler)>>>,
}

impl EventBus {
    /// Bus with no subscribers.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    /// Register `handler` for events of exactly `kind`.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&DomainEvent) -> FoundryResult<()> + Send + Sync + 'static,
    {
        self.subscribe_handler(kind, Arc::new(handler))
    }

    /// Register an already shared handler, e.g. one used for several kinds.
    pub fn subscribe_handler(&self, kind: EventKind, handler: EventHandler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .write()
            .entry(kind)
            .or_default()
            .push((id, handler));
        id
    }

    /// Register one handler for every event kind (what a transport layer does).
    pub fn subscribe_all<F>(&self, handler: F) -> Vec<(EventKind, SubscriptionId)>
    where
        F: Fn(&DomainEvent) -> FoundryResult<()> + Send + Sync + 'static,
    {
        let handler: EventHandler = Arc::new(handler);
        EventKind::ALL
            .iter()
            .map(|kind| (*kind, self.subscribe_handler(*kind, Arc::clone(&handler))))
            .collect()
    }

    /// Remove a subscription. Returns `false` if it was not registered for `kind`.
    pub fn unsubscribe(&self, kind: EventKind, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let Some(handlers) = subscribers.get_mut(&kind) else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|(sub, _)| *sub != id);
        before != handlers.len()
    }

    /// Deliver `event` to every handler registered for its kind, in
    /// subscription order. Returns how many handlers succeeded.
    pub fn publish(&self, event: &DomainEvent) -> usize {
        let kind = event.kind();
        // Snapshot the list so handlers may (un)subscribe without deadlocking.
        let handlers: Vec<(SubscriptionId, EventHandler)> = self
            .subscribers
            .read()
            .get(&kind)
            .cloned()
            .unwrap_or_default();

        let mut delivered = 0;
        for (id, handler) in &handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    warn!(kind = ?kind, subscription = id.0, error = %e, "event handler failed");
                }
                Err(_) => {
                    error!(kind = ?kind, subscription = id.0, "event handler panicked");
                }
            }
        }
        delivered
    }

    /// Publish several events in order.
    pub fn publish_all(&self, events: &[DomainEvent]) {
        for event in events {
            self.publish(event);
        }
    }

    /// Handlers currently registered for `kind`.
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.subscribers.read().get(&kind).map_or(0, Vec::len)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
