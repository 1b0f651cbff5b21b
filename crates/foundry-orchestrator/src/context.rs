use foundry_core::{
    AgentStatus, DomainEvent, EventBus, FoundryResult, OwnershipRegistry, PipelineConfig,
};
use foundry_store::{Db, Store};
use std::sync::Arc;

/// Shared handles every orchestration service works through.
///
/// State changes go through [`Context::commit`]: the closure mutates rows
/// inside one store transaction and collects the events it caused; those
/// events are published only after the transaction commits, and outside the
/// store lock, so subscribers never observe uncommitted state and may call
/// back into the services.
#[derive(Clone)]
pub struct Context {
    /// Persistent state.
    pub store: Arc<Store>,
    /// Where committed events go.
    pub bus: Arc<EventBus>,
    /// Dependency table and phase layout.
    pub pipeline: Arc<PipelineConfig>,
    /// Agents with a live `running` owner in this process.
    pub running: Arc<OwnershipRegistry>,
}

impl Context {
    /// Context with an empty ownership registry.
    pub fn new(store: Arc<Store>, bus: Arc<EventBus>, pipeline: Arc<PipelineConfig>) -> Self {
        Self {
            store,
            bus,
            pipeline,
            running: Arc::new(OwnershipRegistry::new()),
        }
    }

    /// Run `f` in a transaction, then update ownership and publish its events.
    pub(crate) fn commit<T>(
        &self,
        f: impl FnOnce(&Db<'_>, &mut Vec<DomainEvent>) -> FoundryResult<T>,
    ) -> FoundryResult<T> {
        let mut events = Vec::new();
        let out = self.store.transaction(|db| f(db, &mut events))?;
        self.track_ownership(&events);
        self.bus.publish_all(&events);
        Ok(out)
    }

    pub(crate) fn read<T>(&self, f: impl FnOnce(&Db<'_>) -> FoundryResult<T>) -> FoundryResult<T> {
        self.store.read(f)
    }

    fn track_ownership(&self, events: &[DomainEvent]) {
        for event in events {
            match event {
                DomainEvent::AgentStarted { agent_id, .. }
                | DomainEvent::AgentResumed { agent_id, .. }
                | DomainEvent::AgentActivated { agent_id, .. } => {
                    self.running.acquire(*agent_id);
                }
                DomainEvent::AgentPaused { agent_id, .. }
                | DomainEvent::AgentWaiting { agent_id, .. }
                | DomainEvent::AgentCompleted { agent_id, .. }
                | DomainEvent::AgentFailed { agent_id, .. }
                | DomainEvent::AgentInterrupted { agent_id, .. }
                | DomainEvent::AgentRetried { agent_id, .. } => {
                    self.running.release(*agent_id);
                }
                DomainEvent::CheckpointResolved {
                    agent_id,
                    agent_status,
                    ..
                } => {
                    if *agent_status == AgentStatus::Running {
                        self.running.acquire(*agent_id);
                    } else {
                        self.running.release(*agent_id);
                    }
                }
                _ => {}
            }
        }
    }
}
