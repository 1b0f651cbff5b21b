use crate::context::Context;
use crate::lifecycle::start_agent;
use chrono::Utc;
use foundry_core::{
    Agent, AgentStatus, AgentType, CheckpointStatus, DomainEvent, FoundryResult, PipelineConfig,
    ProjectStatus,
};
use foundry_store::Db;
use std::collections::HashMap;
use tracing::{debug, info};
use uuid::Uuid;

/// Whether every prerequisite of `agent_type` is completed and fully signed off.
///
/// A prerequisite type is satisfied only if at least one agent of that type
/// exists in the project and every such agent is `completed` with no
/// pending checkpoint and no pending asset.
pub(crate) fn dependencies_met(
    db: &Db<'_>,
    pipeline: &PipelineConfig,
    project_id: Uuid,
    agent_type: AgentType,
) -> FoundryResult<bool> {
    for prerequisite in pipeline.dependencies(agent_type) {
        let upstream = db.find_agents_by_type(project_id, *prerequisite)?;
        if upstream.is_empty() {
            return Ok(false);
        }
        for agent in &upstream {
            if agent.status != AgentStatus::Completed
                || db.count_pending_checkpoints(agent.id)? > 0
                || db.count_pending_assets(agent.id)? > 0
            {
                return Ok(false);
            }
        }
    }
    Ok(true)
}

fn startable(
    db: &Db<'_>,
    pipeline: &PipelineConfig,
    project_id: Uuid,
) -> FoundryResult<Vec<Agent>> {
    let mut ready = Vec::new();
    for agent in db.list_agents(project_id)? {
        if agent.status == AgentStatus::Pending
            && dependencies_met(db, pipeline, project_id, agent.agent_type)?
        {
            ready.push(agent);
        }
    }
    Ok(ready)
}

/// Advance the project one phase if the current phase is cleared.
///
/// A phase is cleared when its closed checkpoint-type set is non-empty, every
/// type in the set has at least one checkpoint, no checkpoint of those types
/// is pending, the latest checkpoint of each agent for each of those types is
/// approved, and every agent placed in the phase is completed. A rejected
/// checkpoint only stops blocking once a newer one of the same agent and type
/// exists. Clearing the last configured phase completes the
/// project. Returns the new phase ordinal when it moved.
pub(crate) fn advance_phase_if_ready(
    db: &Db<'_>,
    pipeline: &PipelineConfig,
    project_id: Uuid,
    events: &mut Vec<DomainEvent>,
) -> FoundryResult<Option<u32>> {
    let mut project = db.require_project(project_id)?;
    if matches!(
        project.status,
        ProjectStatus::Completed | ProjectStatus::Failed
    ) {
        return Ok(None);
    }
    let current = project.current_phase;
    let Some(phase) = pipeline.phase(current) else {
        return Ok(None);
    };
    if phase.checkpoint_types.is_empty() {
        return Ok(None);
    }

    // Latest checkpoint per (agent, type); superseded rejections do not block,
    // but a pending checkpoint blocks however old it is.
    let checkpoints = db.list_checkpoints(project_id)?;
    let mut latest: HashMap<(Uuid, &str), CheckpointStatus> = HashMap::new();
    for checkpoint in &checkpoints {
        if phase.checkpoint_types.contains(&checkpoint.checkpoint_type) {
            if checkpoint.status == CheckpointStatus::Pending {
                debug!(
                    project_id = %project_id,
                    checkpoint_id = %checkpoint.id,
                    "Phase held by pending checkpoint"
                );
                return Ok(None);
            }
            latest.insert(
                (checkpoint.agent_id, checkpoint.checkpoint_type.as_str()),
                checkpoint.status,
            );
        }
    }
    let every_type_present = phase
        .checkpoint_types
        .iter()
        .all(|t| latest.keys().any(|(_, kind)| *kind == t.as_str()));
    let all_approved = latest.values().all(|s| *s == CheckpointStatus::Approved);
    if !every_type_present || !all_approved {
        return Ok(None);
    }

    let agents = db.list_agents(project_id)?;
    if agents
        .iter()
        .any(|a| a.phase == current && a.status != AgentStatus::Completed)
    {
        return Ok(None);
    }

    let last = pipeline.phases.iter().map(|p| p.ordinal).max().unwrap_or(current);
    project.updated_at = Utc::now();
    if current >= last {
        project.status = ProjectStatus::Completed;
        db.update_project(&project)?;
        info!(project_id = %project_id, phase = current, "Final phase cleared, project completed");
        events.push(DomainEvent::ProjectStatusChanged {
            project_id,
            status: project.status.to_string(),
            reason: Some(format!("phase {} cleared", phase.name)),
        });
        return Ok(None);
    }

    let next = pipeline
        .phases
        .iter()
        .map(|p| p.ordinal)
        .filter(|o| *o > current)
        .min()
        .unwrap_or(current + 1);
    project.current_phase = next;
    db.update_project(&project)?;
    info!(project_id = %project_id, from = current, to = next, "Phase advanced");
    events.push(DomainEvent::PhaseAdvanced {
        project_id,
        from: current,
        to: next,
    });
    Ok(Some(next))
}

/// Decides which pending agents may start.
///
/// Dependencies are checkpoint- and asset-gated: an upstream agent that is
/// completed but still has output awaiting sign-off keeps its dependents
/// blocked.
#[derive(Clone)]
pub struct DependencyScheduler {
    ctx: Context,
}

impl DependencyScheduler {
    /// Scheduler over the shared context.
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Whether every prerequisite of `agent_type` is completed with no
    /// pending checkpoint or asset.
    pub fn can_start(&self, agent_type: AgentType, project_id: Uuid) -> FoundryResult<bool> {
        self.ctx
            .read(|db| dependencies_met(db, &self.ctx.pipeline, project_id, agent_type))
    }

    /// Every pending agent of the project whose dependencies are met.
    pub fn get_next_startable(&self, project_id: Uuid) -> FoundryResult<Vec<Agent>> {
        self.ctx.read(|db| {
            db.require_project(project_id)?;
            startable(db, &self.ctx.pipeline, project_id)
        })
    }

    /// Start every startable agent, unless the project is not running.
    pub fn start_ready(&self, project_id: Uuid) -> FoundryResult<Vec<Agent>> {
        self.ctx.commit(|db, events| {
            let project = db.require_project(project_id)?;
            if project.status != ProjectStatus::Running {
                debug!(project_id = %project_id, status = %project.status, "Project not running, nothing started");
                return Ok(Vec::new());
            }
            let mut started = Vec::new();
            for mut agent in startable(db, &self.ctx.pipeline, project_id)? {
                start_agent(db, &mut agent, None, events)?;
                started.push(agent);
            }
            Ok(started)
        })
    }

    /// Run the phase-advancement check on its own.
    pub fn check_phase_advancement(&self, project_id: Uuid) -> FoundryResult<Option<u32>> {
        self.ctx
            .commit(|db, events| advance_phase_if_ready(db, &self.ctx.pipeline, project_id, events))
    }
}
