use crate::context::Context;
use crate::lifecycle::resume_agent;
use chrono::Utc;
use foundry_core::{
    AgentStatus, DomainEvent, FoundryError, FoundryResult, Intervention, InterventionPriority,
    InterventionResponse, InterventionStatus, ProjectStatus,
};
use tracing::{info, warn};
use uuid::Uuid;

/// Reason recorded when an urgent intervention pauses its project.
pub const URGENT_PAUSE_REASON: &str = "urgent intervention";

/// Author name used for operator replies.
pub const HUMAN_AUTHOR: &str = "human";

/// Out-of-band human messages to a project's agents.
#[derive(Clone)]
pub struct InterventionService {
    ctx: Context,
}

impl InterventionService {
    /// Service over the shared context.
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Record an intervention. An urgent one pauses a running project so
    /// nothing new is scheduled until an operator resumes it.
    pub fn create(
        &self,
        project_id: Uuid,
        target_agent_id: Option<Uuid>,
        message: &str,
        priority: InterventionPriority,
    ) -> FoundryResult<Intervention> {
        if message.trim().is_empty() {
            return Err(FoundryError::Validation(
                "intervention message is empty".into(),
            ));
        }
        self.ctx.commit(|db, events| {
            let mut project = db.require_project(project_id)?;
            if let Some(target) = target_agent_id {
                if db.require_agent(target)?.project_id != project_id {
                    return Err(FoundryError::Validation(format!(
                        "agent {target} does not belong to project {project_id}"
                    )));
                }
            }

            let intervention = Intervention::new(project_id, target_agent_id, message, priority);
            db.insert_intervention(&intervention)?;

            let urgent = priority == InterventionPriority::Urgent;
            if urgent && project.status == ProjectStatus::Running {
                project.status = ProjectStatus::Paused;
                project.updated_at = Utc::now();
                db.update_project(&project)?;
                warn!(project_id = %project_id, intervention_id = %intervention.id, "Urgent intervention paused project");
                events.push(DomainEvent::ProjectStatusChanged {
                    project_id,
                    status: project.status.to_string(),
                    reason: Some(URGENT_PAUSE_REASON.to_string()),
                });
            }
            info!(
                project_id = %project_id,
                intervention_id = %intervention.id,
                priority = priority.as_str(),
                "Intervention created"
            );
            events.push(DomainEvent::InterventionCreated {
                project_id,
                intervention_id: intervention.id,
                target_agent_id,
                urgent,
            });
            Ok(intervention)
        })
    }

    /// Intervention by id.
    pub fn get(&self, intervention_id: Uuid) -> FoundryResult<Intervention> {
        self.ctx.read(|db| db.require_intervention(intervention_id))
    }

    /// Interventions of a project, oldest first.
    pub fn list(&self, project_id: Uuid) -> FoundryResult<Vec<Intervention>> {
        self.ctx.read(|db| {
            db.require_project(project_id)?;
            db.list_interventions(project_id)
        })
    }

    /// Append a reply to the thread. A reply from anyone other than the
    /// target itself wakes a target that is waiting for a response.
    pub fn respond(
        &self,
        intervention_id: Uuid,
        author: &str,
        message: &str,
    ) -> FoundryResult<Intervention> {
        if message.trim().is_empty() {
            return Err(FoundryError::Validation("response message is empty".into()));
        }
        self.ctx.commit(|db, events| {
            let mut intervention = db.require_intervention(intervention_id)?;
            if intervention.status == InterventionStatus::Resolved {
                return Err(FoundryError::conflict(
                    "intervention",
                    intervention_id,
                    intervention.status.as_str(),
                    "respond to",
                ));
            }
            intervention.responses.push(InterventionResponse {
                author: author.to_string(),
                message: message.to_string(),
                at: Utc::now(),
            });
            intervention.status = InterventionStatus::Delivered;
            db.update_intervention(&intervention)?;

            if let Some(target) = intervention.target_agent_id {
                let mut agent = db.require_agent(target)?;
                if agent.status == AgentStatus::WaitingResponse && author != target.to_string() {
                    resume_agent(db, &mut agent, events)?;
                }
            }
            events.push(DomainEvent::InterventionResponded {
                project_id: intervention.project_id,
                intervention_id,
                author: author.to_string(),
            });
            Ok(intervention)
        })
    }

    /// Close an intervention.
    pub fn resolve(&self, intervention_id: Uuid) -> FoundryResult<Intervention> {
        self.ctx.commit(|db, _| {
            let mut intervention = db.require_intervention(intervention_id)?;
            if intervention.status == InterventionStatus::Resolved {
                return Err(FoundryError::conflict(
                    "intervention",
                    intervention_id,
                    intervention.status.as_str(),
                    "resolve",
                ));
            }
            intervention.status = InterventionStatus::Resolved;
            db.update_intervention(&intervention)?;
            info!(intervention_id = %intervention_id, "Intervention resolved");
            Ok(intervention)
        })
    }
}
