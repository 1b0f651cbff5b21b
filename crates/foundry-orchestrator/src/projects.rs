use crate::context::Context;
use chrono::Utc;
use foundry_core::{
    Agent, DomainEvent, FoundryError, FoundryResult, Project, ProjectStatus,
};
use foundry_store::Db;
use tracing::info;
use uuid::Uuid;

/// Project creation and the project-level status machine.
///
/// `draft -> running <-> paused`; `completed` is reached through phase
/// advancement. Project pause is a scheduling gate: it stops
/// [`DependencyScheduler::start_ready`](crate::DependencyScheduler::start_ready)
/// from starting anything but leaves running agents alone. Resuming never
/// restarts interrupted or failed agents; they need an explicit retry.
#[derive(Clone)]
pub struct ProjectService {
    ctx: Context,
}

impl ProjectService {
    /// Service over the shared context.
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Create a draft project seeded with one pending agent per configured
    /// leader type. Workers are spawned later by their leaders.
    pub fn create_project(&self, name: &str) -> FoundryResult<(Project, Vec<Agent>)> {
        let name = name.trim();
        if name.is_empty() {
            return Err(FoundryError::Validation("project name is empty".into()));
        }
        self.ctx.commit(|db, events| {
            let project = Project::new(name);
            db.insert_project(&project)?;
            let mut agents = Vec::new();
            for entry in &self.ctx.pipeline.agents {
                if entry.agent_type.is_worker() {
                    continue;
                }
                let agent = Agent::new(project.id, entry.agent_type, entry.phase);
                db.insert_agent(&agent)?;
                agents.push(agent);
            }
            info!(project_id = %project.id, name, agents = agents.len(), "Project created");
            events.push(DomainEvent::ProjectStatusChanged {
                project_id: project.id,
                status: project.status.to_string(),
                reason: Some("created".into()),
            });
            Ok((project, agents))
        })
    }

    /// Project by id.
    pub fn get(&self, project_id: Uuid) -> FoundryResult<Project> {
        self.ctx.read(|db| db.require_project(project_id))
    }

    /// All projects, oldest first.
    pub fn list(&self) -> FoundryResult<Vec<Project>> {
        self.ctx.read(|db| db.list_projects())
    }

    /// `draft -> running`.
    pub fn start_project(&self, project_id: Uuid) -> FoundryResult<Project> {
        self.transition(project_id, &[ProjectStatus::Draft], ProjectStatus::Running, "start", None)
    }

    /// `running -> paused`.
    pub fn pause_project(&self, project_id: Uuid, reason: &str) -> FoundryResult<Project> {
        self.transition(
            project_id,
            &[ProjectStatus::Running],
            ProjectStatus::Paused,
            "pause",
            Some(reason),
        )
    }

    /// `paused -> running`.
    pub fn resume_project(&self, project_id: Uuid) -> FoundryResult<Project> {
        self.transition(
            project_id,
            &[ProjectStatus::Paused],
            ProjectStatus::Running,
            "resume",
            None,
        )
    }

    /// Delete the project and everything it owns. Its agents lose their
    /// running ownership in this process.
    pub fn delete_project(&self, project_id: Uuid) -> FoundryResult<()> {
        let agents = self.ctx.commit(|db, _| {
            let agents = db.list_agents(project_id)?;
            if !db.delete_project(project_id)? {
                return Err(FoundryError::not_found("project", project_id));
            }
            Ok(agents)
        })?;
        for agent in &agents {
            self.ctx.running.release(agent.id);
        }
        info!(project_id = %project_id, agents = agents.len(), "Project deleted");
        Ok(())
    }

    fn transition(
        &self,
        project_id: Uuid,
        from: &[ProjectStatus],
        to: ProjectStatus,
        operation: &'static str,
        reason: Option<&str>,
    ) -> FoundryResult<Project> {
        self.ctx.commit(|db, events| {
            let project = set_project_status(db, project_id, from, to, operation)?;
            info!(project_id = %project_id, status = %to, "Project status changed");
            events.push(DomainEvent::ProjectStatusChanged {
                project_id,
                status: to.to_string(),
                reason: reason.map(str::to_string),
            });
            Ok(project)
        })
    }
}

fn set_project_status(
    db: &Db<'_>,
    project_id: Uuid,
    from: &[ProjectStatus],
    to: ProjectStatus,
    operation: &'static str,
) -> FoundryResult<Project> {
    let mut project = db.require_project(project_id)?;
    if !from.contains(&project.status) {
        return Err(FoundryError::conflict(
            "project",
            project_id,
            project.status,
            operation,
        ));
    }
    project.status = to;
    project.updated_at = Utc::now();
    db.update_project(&project)?;
    Ok(project)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::lifecycle::LifecycleManager;
    use crate::testing::fixture;
    use foundry_core::{AgentStatus, AgentType};

    #[test]
    fn test_create_seeds_leader_agents() {
        let (ctx, _) = fixture();
        let projects = ProjectService::new(ctx.clone());
        let (project, agents) = projects.create_project("Space Miner").unwrap();
        assert_eq!(project.status, ProjectStatus::Draft);
        assert_eq!(project.current_phase, 0);

        let leaders = ctx
            .pipeline
            .agents
            .iter()
            .filter(|a| !a.agent_type.is_worker())
            .count();
        assert_eq!(agents.len(), leaders);
        assert!(agents.iter().all(|a| a.status == AgentStatus::Pending));
        assert!(!agents.iter().any(|a| a.agent_type == AgentType::CodeWorker));
        let design = agents
            .iter()
            .find(|a| a.agent_type == AgentType::Design)
            .unwrap();
        assert_eq!(design.phase, 1);
    }

    #[test]
    fn test_status_machine() {
        let (ctx, _) = fixture();
        let projects = ProjectService::new(ctx);
        let (project, _) = projects.create_project("p").unwrap();

        assert!(projects.resume_project(project.id).is_err());
        assert_eq!(
            projects.start_project(project.id).unwrap().status,
            ProjectStatus::Running
        );
        assert!(projects.start_project(project.id).is_err());
        assert_eq!(
            projects.pause_project(project.id, "lunch").unwrap().status,
            ProjectStatus::Paused
        );
        assert_eq!(
            projects.resume_project(project.id).unwrap().status,
            ProjectStatus::Running
        );
    }

    #[test]
    fn test_resume_leaves_interrupted_agents() {
        let (ctx, project) = fixture();
        let projects = ProjectService::new(ctx.clone());
        let lifecycle = LifecycleManager::new(ctx.clone());
        let agent = lifecycle
            .register_agent(project.id, AgentType::Concept, None)
            .unwrap();
        let mut stored = lifecycle.get(agent.id).unwrap();
        stored.status = AgentStatus::Interrupted;
        ctx.store.transaction(|db| db.update_agent(&stored)).unwrap();

        projects.pause_project(project.id, "operator").unwrap();
        projects.resume_project(project.id).unwrap();
        assert_eq!(
            lifecycle.get(agent.id).unwrap().status,
            AgentStatus::Interrupted
        );
    }

    #[test]
    fn test_delete_cascades_and_releases() {
        let (ctx, project) = fixture();
        let projects = ProjectService::new(ctx.clone());
        let lifecycle = LifecycleManager::new(ctx.clone());
        let agent = lifecycle
            .register_agent(project.id, AgentType::Concept, None)
            .unwrap();
        lifecycle.start(agent.id).unwrap();
        assert!(ctx.running.owns(agent.id));

        projects.delete_project(project.id).unwrap();
        assert!(!ctx.running.owns(agent.id));
        assert!(matches!(
            lifecycle.get(agent.id).unwrap_err(),
            FoundryError::NotFound { .. }
        ));
        assert!(projects.delete_project(project.id).is_err());
    }
}
