use crate::context::Context;
use crate::quality::effective_setting;
use crate::scheduler::advance_phase_if_ready;
use chrono::Utc;
use foundry_core::{
    Agent, AgentStatus, AgentType, DomainEvent, FoundryError, FoundryResult, InterventionStatus,
};
use foundry_store::Db;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

/// Reason recorded on an agent whose checkpoint was rejected.
pub const REJECTED_REASON: &str = "rejected";
/// Reason recorded on a cancelled agent.
pub const CANCELLED_REASON: &str = "cancelled";
/// Error recorded on jobs failed because their agent was cancelled.
pub const CANCELLED_JOB_REASON: &str = "agent cancelled";

/// Refuse `operation` unless the agent is in one of `allowed`.
pub(crate) fn ensure_status(
    agent: &Agent,
    allowed: &[AgentStatus],
    operation: &'static str,
) -> FoundryResult<()> {
    if allowed.contains(&agent.status) {
        Ok(())
    } else {
        Err(FoundryError::conflict("agent", agent.id, agent.status, operation))
    }
}

pub(crate) fn start_agent(
    db: &Db<'_>,
    agent: &mut Agent,
    task: Option<String>,
    events: &mut Vec<DomainEvent>,
) -> FoundryResult<()> {
    let now = Utc::now();
    agent.status = AgentStatus::Running;
    agent.started_at = Some(now);
    agent.completed_at = None;
    if task.is_some() {
        agent.current_task = task;
    }
    db.update_agent(agent)?;
    info!(agent_id = %agent.id, agent_type = %agent.agent_type, "Agent started");
    events.push(DomainEvent::AgentStarted {
        project_id: agent.project_id,
        agent_id: agent.id,
        at: now,
    });
    Ok(())
}

pub(crate) fn complete_agent(
    db: &Db<'_>,
    agent: &mut Agent,
    events: &mut Vec<DomainEvent>,
) -> FoundryResult<()> {
    let now = Utc::now();
    agent.status = AgentStatus::Completed;
    agent.progress = 100;
    agent.completed_at = Some(now);
    agent.current_task = None;
    db.update_agent(agent)?;
    info!(agent_id = %agent.id, agent_type = %agent.agent_type, "Agent completed");
    events.push(DomainEvent::AgentCompleted {
        project_id: agent.project_id,
        agent_id: agent.id,
        at: now,
    });
    Ok(())
}

pub(crate) fn fail_agent(
    db: &Db<'_>,
    agent: &mut Agent,
    reason: &str,
    events: &mut Vec<DomainEvent>,
) -> FoundryResult<()> {
    agent.status = AgentStatus::Failed;
    agent.last_error = Some(reason.to_string());
    agent.completed_at = Some(Utc::now());
    db.update_agent(agent)?;
    warn!(agent_id = %agent.id, reason, "Agent failed");
    events.push(DomainEvent::AgentFailed {
        project_id: agent.project_id,
        agent_id: agent.id,
        reason: reason.to_string(),
    });
    Ok(())
}

pub(crate) fn pause_agent(
    db: &Db<'_>,
    agent: &mut Agent,
    reason: &str,
    events: &mut Vec<DomainEvent>,
) -> FoundryResult<()> {
    agent.status = AgentStatus::Paused;
    db.update_agent(agent)?;
    info!(agent_id = %agent.id, reason, "Agent paused");
    events.push(DomainEvent::AgentPaused {
        project_id: agent.project_id,
        agent_id: agent.id,
        reason: reason.to_string(),
    });
    Ok(())
}

pub(crate) fn resume_agent(
    db: &Db<'_>,
    agent: &mut Agent,
    events: &mut Vec<DomainEvent>,
) -> FoundryResult<()> {
    agent.status = AgentStatus::Running;
    db.update_agent(agent)?;
    info!(agent_id = %agent.id, "Agent resumed");
    events.push(DomainEvent::AgentResumed {
        project_id: agent.project_id,
        agent_id: agent.id,
    });
    Ok(())
}

pub(crate) fn wait_for_approval(
    db: &Db<'_>,
    agent: &mut Agent,
    events: &mut Vec<DomainEvent>,
) -> FoundryResult<()> {
    agent.status = AgentStatus::WaitingApproval;
    db.update_agent(agent)?;
    events.push(DomainEvent::AgentWaiting {
        project_id: agent.project_id,
        agent_id: agent.id,
        status: AgentStatus::WaitingApproval,
    });
    Ok(())
}

/// Pause every running agent of the project whose phase is strictly after `phase`.
pub(crate) fn pause_downstream(
    db: &Db<'_>,
    project_id: Uuid,
    phase: u32,
    except: Uuid,
    reason: &str,
    events: &mut Vec<DomainEvent>,
) -> FoundryResult<Vec<Uuid>> {
    let mut paused = Vec::new();
    for mut other in db.list_agents(project_id)? {
        if other.id != except && other.phase > phase && other.status == AgentStatus::Running {
            pause_agent(db, &mut other, reason, events)?;
            paused.push(other.id);
        }
    }
    Ok(paused)
}

/// What [`LifecycleManager::activate_for_intervention`] did to the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationOutcome {
    /// Cold-started from pending, paused, failed, interrupted or completed.
    Started,
    /// Was already running; nothing changed.
    AlreadyRunning,
    /// Was waiting for a human response and is running again.
    Woken,
}

/// Result of activating an agent for an intervention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activation {
    /// The agent after activation.
    pub agent: Agent,
    /// What activation did to it.
    pub outcome: ActivationOutcome,
    /// Downstream agents paused because of the activation.
    pub paused: Vec<Uuid>,
}

/// Owns the agent state machine.
///
/// ```text
/// pending -> running -> {waiting_approval, waiting_response, paused, completed, failed}
/// waiting_approval -> running | completed | failed      (checkpoint resolution)
/// waiting_response -> running                           (human reply)
/// paused <-> running
/// failed | interrupted -> pending                       (explicit retry)
/// ```
///
/// Every transition is validated against the current status and rejected
/// with [`FoundryError::StateConflict`] otherwise.
#[derive(Clone)]
pub struct LifecycleManager {
    ctx: Context,
}

impl LifecycleManager {
    /// Manager over the shared context.
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Create a pending agent of `agent_type` in the project.
    pub fn register_agent(
        &self,
        project_id: Uuid,
        agent_type: AgentType,
        parent: Option<Uuid>,
    ) -> FoundryResult<Agent> {
        let phase = self
            .ctx
            .pipeline
            .agent(agent_type)
            .map(|a| a.phase)
            .ok_or_else(|| {
                FoundryError::Validation(format!("agent type {agent_type} is not configured"))
            })?;
        self.ctx.commit(|db, _| {
            db.require_project(project_id)?;
            let mut agent = Agent::new(project_id, agent_type, phase);
            if let Some(parent_id) = parent {
                let parent = db.require_agent(parent_id)?;
                if parent.project_id != project_id {
                    return Err(FoundryError::Validation(format!(
                        "parent agent {parent_id} belongs to another project"
                    )));
                }
                agent = agent.with_parent(parent_id);
            }
            db.insert_agent(&agent)?;
            Ok(agent)
        })
    }

    /// Agent by id.
    pub fn get(&self, agent_id: Uuid) -> FoundryResult<Agent> {
        self.ctx.read(|db| db.require_agent(agent_id))
    }

    /// Agents of a project, by phase.
    pub fn list(&self, project_id: Uuid) -> FoundryResult<Vec<Agent>> {
        self.ctx.read(|db| db.list_agents(project_id))
    }

    /// `pending -> running`.
    pub fn start(&self, agent_id: Uuid) -> FoundryResult<Agent> {
        self.ctx.commit(|db, events| {
            let mut agent = db.require_agent(agent_id)?;
            ensure_status(&agent, &[AgentStatus::Pending], "start")?;
            start_agent(db, &mut agent, None, events)?;
            Ok(agent)
        })
    }

    /// Raise progress (never lowers it) and optionally relabel the current task.
    pub fn update_progress(
        &self,
        agent_id: Uuid,
        progress: u8,
        task: Option<String>,
    ) -> FoundryResult<Agent> {
        if progress > 100 {
            return Err(FoundryError::Validation(format!(
                "progress {progress} is outside 0..=100"
            )));
        }
        self.ctx.commit(|db, events| {
            let mut agent = db.require_agent(agent_id)?;
            ensure_status(&agent, &[AgentStatus::Running], "update progress of")?;
            agent.progress = agent.progress.max(progress);
            if task.is_some() {
                agent.current_task = task;
            }
            db.update_agent(&agent)?;
            events.push(DomainEvent::AgentProgress {
                project_id: agent.project_id,
                agent_id,
                progress: agent.progress,
                current_task: agent.current_task.clone(),
            });
            Ok(agent)
        })
    }

    /// Add billed tokens to an agent's running totals.
    pub fn record_tokens(&self, agent_id: Uuid, input: u64, output: u64) -> FoundryResult<()> {
        self.ctx.read(|db| db.add_agent_tokens(agent_id, input, output))
    }

    /// `running -> waiting_response`: the agent needs a human answer.
    pub fn await_response(&self, agent_id: Uuid) -> FoundryResult<Agent> {
        self.ctx.commit(|db, events| {
            let mut agent = db.require_agent(agent_id)?;
            ensure_status(&agent, &[AgentStatus::Running], "await a response for")?;
            agent.status = AgentStatus::WaitingResponse;
            db.update_agent(&agent)?;
            events.push(DomainEvent::AgentWaiting {
                project_id: agent.project_id,
                agent_id,
                status: AgentStatus::WaitingResponse,
            });
            Ok(agent)
        })
    }

    /// `waiting_response -> running`.
    pub fn respond(&self, agent_id: Uuid) -> FoundryResult<Agent> {
        self.ctx.commit(|db, events| {
            let mut agent = db.require_agent(agent_id)?;
            ensure_status(&agent, &[AgentStatus::WaitingResponse], "deliver a response to")?;
            resume_agent(db, &mut agent, events)?;
            Ok(agent)
        })
    }

    /// `running -> completed` without a review checkpoint.
    ///
    /// Refused while the agent still has a pending checkpoint; that
    /// checkpoint's resolution decides how the agent ends.
    pub fn complete(&self, agent_id: Uuid) -> FoundryResult<Agent> {
        self.ctx.commit(|db, events| {
            let mut agent = db.require_agent(agent_id)?;
            ensure_status(&agent, &[AgentStatus::Running], "complete")?;
            let pending = db.count_pending_checkpoints(agent_id)?;
            if pending > 0 {
                return Err(FoundryError::conflict(
                    "agent",
                    agent_id,
                    format!("running with {pending} pending checkpoint(s)"),
                    "complete",
                ));
            }
            complete_agent(db, &mut agent, events)?;
            advance_phase_if_ready(db, &self.ctx.pipeline, agent.project_id, events)?;
            Ok(agent)
        })
    }

    /// Any non-terminal status `-> failed`.
    pub fn fail(&self, agent_id: Uuid, reason: &str) -> FoundryResult<Agent> {
        self.ctx.commit(|db, events| {
            let mut agent = db.require_agent(agent_id)?;
            if agent.status.is_terminal() {
                return Err(FoundryError::conflict("agent", agent_id, agent.status, "fail"));
            }
            fail_agent(db, &mut agent, reason, events)?;
            Ok(agent)
        })
    }

    /// Mark the agent failed and fail its pending and running jobs in the
    /// same transaction.
    ///
    /// A provider call already in flight is not interrupted, but its job row
    /// is no longer `running`, so the queue drops its result instead of
    /// recording a success. This holds even if the agent is retried and
    /// restarted before the call returns.
    pub fn cancel(&self, agent_id: Uuid) -> FoundryResult<Agent> {
        self.ctx.commit(|db, events| {
            let mut agent = db.require_agent(agent_id)?;
            if agent.status.is_terminal() {
                return Err(FoundryError::conflict("agent", agent_id, agent.status, "cancel"));
            }
            fail_agent(db, &mut agent, CANCELLED_REASON, events)?;
            for job in db.fail_open_jobs_for_agent(agent_id, CANCELLED_JOB_REASON, Utc::now())? {
                info!(
                    job_id = %job.id,
                    agent_id = %agent_id,
                    previous_status = %job.status,
                    "Job failed by agent cancellation"
                );
                events.push(DomainEvent::JobFailed {
                    project_id: job.project_id,
                    job_id: job.id,
                    error: CANCELLED_JOB_REASON.to_string(),
                });
            }
            Ok(agent)
        })
    }

    /// `running -> paused`.
    pub fn pause(&self, agent_id: Uuid, reason: &str) -> FoundryResult<Agent> {
        self.ctx.commit(|db, events| {
            let mut agent = db.require_agent(agent_id)?;
            ensure_status(&agent, &[AgentStatus::Running], "pause")?;
            pause_agent(db, &mut agent, reason, events)?;
            Ok(agent)
        })
    }

    /// `paused -> running`.
    pub fn resume(&self, agent_id: Uuid) -> FoundryResult<Agent> {
        self.ctx.commit(|db, events| {
            let mut agent = db.require_agent(agent_id)?;
            ensure_status(&agent, &[AgentStatus::Paused], "resume")?;
            resume_agent(db, &mut agent, events)?;
            Ok(agent)
        })
    }

    /// `failed | interrupted -> pending`, resetting progress, timestamps and error.
    ///
    /// Retrying a failed agent consumes one of the type's `max_retries`;
    /// retrying an interrupted one does not, since the interruption was not
    /// the agent's failure.
    pub fn retry(&self, agent_id: Uuid) -> FoundryResult<Agent> {
        self.ctx.commit(|db, events| {
            let mut agent = db.require_agent(agent_id)?;
            ensure_status(
                &agent,
                &[AgentStatus::Failed, AgentStatus::Interrupted],
                "retry",
            )?;
            if agent.status == AgentStatus::Failed {
                let setting =
                    effective_setting(db, &self.ctx.pipeline, agent.project_id, agent.agent_type)?;
                if agent.retry_count >= setting.max_retries {
                    return Err(FoundryError::conflict(
                        "agent",
                        agent_id,
                        format!(
                            "failed with {}/{} retries used",
                            agent.retry_count, setting.max_retries
                        ),
                        "retry",
                    ));
                }
                agent.retry_count += 1;
            }
            agent.status = AgentStatus::Pending;
            agent.progress = 0;
            agent.current_task = None;
            agent.last_error = None;
            agent.started_at = None;
            agent.completed_at = None;
            db.update_agent(&agent)?;
            info!(agent_id = %agent_id, retry_count = agent.retry_count, "Agent queued for retry");
            events.push(DomainEvent::AgentRetried {
                project_id: agent.project_id,
                agent_id,
                retry_count: agent.retry_count,
            });
            Ok(agent)
        })
    }

    /// Bring an agent to `running` to handle an intervention.
    ///
    /// Pending, paused, failed, interrupted and completed agents are
    /// cold-started with the intervention as their task; a
    /// `waiting_response` agent is woken; a running agent is left alone. An
    /// agent in `waiting_approval` is refused until its checkpoint resolves.
    /// When the agent is started or woken, every running agent of the
    /// project in a later phase is paused so it does not build on stale
    /// upstream output.
    pub fn activate_for_intervention(
        &self,
        agent_id: Uuid,
        intervention_id: Uuid,
    ) -> FoundryResult<Activation> {
        self.ctx.commit(|db, events| {
            let mut agent = db.require_agent(agent_id)?;
            let mut intervention = db.require_intervention(intervention_id)?;
            if intervention.project_id != agent.project_id {
                return Err(FoundryError::Validation(format!(
                    "intervention {intervention_id} belongs to another project"
                )));
            }

            let outcome = match agent.status {
                AgentStatus::Running => {
                    return Ok(Activation {
                        agent,
                        outcome: ActivationOutcome::AlreadyRunning,
                        paused: Vec::new(),
                    })
                }
                AgentStatus::WaitingApproval => {
                    return Err(FoundryError::conflict(
                        "agent",
                        agent_id,
                        agent.status,
                        "activate",
                    ))
                }
                AgentStatus::WaitingResponse => {
                    agent.current_task = Some(intervention.task_label());
                    resume_agent(db, &mut agent, events)?;
                    ActivationOutcome::Woken
                }
                AgentStatus::Pending
                | AgentStatus::Paused
                | AgentStatus::Failed
                | AgentStatus::Interrupted
                | AgentStatus::Completed => {
                    if agent.status.is_terminal() {
                        agent.progress = 0;
                        agent.last_error = None;
                    }
                    start_agent(db, &mut agent, Some(intervention.task_label()), events)?;
                    ActivationOutcome::Started
                }
            };

            if intervention.status == InterventionStatus::Pending {
                intervention.status = InterventionStatus::Delivered;
                db.update_intervention(&intervention)?;
            }
            events.push(DomainEvent::AgentActivated {
                project_id: agent.project_id,
                agent_id,
                intervention_id,
            });

            let reason = format!("upstream agent {agent_id} activated for intervention");
            let paused = pause_downstream(
                db,
                agent.project_id,
                agent.phase,
                agent_id,
                &reason,
                events,
            )?;
            info!(
                agent_id = %agent_id,
                intervention_id = %intervention_id,
                outcome = ?outcome,
                paused = paused.len(),
                "Agent activated for intervention"
            );
            Ok(Activation {
                agent,
                outcome,
                paused,
            })
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::testing::fixture;
    use foundry_core::{
        Checkpoint, EventKind, Intervention, InterventionPriority, JobStatus, LlmJob,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_start_requires_pending() {
        let (ctx, project) = fixture();
        let lifecycle = LifecycleManager::new(ctx.clone());
        let agent = lifecycle
            .register_agent(project.id, AgentType::Concept, None)
            .unwrap();

        let started = lifecycle.start(agent.id).unwrap();
        assert_eq!(started.status, AgentStatus::Running);
        assert!(started.started_at.is_some());
        assert!(ctx.running.owns(agent.id));

        let err = lifecycle.start(agent.id).unwrap_err();
        assert!(matches!(err, FoundryError::StateConflict { .. }));
    }

    #[test]
    fn test_progress_is_monotonic_and_running_only() {
        let (ctx, project) = fixture();
        let lifecycle = LifecycleManager::new(ctx);
        let agent = lifecycle
            .register_agent(project.id, AgentType::Design, None)
            .unwrap();
        assert!(lifecycle.update_progress(agent.id, 10, None).is_err());

        lifecycle.start(agent.id).unwrap();
        lifecycle
            .update_progress(agent.id, 60, Some("drafting".into()))
            .unwrap();
        let agent = lifecycle.update_progress(agent.id, 30, None).unwrap();
        assert_eq!(agent.progress, 60);
        assert_eq!(agent.current_task.as_deref(), Some("drafting"));
        assert!(lifecycle.update_progress(agent.id, 101, None).is_err());
    }

    #[test]
    fn test_pause_resume_source_states() {
        let (ctx, project) = fixture();
        let lifecycle = LifecycleManager::new(ctx);
        let agent = lifecycle
            .register_agent(project.id, AgentType::Concept, None)
            .unwrap();
        assert!(lifecycle.pause(agent.id, "operator").is_err());
        assert!(lifecycle.resume(agent.id).is_err());

        lifecycle.start(agent.id).unwrap();
        assert_eq!(
            lifecycle.pause(agent.id, "operator").unwrap().status,
            AgentStatus::Paused
        );
        assert!(lifecycle.pause(agent.id, "operator").is_err());
        assert_eq!(lifecycle.resume(agent.id).unwrap().status, AgentStatus::Running);
    }

    #[test]
    fn test_retry_is_bounded_for_failures_but_not_interruptions() {
        let (ctx, project) = fixture();
        let lifecycle = LifecycleManager::new(ctx.clone());
        let agent = lifecycle
            .register_agent(project.id, AgentType::Concept, None)
            .unwrap();

        // default max_retries is 3
        for expected in 1..=3 {
            lifecycle.start(agent.id).unwrap();
            lifecycle.update_progress(agent.id, 50, None).unwrap();
            lifecycle.fail(agent.id, "provider exploded").unwrap();
            let retried = lifecycle.retry(agent.id).unwrap();
            assert_eq!(retried.retry_count, expected);
            assert_eq!(retried.progress, 0);
            assert!(retried.last_error.is_none());
        }
        lifecycle.start(agent.id).unwrap();
        lifecycle.fail(agent.id, "again").unwrap();
        assert!(matches!(
            lifecycle.retry(agent.id),
            Err(FoundryError::StateConflict { .. })
        ));

        // an interrupted agent retries without consuming the budget
        let other = lifecycle
            .register_agent(project.id, AgentType::Design, None)
            .unwrap();
        let mut interrupted = ctx.store.read(|db| db.require_agent(other.id)).unwrap();
        interrupted.status = AgentStatus::Interrupted;
        ctx.store
            .transaction(|db| db.update_agent(&interrupted))
            .unwrap();
        assert_eq!(lifecycle.retry(other.id).unwrap().retry_count, 0);
    }

    #[test]
    fn test_cancel_releases_ownership() {
        let (ctx, project) = fixture();
        let lifecycle = LifecycleManager::new(ctx.clone());
        let agent = lifecycle
            .register_agent(project.id, AgentType::Concept, None)
            .unwrap();
        lifecycle.start(agent.id).unwrap();

        let cancelled = lifecycle.cancel(agent.id).unwrap();
        assert_eq!(cancelled.status, AgentStatus::Failed);
        assert_eq!(cancelled.last_error.as_deref(), Some(CANCELLED_REASON));
        assert!(!ctx.running.owns(agent.id));
        assert!(lifecycle.cancel(agent.id).is_err());
    }

    #[test]
    fn test_cancel_of_terminal_agent_keeps_ownership() {
        let (ctx, project) = fixture();
        let lifecycle = LifecycleManager::new(ctx.clone());
        let agent = lifecycle
            .register_agent(project.id, AgentType::Concept, None)
            .unwrap();
        lifecycle.start(agent.id).unwrap();
        lifecycle.complete(agent.id).unwrap();
        ctx.running.acquire(agent.id);

        assert!(matches!(
            lifecycle.cancel(agent.id).unwrap_err(),
            FoundryError::StateConflict { .. }
        ));
        assert!(ctx.running.owns(agent.id));
    }

    #[test]
    fn test_cancel_fails_open_jobs_in_same_commit() {
        let (ctx, project) = fixture();
        let lifecycle = LifecycleManager::new(ctx.clone());
        let agent = lifecycle
            .register_agent(project.id, AgentType::Concept, None)
            .unwrap();
        lifecycle.start(agent.id).unwrap();
        let queued = LlmJob::new(project.id, agent.id, "mock", "m", Vec::new(), 64, 0);
        let mut finished = LlmJob::new(project.id, agent.id, "mock", "m", Vec::new(), 64, 0);
        finished.status = JobStatus::Completed;
        ctx.store
            .transaction(|db| {
                db.insert_job(&queued)?;
                db.insert_job(&finished)
            })
            .unwrap();

        lifecycle.cancel(agent.id).unwrap();
        let job = |id| ctx.store.read(|db| db.require_job(id)).unwrap();
        assert_eq!(job(queued.id).status, JobStatus::Failed);
        assert_eq!(job(queued.id).error.as_deref(), Some(CANCELLED_JOB_REASON));
        assert_eq!(job(finished.id).status, JobStatus::Completed);
    }

    #[test]
    fn test_complete_refused_with_pending_checkpoint() {
        let (ctx, project) = fixture();
        let lifecycle = LifecycleManager::new(ctx.clone());
        let agent = lifecycle
            .register_agent(project.id, AgentType::Concept, None)
            .unwrap();
        lifecycle.start(agent.id).unwrap();
        let checkpoint = Checkpoint::new(project.id, agent.id, "concept", serde_json::json!({}));
        ctx.store
            .transaction(|db| db.insert_checkpoint(&checkpoint))
            .unwrap();

        assert!(matches!(
            lifecycle.complete(agent.id).unwrap_err(),
            FoundryError::StateConflict { .. }
        ));
        assert_eq!(lifecycle.get(agent.id).unwrap().status, AgentStatus::Running);
        let project = ctx.store.read(|db| db.require_project(project.id)).unwrap();
        assert_eq!(project.current_phase, 0);
    }

    #[test]
    fn test_activation_outcomes() {
        let (ctx, project) = fixture();
        let lifecycle = LifecycleManager::new(ctx.clone());
        let agent = lifecycle
            .register_agent(project.id, AgentType::Design, None)
            .unwrap();
        let intervention = Intervention::new(
            project.id,
            Some(agent.id),
            "make the hub world smaller",
            InterventionPriority::Normal,
        );
        ctx.store
            .transaction(|db| db.insert_intervention(&intervention))
            .unwrap();

        let activations = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&activations);
        ctx.bus.subscribe(EventKind::AgentActivated, move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let first = lifecycle
            .activate_for_intervention(agent.id, intervention.id)
            .unwrap();
        assert_eq!(first.outcome, ActivationOutcome::Started);
        assert_eq!(
            first.agent.current_task.as_deref(),
            Some("intervention: make the hub world smaller")
        );

        let second = lifecycle
            .activate_for_intervention(agent.id, intervention.id)
            .unwrap();
        assert_eq!(second.outcome, ActivationOutcome::AlreadyRunning);

        lifecycle.await_response(agent.id).unwrap();
        let third = lifecycle
            .activate_for_intervention(agent.id, intervention.id)
            .unwrap();
        assert_eq!(third.outcome, ActivationOutcome::Woken);
        assert_eq!(activations.load(Ordering::SeqCst), 2);

        let delivered = ctx
            .store
            .read(|db| db.require_intervention(intervention.id))
            .unwrap();
        assert_eq!(delivered.status, InterventionStatus::Delivered);
    }

    #[test]
    fn test_activation_refused_while_waiting_approval() {
        let (ctx, project) = fixture();
        let lifecycle = LifecycleManager::new(ctx.clone());
        let agent = lifecycle
            .register_agent(project.id, AgentType::Concept, None)
            .unwrap();
        let mut stored = ctx.store.read(|db| db.require_agent(agent.id)).unwrap();
        stored.status = AgentStatus::WaitingApproval;
        ctx.store.transaction(|db| db.update_agent(&stored)).unwrap();
        let intervention =
            Intervention::new(project.id, Some(agent.id), "hold", InterventionPriority::Urgent);
        ctx.store
            .transaction(|db| db.insert_intervention(&intervention))
            .unwrap();

        assert!(matches!(
            lifecycle.activate_for_intervention(agent.id, intervention.id),
            Err(FoundryError::StateConflict { .. })
        ));
    }
}
