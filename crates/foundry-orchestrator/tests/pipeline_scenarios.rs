//! End-to-end pipeline scenarios.
//!
//! Drives a `ControlPlane` through dependency gating, urgent interventions,
//! crash recovery across two "processes" sharing one database file, and a
//! full reviewed run from concept to completion.

use async_trait::async_trait;
use chrono::Utc;
use foundry_core::{
    AgentStatus, AgentType, ChatMessage, Checkpoint, CheckpointStatus, EventKind, FoundryError,
    FoundryResult, InterventionPriority, JobStatus, PipelineConfig, ProjectStatus, QueueConfig,
    Resolution,
};
use foundry_orchestrator::*;
use foundry_queue::{ChatResponse, JobRequest, ProviderClient, ProviderRegistry};
use foundry_store::Store;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct EchoProvider;

#[async_trait]
impl ProviderClient for EchoProvider {
    async fn chat(
        &self,
        messages: &[ChatMessage],
        _model: &str,
        _max_tokens: u32,
    ) -> FoundryResult<ChatResponse> {
        Ok(ChatResponse {
            content: format!("echo: {}", messages.len()),
            input_tokens: 5,
            output_tokens: 8,
        })
    }
}

/// Answers only once a permit is added to its gate.
struct GatedProvider {
    gate: Arc<Semaphore>,
}

#[async_trait]
impl ProviderClient for GatedProvider {
    async fn chat(
        &self,
        _messages: &[ChatMessage],
        _model: &str,
        _max_tokens: u32,
    ) -> FoundryResult<ChatResponse> {
        self.gate.acquire().await.unwrap().forget();
        Ok(ChatResponse {
            content: "late".into(),
            input_tokens: 50,
            output_tokens: 50,
        })
    }
}

fn plane_on(store: Arc<Store>) -> ControlPlane {
    let providers = ProviderRegistry::new().with("echo", Arc::new(EchoProvider));
    let queue = QueueConfig {
        poll_interval_ms: 10,
        ..QueueConfig::default()
    };
    ControlPlane::new(store, PipelineConfig::default(), queue, providers).unwrap()
}

fn plane() -> ControlPlane {
    plane_on(Arc::new(Store::open_in_memory().unwrap()))
}

fn agent_of(plane: &ControlPlane, project_id: Uuid, agent_type: AgentType) -> Uuid {
    plane
        .lifecycle()
        .list(project_id)
        .unwrap()
        .into_iter()
        .find(|a| a.agent_type == agent_type)
        .map(|a| a.id)
        .unwrap()
}

/// Every `waiting_approval` agent has at least one pending checkpoint.
fn assert_waiting_has_pending(plane: &ControlPlane, project_id: Uuid) {
    let pending = plane.checkpoints().list_pending(project_id).unwrap();
    for agent in plane.lifecycle().list(project_id).unwrap() {
        if agent.status == AgentStatus::WaitingApproval {
            assert!(
                pending.iter().any(|c| c.agent_id == agent.id),
                "agent {} ({}) waits for approval without a pending checkpoint",
                agent.id,
                agent.agent_type
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[test]
fn test_dependent_waits_for_checkpoint_sign_off() {
    let plane = plane();
    let (project, _) = plane.projects().create_project("gating").unwrap();
    plane.projects().start_project(project.id).unwrap();
    let concept = agent_of(&plane, project.id, AgentType::Concept);
    let scheduler = plane.scheduler();

    plane.lifecycle().start(concept).unwrap();
    assert!(!scheduler.can_start(AgentType::Design, project.id).unwrap());

    // Completed with nothing pending unblocks the dependent.
    plane.lifecycle().complete(concept).unwrap();
    assert!(scheduler.can_start(AgentType::Design, project.id).unwrap());

    // A pending checkpoint on the completed upstream blocks it again.
    let late = Checkpoint::new(project.id, concept, "concept", json!({"v": 2}));
    plane
        .store()
        .transaction(|db| db.insert_checkpoint(&late))
        .unwrap();
    assert!(!scheduler.can_start(AgentType::Design, project.id).unwrap());
    assert!(scheduler.get_next_startable(project.id).unwrap().is_empty());

    let advanced = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&advanced);
    plane.bus().subscribe(EventKind::PhaseAdvanced, move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let outcome = plane
        .checkpoints()
        .resolve(late.id, Resolution::Approved, None)
        .unwrap();
    assert_eq!(outcome.advanced_to, Some(1));
    assert!(scheduler.can_start(AgentType::Design, project.id).unwrap());

    // Resolving again is refused and does not advance a second time.
    assert!(matches!(
        plane
            .checkpoints()
            .resolve(late.id, Resolution::Approved, None)
            .unwrap_err(),
        FoundryError::StateConflict { .. }
    ));
    assert_eq!(advanced.load(Ordering::SeqCst), 1);
    assert_eq!(plane.projects().get(project.id).unwrap().current_phase, 1);

    let started = scheduler.start_ready(project.id).unwrap();
    assert_eq!(started.len(), 1);
    assert_eq!(started[0].agent_type, AgentType::Design);
}

#[test]
fn test_urgent_intervention_pauses_downstream_work() {
    let plane = plane();
    let (project, _) = plane.projects().create_project("urgent").unwrap();
    plane.projects().start_project(project.id).unwrap();

    let planner = agent_of(&plane, project.id, AgentType::TaskSplit); // phase 3
    let integrator = agent_of(&plane, project.id, AgentType::Integrator); // phase 5
    let scenario = agent_of(&plane, project.id, AgentType::Scenario); // phase 2
    plane.lifecycle().start(integrator).unwrap();
    plane.lifecycle().start(scenario).unwrap();

    let outcome = plane
        .intervene(
            project.id,
            Some(planner),
            "split the level editor out of the first milestone",
            InterventionPriority::Urgent,
        )
        .unwrap();

    let activation = outcome.activation.unwrap();
    assert_eq!(activation.outcome, ActivationOutcome::Started);
    assert_eq!(activation.paused, vec![integrator]);

    let lifecycle = plane.lifecycle();
    assert_eq!(lifecycle.get(planner).unwrap().status, AgentStatus::Running);
    let paused = lifecycle.get(integrator).unwrap();
    assert_eq!(paused.status, AgentStatus::Paused);
    assert_eq!(lifecycle.get(scenario).unwrap().status, AgentStatus::Running);
    assert_eq!(
        plane.projects().get(project.id).unwrap().status,
        ProjectStatus::Paused
    );

    // The project gate stops automatic starts but not explicit operator resumes.
    assert!(plane.scheduler().start_ready(project.id).unwrap().is_empty());
    assert_eq!(
        lifecycle.resume(integrator).unwrap().status,
        AgentStatus::Running
    );
}

#[tokio::test]
async fn test_recovery_after_crash() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("foundry.db");

    // First process: an agent is running and one of its jobs was claimed
    // when the process died.
    let (project_id, concept, job_id) = {
        let plane = plane_on(Arc::new(Store::open(&path).unwrap()));
        let (project, _) = plane.projects().create_project("crash").unwrap();
        plane.projects().start_project(project.id).unwrap();
        plane.scheduler().start_ready(project.id).unwrap();
        let concept = agent_of(&plane, project.id, AgentType::Concept);
        let job_id = plane
            .submit_job(JobRequest::new(
                project.id,
                concept,
                "echo",
                "m",
                vec![ChatMessage::user("pitch")],
            ))
            .unwrap();
        assert!(plane
            .store()
            .transaction(|db| db.claim_job(job_id, Utc::now()))
            .unwrap()
            .is_some());
        (project.id, concept, job_id)
    };

    // Second process.
    let plane = plane_on(Arc::new(Store::open(&path).unwrap()));
    let report = plane.boot().unwrap();
    assert_eq!(report.interrupted_agents, vec![concept]);
    assert_eq!(report.requeued_jobs, vec![job_id]);

    let job = plane
        .queue()
        .wait_for_completion(job_id, Duration::from_secs(5))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.retry_count, 0);

    // Interrupted agents are never resumed implicitly.
    let agent = plane.lifecycle().get(concept).unwrap();
    assert_eq!(agent.status, AgentStatus::Interrupted);
    plane.projects().pause_project(project_id, "operator").unwrap();
    plane.projects().resume_project(project_id).unwrap();
    assert_eq!(
        plane.lifecycle().get(concept).unwrap().status,
        AgentStatus::Interrupted
    );
    assert_eq!(
        plane.lifecycle().retry(concept).unwrap().status,
        AgentStatus::Pending
    );
    plane.shutdown().await;
}

#[test]
fn test_reviewed_run_reaches_completion() {
    let plane = plane();
    let (project, _) = plane.projects().create_project("full run").unwrap();
    plane.projects().start_project(project.id).unwrap();
    let mut revised = false;

    for _ in 0..20 {
        plane.scheduler().start_ready(project.id).unwrap();
        for agent in plane.lifecycle().list(project.id).unwrap() {
            if agent.status == AgentStatus::Running {
                plane
                    .checkpoints()
                    .submit_output(agent.id, json!({"by": agent.agent_type.as_str()}))
                    .unwrap();
            }
        }
        assert_waiting_has_pending(&plane, project.id);

        for checkpoint in plane.checkpoints().list_pending(project.id).unwrap() {
            // Send the first concept back once.
            let resolution = if !revised && checkpoint.checkpoint_type == "concept" {
                revised = true;
                Resolution::RevisionRequested
            } else {
                Resolution::Approved
            };
            plane
                .checkpoints()
                .resolve(checkpoint.id, resolution, None)
                .unwrap();
            assert_waiting_has_pending(&plane, project.id);
        }

        if plane.projects().get(project.id).unwrap().status == ProjectStatus::Completed {
            break;
        }
    }

    let project = plane.projects().get(project.id).unwrap();
    assert_eq!(project.status, ProjectStatus::Completed);
    assert_eq!(project.current_phase, 6);
    assert!(revised);
    assert!(plane
        .lifecycle()
        .list(project.id)
        .unwrap()
        .iter()
        .all(|a| a.status == AgentStatus::Completed));
    assert!(plane
        .checkpoints()
        .list(project.id)
        .unwrap()
        .iter()
        .all(|c| c.status == CheckpointStatus::Approved));
}

#[test]
fn test_stale_pending_checkpoint_blocks_completion_and_phase() {
    let plane = plane();
    let (project, _) = plane.projects().create_project("stale review").unwrap();
    plane.projects().start_project(project.id).unwrap();
    let concept = agent_of(&plane, project.id, AgentType::Concept);
    let lifecycle = plane.lifecycle();
    let checkpoints = plane.checkpoints();

    // First attempt leaves a checkpoint pending behind the failure.
    lifecycle.start(concept).unwrap();
    let stale = checkpoints.create(concept, "concept", json!({"v": 1})).unwrap();
    lifecycle.fail(concept, "provider timeout").unwrap();
    lifecycle.retry(concept).unwrap();

    // Second attempt gets a newer checkpoint approved.
    lifecycle.start(concept).unwrap();
    let fresh = checkpoints.create(concept, "concept", json!({"v": 2})).unwrap();
    let outcome = checkpoints
        .resolve(fresh.id, Resolution::Approved, None)
        .unwrap();
    assert_eq!(outcome.advanced_to, None);
    assert_eq!(outcome.agent_status, AgentStatus::WaitingApproval);

    // Third attempt tries to finish without review.
    lifecycle.fail(concept, "stuck").unwrap();
    lifecycle.retry(concept).unwrap();
    lifecycle.start(concept).unwrap();
    assert!(matches!(
        lifecycle.complete(concept).unwrap_err(),
        FoundryError::StateConflict { .. }
    ));
    assert_eq!(plane.projects().get(project.id).unwrap().current_phase, 0);
    assert_eq!(
        checkpoints.get(stale.id).unwrap().status,
        CheckpointStatus::Pending
    );

    // Signing off the stale checkpoint lets the agent finish and the phase move.
    checkpoints
        .resolve(stale.id, Resolution::Approved, None)
        .unwrap();
    lifecycle.complete(concept).unwrap();
    assert_eq!(plane.projects().get(project.id).unwrap().current_phase, 1);
}

#[tokio::test]
async fn test_cancelled_call_is_not_recorded_after_retry() {
    let gate = Arc::new(Semaphore::new(0));
    let providers = ProviderRegistry::new().with(
        "gated",
        Arc::new(GatedProvider {
            gate: Arc::clone(&gate),
        }),
    );
    let plane = ControlPlane::new(
        Arc::new(Store::open_in_memory().unwrap()),
        PipelineConfig::default(),
        QueueConfig::default(),
        providers,
    )
    .unwrap();
    let (project, _) = plane.projects().create_project("cancel").unwrap();
    plane.projects().start_project(project.id).unwrap();
    let concept = agent_of(&plane, project.id, AgentType::Concept);
    plane.lifecycle().start(concept).unwrap();

    let failures = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&failures);
    plane.bus().subscribe(EventKind::JobFailed, move |_| {
        seen.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let job_id = plane
        .submit_job(JobRequest::new(
            project.id,
            concept,
            "gated",
            "m",
            vec![ChatMessage::user("pitch")],
        ))
        .unwrap();
    assert_eq!(plane.queue().poll_once().await.unwrap(), 1);

    // Cancel mid-call, then bring the agent back before the call returns.
    plane.lifecycle().cancel(concept).unwrap();
    plane.lifecycle().retry(concept).unwrap();
    plane.lifecycle().start(concept).unwrap();
    gate.add_permits(1);
    plane.shutdown().await;

    let job = plane.queue().get_job(job_id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.error.as_deref(), Some(CANCELLED_JOB_REASON));
    assert!(job.response.is_none());
    assert_eq!(failures.load(Ordering::SeqCst), 1);

    let agent = plane.lifecycle().get(concept).unwrap();
    assert_eq!(agent.status, AgentStatus::Running);
    assert_eq!(agent.input_tokens + agent.output_tokens, 0);
}
