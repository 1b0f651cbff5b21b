mod config;

use clap::{Parser, Subcommand};
use config::FoundryConfig;
use foundry_core::{AgentType, InterventionPriority, QualitySetting, Resolution};
use foundry_orchestrator::ControlPlane;
use foundry_queue::ProviderRegistry;
use foundry_store::Store;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "foundry", about = "Foundry: orchestration control plane for staged AI production pipelines")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "foundry.toml")]
    config: PathBuf,

    /// Human-readable logs instead of JSON
    #[arg(long)]
    pretty: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration and print the effective pipeline
    Check,
    /// Reconcile agents and jobs left in flight by a stopped process.
    /// Only run this while no other process is serving the database.
    Recover,
    /// Manage projects
    Project {
        #[command(subcommand)]
        action: ProjectAction,
    },
    /// Inspect and drive agents
    Agent {
        #[command(subcommand)]
        action: AgentAction,
    },
    /// Review checkpoints
    Checkpoint {
        #[command(subcommand)]
        action: CheckpointAction,
    },
    /// Set auto-approval rules, e.g. `concept=true asset=false`
    AutoApprove {
        project: Uuid,
        #[arg(required = true, value_parser = parse_rule)]
        rules: Vec<(String, bool)>,
    },
    /// Send a message to a project's agents
    Intervene {
        project: Uuid,
        message: String,
        /// Agent to activate for the intervention
        #[arg(long)]
        target: Option<Uuid>,
        /// Pause the project
        #[arg(long)]
        urgent: bool,
    },
    /// Per-type review policy
    Quality {
        #[command(subcommand)]
        action: QualityAction,
    },
    /// List a project's provider jobs
    Jobs { project: Uuid },
}

#[derive(Subcommand)]
enum ProjectAction {
    Create { name: String },
    List,
    Show { id: Uuid },
    Start { id: Uuid },
    Pause {
        id: Uuid,
        #[arg(long, default_value = "operator")]
        reason: String,
    },
    Resume { id: Uuid },
    Delete { id: Uuid },
}

#[derive(Subcommand)]
enum AgentAction {
    List { project: Uuid },
    Show { id: Uuid },
    /// Start every agent whose dependencies are signed off
    StartReady { project: Uuid },
    Pause {
        id: Uuid,
        #[arg(long, default_value = "operator")]
        reason: String,
    },
    Resume { id: Uuid },
    Retry { id: Uuid },
    Cancel { id: Uuid },
}

#[derive(Subcommand)]
enum CheckpointAction {
    List {
        project: Uuid,
        /// Only pending checkpoints
        #[arg(long)]
        pending: bool,
    },
    /// approved | rejected | revision_requested
    Resolve {
        id: Uuid,
        resolution: Resolution,
        #[arg(long)]
        feedback: Option<String>,
    },
}

#[derive(Subcommand)]
enum QualityAction {
    Show { project: Uuid, agent_type: AgentType },
    Set {
        project: Uuid,
        agent_type: AgentType,
        /// Whether output goes through a review checkpoint
        #[arg(long, action = clap::ArgAction::Set)]
        enabled: bool,
        #[arg(long)]
        max_retries: Option<u32>,
    },
}

fn parse_rule(s: &str) -> Result<(String, bool), String> {
    let (category, enabled) = s
        .split_once('=')
        .ok_or_else(|| format!("expected category=true|false, got '{s}'"))?;
    let enabled = enabled
        .parse::<bool>()
        .map_err(|_| format!("expected true or false after '=', got '{enabled}'"))?;
    Ok((category.to_string(), enabled))
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.pretty {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    }

    let (config, found) = FoundryConfig::load(&cli.config)?;
    if !found {
        warn!(path = %cli.config.display(), "Config file not found, using defaults");
    }

    if let Commands::Check = cli.command {
        info!(
            database = %config.database.display(),
            agents = config.pipeline.agents.len(),
            phases = config.pipeline.phases.len(),
            "Configuration is valid"
        );
        return print_json(&config.pipeline);
    }

    let store = Arc::new(Store::open(&config.database)?);
    // Operator commands never dispatch jobs, so no provider clients are registered.
    let plane = ControlPlane::new(
        store,
        config.pipeline,
        config.queue,
        ProviderRegistry::new(),
    )?;

    match cli.command {
        Commands::Check => {}
        Commands::Recover => {
            let report = plane.recover()?;
            if report.is_clean() {
                info!("Nothing to recover");
            }
            print_json(&report)?;
        }
        Commands::Project { action } => {
            let projects = plane.projects();
            match action {
                ProjectAction::Create { name } => {
                    let (project, agents) = projects.create_project(&name)?;
                    info!(project_id = %project.id, agents = agents.len(), "Project created");
                    print_json(&project)?;
                }
                ProjectAction::List => print_json(&projects.list()?)?,
                ProjectAction::Show { id } => print_json(&projects.get(id)?)?,
                ProjectAction::Start { id } => print_json(&projects.start_project(id)?)?,
                ProjectAction::Pause { id, reason } => {
                    print_json(&projects.pause_project(id, &reason)?)?;
                }
                ProjectAction::Resume { id } => print_json(&projects.resume_project(id)?)?,
                ProjectAction::Delete { id } => {
                    projects.delete_project(id)?;
                    println!("Deleted project {id}");
                }
            }
        }
        Commands::Agent { action } => {
            let lifecycle = plane.lifecycle();
            match action {
                AgentAction::List { project } => print_json(&lifecycle.list(project)?)?,
                AgentAction::Show { id } => print_json(&lifecycle.get(id)?)?,
                AgentAction::StartReady { project } => {
                    print_json(&plane.scheduler().start_ready(project)?)?;
                }
                AgentAction::Pause { id, reason } => print_json(&lifecycle.pause(id, &reason)?)?,
                AgentAction::Resume { id } => print_json(&lifecycle.resume(id)?)?,
                AgentAction::Retry { id } => print_json(&lifecycle.retry(id)?)?,
                AgentAction::Cancel { id } => print_json(&lifecycle.cancel(id)?)?,
            }
        }
        Commands::Checkpoint { action } => {
            let checkpoints = plane.checkpoints();
            match action {
                CheckpointAction::List { project, pending } => {
                    let list = if pending {
                        checkpoints.list_pending(project)?
                    } else {
                        checkpoints.list(project)?
                    };
                    print_json(&list)?;
                }
                CheckpointAction::Resolve {
                    id,
                    resolution,
                    feedback,
                } => print_json(&checkpoints.resolve(id, resolution, feedback)?)?,
            }
        }
        Commands::AutoApprove { project, rules } => {
            let rules: HashMap<String, bool> = rules.into_iter().collect();
            print_json(&plane.auto_approval().set_rules(project, rules)?)?;
        }
        Commands::Intervene {
            project,
            message,
            target,
            urgent,
        } => {
            let priority = if urgent {
                InterventionPriority::Urgent
            } else {
                InterventionPriority::Normal
            };
            print_json(&plane.intervene(project, target, &message, priority)?)?;
        }
        Commands::Quality { action } => match action {
            QualityAction::Show {
                project,
                agent_type,
            } => print_json(&plane.quality().get(project, agent_type)?)?,
            QualityAction::Set {
                project,
                agent_type,
                enabled,
                max_retries,
            } => {
                let current = plane.quality().get(project, agent_type)?;
                let updated = plane.quality().update(QualitySetting {
                    enabled,
                    max_retries: max_retries.unwrap_or(current.max_retries),
                    ..current
                })?;
                print_json(&updated)?;
            }
        },
        Commands::Jobs { project } => {
            let jobs = plane.store().read(|db| db.list_jobs(project))?;
            print_json(&jobs)?;
        }
    }

    Ok(())
}
