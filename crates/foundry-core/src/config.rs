//! Typed configuration, loaded once at startup.
//!
//! Every struct deserializes from TOML with all fields defaulted, so a config
//! file only has to name what it overrides.

use crate::error::{FoundryError, FoundryResult};
use crate::types::AgentType;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

/// Static per-type settings: where the type sits in the pipeline and what gates it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentTypeConfig {
    /// Type being configured.
    pub agent_type: AgentType,
    /// Phase ordinal the type belongs to.
    pub phase: u32,
    /// Types that must be completed and signed off first.
    #[serde(default)]
    pub depends_on: Vec<AgentType>,
    /// Category key of the checkpoint this type produces.
    pub checkpoint_type: String,
    /// Whether output goes through a review checkpoint by default.
    #[serde(default = "default_true")]
    pub review: bool,
    /// Default retry allowance for new quality settings.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Whether the type is flagged high-cost on first setting creation.
    #[serde(default)]
    pub high_cost: bool,
}

/// The closed set of checkpoint types that must all be approved to leave a phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseConfig {
    /// Position in the pipeline, from 0.
    pub ordinal: u32,
    /// Display name.
    pub name: String,
    /// Checkpoint types that gate leaving the phase.
    pub checkpoint_types: BTreeSet<String>,
}

/// Dependency table, phase layout and quality defaults for the whole pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Per-type settings.
    #[serde(default = "default_agents")]
    pub agents: Vec<AgentTypeConfig>,
    /// Phase layout.
    #[serde(default = "default_phases")]
    pub phases: Vec<PhaseConfig>,
    /// Cap on workers a leader may spawn.
    #[serde(default = "default_max_workers")]
    pub max_workers_per_leader: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            agents: default_agents(),
            phases: default_phases(),
            max_workers_per_leader: default_max_workers(),
        }
    }
}

impl PipelineConfig {
    /// Settings for `agent_type`, if configured.
    pub fn agent(&self, agent_type: AgentType) -> Option<&AgentTypeConfig> {
        self.agents.iter().find(|a| a.agent_type == agent_type)
    }

    /// Prerequisite types of `agent_type`. Unknown types have none.
    pub fn dependencies(&self, agent_type: AgentType) -> &[AgentType] {
        self.agent(agent_type)
            .map(|a| a.depends_on.as_slice())
            .unwrap_or(&[])
    }

    /// Phase ordinal of `agent_type`; unknown types sit in phase 0.
    pub fn phase_of(&self, agent_type: AgentType) -> u32 {
        self.agent(agent_type).map(|a| a.phase).unwrap_or(0)
    }

    /// Checkpoint type `agent_type` produces, defaulting to its name.
    pub fn checkpoint_type_for(&self, agent_type: AgentType) -> String {
        self.agent(agent_type)
            .map(|a| a.checkpoint_type.clone())
            .unwrap_or_else(|| agent_type.to_string())
    }

    /// Phase with the given ordinal.
    pub fn phase(&self, ordinal: u32) -> Option<&PhaseConfig> {
        self.phases.iter().find(|p| p.ordinal == ordinal)
    }

    /// Check the table is internally consistent: known dependency targets,
    /// unique phase ordinals and no dependency cycles.
    pub fn validate(&self) -> FoundryResult<()> {
        let known: HashSet<AgentType> = self.agents.iter().map(|a| a.agent_type).collect();
        if known.len() != self.agents.len() {
            return Err(FoundryError::Config(
                "agent type configured more than once".into(),
            ));
        }
        for agent in &self.agents {
            for dep in &agent.depends_on {
                if !known.contains(dep) {
                    return Err(FoundryError::Config(format!(
                        "{} depends on unconfigured type {}",
                        agent.agent_type, dep
                    )));
                }
            }
        }

        let ordinals: HashSet<u32> = self.phases.iter().map(|p| p.ordinal).collect();
        if ordinals.len() != self.phases.len() {
            return Err(FoundryError::Config("duplicate phase ordinal".into()));
        }
        if let Some(agent) = self.agents.iter().find(|a| !ordinals.contains(&a.phase)) {
            return Err(FoundryError::Config(format!(
                "{} is placed in unconfigured phase {}",
                agent.agent_type, agent.phase
            )));
        }

        if self.has_cycle() {
            return Err(FoundryError::Config(
                "dependency cycle detected in agent table".into(),
            ));
        }
        Ok(())
    }

    fn has_cycle(&self) -> bool {
        let mut visited = HashMap::new();
        self.agents
            .iter()
            .any(|a| self.dfs_cycle(a.agent_type, &mut visited))
    }

    fn dfs_cycle(&self, agent_type: AgentType, visited: &mut HashMap<AgentType, u8>) -> bool {
        match visited.get(&agent_type) {
            Some(1) => return true,  // back edge
            Some(2) => return false, // already processed
            _ => {}
        }
        visited.insert(agent_type, 1);
        for dep in self.dependencies(agent_type) {
            if self.dfs_cycle(*dep, visited) {
                return true;
            }
        }
        visited.insert(agent_type, 2);
        false
    }
}

/// How the token budget is enforced on job submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetEnforcement {
    /// No checks.
    Off,
    /// Log when over the limit, but accept the job.
    Soft,
    /// Refuse submissions once the hard limit is reached.
    Hard,
}

/// Per-project token budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Enforcement mode.
    #[serde(default = "default_enforcement")]
    pub enforcement: BudgetEnforcement,
    /// Per-project token count at which submissions start logging warnings.
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: u64,
    /// Per-project token count at which hard enforcement refuses jobs.
    #[serde(default = "default_hard_limit")]
    pub hard_limit: u64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            enforcement: default_enforcement(),
            warning_threshold: default_warning_threshold(),
            hard_limit: default_hard_limit(),
        }
    }
}

/// Concurrency ceiling of a single provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderLimit {
    /// Provider ID.
    pub id: String,
    /// Max jobs in flight against it.
    pub max_concurrent: usize,
}

/// Providers that share one account and therefore one concurrency ceiling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderGroup {
    /// Group ID.
    pub id: String,
    /// Member provider IDs.
    pub providers: Vec<String>,
    /// Max jobs in flight across all members.
    pub max_concurrent: usize,
}

/// Job queue settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Delay between poll ticks, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Max pending jobs fetched per tick.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Size of the bounded worker pool.
    #[serde(default = "default_max_workers_pool")]
    pub max_workers: usize,
    /// Transient failures a job may retry before failing for good.
    #[serde(default = "default_max_job_retries")]
    pub max_job_retries: u32,
    /// Ceiling for providers not listed in `providers`.
    #[serde(default = "default_provider_concurrency")]
    pub default_provider_concurrency: usize,
    /// Per-provider ceilings.
    #[serde(default)]
    pub providers: Vec<ProviderLimit>,
    /// Shared-account groups.
    #[serde(default)]
    pub groups: Vec<ProviderGroup>,
    /// Token budget settings.
    #[serde(default)]
    pub budget: BudgetConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            batch_size: default_batch_size(),
            max_workers: default_max_workers_pool(),
            max_job_retries: default_max_job_retries(),
            default_provider_concurrency: default_provider_concurrency(),
            providers: Vec::new(),
            groups: Vec::new(),
            budget: BudgetConfig::default(),
        }
    }
}

impl QueueConfig {
    /// `poll_interval_ms` as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Reject zero-sized pools and ceilings, overlapping groups and a warning
    /// threshold above the hard limit.
    pub fn validate(&self) -> FoundryResult<()> {
        if self.batch_size == 0 || self.max_workers == 0 {
            return Err(FoundryError::Config(
                "batch_size and max_workers must be positive".into(),
            ));
        }
        let mut grouped = HashSet::new();
        for group in &self.groups {
            for provider in &group.providers {
                if !grouped.insert(provider.as_str()) {
                    return Err(FoundryError::Config(format!(
                        "provider '{provider}' belongs to more than one group"
                    )));
                }
            }
        }
        if self.budget.warning_threshold > self.budget.hard_limit {
            return Err(FoundryError::Config(
                "budget warning threshold exceeds hard limit".into(),
            ));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}
fn default_max_retries() -> u32 {
    3
}
fn default_max_workers() -> u32 {
    5
}
fn default_enforcement() -> BudgetEnforcement {
    BudgetEnforcement::Soft
}
fn default_warning_threshold() -> u64 {
    4_000_000
}
fn default_hard_limit() -> u64 {
    5_000_000
}
fn default_poll_interval_ms() -> u64 {
    1_000
}
fn default_batch_size() -> usize {
    10
}
fn default_max_workers_pool() -> usize {
    8
}
fn default_max_job_retries() -> u32 {
    3
}
fn default_provider_concurrency() -> usize {
    4
}

fn agent_entry(
    agent_type: AgentType,
    phase: u32,
    depends_on: &[AgentType],
    checkpoint_type: &str,
) -> AgentTypeConfig {
    AgentTypeConfig {
        agent_type,
        phase,
        depends_on: depends_on.to_vec(),
        checkpoint_type: checkpoint_type.to_string(),
        review: !agent_type.is_worker(),
        max_retries: default_max_retries(),
        high_cost: matches!(agent_type, AgentType::AssetLeader | AgentType::AssetWorker),
    }
}

fn default_agents() -> Vec<AgentTypeConfig> {
    use AgentType::*;
    vec![
        agent_entry(Concept, 0, &[], "concept"),
        agent_entry(Design, 1, &[Concept], "design"),
        agent_entry(Scenario, 2, &[Design], "scenario"),
        agent_entry(Character, 2, &[Design], "character"),
        agent_entry(World, 2, &[Design], "world"),
        agent_entry(TaskSplit, 3, &[Scenario, Character, World], "task_split"),
        agent_entry(CodeLeader, 4, &[TaskSplit], "code"),
        agent_entry(AssetLeader, 4, &[TaskSplit], "asset"),
        agent_entry(CodeWorker, 4, &[], "code"),
        agent_entry(AssetWorker, 4, &[], "asset"),
        agent_entry(Integrator, 5, &[CodeLeader, AssetLeader], "integration"),
        agent_entry(Tester, 5, &[Integrator], "test"),
        agent_entry(Reviewer, 6, &[Tester], "review"),
    ]
}

fn default_phases() -> Vec<PhaseConfig> {
    let phase = |ordinal: u32, name: &str, types: &[&str]| PhaseConfig {
        ordinal,
        name: name.to_string(),
        checkpoint_types: types.iter().map(|t| (*t).to_string()).collect(),
    };
    vec![
        phase(0, "concept", &["concept"]),
        phase(1, "design", &["design"]),
        phase(2, "narrative", &["scenario", "character", "world"]),
        phase(3, "planning", &["task_split"]),
        phase(4, "production", &["code", "asset"]),
        phase(5, "integration", &["integration", "test"]),
        phase(6, "review", &["review"]),
    ]
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_pipeline_is_valid() {
        let config = PipelineConfig::default();
        config.validate().unwrap();
        assert_eq!(
            config.dependencies(AgentType::TaskSplit),
            &[AgentType::Scenario, AgentType::Character, AgentType::World]
        );
        assert_eq!(config.phase_of(AgentType::Tester), 5);
        assert!(config.phase(2).unwrap().checkpoint_types.contains("world"));
    }

    #[test]
    fn test_cycle_detection() {
        let mut config = PipelineConfig::default();
        let concept = config
            .agents
            .iter_mut()
            .find(|a| a.agent_type == AgentType::Concept)
            .unwrap();
        concept.depends_on = vec![AgentType::Reviewer];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let config = PipelineConfig {
            agents: vec![agent_entry(AgentType::Design, 1, &[AgentType::Concept], "design")],
            phases: default_phases(),
            max_workers_per_leader: 3,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_queue_config_rejects_overlapping_groups() {
        let config = QueueConfig {
            groups: vec![
                ProviderGroup {
                    id: "a".into(),
                    providers: vec!["openai".into()],
                    max_concurrent: 2,
                },
                ProviderGroup {
                    id: "b".into(),
                    providers: vec!["openai".into()],
                    max_concurrent: 2,
                },
            ],
            ..QueueConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(QueueConfig::default().validate().is_ok());
    }

    #[test]
    fn test_toml_overrides_only_named_fields() {
        let config: QueueConfig = toml::from_str(
            r#"
            poll_interval_ms = 250
            [budget]
            enforcement = "hard"
            hard_limit = 10000
            warning_threshold = 8000
            [[groups]]
            id = "shared-account"
            providers = ["anthropic", "bedrock"]
            max_concurrent = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.poll_interval(), Duration::from_millis(250));
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.budget.enforcement, BudgetEnforcement::Hard);
        assert_eq!(config.groups[0].providers.len(), 2);
    }
}
