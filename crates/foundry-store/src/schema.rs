/// Idempotent schema. Every table owned by a project cascades on project delete;
/// agent references from jobs and checkpoints are weak (no foreign key).
pub(crate) const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS projects (
    id BLOB PRIMARY KEY,
    name TEXT NOT NULL,
    status TEXT NOT NULL,
    current_phase INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS agents (
    id BLOB PRIMARY KEY,
    project_id BLOB NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    agent_type TEXT NOT NULL,
    phase INTEGER NOT NULL,
    status TEXT NOT NULL,
    progress INTEGER NOT NULL DEFAULT 0,
    current_task TEXT,
    input_tokens INTEGER NOT NULL DEFAULT 0,
    output_tokens INTEGER NOT NULL DEFAULT 0,
    parent_agent_id BLOB,
    retry_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_agents_project ON agents(project_id, status);

CREATE TABLE IF NOT EXISTS checkpoints (
    id BLOB PRIMARY KEY,
    project_id BLOB NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    agent_id BLOB NOT NULL,
    checkpoint_type TEXT NOT NULL,
    status TEXT NOT NULL,
    output TEXT NOT NULL,
    feedback TEXT,
    created_at TEXT NOT NULL,
    resolved_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_checkpoints_agent ON checkpoints(agent_id, status);

CREATE TABLE IF NOT EXISTS assets (
    id BLOB PRIMARY KEY,
    project_id BLOB NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    agent_id BLOB NOT NULL,
    category TEXT NOT NULL,
    name TEXT NOT NULL,
    payload TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_assets_agent ON assets(agent_id, status);

CREATE TABLE IF NOT EXISTS interventions (
    id BLOB PRIMARY KEY,
    project_id BLOB NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    target_agent_id BLOB,
    message TEXT NOT NULL,
    priority TEXT NOT NULL,
    status TEXT NOT NULL,
    responses TEXT NOT NULL DEFAULT '[]',
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS llm_jobs (
    id BLOB PRIMARY KEY,
    project_id BLOB NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    agent_id BLOB NOT NULL,
    provider_id TEXT NOT NULL,
    model TEXT NOT NULL,
    prompt TEXT NOT NULL,
    max_tokens INTEGER NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    response TEXT,
    error TEXT,
    input_tokens INTEGER NOT NULL DEFAULT 0,
    output_tokens INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_jobs_claimable ON llm_jobs(status, priority DESC, created_at ASC);

CREATE TABLE IF NOT EXISTS quality_settings (
    project_id BLOB NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    agent_type TEXT NOT NULL,
    enabled INTEGER NOT NULL,
    max_retries INTEGER NOT NULL,
    high_cost INTEGER NOT NULL,
    PRIMARY KEY (project_id, agent_type)
);

CREATE TABLE IF NOT EXISTS auto_approval_rules (
    project_id BLOB NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    category TEXT NOT NULL,
    enabled INTEGER NOT NULL,
    PRIMARY KEY (project_id, category)
);

CREATE TABLE IF NOT EXISTS workflow_snapshots (
    id BLOB PRIMARY KEY,
    project_id BLOB NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    agent_id BLOB NOT NULL,
    workflow_run_id BLOB NOT NULL,
    step TEXT NOT NULL,
    progress INTEGER NOT NULL,
    current_task TEXT,
    state TEXT NOT NULL,
    worker_tasks TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_snapshots_run ON workflow_snapshots(agent_id, workflow_run_id);
";
