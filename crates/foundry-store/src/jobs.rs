use crate::{json_col, text_col, Db, SqlContext};
use foundry_core::{FoundryError, FoundryResult, JobStatus, LlmJob};
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

const JOB_COLUMNS: &str = "id, project_id, agent_id, provider_id, model, prompt, max_tokens, \
     priority, status, retry_count, response, error, input_tokens, output_tokens, created_at, \
     started_at, completed_at";

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<LlmJob> {
    let input_tokens: i64 = row.get(12)?;
    let output_tokens: i64 = row.get(13)?;
    Ok(LlmJob {
        id: row.get(0)?,
        project_id: row.get(1)?,
        agent_id: row.get(2)?,
        provider_id: row.get(3)?,
        model: row.get(4)?,
        prompt: json_col(row, 5)?,
        max_tokens: row.get(6)?,
        priority: row.get(7)?,
        status: text_col(row, 8)?,
        retry_count: row.get(9)?,
        response: row.get(10)?,
        error: row.get(11)?,
        input_tokens: input_tokens as u64,
        output_tokens: output_tokens as u64,
        created_at: row.get(14)?,
        started_at: row.get(15)?,
        completed_at: row.get(16)?,
    })
}

impl Db<'_> {
    /// Insert a new job row.
    pub fn insert_job(&self, job: &LlmJob) -> FoundryResult<()> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO llm_jobs ({JOB_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
                ),
                params![
                    job.id,
                    job.project_id,
                    job.agent_id,
                    job.provider_id,
                    job.model,
                    serde_json::to_string(&job.prompt)?,
                    job.max_tokens,
                    job.priority,
                    job.status.as_str(),
                    job.retry_count,
                    job.response,
                    job.error,
                    job.input_tokens as i64,
                    job.output_tokens as i64,
                    job.created_at,
                    job.started_at,
                    job.completed_at,
                ],
            )
            .sql()?;
        Ok(())
    }

    /// Job by id, if any.
    pub fn get_job(&self, id: Uuid) -> FoundryResult<Option<LlmJob>> {
        self.conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM llm_jobs WHERE id = ?1"),
                params![id],
                job_from_row,
            )
            .optional()
            .sql()
    }

    /// Job by id, or `NotFound`.
    pub fn require_job(&self, id: Uuid) -> FoundryResult<LlmJob> {
        self.get_job(id)?
            .ok_or_else(|| FoundryError::not_found("job", id))
    }

    /// Atomically move a job from `pending` to `running` and return the row
    /// as claimed.
    ///
    /// Returns `None` when another claimer got there first (or the job is
    /// gone). Only the caller that receives the row may execute the job, and
    /// it must run that row rather than any earlier read of it.
    pub fn claim_job(
        &self,
        id: Uuid,
        at: chrono::DateTime<chrono::Utc>,
    ) -> FoundryResult<Option<LlmJob>> {
        self.conn
            .query_row(
                &format!(
                    "UPDATE llm_jobs SET status = 'running', started_at = ?2
                     WHERE id = ?1 AND status = 'pending'
                     RETURNING {JOB_COLUMNS}"
                ),
                params![id, at],
                job_from_row,
            )
            .optional()
            .sql()
    }

    /// Fail every `pending` or `running` job of an agent in one statement.
    ///
    /// A worker still running one of these jobs loses its write-back, since
    /// [`transition_job`](Self::transition_job) expects `running`. Returns the
    /// jobs as they were before the update.
    pub fn fail_open_jobs_for_agent(
        &self,
        agent_id: Uuid,
        reason: &str,
        at: chrono::DateTime<chrono::Utc>,
    ) -> FoundryResult<Vec<LlmJob>> {
        let open = {
            let mut stmt = self
                .conn
                .prepare(&format!(
                    "SELECT {JOB_COLUMNS} FROM llm_jobs
                     WHERE agent_id = ?1 AND status IN ('pending', 'running')
                     ORDER BY created_at ASC"
                ))
                .sql()?;
            let rows = stmt.query_map(params![agent_id], job_from_row).sql()?;
            rows.collect::<rusqlite::Result<Vec<_>>>().sql()?
        };
        self.conn
            .execute(
                "UPDATE llm_jobs SET status = 'failed', error = ?2, completed_at = ?3
                 WHERE agent_id = ?1 AND status IN ('pending', 'running')",
                params![agent_id, reason, at],
            )
            .sql()?;
        Ok(open)
    }

    /// Write `job` back only if the stored row is still in `expected` status.
    pub fn transition_job(&self, job: &LlmJob, expected: JobStatus) -> FoundryResult<bool> {
        let rows = self
            .conn
            .execute(
                "UPDATE llm_jobs SET status = ?2, retry_count = ?3, response = ?4, error = ?5,
                    input_tokens = ?6, output_tokens = ?7, started_at = ?8, completed_at = ?9
                 WHERE id = ?1 AND status = ?10",
                params![
                    job.id,
                    job.status.as_str(),
                    job.retry_count,
                    job.response,
                    job.error,
                    job.input_tokens as i64,
                    job.output_tokens as i64,
                    job.started_at,
                    job.completed_at,
                    expected.as_str(),
                ],
            )
            .sql()?;
        Ok(rows == 1)
    }

    /// Pending jobs in dispatch order: priority first, then age.
    pub fn list_claimable(&self, limit: usize) -> FoundryResult<Vec<LlmJob>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM llm_jobs WHERE status = 'pending'
                 ORDER BY priority DESC, created_at ASC, rowid ASC
                 LIMIT ?1"
            ))
            .sql()?;
        let rows = stmt
            .query_map(params![limit as i64], job_from_row)
            .sql()?;
        rows.collect::<rusqlite::Result<Vec<_>>>().sql()
    }

    /// Jobs in `status` across all projects, oldest first.
    pub fn list_jobs_with_status(&self, status: JobStatus) -> FoundryResult<Vec<LlmJob>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM llm_jobs WHERE status = ?1 ORDER BY created_at ASC"
            ))
            .sql()?;
        let rows = stmt
            .query_map(params![status.as_str()], job_from_row)
            .sql()?;
        rows.collect::<rusqlite::Result<Vec<_>>>().sql()
    }

    /// Jobs of a project, oldest first.
    pub fn list_jobs(&self, project_id: Uuid) -> FoundryResult<Vec<LlmJob>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM llm_jobs WHERE project_id = ?1 ORDER BY created_at ASC"
            ))
            .sql()?;
        let rows = stmt.query_map(params![project_id], job_from_row).sql()?;
        rows.collect::<rusqlite::Result<Vec<_>>>().sql()
    }

    /// Total tokens recorded by completed jobs of a project.
    pub fn project_token_usage(&self, project_id: Uuid) -> FoundryResult<u64> {
        let total: i64 = self
            .conn
            .query_row(
                "SELECT COALESCE(SUM(input_tokens + output_tokens), 0) FROM llm_jobs
                 WHERE project_id = ?1 AND status = 'completed'",
                params![project_id],
                |row| row.get(0),
            )
            .sql()?;
        Ok(total.max(0) as u64)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use crate::Store;
    use chrono::Utc;
    use foundry_core::{ChatMessage, JobStatus, LlmJob, Project};
    use uuid::Uuid;

    fn job(project: &Project, priority: i32) -> LlmJob {
        LlmJob::new(
            project.id,
            Uuid::new_v4(),
            "mock",
            "mock-small",
            vec![ChatMessage::user("hello")],
            256,
            priority,
        )
    }

    fn seeded() -> (Store, Project) {
        let store = Store::open_in_memory().unwrap();
        let project = Project::new("jobs");
        store.transaction(|db| db.insert_project(&project)).unwrap();
        (store, project)
    }

    #[test]
    fn test_claim_is_exclusive() {
        let (store, project) = seeded();
        let job = job(&project, 0);
        store.transaction(|db| db.insert_job(&job)).unwrap();

        let claimed = store
            .transaction(|db| db.claim_job(job.id, Utc::now()))
            .unwrap()
            .unwrap();
        assert_eq!(claimed.status, JobStatus::Running);
        assert!(store
            .transaction(|db| db.claim_job(job.id, Utc::now()))
            .unwrap()
            .is_none());

        let loaded = store.read(|db| db.require_job(job.id)).unwrap();
        assert_eq!(loaded.status, JobStatus::Running);
        assert!(loaded.started_at.is_some());
    }

    #[test]
    fn test_claimable_order_prefers_priority_then_age() {
        let (store, project) = seeded();
        let low = job(&project, 0);
        let high = job(&project, 5);
        let low_later = job(&project, 0);
        store
            .transaction(|db| {
                db.insert_job(&low)?;
                db.insert_job(&high)?;
                db.insert_job(&low_later)
            })
            .unwrap();

        let ids: Vec<_> = store
            .read(|db| db.list_claimable(10))
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(ids, vec![high.id, low.id, low_later.id]);
    }

    #[test]
    fn test_transition_requires_expected_status() {
        let (store, project) = seeded();
        let mut job = job(&project, 0);
        store.transaction(|db| db.insert_job(&job)).unwrap();

        job.status = JobStatus::Completed;
        job.input_tokens = 10;
        job.output_tokens = 30;
        assert!(!store
            .transaction(|db| db.transition_job(&job, JobStatus::Running))
            .unwrap());
        assert!(store
            .transaction(|db| db.transition_job(&job, JobStatus::Pending))
            .unwrap());
        assert_eq!(
            store.read(|db| db.project_token_usage(project.id)).unwrap(),
            40
        );
    }

    #[test]
    fn test_claim_returns_current_row_not_stale_read() {
        let (store, project) = seeded();
        let job = job(&project, 0);
        store.transaction(|db| db.insert_job(&job)).unwrap();
        let listed = store.read(|db| db.list_claimable(10)).unwrap();
        assert_eq!(listed[0].retry_count, 0);

        // Another poller runs and requeues it before this one claims.
        let mut requeued = store
            .transaction(|db| db.claim_job(job.id, Utc::now()))
            .unwrap()
            .unwrap();
        requeued.status = JobStatus::Pending;
        requeued.retry_count = 1;
        requeued.started_at = None;
        assert!(store
            .transaction(|db| db.transition_job(&requeued, JobStatus::Running))
            .unwrap());

        let claimed = store
            .transaction(|db| db.claim_job(listed[0].id, Utc::now()))
            .unwrap()
            .unwrap();
        assert_eq!(claimed.retry_count, 1);
        assert!(claimed.started_at.is_some());
    }

    #[test]
    fn test_fail_open_jobs_for_agent() {
        let (store, project) = seeded();
        let agent_id = Uuid::new_v4();
        let mut pending = job(&project, 0);
        pending.agent_id = agent_id;
        let mut running = job(&project, 0);
        running.agent_id = agent_id;
        let mut done = job(&project, 0);
        done.agent_id = agent_id;
        done.status = JobStatus::Completed;
        let other = job(&project, 0);
        store
            .transaction(|db| {
                db.insert_job(&pending)?;
                db.insert_job(&running)?;
                db.insert_job(&done)?;
                db.insert_job(&other)
            })
            .unwrap();
        store
            .transaction(|db| db.claim_job(running.id, Utc::now()))
            .unwrap()
            .unwrap();

        let failed = store
            .transaction(|db| db.fail_open_jobs_for_agent(agent_id, "agent cancelled", Utc::now()))
            .unwrap();
        assert_eq!(failed.len(), 2);

        let status = |id| store.read(|db| db.require_job(id)).unwrap().status;
        assert_eq!(status(pending.id), JobStatus::Failed);
        assert_eq!(status(running.id), JobStatus::Failed);
        assert_eq!(status(done.id), JobStatus::Completed);
        assert_eq!(status(other.id), JobStatus::Pending);

        // The worker holding the running job can no longer write it back.
        let mut late = store.read(|db| db.require_job(running.id)).unwrap();
        late.status = JobStatus::Completed;
        assert!(!store
            .transaction(|db| db.transition_job(&late, JobStatus::Running))
            .unwrap());
    }
}
