//! Dispatchable generation-provider calls.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a provider job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Queued, waiting for a slot.
    Pending,
    /// Claimed by a poller and in flight.
    Running,
    /// Provider returned a response.
    Completed,
    /// Failed for good or was cancelled.
    Failed,
}

text_enum!(JobStatus {
    Pending => "pending",
    Running => "running",
    Completed => "completed",
    Failed => "failed",
});

impl JobStatus {
    /// `completed` and `failed` are final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Role of a chat message sent to a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    /// Instructions.
    System,
    /// Request content.
    User,
    /// Earlier model output.
    Assistant,
}

/// One message of a provider prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Who is speaking.
    pub role: ChatRole,
    /// Message text.
    pub content: String,
}

impl ChatMessage {
    /// A system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    /// A user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }
}

/// One call to a generation provider, queued and retried independently of
/// the agent that requested it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmJob {
    /// Unique job ID.
    pub id: Uuid,
    /// Owning project, charged for tokens.
    pub project_id: Uuid,
    /// Requesting agent.
    pub agent_id: Uuid,
    /// Provider to dispatch to.
    pub provider_id: String,
    /// Model name passed to the provider.
    pub model: String,
    /// Messages sent to the provider.
    pub prompt: Vec<ChatMessage>,
    /// Completion token cap.
    pub max_tokens: u32,
    /// Higher runs first.
    pub priority: i32,
    /// Current status.
    pub status: JobStatus,
    /// Transient failures retried so far.
    pub retry_count: u32,
    /// Provider response, once completed.
    pub response: Option<String>,
    /// Last error text.
    pub error: Option<String>,
    /// Prompt tokens billed.
    pub input_tokens: u64,
    /// Completion tokens billed.
    pub output_tokens: u64,
    /// When it was submitted.
    pub created_at: DateTime<Utc>,
    /// When it was last claimed.
    pub started_at: Option<DateTime<Utc>>,
    /// When it reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
}

impl LlmJob {
    /// New pending job with a fresh ID.
    pub fn new(
        project_id: Uuid,
        agent_id: Uuid,
        provider_id: impl Into<String>,
        model: impl Into<String>,
        prompt: Vec<ChatMessage>,
        max_tokens: u32,
        priority: i32,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id,
            agent_id,
            provider_id: provider_id.into(),
            model: model.into(),
            prompt,
            max_tokens,
            priority,
            status: JobStatus::Pending,
            retry_count: 0,
            response: None,
            error: None,
            input_tokens: 0,
            output_tokens: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_new_job_is_pending() {
        let job = LlmJob::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "anthropic",
            "claude-sonnet",
            vec![ChatMessage::user("draft the level list")],
            2048,
            5,
        );
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 0);
        assert!(job.response.is_none());
    }

    #[test]
    fn test_job_status_parse() {
        assert_eq!("running".parse::<JobStatus>().unwrap(), JobStatus::Running);
        assert!("queued".parse::<JobStatus>().is_err());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
    }
}
