use thiserror::Error;

/// A convenience `Result` alias using [`FoundryError`].
pub type FoundryResult<T> = Result<T, FoundryError>;

/// Top-level error type for the Foundry control plane.
///
/// The first five variants are the orchestration error taxonomy: callers
/// branch on them. The rest are ambient failures from the layers underneath.
#[derive(Error, Debug)]
pub enum FoundryError {
    /// An unknown id was referenced (agent, project, checkpoint, job...).
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Entity kind, e.g. `"agent"`.
        kind: &'static str,
        /// The id that failed to resolve.
        id: String,
    },

    /// Malformed input that no retry will fix.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The operation is not valid for the entity's current status.
    #[error("cannot {operation} {entity} {id} while it is {status}")]
    StateConflict {
        /// Entity kind, e.g. `"agent"`.
        entity: &'static str,
        /// Entity id.
        id: String,
        /// Status the entity was found in.
        status: String,
        /// The refused operation.
        operation: &'static str,
    },

    /// The project's hard token budget is exhausted.
    #[error("token budget exceeded for project {project_id}: {used} used, limit {limit}")]
    BudgetExceeded {
        /// Project whose budget is exhausted.
        project_id: String,
        /// Tokens consumed so far.
        used: u64,
        /// Configured hard limit.
        limit: u64,
    },

    /// A generation provider call failed. Retried by the job queue.
    #[error("Provider error: {0}")]
    Provider(String),

    /// A storage-layer failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FoundryError {
    /// Shorthand for [`FoundryError::NotFound`].
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Shorthand for [`FoundryError::StateConflict`].
    pub fn conflict(
        entity: &'static str,
        id: impl ToString,
        status: impl ToString,
        operation: &'static str,
    ) -> Self {
        Self::StateConflict {
            entity,
            id: id.to_string(),
            status: status.to_string(),
            operation,
        }
    }

    /// Whether the job queue should retry the work that produced this error.
    ///
    /// Only provider failures are transient. Everything else is surfaced to
    /// the caller immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FoundryError::Provider(_))
    }
}
