use async_trait::async_trait;
use foundry_core::{ChatMessage, FoundryResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// What a provider returns for one chat call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Generated text.
    pub content: String,
    /// Prompt tokens billed.
    pub input_tokens: u64,
    /// Completion tokens billed.
    pub output_tokens: u64,
}

/// Client for one external generation provider account.
///
/// Implementations surface network or rate-limit failures as
/// [`FoundryError::Provider`](foundry_core::FoundryError::Provider); the
/// queue retries those. Any other error fails the job immediately.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Send one chat request.
    async fn chat(
        &self,
        messages: &[ChatMessage],
        model: &str,
        max_tokens: u32,
    ) -> FoundryResult<ChatResponse>;
}

/// Provider clients keyed by provider id.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    clients: HashMap<String, Arc<dyn ProviderClient>>,
}

impl ProviderRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the client for `id`.
    pub fn register(&mut self, id: impl Into<String>, client: Arc<dyn ProviderClient>) {
        self.clients.insert(id.into(), client);
    }

    /// Builder form of [`register`](Self::register).
    pub fn with(mut self, id: impl Into<String>, client: Arc<dyn ProviderClient>) -> Self {
        self.register(id, client);
        self
    }

    /// Client for `id`, if registered.
    pub fn get(&self, id: &str) -> Option<Arc<dyn ProviderClient>> {
        self.clients.get(id).cloned()
    }

    /// Whether `id` is registered.
    pub fn contains(&self, id: &str) -> bool {
        self.clients.contains_key(id)
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.clients.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}
