//! Text-completion collaborator

mod ollama;

pub use ollama::OllamaClient;

use crate::error::Result;

/// One generation request
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub system: Option<String>,
    pub prompt: String,
    /// Context window, in tokens, the prompt was sized for
    pub context_length: u32,
}

impl CompletionRequest {
    pub fn new(system: impl Into<String>, prompt: impl Into<String>, context_length: u32) -> Self {
        Self {
            system: Some(system.into()),
            prompt: prompt.into(),
            context_length,
        }
    }
}

#[async_trait::async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<String>;

    /// Context window, in tokens, that prompts must fit into
    fn context_length(&self) -> u32;

    async fn is_available(&self) -> bool {
        true
    }
}
