use async_trait::async_trait;

use crate::types::Message;

pub mod http;
pub mod mock;

#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub system: String,
    pub messages: Vec<Message>,
}

/// Seam to the local model backend. The backend is an external
/// collaborator: the runtime only ever consumes its text output and
/// never trusts it beyond that.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn generate(&self, req: GenerateRequest) -> anyhow::Result<String>;

    /// Model identity reported by the backend, compared against
    /// `--expected-model` at boot.
    async fn model_id(&self) -> anyhow::Result<String>;
}
