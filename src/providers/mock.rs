use std::collections::VecDeque;
use std::sync::Mutex;

use anyhow::anyhow;
use async_trait::async_trait;

use crate::providers::{GenerateRequest, ModelProvider};

/// Scripted provider for tests and offline runs: each `generate` pops the
/// next canned output, which may contain `::TOOL …::` markers like a real
/// generation.
#[derive(Debug, Default)]
pub struct MockProvider {
    outputs: Mutex<VecDeque<String>>,
}

impl MockProvider {
    pub fn new(outputs: Vec<String>) -> Self {
        MockProvider {
            outputs: Mutex::new(outputs.into()),
        }
    }

    pub fn push(&self, output: impl Into<String>) {
        self.outputs
            .lock()
            .expect("mock outputs lock")
            .push_back(output.into());
    }
}

#[async_trait]
impl ModelProvider for MockProvider {
    async fn generate(&self, _req: GenerateRequest) -> anyhow::Result<String> {
        self.outputs
            .lock()
            .expect("mock outputs lock")
            .pop_front()
            .ok_or_else(|| anyhow!("mock provider has no scripted output left"))
    }

    async fn model_id(&self) -> anyhow::Result<String> {
        Ok("mock".to_string())
    }
}
