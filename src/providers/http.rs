use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::providers::{GenerateRequest, ModelProvider};
use crate::types::Role;

const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Client for an OpenAI-compatible local backend (llama-server and
/// friends). Always loopback in practice; the endpoint comes from config
/// and is the only network destination the runtime ever contacts.
pub struct HttpProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl HttpProvider {
    pub fn new(base_url: &str, model: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .context("build http client")?;
        Ok(HttpProvider {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        })
    }

    fn role_str(role: Role) -> &'static str {
        match role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            // Tool results travel as user-role content; the framing
            // markers carry the distinction for the model.
            Role::Tool => "user",
        }
    }
}

#[async_trait]
impl ModelProvider for HttpProvider {
    async fn generate(&self, req: GenerateRequest) -> anyhow::Result<String> {
        let mut messages = vec![json!({"role": "system", "content": req.system})];
        for m in &req.messages {
            messages.push(json!({"role": Self::role_str(m.role), "content": m.content}));
        }
        let body = json!({
            "model": self.model,
            "messages": messages,
            "stream": false,
        });

        let url = format!("{}/v1/chat/completions", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("POST {url}"))?;
        let status = resp.status();
        let payload: Value = resp.json().await.context("decode completion response")?;
        if !status.is_success() {
            return Err(anyhow!("backend returned {status}: {payload}"));
        }
        payload["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("backend response has no message content"))
    }

    async fn model_id(&self) -> anyhow::Result<String> {
        let url = format!("{}/v1/models", self.base_url);
        let payload: Value = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {url}"))?
            .json()
            .await
            .context("decode models response")?;
        payload["data"][0]["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("backend reported no model id"))
    }
}
