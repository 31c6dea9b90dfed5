//! LLM provider registry
//!
//! Every provider speaks the OpenAI-compatible chat-completions wire
//! format (OpenRouter, OpenAI, Groq, Ollama natively; Gemini through
//! its OpenAI-compatible endpoint), so one HTTP adapter serves them
//! all. The registry is a list of values satisfying the `LlmClient`
//! capability, built from configuration at startup.

use crate::config::Config;
use crate::error::AgentError;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Capability tag used by the model selector to fill ensemble slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Fast,
    Reasoning,
    Code,
    Local,
}

/// The closed capability every provider plug-in satisfies: send a
/// prompt to a named model, get a text completion within a deadline.
#[async_trait]
pub trait LlmClient: Send + Sync {
    fn name(&self) -> &str;

    fn capability(&self) -> Capability;

    async fn send_prompt(
        &self,
        model: &str,
        system: &str,
        user: &str,
        deadline: Duration,
    ) -> Result<String>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    temperature: f32,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Deserialize)]
struct MessageContent {
    content: Option<String>,
}

/// One configured remote provider.
pub struct HttpProvider {
    name: String,
    base_url: String,
    api_key: String,
    capability: Capability,
    client: reqwest::Client,
}

impl HttpProvider {
    pub fn new(name: &str, base_url: &str, api_key: &str, capability: Capability) -> Self {
        Self {
            name: name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            capability,
            client: reqwest::Client::new(),
        }
    }

    async fn post_chat(
        &self,
        model: &str,
        system: &str,
        user: &str,
        deadline: Duration,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let request = ChatRequest {
            model,
            messages: vec![
                Message { role: "system", content: system },
                Message { role: "user", content: user },
            ],
            temperature: 0.1,
        };
        self.client
            .post(format!("{}/chat/completions", self.base_url))
            .timeout(deadline)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
    }
}

#[async_trait]
impl LlmClient for HttpProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capability(&self) -> Capability {
        self.capability
    }

    async fn send_prompt(
        &self,
        model: &str,
        system: &str,
        user: &str,
        deadline: Duration,
    ) -> Result<String> {
        // One retry on transport errors only; semantic rejections
        // (4xx other than 429) surface immediately.
        let mut last_transport: Option<reqwest::Error> = None;
        for attempt in 0..2 {
            let response = match self.post_chat(model, system, user, deadline).await {
                Ok(r) => r,
                Err(e) => {
                    last_transport = Some(e);
                    continue;
                }
            };

            let status = response.status();
            let text = response.text().await.unwrap_or_default();

            if status.is_success() {
                let parsed: ChatResponse = serde_json::from_str(&text).map_err(|e| {
                    anyhow::anyhow!("{}: failed to parse completion response: {}", self.name, e)
                })?;
                let content = parsed
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|c| c.message.content)
                    .unwrap_or_default();
                if content.trim().is_empty() {
                    return Err(anyhow::anyhow!("{}: empty completion", self.name));
                }
                return Ok(content);
            }

            if status.as_u16() == 429 && attempt == 0 {
                tokio::time::sleep(Duration::from_secs(2)).await;
                continue;
            }

            return Err(anyhow::anyhow!(
                "{}: API error {}: {}",
                self.name,
                status,
                crate::prompt::truncate(&text, 200)
            ));
        }
        Err(anyhow::anyhow!(
            "{}: transport error: {}",
            self.name,
            last_transport
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown".to_string())
        ))
    }
}

/// Build the provider list from configuration. Order doubles as the
/// global priority order used for ensemble tie-breaks.
pub fn build_registry(cfg: &Config) -> Result<Vec<Arc<dyn LlmClient>>, AgentError> {
    cfg.validate()?;

    let mut registry: Vec<Arc<dyn LlmClient>> = Vec::new();
    if let Some(key) = &cfg.openrouter_api_key {
        registry.push(Arc::new(HttpProvider::new(
            "OpenRouter",
            "https://openrouter.ai/api/v1",
            key,
            Capability::Reasoning,
        )));
    }
    if let Some(key) = &cfg.openai_api_key {
        registry.push(Arc::new(HttpProvider::new(
            "OpenAI",
            "https://api.openai.com/v1",
            key,
            Capability::Reasoning,
        )));
    }
    if let Some(key) = &cfg.gemini_api_key {
        registry.push(Arc::new(HttpProvider::new(
            "Gemini",
            "https://generativelanguage.googleapis.com/v1beta/openai",
            key,
            Capability::Fast,
        )));
    }
    if let Some(key) = &cfg.groq_api_key {
        registry.push(Arc::new(HttpProvider::new(
            "Groq",
            "https://api.groq.com/openai/v1",
            key,
            Capability::Fast,
        )));
    }
    if cfg.ollama_enabled {
        registry.push(Arc::new(HttpProvider::new(
            "Ollama",
            &cfg.ollama_base_url,
            "ollama",
            Capability::Local,
        )));
    }

    if registry.is_empty() {
        return Err(AgentError::Config("no LLM provider configured".to_string()));
    }
    Ok(registry)
}
