//! Language model client
//!
//! `LlmClient` is the seam the enrichment pipeline talks to. The bundled
//! implementation speaks the OpenAI-compatible chat completions API.

use crate::config::LlmConfig;
use crate::error::AppError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, PartialEq)]
pub struct GenerateRequest {
    pub prompt: String,
    pub system_message: String,
    pub temperature: f32,
    /// Ask the model to reason before answering
    pub thinking: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LlmResponse {
    pub content: String,
    /// Provider id of the exchange, kept for audit
    pub conversation_id: Option<String>,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn generate(&self, request: GenerateRequest) -> Result<LlmResponse, AppError>;
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    reasoning_effort: Option<&'static str>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    id: Option<String>,
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    content: Option<String>,
}

pub struct HttpLlmClient {
    client: Client,
    endpoint: Url,
    model: String,
    api_key: Option<String>,
    retries: usize,
}

impl HttpLlmClient {
    pub fn new(config: &LlmConfig) -> Result<Self, AppError> {
        let mut base = Url::parse(&config.base_url)
            .map_err(|e| AppError::Config(format!("Invalid LLM_BASE_URL: {}", e)))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let endpoint = base
            .join("chat/completions")
            .map_err(|e| AppError::Config(format!("Invalid LLM_BASE_URL: {}", e)))?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint,
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            retries: 2,
        })
    }

    async fn send_with_retry(&self, request: reqwest::RequestBuilder) -> Result<ChatResponse, AppError> {
        let mut last_err: Option<AppError> = None;
        for attempt in 0..=self.retries {
            let req = request
                .try_clone()
                .ok_or_else(|| AppError::Llm("Failed to clone model request".to_string()))?;
            match req.send().await {
                Ok(response) => match response.error_for_status() {
                    Ok(ok) => {
                        return ok
                            .json::<ChatResponse>()
                            .await
                            .map_err(|e| AppError::Llm(format!("Malformed model response: {}", e)))
                    }
                    Err(e) => last_err = Some(AppError::Llm(e.to_string())),
                },
                Err(e) => last_err = Some(AppError::Llm(e.to_string())),
            }

            if attempt < self.retries {
                tokio::time::sleep(Duration::from_millis(200 * (attempt + 1) as u64)).await;
            }
        }

        Err(last_err.unwrap_or_else(|| AppError::Llm("Model request failed".to_string())))
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn generate(&self, request: GenerateRequest) -> Result<LlmResponse, AppError> {
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage { role: "system", content: &request.system_message },
                ChatMessage { role: "user", content: &request.prompt },
            ],
            temperature: request.temperature,
            reasoning_effort: request.thinking.then_some("medium"),
        };

        let mut builder = self.client.post(self.endpoint.clone()).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = self.send_with_retry(builder).await?;
        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| AppError::Llm("Model returned no content".to_string()))?;

        Ok(LlmResponse {
            content,
            conversation_id: response.id,
        })
    }
}
