//! `POST /generate` served by an OpenAI-compatible chat completions endpoint.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    config::AppConfig,
    error::ServiceError,
    generator::TextGenerator,
    inference::SamplingParams,
    model::{GenerationRequest, GenerationResponse},
};

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    max_tokens: usize,
    temperature: f64,
    top_p: f64,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: AssistantMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Option<String>,
}

pub struct RemoteGenerator {
    client: Client,
    endpoint: String,
    model: String,
    api_key: String,
    max_new_tokens_limit: usize,
}

impl RemoteGenerator {
    pub fn from_config(config: &AppConfig) -> Result<Self, ServiceError> {
        let client = Client::builder()
            .timeout(config.upstream_timeout)
            .build()
            .map_err(|e| ServiceError::Startup(format!("http client: {e}")))?;
        let endpoint = format!(
            "{}/chat/completions",
            config.remote_base_url.trim_end_matches('/')
        );
        info!(%endpoint, model = %config.remote_model, "forwarding completions upstream");

        Ok(Self {
            client,
            endpoint,
            model: config.remote_model.clone(),
            api_key: config.remote_api_key.clone(),
            max_new_tokens_limit: config.max_new_tokens_limit,
        })
    }
}

#[async_trait]
impl TextGenerator for RemoteGenerator {
    async fn generate(
        &self,
        request: GenerationRequest,
    ) -> Result<GenerationResponse, ServiceError> {
        let params = SamplingParams::from_request(&request, self.max_new_tokens_limit)?;
        let body = ChatCompletionRequest {
            model: &self.model,
            messages: [ChatMessage {
                role: "user",
                content: &request.prompt,
            }],
            max_tokens: params.max_new_tokens,
            temperature: params.temperature,
            top_p: params.top_p,
            stream: false,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                ServiceError::Upstream(format!("request to {} failed: {e}", self.endpoint))
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ServiceError::Upstream(format!(
                "{} returned {status}: {detail}",
                self.endpoint
            )));
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::Upstream(format!("malformed completion: {e}")))?;
        let choice = completion
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ServiceError::Upstream("completion has no choices".into()))?;
        debug!(finish_reason = ?choice.finish_reason, "upstream completion");

        Ok(GenerationResponse {
            response: choice.message.content.unwrap_or_default(),
        })
    }
}
