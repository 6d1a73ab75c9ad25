use std::sync::Arc;

use async_trait::async_trait;
use tokio::task;
use tracing::info;

use crate::{
    config::AppConfig,
    error::ServiceError,
    gate::AdmissionGate,
    inference::{ChatTemplate, CompletionPipeline, PromptBuilder, SamplingParams, TextTokenizer},
    model::{GenerationRequest, GenerationResponse, ModelMetadata, ModelResource},
};

/// Backend answering `POST /generate`.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(
        &self,
        request: GenerationRequest,
    ) -> Result<GenerationResponse, ServiceError>;

    /// Description of a resident model, when the backend owns one.
    fn metadata(&self) -> Option<&ModelMetadata> {
        None
    }
}

/// Completions from the model held in this process.
pub struct LocalGenerator {
    pipeline: Arc<CompletionPipeline>,
    gate: AdmissionGate,
    max_new_tokens_limit: usize,
}

impl LocalGenerator {
    pub fn new(pipeline: CompletionPipeline, max_new_tokens_limit: usize) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            gate: AdmissionGate::single(),
            max_new_tokens_limit,
        }
    }

    /// Loads the model, the optional adapter, tokenizer and chat template.
    /// Blocking; runs once before the listener is bound.
    pub fn initialize(config: &AppConfig) -> Result<Self, ServiceError> {
        info!(
            model_id = %config.model_id,
            path = %config.model_path.display(),
            dtype = config.dtype.as_str(),
            device = %config.device,
            "loading base model"
        );
        let mut resource = ModelResource::load(config)?;
        info!(
            device = %resource.metadata().device,
            size_bytes = resource.metadata().size_bytes,
            "base model resident"
        );

        if let Some(adapter_dir) = config.adapter_path.as_deref() {
            resource = resource.apply_adapter(adapter_dir).into_resource();
        }

        let tokenizer = Arc::new(TextTokenizer::load(config)?);
        let template = ChatTemplate::load(&config.tokenizer_config_path)?;
        let stop_ids = tokenizer.resolve_stop_ids(&config.eos_tokens)?;
        info!(?stop_ids, "tokenizer ready");

        let pipeline = CompletionPipeline::new(
            Arc::new(resource),
            PromptBuilder::new(tokenizer, template),
            stop_ids,
        );
        Ok(Self::new(pipeline, config.max_new_tokens_limit))
    }

    pub fn pipeline(&self) -> &CompletionPipeline {
        &self.pipeline
    }
}

#[async_trait]
impl TextGenerator for LocalGenerator {
    async fn generate(
        &self,
        request: GenerationRequest,
    ) -> Result<GenerationResponse, ServiceError> {
        let params = SamplingParams::from_request(&request, self.max_new_tokens_limit)?;
        let permit = self.gate.admit().await?;

        let pipeline = self.pipeline.clone();
        let prompt = request.prompt;
        let completion = task::spawn_blocking(move || {
            let _permit = permit;
            pipeline.complete(&prompt, &params)
        })
        .await
        .map_err(|err| ServiceError::Inference(format!("inference task failed: {err}")))??;

        Ok(GenerationResponse {
            response: completion.text,
        })
    }

    fn metadata(&self) -> Option<&ModelMetadata> {
        Some(self.pipeline.resource().metadata())
    }
}
