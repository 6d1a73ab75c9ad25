use std::{sync::Arc, time::Instant};

use rand::{Rng, SeedableRng, rngs::StdRng};
use tracing::info;

use crate::{
    error::ServiceError,
    inference::{FinishReason, PromptBuilder, SamplingParams, decoder, engine},
    model::ModelResource,
};

/// Result of one prompt-to-text run.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub prompt_tokens: usize,
    pub generated_tokens: usize,
    pub finish_reason: FinishReason,
}

/// Prompt construction, decode loop and output decoding over the resident
/// model. Blocking; callers run it off the async executor.
pub struct CompletionPipeline {
    resource: Arc<ModelResource>,
    prompt_builder: PromptBuilder,
    stop_ids: Vec<u32>,
}

impl CompletionPipeline {
    pub fn new(
        resource: Arc<ModelResource>,
        prompt_builder: PromptBuilder,
        stop_ids: Vec<u32>,
    ) -> Self {
        Self {
            resource,
            prompt_builder,
            stop_ids,
        }
    }

    pub fn resource(&self) -> &ModelResource {
        &self.resource
    }

    pub fn stop_ids(&self) -> &[u32] {
        &self.stop_ids
    }

    pub fn complete(
        &self,
        prompt: &str,
        params: &SamplingParams,
    ) -> Result<Completion, ServiceError> {
        let mut rng = StdRng::from_entropy();
        self.complete_with_rng(prompt, params, &mut rng)
    }

    pub fn complete_with_rng<R: Rng + ?Sized>(
        &self,
        prompt: &str,
        params: &SamplingParams,
        rng: &mut R,
    ) -> Result<Completion, ServiceError> {
        let started = Instant::now();
        let sequence = self.prompt_builder.build_prompt(prompt)?;
        let prompt_tokens = sequence.len();

        let output = engine::generate(
            self.resource.model(),
            &sequence,
            params,
            &self.stop_ids,
            rng,
        )?;
        let generated_tokens = output.new_tokens(prompt_tokens).len();
        let text = decoder::decode(self.prompt_builder.tokenizer(), &output, prompt_tokens)?;

        let elapsed = started.elapsed();
        info!(
            prompt_tokens,
            generated_tokens,
            finish_reason = ?output.finish_reason,
            latency_ms = elapsed.as_millis() as u64,
            "completion finished"
        );

        Ok(Completion {
            text,
            prompt_tokens,
            generated_tokens,
            finish_reason: output.finish_reason,
        })
    }
}
