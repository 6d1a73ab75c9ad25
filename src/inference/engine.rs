use rand::Rng;

use crate::{
    error::ServiceError,
    inference::{PromptSequence, SamplingParams, sampling::sample_next},
    model::LanguageModel,
};

/// Whether `GenerationOutput::tokens` begins with the prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceLayout {
    PromptEchoed,
    NewTokensOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// A stop token was sampled.
    Eos,
    /// `max_new_tokens` were produced.
    Length,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationOutput {
    pub tokens: Vec<u32>,
    pub layout: SequenceLayout,
    pub finish_reason: FinishReason,
}

impl GenerationOutput {
    /// Tokens produced after the prompt. An echoed output that is not longer
    /// than the prompt yields an empty slice.
    pub fn new_tokens(&self, prompt_len: usize) -> &[u32] {
        match self.layout {
            SequenceLayout::PromptEchoed => self.tokens.get(prompt_len..).unwrap_or(&[]),
            SequenceLayout::NewTokensOnly => &self.tokens,
        }
    }
}

/// Autoregressive decode of `prompt` until a stop id is sampled or
/// `params.max_new_tokens` tokens were produced. The sampled stop id is kept
/// in the output.
pub fn generate<R: Rng + ?Sized>(
    model: &dyn LanguageModel,
    prompt: &PromptSequence,
    params: &SamplingParams,
    stop_ids: &[u32],
    rng: &mut R,
) -> Result<GenerationOutput, ServiceError> {
    let mut tokens = Vec::with_capacity(prompt.len() + params.max_new_tokens);
    tokens.extend_from_slice(&prompt.input_ids);
    let mut attention_mask = Vec::with_capacity(tokens.capacity());
    attention_mask.extend_from_slice(&prompt.attention_mask);

    let mut finish_reason = FinishReason::Length;
    for step in 0..params.max_new_tokens {
        let logits = model
            .next_token_logits(&tokens, &attention_mask)
            .map_err(|err| match err {
                ServiceError::ResourceExhausted(detail) => ServiceError::ResourceExhausted(format!(
                    "{detail}; failed at new token {} of {}, retry with a smaller max_new_tokens",
                    step + 1,
                    params.max_new_tokens
                )),
                other => other,
            })?;

        let next = sample_next(&logits, params, rng)?;
        tokens.push(next);
        attention_mask.push(1);

        if stop_ids.contains(&next) {
            finish_reason = FinishReason::Eos;
            break;
        }
    }

    Ok(GenerationOutput {
        tokens,
        layout: SequenceLayout::PromptEchoed,
        finish_reason,
    })
}
