use std::sync::Arc;

use crate::{
    error::ServiceError,
    inference::{ChatTemplate, TextTokenizer},
};

/// Token ids of one rendered chat turn plus the generation-start marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptSequence {
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
}

impl PromptSequence {
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }
}

pub struct PromptBuilder {
    tokenizer: Arc<TextTokenizer>,
    template: ChatTemplate,
}

impl PromptBuilder {
    pub fn new(tokenizer: Arc<TextTokenizer>, template: ChatTemplate) -> Self {
        Self {
            tokenizer,
            template,
        }
    }

    pub fn tokenizer(&self) -> &TextTokenizer {
        &self.tokenizer
    }

    /// Renders `text` as a user turn and tokenizes the result.
    pub fn build_prompt(&self, text: &str) -> Result<PromptSequence, ServiceError> {
        let rendered = self.template.render_user_turn(text)?;
        let (input_ids, attention_mask) = self.tokenizer.encode_rendered(&rendered)?;
        if input_ids.is_empty() {
            return Err(ServiceError::Tokenizer(
                "rendered prompt produced no tokens".into(),
            ));
        }

        Ok(PromptSequence {
            input_ids,
            attention_mask,
        })
    }
}
