use tokenizers::{FromPretrainedParameters, Tokenizer};
use tracing::{debug, info};

use crate::{config::AppConfig, error::ServiceError};

/// Terminators recognised in addition to the configured ones when the
/// vocabulary defines them.
const COMMON_STOP_TOKENS: &[&str] = &["</s>", "<|endoftext|>", "<|im_end|>", "<|eot_id|>"];

pub struct TextTokenizer {
    inner: Tokenizer,
}

impl TextTokenizer {
    pub fn new(inner: Tokenizer) -> Self {
        Self { inner }
    }

    /// Loads `tokenizer.json` from disk, or fetches it from the hub for the
    /// configured model id when the file is absent.
    pub fn load(config: &AppConfig) -> Result<Self, ServiceError> {
        let inner = if config.tokenizer_path.exists() {
            info!(path = %config.tokenizer_path.display(), "loading tokenizer");
            Tokenizer::from_file(&config.tokenizer_path)
        } else {
            info!(model_id = %config.model_id, "tokenizer file missing, fetching from hub");
            let params = FromPretrainedParameters {
                revision: config.revision.clone().unwrap_or_else(|| "main".to_string()),
                ..Default::default()
            };
            Tokenizer::from_pretrained(&config.model_id, Some(params))
        }
        .map_err(|e| ServiceError::Startup(format!("tokenizer unavailable: {e}")))?;

        Ok(Self::new(inner))
    }

    /// Encodes already-rendered text. Special tokens are not added: the chat
    /// template is responsible for BOS and turn markers.
    pub fn encode_rendered(&self, text: &str) -> Result<(Vec<u32>, Vec<u32>), ServiceError> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))?;
        Ok((
            encoding.get_ids().to_vec(),
            encoding.get_attention_mask().to_vec(),
        ))
    }

    /// Decodes ids, dropping special and control tokens.
    pub fn decode(&self, ids: &[u32]) -> Result<String, ServiceError> {
        self.inner
            .decode(ids, true)
            .map_err(|e| ServiceError::Tokenizer(e.to_string()))
    }

    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.inner.token_to_id(token)
    }

    /// Resolves the ids that end generation. At least one configured or
    /// common terminator must exist in the vocabulary.
    pub fn resolve_stop_ids(&self, configured: &[String]) -> Result<Vec<u32>, ServiceError> {
        let mut ids = Vec::new();
        let candidates = configured
            .iter()
            .map(String::as_str)
            .chain(COMMON_STOP_TOKENS.iter().copied());
        for token in candidates {
            if let Some(id) = self.token_to_id(token) {
                if !ids.contains(&id) {
                    debug!(token, id, "stop token");
                    ids.push(id);
                }
            }
        }

        if ids.is_empty() {
            return Err(ServiceError::Startup(format!(
                "none of the stop tokens {configured:?} exist in the vocabulary"
            )));
        }
        Ok(ids)
    }
}
