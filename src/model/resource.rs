use crate::{
    config::AppConfig,
    error::ServiceError,
    model::{ModelMetadata, adapter::LoraAdapter},
};

/// Forward pass of a causal language model.
///
/// Implementations are shared read-only across requests once serving starts;
/// only [`LanguageModel::merge_lora`] takes `&mut self`, and it runs during
/// startup before any request is admitted.
pub trait LanguageModel: Send + Sync {
    /// Logits over the vocabulary for the position following the last token
    /// of `input_ids`. `attention_mask` has the same length as `input_ids`.
    fn next_token_logits(
        &self,
        input_ids: &[u32],
        attention_mask: &[u32],
    ) -> Result<Vec<f32>, ServiceError>;

    /// Merges a low-rank adapter into the base weights, returning the number
    /// of parameters that were updated. Must leave the weights untouched when
    /// it returns an error.
    fn merge_lora(&mut self, adapter: &LoraAdapter) -> Result<usize, ServiceError> {
        Err(ServiceError::Adapter(format!(
            "backend cannot compose adapter {}",
            adapter.path.display()
        )))
    }
}

/// The resident model: weights placed on a device at a fixed precision.
pub struct ModelResource {
    pub(crate) model: Box<dyn LanguageModel>,
    pub(crate) metadata: ModelMetadata,
}

impl ModelResource {
    pub fn new(model: Box<dyn LanguageModel>, metadata: ModelMetadata) -> Self {
        Self { model, metadata }
    }

    #[cfg(feature = "tch-backend")]
    pub fn load(config: &AppConfig) -> Result<Self, ServiceError> {
        use crate::model::{AdapterStatus, torch::TorchScriptModel};

        let model = TorchScriptModel::load(&config.model_path, config.device, config.dtype)?;
        let metadata = ModelMetadata {
            model_id: config.model_id.clone(),
            dtype: config.dtype.as_str().to_string(),
            device: model.device_label(),
            size_bytes: model.size_bytes(),
            adapter: AdapterStatus::None,
        };
        Ok(Self::new(Box::new(model), metadata))
    }

    #[cfg(not(feature = "tch-backend"))]
    pub fn load(config: &AppConfig) -> Result<Self, ServiceError> {
        Err(ServiceError::Startup(format!(
            "cannot load {}: built without the tch-backend feature",
            config.model_path.display()
        )))
    }

    pub fn model(&self) -> &dyn LanguageModel {
        self.model.as_ref()
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }
}
