//! Optional low-rank adapter composition performed once at startup.
//!
//! Adapters use the PEFT on-disk layout: `adapter_config.json` next to
//! `adapter_model.safetensors`. Any failure leaves the base weights in place
//! and the service keeps starting with them.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use serde::Deserialize;
use tracing::{info, warn};

use crate::{
    error::ServiceError,
    model::{AdapterStatus, ModelResource},
};

const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";
const ADAPTER_WEIGHTS_FILE: &str = "adapter_model.safetensors";
const PEFT_PREFIX: &str = "base_model.model.";

#[derive(Debug, Clone, Deserialize)]
pub struct AdapterConfig {
    pub r: usize,
    pub lora_alpha: f64,
    #[serde(default)]
    pub use_rslora: bool,
    #[serde(default)]
    pub base_model_name_or_path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LoraAdapter {
    pub path: PathBuf,
    pub weights_path: PathBuf,
    pub config: AdapterConfig,
}

impl LoraAdapter {
    pub fn open(dir: &Path) -> Result<Self, ServiceError> {
        if !dir.is_dir() {
            return Err(ServiceError::Adapter(format!(
                "adapter path '{}' not found",
                dir.display()
            )));
        }

        let raw = fs::read_to_string(dir.join(ADAPTER_CONFIG_FILE)).map_err(|e| {
            ServiceError::Adapter(format!("cannot read {ADAPTER_CONFIG_FILE}: {e}"))
        })?;
        let config: AdapterConfig = serde_json::from_str(&raw).map_err(|e| {
            ServiceError::Adapter(format!("invalid {ADAPTER_CONFIG_FILE}: {e}"))
        })?;
        if config.r == 0 {
            return Err(ServiceError::Adapter("adapter rank must be positive".into()));
        }

        let weights_path = dir.join(ADAPTER_WEIGHTS_FILE);
        if !weights_path.is_file() {
            return Err(ServiceError::Adapter(format!(
                "adapter weights missing: {}",
                weights_path.display()
            )));
        }

        Ok(Self {
            path: dir.to_path_buf(),
            weights_path,
            config,
        })
    }

    /// Multiplier applied to `B·A` before it is added to the base weight.
    pub fn scale(&self) -> f64 {
        let rank = self.config.r as f64;
        if self.config.use_rslora {
            self.config.lora_alpha / rank.sqrt()
        } else {
            self.config.lora_alpha / rank
        }
    }
}

/// The `A`/`B` factor tensors that update one base parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoraPair {
    pub target: String,
    pub a_key: String,
    pub b_key: String,
}

#[derive(Default)]
struct PartialPair {
    a_key: Option<String>,
    b_key: Option<String>,
}

/// Groups adapter tensor names into `(A, B)` pairs keyed by the base
/// parameter they modify. Every name must belong to a complete pair.
pub fn pair_lora_keys<'a, I>(keys: I) -> Result<Vec<LoraPair>, ServiceError>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut pending: BTreeMap<String, PartialPair> = BTreeMap::new();

    for key in keys {
        let (module, is_a) = split_lora_key(key).ok_or_else(|| {
            ServiceError::Adapter(format!("unsupported adapter tensor '{key}'"))
        })?;
        let module = module.strip_prefix(PEFT_PREFIX).unwrap_or(module);
        let entry = pending.entry(format!("{module}.weight")).or_default();
        let slot = if is_a { &mut entry.a_key } else { &mut entry.b_key };
        if slot.replace(key.to_string()).is_some() {
            return Err(ServiceError::Adapter(format!(
                "duplicate adapter tensor for '{module}'"
            )));
        }
    }

    if pending.is_empty() {
        return Err(ServiceError::Adapter("adapter contains no LoRA tensors".into()));
    }

    pending
        .into_iter()
        .map(|(target, pair)| match (pair.a_key, pair.b_key) {
            (Some(a_key), Some(b_key)) => Ok(LoraPair {
                target,
                a_key,
                b_key,
            }),
            _ => Err(ServiceError::Adapter(format!(
                "incomplete LoRA pair for '{target}'"
            ))),
        })
        .collect()
}

/// Splits `…<module>.lora_A[.<name>].weight` into the module path and whether
/// it is the `A` factor.
fn split_lora_key(key: &str) -> Option<(&str, bool)> {
    let stem = key.strip_suffix(".weight")?;
    for (marker, is_a) in [(".lora_A", true), (".lora_B", false)] {
        if let Some(idx) = stem.find(marker) {
            let rest = &stem[idx + marker.len()..];
            if rest.is_empty() || (rest.starts_with('.') && !rest[1..].contains('.')) {
                return Some((&stem[..idx], is_a));
            }
        }
    }
    None
}

/// Result of the optional adapter step. Both arms carry a usable resource.
pub enum AdapterOutcome {
    Loaded(ModelResource),
    FallbackToBase(ModelResource, String),
}

impl AdapterOutcome {
    pub fn is_loaded(&self) -> bool {
        matches!(self, AdapterOutcome::Loaded(_))
    }

    pub fn into_resource(self) -> ModelResource {
        match self {
            AdapterOutcome::Loaded(resource) | AdapterOutcome::FallbackToBase(resource, _) => {
                resource
            }
        }
    }
}

impl ModelResource {
    /// Composes the adapter in `dir` onto the base weights, or keeps the base
    /// weights when that is not possible.
    pub fn apply_adapter(mut self, dir: &Path) -> AdapterOutcome {
        info!(path = %dir.display(), "applying LoRA adapter");

        let merged = LoraAdapter::open(dir).and_then(|adapter| {
            if let Some(base) = adapter.config.base_model_name_or_path.as_deref() {
                if base != self.metadata.model_id {
                    warn!(adapter_base = base, model_id = %self.metadata.model_id, "adapter was trained on a different base model id");
                }
            }
            self.model.merge_lora(&adapter)
        });

        match merged {
            Ok(merged_tensors) => {
                info!(merged_tensors, "LoRA adapter applied");
                self.metadata.adapter = AdapterStatus::Loaded {
                    path: dir.to_path_buf(),
                    merged_tensors,
                };
                AdapterOutcome::Loaded(self)
            }
            Err(err) => {
                let reason = err.to_string();
                warn!(%reason, "continuing with base model only");
                self.metadata.adapter = AdapterStatus::FallbackToBase {
                    reason: reason.clone(),
                };
                AdapterOutcome::FallbackToBase(self, reason)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    };

    use super::*;
    use crate::model::{LanguageModel, ModelMetadata};

    struct NoopModel;

    impl LanguageModel for NoopModel {
        fn next_token_logits(&self, _: &[u32], _: &[u32]) -> Result<Vec<f32>, ServiceError> {
            Ok(vec![0.0; 4])
        }
    }

    struct RecordingModel {
        merged: Arc<AtomicBool>,
    }

    impl LanguageModel for RecordingModel {
        fn next_token_logits(&self, _: &[u32], _: &[u32]) -> Result<Vec<f32>, ServiceError> {
            Ok(vec![0.0; 4])
        }

        fn merge_lora(&mut self, adapter: &LoraAdapter) -> Result<usize, ServiceError> {
            assert_eq!(adapter.scale(), 2.0);
            self.merged.store(true, Ordering::SeqCst);
            Ok(7)
        }
    }

    fn resource(model: Box<dyn LanguageModel>) -> ModelResource {
        ModelResource::new(
            model,
            ModelMetadata {
                model_id: "google/gemma-3-270m-it".into(),
                dtype: "bfloat16".into(),
                device: "cpu".into(),
                size_bytes: 0,
                adapter: AdapterStatus::None,
            },
        )
    }

    fn write_adapter_dir(config: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(ADAPTER_CONFIG_FILE), config).unwrap();
        fs::write(dir.path().join(ADAPTER_WEIGHTS_FILE), b"").unwrap();
        dir
    }

    #[test]
    fn nonexistent_path_falls_back_to_base() {
        let outcome = resource(Box::new(NoopModel)).apply_adapter(Path::new("/no/such/adapter"));
        match outcome {
            AdapterOutcome::FallbackToBase(resource, reason) => {
                assert!(reason.contains("not found"));
                assert!(matches!(
                    resource.metadata().adapter,
                    AdapterStatus::FallbackToBase { .. }
                ));
            }
            AdapterOutcome::Loaded(_) => panic!("adapter should not load"),
        }
    }

    #[test]
    fn malformed_config_falls_back_to_base() {
        let dir = write_adapter_dir("{ not json");
        let outcome = resource(Box::new(NoopModel)).apply_adapter(dir.path());
        assert!(!outcome.is_loaded());
    }

    #[test]
    fn backend_without_merge_support_falls_back() {
        let dir = write_adapter_dir(r#"{"r": 8, "lora_alpha": 16}"#);
        let outcome = resource(Box::new(NoopModel)).apply_adapter(dir.path());
        match outcome {
            AdapterOutcome::FallbackToBase(_, reason) => assert!(reason.contains("cannot compose")),
            AdapterOutcome::Loaded(_) => panic!("noop backend cannot merge"),
        }
    }

    #[test]
    fn successful_merge_records_status() {
        let dir = write_adapter_dir(r#"{"r": 8, "lora_alpha": 16}"#);
        let merged = Arc::new(AtomicBool::new(false));
        let outcome = resource(Box::new(RecordingModel {
            merged: merged.clone(),
        }))
        .apply_adapter(dir.path());

        assert!(outcome.is_loaded());
        assert!(merged.load(Ordering::SeqCst));
        let resource = outcome.into_resource();
        assert_eq!(
            resource.metadata().adapter,
            AdapterStatus::Loaded {
                path: dir.path().to_path_buf(),
                merged_tensors: 7,
            }
        );
    }

    #[test]
    fn rslora_scale_uses_square_root() {
        let adapter = LoraAdapter {
            path: PathBuf::from("a"),
            weights_path: PathBuf::from("a/w"),
            config: AdapterConfig {
                r: 16,
                lora_alpha: 32.0,
                use_rslora: true,
                base_model_name_or_path: None,
            },
        };
        assert_eq!(adapter.scale(), 8.0);
    }

    #[test]
    fn pairs_peft_keys_onto_base_parameters() {
        let keys = [
            "base_model.model.model.layers.0.self_attn.q_proj.lora_A.weight",
            "base_model.model.model.layers.0.self_attn.q_proj.lora_B.weight",
            "base_model.model.model.layers.0.mlp.down_proj.lora_A.default.weight",
            "base_model.model.model.layers.0.mlp.down_proj.lora_B.default.weight",
        ];
        let pairs = pair_lora_keys(keys).unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].target, "model.layers.0.mlp.down_proj.weight");
        assert_eq!(pairs[1].target, "model.layers.0.self_attn.q_proj.weight");
        assert_eq!(pairs[1].a_key, keys[0]);
        assert_eq!(pairs[1].b_key, keys[1]);
    }

    #[test]
    fn rejects_unpaired_and_foreign_tensors() {
        let unpaired = pair_lora_keys(["base_model.model.model.layers.0.q_proj.lora_A.weight"]);
        assert!(unpaired.is_err());

        let foreign = pair_lora_keys([
            "base_model.model.model.embed_tokens.lora_embedding_A",
            "base_model.model.lm_head.weight",
        ]);
        assert!(foreign.is_err());

        let empty: [&str; 0] = [];
        assert!(pair_lora_keys(empty).is_err());
    }
}
