use std::{collections::HashMap, fs, path::Path};

use parking_lot::Mutex;
use tch::{Cuda, Device, IValue, Kind, TchError, Tensor, no_grad};
use tracing::info;

use crate::{
    config::{DeviceSpec, Precision},
    error::ServiceError,
    model::{
        LanguageModel,
        adapter::{LoraAdapter, pair_lora_keys},
    },
};

/// A causal LM exported with `torch.jit.trace(model, (input_ids, attention_mask))`.
pub struct TorchScriptModel {
    device: Device,
    kind: Kind,
    size_bytes: u64,
    module: Mutex<tch::CModule>,
}

impl TorchScriptModel {
    pub fn load(
        module_path: &Path,
        device: DeviceSpec,
        precision: Precision,
    ) -> Result<Self, ServiceError> {
        if !module_path.exists() {
            return Err(ServiceError::Startup(format!(
                "model artifact missing: {}",
                module_path.display()
            )));
        }
        let device = resolve_device(device)?;
        let kind = precision_kind(precision);
        let size_bytes = fs::metadata(module_path)?.len();

        info!(
            path = %module_path.display(),
            ?device,
            ?kind,
            size_bytes,
            "loading TorchScript module"
        );
        let mut module = tch::CModule::load_on_device(module_path, device)
            .map_err(|e| ServiceError::Startup(e.to_string()))?;
        module.to(device, kind, false);
        module.set_eval();

        Ok(Self {
            device,
            kind,
            size_bytes,
            module: Mutex::new(module),
        })
    }

    pub fn device_label(&self) -> String {
        match self.device {
            Device::Cpu => "cpu".to_string(),
            Device::Cuda(idx) => format!("cuda:{idx}"),
            other => format!("{other:?}").to_lowercase(),
        }
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }
}

impl LanguageModel for TorchScriptModel {
    fn next_token_logits(
        &self,
        input_ids: &[u32],
        attention_mask: &[u32],
    ) -> Result<Vec<f32>, ServiceError> {
        let seq_len = input_ids.len() as i64;
        let ids: Vec<i64> = input_ids.iter().map(|&id| id as i64).collect();
        let mask: Vec<i64> = attention_mask.iter().map(|&m| m as i64).collect();

        no_grad(|| {
            let input_tensor = Tensor::from_slice(&ids).reshape([1, seq_len]).to(self.device);
            let mask_tensor = Tensor::from_slice(&mask).reshape([1, seq_len]).to(self.device);

            let module = self.module.lock();
            let output = module
                .forward_is(&[IValue::Tensor(input_tensor), IValue::Tensor(mask_tensor)])
                .map_err(classify_torch_error)?;

            // Traced HF models return either bare logits or a tuple led by them.
            let logits = match output {
                IValue::Tensor(t) => t,
                IValue::Tuple(ref tuple) if !tuple.is_empty() => match &tuple[0] {
                    IValue::Tensor(t) => t.shallow_clone(),
                    _ => {
                        return Err(ServiceError::Inference(
                            "expected tensor as first tuple element".into(),
                        ));
                    }
                },
                _ => {
                    return Err(ServiceError::Inference(
                        "unexpected model output format".into(),
                    ));
                }
            };

            // [1, seq_len, vocab] -> [vocab] for the last position.
            let last_logits = logits
                .select(1, -1)
                .squeeze()
                .to_kind(Kind::Float)
                .to(Device::Cpu);
            Vec::<f32>::try_from(&last_logits).map_err(classify_torch_error)
        })
    }

    fn merge_lora(&mut self, adapter: &LoraAdapter) -> Result<usize, ServiceError> {
        let device = self.device;
        let tensors: HashMap<String, Tensor> = Tensor::read_safetensors(&adapter.weights_path)
            .map_err(adapter_error)?
            .into_iter()
            .collect();
        let pairs = pair_lora_keys(tensors.keys().map(String::as_str))?;

        let module = self.module.get_mut();
        let params: HashMap<String, Tensor> = module
            .named_parameters()
            .map_err(adapter_error)?
            .into_iter()
            .collect();
        let scale = adapter.scale();

        no_grad(|| {
            // Every delta is computed and shape-checked before any weight changes.
            let mut updates = Vec::with_capacity(pairs.len());
            for pair in &pairs {
                let weight = params.get(&pair.target).ok_or_else(|| {
                    ServiceError::Adapter(format!(
                        "adapter targets unknown parameter '{}'",
                        pair.target
                    ))
                })?;
                let lora_a = tensors[&pair.a_key].to_kind(Kind::Float).to(device);
                let lora_b = tensors[&pair.b_key].to_kind(Kind::Float).to(device);
                let delta = lora_b
                    .f_matmul(&lora_a)
                    .and_then(|d| d.f_mul_scalar(scale))
                    .map_err(adapter_error)?;
                if delta.size() != weight.size() {
                    return Err(ServiceError::Adapter(format!(
                        "shape mismatch for '{}': delta {:?} vs weight {:?}",
                        pair.target,
                        delta.size(),
                        weight.size()
                    )));
                }
                updates.push((weight.shallow_clone(), delta.to_kind(weight.kind())));
            }

            for (mut weight, delta) in updates {
                weight.f_add_(&delta).map_err(adapter_error)?;
            }
            Ok(pairs.len())
        })
    }
}

fn resolve_device(spec: DeviceSpec) -> Result<Device, ServiceError> {
    match spec {
        DeviceSpec::Cpu => Ok(Device::Cpu),
        DeviceSpec::Auto => Ok(if Cuda::is_available() {
            Device::Cuda(0)
        } else {
            Device::Cpu
        }),
        DeviceSpec::Cuda(idx) => {
            let visible = Cuda::device_count();
            if Cuda::is_available() && (idx as i64) < visible {
                Ok(Device::Cuda(idx))
            } else {
                Err(ServiceError::Startup(format!(
                    "CUDA device {idx} is unavailable ({visible} visible)"
                )))
            }
        }
    }
}

fn precision_kind(precision: Precision) -> Kind {
    match precision {
        Precision::F32 => Kind::Float,
        Precision::F16 => Kind::Half,
        Precision::BF16 => Kind::BFloat16,
    }
}

fn classify_torch_error(err: TchError) -> ServiceError {
    let message = err.to_string();
    if message.to_lowercase().contains("out of memory") {
        ServiceError::ResourceExhausted(message)
    } else {
        ServiceError::Inference(message)
    }
}

fn adapter_error(err: TchError) -> ServiceError {
    ServiceError::Adapter(err.to_string())
}
