pub mod adapter;
mod resource;
mod types;

#[cfg(feature = "tch-backend")]
pub mod torch;

pub use adapter::{AdapterOutcome, LoraAdapter};
pub use resource::{LanguageModel, ModelResource};
pub use types::{AdapterStatus, GenerationRequest, GenerationResponse, ModelMetadata};
