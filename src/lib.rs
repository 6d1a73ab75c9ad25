pub mod config;
pub mod error;
pub mod gate;
pub mod generator;
pub mod inference;
pub mod model;
pub mod remote;
pub mod server;
pub mod transcription;

pub use config::{AppConfig, ServiceMode};
pub use error::ServiceError;
pub use generator::{LocalGenerator, TextGenerator};
pub use model::{GenerationRequest, GenerationResponse, ModelMetadata, ModelResource};
pub use remote::RemoteGenerator;
pub use server::{build_router, build_transcription_router};
pub use transcription::{SpeechRecognizer, TranscriptionService};
