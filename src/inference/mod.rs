pub mod decoder;
pub mod engine;
mod pipeline;
mod prompt;
pub mod sampling;
mod template;
pub mod tokenizer;

pub use engine::{FinishReason, GenerationOutput, SequenceLayout};
pub use pipeline::{Completion, CompletionPipeline};
pub use prompt::{PromptBuilder, PromptSequence};
pub use sampling::SamplingParams;
pub use template::ChatTemplate;
pub use tokenizer::TextTokenizer;
