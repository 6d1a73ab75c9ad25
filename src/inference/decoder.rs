use crate::{
    error::ServiceError,
    inference::{GenerationOutput, TextTokenizer},
};

/// Text of the tokens generated after the prompt, without special tokens.
pub fn decode(
    tokenizer: &TextTokenizer,
    output: &GenerationOutput,
    prompt_len: usize,
) -> Result<String, ServiceError> {
    tokenizer.decode(output.new_tokens(prompt_len))
}
