//! Single-turn chat template rendering.
//!
//! Uses the `chat_template` shipped in the model's `tokenizer_config.json`
//! when present, otherwise the Gemma turn format.

use std::{fs, path::Path};

use minijinja::{Environment, Error as TemplateError, ErrorKind, context};
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::error::ServiceError;

const TEMPLATE_NAME: &str = "chat";

const GEMMA_TEMPLATE: &str = r#"{{ bos_token }}{% for message in messages %}{{ '<start_of_turn>' + ('model' if message['role'] == 'assistant' else message['role']) + '\n' + (message['content'] | trim) + '<end_of_turn>\n' }}{% endfor %}{% if add_generation_prompt %}{{ '<start_of_turn>model\n' }}{% endif %}"#;

#[derive(Serialize)]
struct ChatTurn<'a> {
    role: &'a str,
    content: &'a str,
}

pub struct ChatTemplate {
    env: Environment<'static>,
    bos_token: String,
    eos_token: String,
}

impl std::fmt::Debug for ChatTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatTemplate")
            .field("bos_token", &self.bos_token)
            .field("eos_token", &self.eos_token)
            .finish_non_exhaustive()
    }
}

impl ChatTemplate {
    pub fn new(
        source: String,
        bos_token: impl Into<String>,
        eos_token: impl Into<String>,
    ) -> Result<Self, ServiceError> {
        let mut env = Environment::new();
        // Same whitespace handling as `transformers`' apply_chat_template.
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        env.add_function("raise_exception", raise_exception);
        env.add_template_owned(TEMPLATE_NAME, source)
            .map_err(|e| ServiceError::Template(format!("invalid chat template: {e}")))?;

        Ok(Self {
            env,
            bos_token: bos_token.into(),
            eos_token: eos_token.into(),
        })
    }

    pub fn gemma() -> Result<Self, ServiceError> {
        Self::new(GEMMA_TEMPLATE.to_string(), "<bos>", "<eos>")
    }

    /// Reads the template and BOS/EOS strings from a `tokenizer_config.json`.
    /// A missing file or a config without `chat_template` selects the Gemma
    /// format.
    pub fn load(config_path: &Path) -> Result<Self, ServiceError> {
        if !config_path.exists() {
            info!(path = %config_path.display(), "no tokenizer config, using built-in Gemma chat template");
            return Self::gemma();
        }

        let raw = fs::read_to_string(config_path)?;
        Self::from_tokenizer_config(&raw)
    }

    pub fn from_tokenizer_config(raw: &str) -> Result<Self, ServiceError> {
        let config: Value = serde_json::from_str(raw)
            .map_err(|e| ServiceError::Template(format!("invalid tokenizer config: {e}")))?;

        let bos = special_token(&config, "bos_token").unwrap_or_else(|| "<bos>".to_string());
        let eos = special_token(&config, "eos_token").unwrap_or_else(|| "<eos>".to_string());

        match chat_template_source(&config) {
            Some(source) => {
                info!("using chat template from tokenizer config");
                Self::new(source, bos, eos)
            }
            None => {
                info!("tokenizer config has no chat_template, using built-in Gemma template");
                Self::new(GEMMA_TEMPLATE.to_string(), bos, eos)
            }
        }
    }

    /// Renders `content` as one user turn followed by the generation-start
    /// marker.
    pub fn render_user_turn(&self, content: &str) -> Result<String, ServiceError> {
        let template = self
            .env
            .get_template(TEMPLATE_NAME)
            .map_err(|e| ServiceError::Template(e.to_string()))?;
        let messages = [ChatTurn {
            role: "user",
            content,
        }];

        template
            .render(context! {
                messages => messages,
                add_generation_prompt => true,
                bos_token => self.bos_token.as_str(),
                eos_token => self.eos_token.as_str(),
            })
            .map_err(|e| ServiceError::Template(format!("render failed: {e}")))
    }
}

fn raise_exception(message: String) -> Result<String, TemplateError> {
    Err(TemplateError::new(ErrorKind::InvalidOperation, message))
}

/// `bos_token`/`eos_token` are either plain strings or `{"content": ...}`.
fn special_token(config: &Value, key: &str) -> Option<String> {
    match config.get(key)? {
        Value::String(token) => Some(token.clone()),
        Value::Object(map) => map.get("content")?.as_str().map(str::to_string),
        _ => None,
    }
}

/// `chat_template` is a string, or a list of named templates of which the
/// one called `default` is used.
fn chat_template_source(config: &Value) -> Option<String> {
    match config.get("chat_template")? {
        Value::String(source) => Some(source.clone()),
        Value::Array(entries) => entries
            .iter()
            .find(|entry| entry.get("name").and_then(Value::as_str) == Some("default"))
            .and_then(|entry| entry.get("template"))
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}
