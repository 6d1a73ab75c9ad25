#![allow(dead_code)]

use std::{
    collections::HashMap,
    net::SocketAddr,
    path::{Path, PathBuf},
    str::FromStr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, Response},
};
use parking_lot::Mutex;
use resident_llm_service::{
    AppConfig, LocalGenerator, ModelResource, ServiceError, SpeechRecognizer,
    inference::{ChatTemplate, CompletionPipeline, PromptBuilder, TextTokenizer},
    model::{AdapterStatus, LanguageModel, ModelMetadata},
    transcription::{TranscribeOptions, TranscriptionSegment},
};
use tokenizers::Tokenizer;
use tokio::net::TcpListener;

pub const EOS: u32 = 1;
pub const END_OF_TURN: u32 = 5;
pub const MODEL: u32 = 7;

const TOKENIZER_JSON: &str = include_str!("../fixtures/tokenizer.json");

const VOCAB_SIZE: usize = 14;

pub fn tokenizer() -> TextTokenizer {
    TextTokenizer::new(Tokenizer::from_str(TOKENIZER_JSON).expect("fixture tokenizer"))
}

pub fn test_config() -> AppConfig {
    AppConfig::from_lookup(|_| None).expect("default config")
}

/// Observations shared between a [`BigramModel`] and the test holding it.
#[derive(Default)]
pub struct ModelProbe {
    pub calls: AtomicUsize,
    pub active: AtomicUsize,
    pub max_active: AtomicUsize,
}

/// Deterministic next-token model: the last token selects the favourite
/// successor, anything unmapped ends the turn.
pub struct BigramModel {
    transitions: HashMap<u32, u32>,
    step_delay: Duration,
    exhausted_on_call: Option<usize>,
    probe: Arc<ModelProbe>,
}

impl BigramModel {
    /// Answers "rust is fast" after the generation marker.
    pub fn rust_is_fast() -> Self {
        Self {
            transitions: HashMap::from([(MODEL, 11), (11, 12), (12, 13), (13, END_OF_TURN)]),
            step_delay: Duration::ZERO,
            exhausted_on_call: None,
            probe: Arc::new(ModelProbe::default()),
        }
    }

    /// Never stops on its own.
    pub fn chatterbox() -> Self {
        Self {
            transitions: HashMap::from([(MODEL, 8), (8, 9), (9, 8)]),
            ..Self::rust_is_fast()
        }
    }

    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    /// Reports device exhaustion on the n-th forward pass (zero based).
    pub fn exhausted_on_call(mut self, call: usize) -> Self {
        self.exhausted_on_call = Some(call);
        self
    }

    pub fn probe(&self) -> Arc<ModelProbe> {
        self.probe.clone()
    }
}

impl LanguageModel for BigramModel {
    fn next_token_logits(
        &self,
        input_ids: &[u32],
        attention_mask: &[u32],
    ) -> Result<Vec<f32>, ServiceError> {
        assert_eq!(input_ids.len(), attention_mask.len());
        let call = self.probe.calls.fetch_add(1, Ordering::SeqCst);
        let active = self.probe.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.probe.max_active.fetch_max(active, Ordering::SeqCst);

        if !self.step_delay.is_zero() {
            thread::sleep(self.step_delay);
        }
        self.probe.active.fetch_sub(1, Ordering::SeqCst);

        if self.exhausted_on_call == Some(call) {
            return Err(ServiceError::ResourceExhausted(
                "CUDA out of memory. Tried to allocate 2.00 GiB".into(),
            ));
        }

        let last = input_ids.last().copied().unwrap_or_default();
        let next = self.transitions.get(&last).copied().unwrap_or(END_OF_TURN);
        let mut logits = vec![0.0; VOCAB_SIZE];
        logits[next as usize] = 20.0;
        Ok(logits)
    }
}

pub fn metadata() -> ModelMetadata {
    ModelMetadata {
        model_id: "google/gemma-3-270m-it".into(),
        dtype: "bfloat16".into(),
        device: "cpu".into(),
        size_bytes: 536_000_000,
        adapter: AdapterStatus::None,
    }
}

pub fn resource(model: BigramModel) -> ModelResource {
    ModelResource::new(Box::new(model), metadata())
}

pub fn generator_from_resource(resource: ModelResource) -> LocalGenerator {
    let tokenizer = Arc::new(tokenizer());
    let stop_ids = tokenizer
        .resolve_stop_ids(&["<eos>".into(), "<end_of_turn>".into()])
        .expect("stop ids");
    let pipeline = CompletionPipeline::new(
        Arc::new(resource),
        PromptBuilder::new(tokenizer, ChatTemplate::gemma().expect("template")),
        stop_ids,
    );
    LocalGenerator::new(pipeline, 2048)
}

pub fn local_generator(model: BigramModel) -> LocalGenerator {
    generator_from_resource(resource(model))
}

pub fn json_request(method: &str, uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .expect("request")
}

pub const BOUNDARY: &str = "X-TRANSCRIBE-BOUNDARY";

/// `multipart/form-data` body with one part per `(name, filename, bytes)`.
pub fn multipart_request(uri: &str, parts: &[(&str, Option<&str>, &[u8])]) -> Request<Body> {
    let mut body = Vec::new();
    for (name, filename, bytes) in parts {
        body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        match filename {
            Some(filename) => body.extend_from_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\n\
                     Content-Type: application/octet-stream\r\n\r\n"
                )
                .as_bytes(),
            ),
            None => body.extend_from_slice(
                format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes(),
            ),
        }
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

    Request::builder()
        .method("POST")
        .uri(uri)
        .header(
            "content-type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .expect("request")
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json body")
}

pub async fn body_text(response: Response<Body>) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    String::from_utf8(bytes.to_vec()).expect("utf-8 body")
}

/// Recognizer that replays fixed segments and remembers the spooled file.
pub struct ScriptedRecognizer {
    segments: Vec<TranscriptionSegment>,
    pub seen: Mutex<Vec<(PathBuf, Vec<u8>)>>,
}

impl ScriptedRecognizer {
    pub fn new(texts: &[&str]) -> Self {
        let segments = texts
            .iter()
            .enumerate()
            .map(|(idx, text)| TranscriptionSegment {
                start: idx as f64,
                end: idx as f64 + 1.0,
                text: text.to_string(),
            })
            .collect();
        Self {
            segments,
            seen: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl SpeechRecognizer for ScriptedRecognizer {
    async fn transcribe(
        &self,
        audio_path: &Path,
        _options: &TranscribeOptions,
    ) -> Result<Vec<TranscriptionSegment>, ServiceError> {
        let bytes = tokio::fs::read(audio_path).await?;
        self.seen.lock().push((audio_path.to_path_buf(), bytes));
        Ok(self.segments.clone())
    }
}

pub fn dir_is_empty(dir: &Path) -> bool {
    std::fs::read_dir(dir)
        .expect("read tmp dir")
        .next()
        .is_none()
}

/// Serves `router` on an ephemeral local port.
pub async fn spawn_stub(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind stub");
    let addr = listener.local_addr().expect("stub addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("stub server");
    });
    addr
}
