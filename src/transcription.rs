//! Speech-to-text behind `POST /transcribe`.
//!
//! Uploaded audio is spooled to a temporary file, handed to a
//! [`SpeechRecognizer`], and the recognized segments are joined into one
//! transcript.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};

use async_trait::async_trait;
use reqwest::{
    Client,
    multipart::{Form, Part},
};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{info, warn};

use crate::{config::AppConfig, error::ServiceError, gate::AdmissionGate};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionSegment {
    #[serde(default)]
    pub start: f64,
    #[serde(default)]
    pub end: f64,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscribeOptions {
    pub language: String,
    pub vad_filter: bool,
    pub with_timestamps: bool,
}

impl TranscribeOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            language: config.asr_language.clone(),
            vad_filter: config.asr_vad_filter,
            with_timestamps: false,
        }
    }

    /// Segment timestamps are only requested from the backend when wanted;
    /// plain `json` carries the text alone.
    fn response_format(&self) -> &'static str {
        if self.with_timestamps {
            "verbose_json"
        } else {
            "json"
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TranscriptionResponse {
    pub text: String,
}

#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    /// Segments of the audio file at `audio_path`, in emission order.
    async fn transcribe(
        &self,
        audio_path: &Path,
        options: &TranscribeOptions,
    ) -> Result<Vec<TranscriptionSegment>, ServiceError>;
}

/// Segment texts concatenated in order, with no separator.
pub fn join_segments(segments: &[TranscriptionSegment]) -> String {
    segments.iter().map(|s| s.text.as_str()).collect()
}

pub struct TranscriptionService {
    recognizer: Arc<dyn SpeechRecognizer>,
    options: TranscribeOptions,
    tmp_dir: PathBuf,
    gate: AdmissionGate,
}

impl TranscriptionService {
    pub fn new(
        recognizer: Arc<dyn SpeechRecognizer>,
        options: TranscribeOptions,
        tmp_dir: PathBuf,
    ) -> Self {
        Self {
            recognizer,
            options,
            tmp_dir,
            gate: AdmissionGate::single(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, ServiceError> {
        let recognizer = WhisperHttpRecognizer::from_config(config)?;
        Ok(Self::new(
            Arc::new(recognizer),
            TranscribeOptions::from_config(config),
            config.transcribe_tmp_dir.clone(),
        ))
    }

    pub async fn transcribe(&self, audio: &[u8]) -> Result<String, ServiceError> {
        if audio.is_empty() {
            return Err(ServiceError::MissingAudio);
        }
        let _permit = self.gate.admit().await?;
        let started = Instant::now();

        // Removed on drop if this future is cancelled or a step below fails.
        let spool = tempfile::Builder::new()
            .prefix("upload-")
            .tempfile_in(&self.tmp_dir)?;
        tokio::fs::write(spool.path(), audio).await?;

        let result = self.recognizer.transcribe(spool.path(), &self.options).await;
        release(spool);

        let segments = result?;
        let text = join_segments(&segments);
        info!(
            bytes = audio.len(),
            segments = segments.len(),
            latency_ms = started.elapsed().as_millis() as u64,
            "transcription finished"
        );
        Ok(text)
    }
}

fn release(spool: NamedTempFile) {
    let path = spool.path().to_path_buf();
    if let Err(err) = spool.close() {
        warn!(path = %path.display(), error = %err, "failed to remove spooled audio");
    }
}

#[derive(Debug, Deserialize)]
struct VerboseTranscription {
    #[serde(default)]
    text: String,
    #[serde(default)]
    segments: Option<Vec<TranscriptionSegment>>,
}

impl VerboseTranscription {
    fn into_segments(self) -> Vec<TranscriptionSegment> {
        match self.segments {
            Some(segments) => segments,
            None if self.text.is_empty() => Vec::new(),
            None => vec![TranscriptionSegment {
                start: 0.0,
                end: 0.0,
                text: self.text,
            }],
        }
    }
}

/// Whisper served through an OpenAI-compatible `/audio/transcriptions`
/// endpoint.
pub struct WhisperHttpRecognizer {
    client: Client,
    endpoint: String,
    model: String,
}

impl WhisperHttpRecognizer {
    pub fn from_config(config: &AppConfig) -> Result<Self, ServiceError> {
        let client = Client::builder()
            .timeout(config.upstream_timeout)
            .build()
            .map_err(|e| ServiceError::Startup(format!("http client: {e}")))?;
        let endpoint = format!(
            "{}/audio/transcriptions",
            config.asr_base_url.trim_end_matches('/')
        );
        info!(%endpoint, model = %config.asr_model, "using speech recognizer");

        Ok(Self {
            client,
            endpoint,
            model: config.asr_model.clone(),
        })
    }
}

#[async_trait]
impl SpeechRecognizer for WhisperHttpRecognizer {
    async fn transcribe(
        &self,
        audio_path: &Path,
        options: &TranscribeOptions,
    ) -> Result<Vec<TranscriptionSegment>, ServiceError> {
        let audio = tokio::fs::read(audio_path).await?;
        let file_name = audio_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audio".to_string());

        let mut form = Form::new()
            .part("file", Part::bytes(audio).file_name(file_name))
            .text("model", self.model.clone())
            .text("language", options.language.clone())
            .text("vad_filter", options.vad_filter.to_string())
            .text("response_format", options.response_format());
        if options.with_timestamps {
            form = form.text("timestamp_granularities[]", "segment");
        }

        let response = self
            .client
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                ServiceError::Upstream(format!("request to {} failed: {e}", self.endpoint))
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ServiceError::Upstream(format!(
                "{} returned {status}: {detail}",
                self.endpoint
            )));
        }

        let transcription: VerboseTranscription = response
            .json()
            .await
            .map_err(|e| ServiceError::Upstream(format!("malformed transcription: {e}")))?;
        Ok(transcription.into_segments())
    }
}
