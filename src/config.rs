use std::{
    env, fmt,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use anyhow::{Context, anyhow};

/// Which of the three deployments this process serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceMode {
    /// Resident model answering `POST /generate`.
    Local,
    /// `POST /generate` forwarded to an OpenAI-compatible chat endpoint.
    Remote,
    /// `POST /transcribe` backed by a Whisper-style recognizer.
    Transcribe,
}

impl ServiceMode {
    pub fn default_port(self) -> u16 {
        match self {
            ServiceMode::Local => 8000,
            ServiceMode::Remote => 8002,
            ServiceMode::Transcribe => 5000,
        }
    }
}

impl FromStr for ServiceMode {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_lowercase().as_str() {
            "local" | "llmapi" => Ok(ServiceMode::Local),
            "remote" | "apilocal" => Ok(ServiceMode::Remote),
            "transcribe" | "faster" => Ok(ServiceMode::Transcribe),
            other => Err(anyhow!(
                "unknown service mode '{other}' (expected local, remote or transcribe)"
            )),
        }
    }
}

/// Numeric precision the resident weights are cast to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    F32,
    F16,
    BF16,
}

impl Precision {
    pub fn as_str(self) -> &'static str {
        match self {
            Precision::F32 => "float32",
            Precision::F16 => "float16",
            Precision::BF16 => "bfloat16",
        }
    }
}

impl FromStr for Precision {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "f32" | "float32" => Ok(Precision::F32),
            "f16" | "float16" | "half" => Ok(Precision::F16),
            "bf16" | "bfloat16" => Ok(Precision::BF16),
            other => Err(anyhow!("unsupported model dtype '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSpec {
    /// First CUDA device when one is available, CPU otherwise.
    Auto,
    Cpu,
    Cuda(usize),
}

impl FromStr for DeviceSpec {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let lower = raw.trim().to_lowercase();
        match lower.as_str() {
            "auto" => Ok(DeviceSpec::Auto),
            "cpu" => Ok(DeviceSpec::Cpu),
            "cuda" => Ok(DeviceSpec::Cuda(0)),
            _ => {
                let idx = lower
                    .strip_prefix("cuda:")
                    .ok_or_else(|| anyhow!("unsupported device '{raw}'"))?;
                let idx = idx
                    .parse::<usize>()
                    .with_context(|| format!("invalid CUDA ordinal in '{raw}'"))?;
                Ok(DeviceSpec::Cuda(idx))
            }
        }
    }
}

impl fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSpec::Auto => f.write_str("auto"),
            DeviceSpec::Cpu => f.write_str("cpu"),
            DeviceSpec::Cuda(idx) => write!(f, "cuda:{idx}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub mode: ServiceMode,
    pub listen_addr: SocketAddr,
    pub model_id: String,
    pub revision: Option<String>,
    pub model_path: PathBuf,
    pub tokenizer_path: PathBuf,
    pub tokenizer_config_path: PathBuf,
    pub dtype: Precision,
    pub device: DeviceSpec,
    pub adapter_path: Option<PathBuf>,
    pub eos_tokens: Vec<String>,
    pub max_new_tokens_limit: usize,
    pub remote_base_url: String,
    pub remote_model: String,
    pub remote_api_key: String,
    pub upstream_timeout: Duration,
    pub asr_base_url: String,
    pub asr_model: String,
    pub asr_language: String,
    pub asr_vad_filter: bool,
    pub transcribe_tmp_dir: PathBuf,
    pub max_upload_bytes: usize,
}

const DEFAULT_EOS_TOKENS: &[&str] = &["<eos>", "<end_of_turn>"];

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup. `from_env` passes
    /// the process environment; tests pass a map.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mode = match lookup("SERVICE_MODE") {
            Some(raw) => raw.parse()?,
            None => ServiceMode::Local,
        };

        let default_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), mode.default_port());
        let listen_addr = match lookup("SERVER_ADDR") {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("invalid SERVER_ADDR '{raw}'"))?,
            None => default_addr,
        };

        let model_id =
            lookup("MODEL_ID").unwrap_or_else(|| "google/gemma-3-270m-it".to_string());
        let revision = lookup("MODEL_REVISION");

        let model_path =
            PathBuf::from(lookup("MODEL_PATH").unwrap_or_else(|| "models/model.ts".to_string()));
        let tokenizer_path = PathBuf::from(
            lookup("TOKENIZER_PATH").unwrap_or_else(|| "models/tokenizer.json".to_string()),
        );
        let tokenizer_config_path = PathBuf::from(
            lookup("TOKENIZER_CONFIG_PATH")
                .unwrap_or_else(|| "models/tokenizer_config.json".to_string()),
        );

        let dtype = match lookup("MODEL_DTYPE") {
            Some(raw) => raw.parse()?,
            None => Precision::BF16,
        };
        let device = match lookup("DEVICE") {
            Some(raw) => raw.parse()?,
            None => DeviceSpec::Auto,
        };

        let adapter_path = lookup("ADAPTER_PATH")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        let eos_tokens = lookup("EOS_TOKENS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .filter(|tokens| !tokens.is_empty())
            .unwrap_or_else(|| DEFAULT_EOS_TOKENS.iter().map(|t| t.to_string()).collect());

        let max_new_tokens_limit = parse_or(&lookup, "MAX_NEW_TOKENS_LIMIT", 2048);

        let remote_base_url = lookup("REMOTE_BASE_URL")
            .unwrap_or_else(|| "http://localhost:8000/api/v1".to_string());
        let remote_model =
            lookup("REMOTE_MODEL").unwrap_or_else(|| "Gemma3-1b-it-FLM".to_string());
        let remote_api_key = lookup("REMOTE_API_KEY").unwrap_or_else(|| "lemonade".to_string());
        let upstream_timeout =
            Duration::from_secs(parse_or(&lookup, "UPSTREAM_TIMEOUT_SECS", 300));

        let asr_base_url =
            lookup("ASR_BASE_URL").unwrap_or_else(|| "http://localhost:8080/v1".to_string());
        let asr_model = lookup("ASR_MODEL").unwrap_or_else(|| "small".to_string());
        let asr_language = lookup("ASR_LANGUAGE").unwrap_or_else(|| "ja".to_string());
        let asr_vad_filter = lookup("ASR_VAD_FILTER")
            .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(true);
        let transcribe_tmp_dir = lookup("TRANSCRIBE_TMP_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(env::temp_dir);
        let max_upload_bytes = parse_or(&lookup, "MAX_UPLOAD_BYTES", 25 * 1024 * 1024);

        Ok(Self {
            mode,
            listen_addr,
            model_id,
            revision,
            model_path,
            tokenizer_path,
            tokenizer_config_path,
            dtype,
            device,
            adapter_path,
            eos_tokens,
            max_new_tokens_limit,
            remote_base_url,
            remote_model,
            remote_api_key,
            upstream_timeout,
            asr_base_url,
            asr_model,
            asr_language,
            asr_vad_filter,
            transcribe_tmp_dir,
            max_upload_bytes,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    lookup(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}
