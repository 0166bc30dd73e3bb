//! Configuration management
//!
//! Process-wide configuration for the conversation server: transport
//! bind address, audio session bounds, memory budget, per-stage inference
//! deadlines, and backend endpoints.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Bind address and connection lifecycle settings
    #[serde(default)]
    pub server: ServerConfig,
    /// Audio ingest and speech-session bounds
    #[serde(default)]
    pub audio: AudioConfig,
    /// Conversation memory budget
    #[serde(default)]
    pub memory: MemoryConfig,
    /// Inference pipeline deadlines
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// Backend model endpoints
    #[serde(default)]
    pub models: ModelsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Send a heartbeat probe after this many seconds without inbound traffic.
    #[serde(default = "default_heartbeat_after_s")]
    pub heartbeat_after_s: u64,
    /// Close the connection after this many seconds without inbound traffic.
    #[serde(default = "default_idle_close_s")]
    pub idle_close_s: u64,
    /// Per-connection outbound event buffer depth.
    #[serde(default = "default_outbound_queue_depth")]
    pub outbound_queue_depth: usize,
    /// How long a disconnected client's memory is retained for reconnect.
    #[serde(default = "default_memory_grace_s")]
    pub memory_grace_s: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_heartbeat_after_s() -> u64 {
    45
}

fn default_idle_close_s() -> u64 {
    90
}

fn default_outbound_queue_depth() -> usize {
    64
}

fn default_memory_grace_s() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            heartbeat_after_s: default_heartbeat_after_s(),
            idle_close_s: default_idle_close_s(),
            outbound_queue_depth: default_outbound_queue_depth(),
            memory_grace_s: default_memory_grace_s(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Canonical inbound sample rate; other rates are resampled or rejected.
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    /// Sessions shorter than this are discarded without transcription.
    #[serde(default = "default_min_speech_duration_s")]
    pub min_speech_duration_s: f64,
    /// Sessions are force-closed at this accumulated duration.
    #[serde(default = "default_max_speech_duration_s")]
    pub max_speech_duration_s: f64,
    /// Reject off-rate frames instead of resampling them.
    #[serde(default)]
    pub reject_foreign_rates: bool,
}

fn default_sample_rate() -> u32 {
    16000
}

fn default_min_speech_duration_s() -> f64 {
    0.5
}

fn default_max_speech_duration_s() -> f64 {
    30.0
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            min_speech_duration_s: default_min_speech_duration_s(),
            max_speech_duration_s: default_max_speech_duration_s(),
            reject_foreign_rates: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Per-connection token budget for (summary + verbatim turns).
    #[serde(default = "default_memory_max_tokens")]
    pub max_tokens: usize,
    /// Verbatim turns always kept out of summarisation.
    #[serde(default = "default_keep_recent_turns")]
    pub keep_recent_turns: usize,
    /// Bound on waiting for an in-flight summarisation at snapshot time.
    #[serde(default = "default_summarise_wait_s")]
    pub summarise_wait_s: u64,
}

fn default_memory_max_tokens() -> usize {
    2000
}

fn default_keep_recent_turns() -> usize {
    4
}

fn default_summarise_wait_s() -> u64 {
    5
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_memory_max_tokens(),
            keep_recent_turns: default_keep_recent_turns(),
            summarise_wait_s: default_summarise_wait_s(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_stage_deadline_stt_s")]
    pub stage_deadline_stt_s: u64,
    #[serde(default = "default_stage_deadline_llm_s")]
    pub stage_deadline_llm_s: u64,
    #[serde(default = "default_stage_deadline_tts_s")]
    pub stage_deadline_tts_s: u64,
    /// Deadline on the client answering a screen-capture request.
    #[serde(default = "default_screen_capture_wait_s")]
    pub screen_capture_wait_s: u64,
}

fn default_stage_deadline_stt_s() -> u64 {
    20
}

fn default_stage_deadline_llm_s() -> u64 {
    30
}

fn default_stage_deadline_tts_s() -> u64 {
    45
}

fn default_screen_capture_wait_s() -> u64 {
    5
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stage_deadline_stt_s: default_stage_deadline_stt_s(),
            stage_deadline_llm_s: default_stage_deadline_llm_s(),
            stage_deadline_tts_s: default_stage_deadline_tts_s(),
            screen_capture_wait_s: default_screen_capture_wait_s(),
        }
    }
}

impl PipelineConfig {
    pub fn stt_deadline(&self) -> Duration {
        Duration::from_secs(self.stage_deadline_stt_s)
    }

    pub fn llm_deadline(&self) -> Duration {
        Duration::from_secs(self.stage_deadline_llm_s)
    }

    pub fn tts_deadline(&self) -> Duration {
        Duration::from_secs(self.stage_deadline_tts_s)
    }

    pub fn screen_capture_wait(&self) -> Duration {
        Duration::from_secs(self.screen_capture_wait_s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    /// Speech-to-text endpoint (POST, PCM16 base64 in, transcript out).
    #[serde(default = "default_stt_url")]
    pub stt_url: String,
    /// OpenAI-compatible chat completions base URL.
    #[serde(default = "default_llm_url")]
    pub llm_url: String,
    /// API key for the LLM backend; read from env when not set here.
    #[serde(default)]
    pub llm_api_key: Option<String>,
    /// Chat model with vision support.
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    /// Cheap model for memory summarisation.
    #[serde(default = "default_summary_model")]
    pub summary_model: String,
    /// Text-to-speech endpoint.
    #[serde(default = "default_tts_url")]
    pub tts_url: String,
    /// Default TTS voice.
    #[serde(default = "default_voice_preset")]
    pub voice_preset: String,
}

fn default_stt_url() -> String {
    "http://127.0.0.1:9000/v1/transcribe".to_string()
}

fn default_llm_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}

fn default_llm_model() -> String {
    "google/gemini-flash-1.5".to_string()
}

fn default_summary_model() -> String {
    "openai/gpt-oss-120b:free".to_string()
}

fn default_tts_url() -> String {
    "http://127.0.0.1:9001/v1/synthesize".to_string()
}

fn default_voice_preset() -> String {
    "en_US-amy-medium".to_string()
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            stt_url: default_stt_url(),
            llm_url: default_llm_url(),
            llm_api_key: None,
            llm_model: default_llm_model(),
            summary_model: default_summary_model(),
            tts_url: default_tts_url(),
            voice_preset: default_voice_preset(),
        }
    }
}

impl ModelsConfig {
    /// Resolve the LLM API key from config or the environment.
    pub fn resolve_llm_api_key(&self) -> Option<String> {
        self.llm_api_key
            .clone()
            .or_else(|| std::env::var("VOICEBRIDGE_LLM_API_KEY").ok())
    }
}

impl Config {
    /// Load configuration from the default file location, creating it with
    /// defaults on first run.
    pub fn load() -> Result<Self> {
        let path = config_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            let config = Config::default();
            config.save_to(&path)?;
            Ok(config)
        }
    }

    /// Load configuration from an explicit path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&contents).context("Failed to parse config file")?;
        Ok(config)
    }

    /// Save configuration to an explicit path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let parent = path.parent().context("Config path has no parent")?;
        std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }
}

/// Get the configuration file path
pub fn config_path() -> Result<PathBuf> {
    let base = directories::ProjectDirs::from("com", "voicebridge", "voicebridge")
        .context("Failed to get project directories")?;
    Ok(base.config_dir().join("config.toml"))
}

/// Get default configuration as TOML string
pub fn default_config_toml() -> String {
    toml::to_string_pretty(&Config::default())
        .unwrap_or_else(|_| "# Default configuration\n".to_string())
}
