//! Configuration management for the Parley gateway
//!
//! A single `Config` value is assembled at process start and shared by
//! reference. Precedence for every field is env > TOML file > default.

pub mod file;

use std::path::PathBuf;

use secrecy::{ExposeSecret, SecretString};

use crate::{Error, Result};
use file::ParleyConfigFile;

/// Default streaming recognition endpoint (bigmodel, async mode)
pub const DEFAULT_ASR_URL: &str = "wss://openspeech.bytedance.com/api/v3/sauc/bigmodel_async";

/// Default streaming synthesis endpoint (v1 binary protocol)
pub const DEFAULT_TTS_URL: &str = "wss://openspeech.bytedance.com/api/v1/tts/ws_binary";

/// Parley gateway configuration
#[derive(Debug)]
pub struct Config {
    /// Speech backend credentials and endpoints
    pub speech: SpeechConfig,

    /// Recognition options
    pub asr: AsrConfig,

    /// Synthesis options
    pub tts: TtsConfig,

    /// Reply segmentation thresholds
    pub segmenter: SegmenterConfig,

    /// Reasoning collaborator (chat completions) configuration
    pub llm: LlmConfig,

    /// HTTP server configuration
    pub server: ServerConfig,
}

/// Credentials and endpoints shared by both speech protocols
#[derive(Debug)]
pub struct SpeechConfig {
    /// Application id (`VOLC_APPID`)
    pub app_id: String,

    /// Access token (`VOLC_ACCESS_TOKEN`)
    pub access_token: SecretString,

    /// Billing resource for the recognition service
    pub asr_resource_id: String,

    pub asr_url: String,

    pub tts_url: String,

    /// Synthesis cluster name
    pub tts_cluster: String,

    /// Synthesis voice identifier
    pub tts_voice: String,
}

/// Recognition options
#[derive(Debug, Clone)]
pub struct AsrConfig {
    /// Recognition language (e.g. "zh-CN")
    pub language: String,

    /// User id sent in the handshake
    pub uid: String,

    /// Input sample rate; inbound audio is PCM16 mono
    pub sample_rate: u32,

    /// Largest inbound audio chunk forwarded as one frame
    pub max_chunk_bytes: usize,
}

impl Default for AsrConfig {
    fn default() -> Self {
        Self {
            language: "zh-CN".to_string(),
            uid: "parley_user".to_string(),
            sample_rate: 16_000,
            max_chunk_bytes: 64 * 1024,
        }
    }
}

/// Synthesis options
///
/// Volume and pitch are held at unity; boosting them at the source clips.
#[derive(Debug, Clone)]
pub struct TtsConfig {
    /// Output sample rate; audio is PCM16 mono
    pub sample_rate: u32,

    pub speed_ratio: f32,

    pub volume_ratio: f32,

    pub pitch_ratio: f32,

    /// Uid sent with each request
    pub uid: String,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            sample_rate: 24_000,
            speed_ratio: 1.0,
            volume_ratio: 1.0,
            pitch_ratio: 1.0,
            uid: "parley_user".to_string(),
        }
    }
}

/// Segmentation thresholds in characters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmenterConfig {
    /// Length past which the first segment may split on a weak boundary
    pub first_segment_chars: usize,

    /// Length past which later segments may split on a weak boundary
    pub next_segment_chars: usize,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            first_segment_chars: 50,
            next_segment_chars: 20,
        }
    }
}

/// Chat completions configuration
#[derive(Debug)]
pub struct LlmConfig {
    /// API key (`SILICONFLOW_API_KEY`)
    pub api_key: Option<SecretString>,

    /// OpenAI-compatible base URL
    pub base_url: String,

    pub model: String,

    pub temperature: f32,

    pub system_prompt: String,

    /// Number of past exchanges replayed to the model
    pub history_turns: usize,
}

/// HTTP server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to listen on
    pub port: u16,

    /// Path to static files directory (web client)
    pub static_dir: Option<PathBuf>,

    /// Greeting sent when a session opens
    pub greeting: String,
}

const DEFAULT_SYSTEM_PROMPT: &str = "你是一个语音助手。回答简洁口语化，不使用 Markdown、列表或表情符号。";

const DEFAULT_GREETING: &str = "你好！我是你的智能行程规划助理。请告诉我你想去哪里，或者查天气。";

impl Config {
    /// Load configuration from the process environment and the TOML file
    ///
    /// # Errors
    ///
    /// Returns error if a numeric override cannot be parsed
    pub fn load() -> Result<Self> {
        let fc = file::load_config_file();
        Self::from_sources(fc, |key| std::env::var(key).ok())
    }

    /// Assemble configuration from a parsed file and an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if a numeric override cannot be parsed
    pub fn from_sources<F>(fc: ParleyConfigFile, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let speech = SpeechConfig {
            app_id: env("VOLC_APPID").or(fc.speech.app_id).unwrap_or_default(),
            access_token: SecretString::from(
                env("VOLC_ACCESS_TOKEN")
                    .or(fc.speech.access_token)
                    .unwrap_or_default(),
            ),
            asr_resource_id: env("VOLC_ASR_RESOURCE_ID")
                .or(fc.speech.asr_resource_id)
                .unwrap_or_else(|| "volc.bigasr.sauc.duration".to_string()),
            asr_url: env("VOLC_ASR_URL")
                .or(fc.speech.asr_url)
                .unwrap_or_else(|| DEFAULT_ASR_URL.to_string()),
            tts_url: env("VOLC_TTS_URL")
                .or(fc.speech.tts_url)
                .unwrap_or_else(|| DEFAULT_TTS_URL.to_string()),
            tts_cluster: env("VOLC_TTS_CLUSTER")
                .or(fc.speech.tts_cluster)
                .unwrap_or_else(|| "volcano_tts".to_string()),
            tts_voice: env("VOLC_TTS_VOICE_TYPE")
                .or(fc.speech.tts_voice)
                .unwrap_or_else(|| "zh_female_cancan_mars_bigtts".to_string()),
        };

        let asr_defaults = AsrConfig::default();
        let asr = AsrConfig {
            language: fc.asr.language.unwrap_or(asr_defaults.language),
            uid: fc.asr.uid.unwrap_or(asr_defaults.uid),
            sample_rate: asr_defaults.sample_rate,
            max_chunk_bytes: fc
                .asr
                .max_chunk_bytes
                .filter(|n| *n > 0)
                .unwrap_or(asr_defaults.max_chunk_bytes),
        };

        let tts_defaults = TtsConfig::default();
        let tts = TtsConfig {
            sample_rate: fc.tts.sample_rate.unwrap_or(tts_defaults.sample_rate),
            speed_ratio: fc.tts.speed_ratio.unwrap_or(tts_defaults.speed_ratio),
            ..tts_defaults
        };

        let seg_defaults = SegmenterConfig::default();
        let segmenter = SegmenterConfig {
            first_segment_chars: fc
                .segmenter
                .first_segment_chars
                .unwrap_or(seg_defaults.first_segment_chars),
            next_segment_chars: fc
                .segmenter
                .next_segment_chars
                .unwrap_or(seg_defaults.next_segment_chars),
        };

        let llm = LlmConfig {
            api_key: env("SILICONFLOW_API_KEY")
                .or(fc.llm.api_key)
                .filter(|k| !k.is_empty())
                .map(SecretString::from),
            base_url: env("SILICONFLOW_BASE_URL")
                .or(fc.llm.base_url)
                .unwrap_or_else(|| "https://api.siliconflow.cn/v1".to_string()),
            model: env("SILICONFLOW_MODEL")
                .or(fc.llm.model)
                .unwrap_or_else(|| "Qwen/Qwen2.5-32B-Instruct".to_string()),
            temperature: fc.llm.temperature.unwrap_or(0.1),
            system_prompt: fc
                .llm
                .system_prompt
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            history_turns: fc.llm.history_turns.unwrap_or(10),
        };

        let port = match env("PARLEY_PORT") {
            Some(raw) => raw
                .parse()
                .map_err(|_| Error::Config(format!("invalid PARLEY_PORT: {raw}")))?,
            None => fc.server.port.unwrap_or(8000),
        };
        let server = ServerConfig {
            port,
            static_dir: env("PARLEY_STATIC_DIR")
                .or(fc.server.static_dir)
                .map(PathBuf::from),
            greeting: fc
                .server
                .greeting
                .unwrap_or_else(|| DEFAULT_GREETING.to_string()),
        };

        Ok(Self {
            speech,
            asr,
            tts,
            segmenter,
            llm,
            server,
        })
    }

    /// Check that speech backend credentials are present
    ///
    /// # Errors
    ///
    /// Returns error naming the first missing credential
    pub fn require_speech_credentials(&self) -> Result<()> {
        if self.speech.app_id.is_empty() {
            return Err(Error::Config("VOLC_APPID is required".to_string()));
        }
        if self.speech.access_token.expose_secret().is_empty() {
            return Err(Error::Config("VOLC_ACCESS_TOKEN is required".to_string()));
        }
        Ok(())
    }
}
