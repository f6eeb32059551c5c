//! TOML configuration file loading
//!
//! Supports `~/.config/parley/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct ParleyConfigFile {
    /// Speech backend credentials and endpoints
    #[serde(default)]
    pub speech: SpeechFileConfig,

    /// Recognition options
    #[serde(default)]
    pub asr: AsrFileConfig,

    /// Synthesis options
    #[serde(default)]
    pub tts: TtsFileConfig,

    /// Reply segmentation thresholds
    #[serde(default)]
    pub segmenter: SegmenterFileConfig,

    /// LLM configuration
    #[serde(default)]
    pub llm: LlmFileConfig,

    /// Server/runtime configuration
    #[serde(default)]
    pub server: ServerFileConfig,
}

/// Speech backend configuration
#[derive(Debug, Default, Deserialize)]
pub struct SpeechFileConfig {
    pub app_id: Option<String>,
    pub access_token: Option<String>,
    pub asr_resource_id: Option<String>,
    pub asr_url: Option<String>,
    pub tts_url: Option<String>,
    pub tts_cluster: Option<String>,
    pub tts_voice: Option<String>,
}

/// Recognition options
#[derive(Debug, Default, Deserialize)]
pub struct AsrFileConfig {
    /// Recognition language (e.g. "zh-CN")
    pub language: Option<String>,
    /// User id sent in the handshake
    pub uid: Option<String>,
    /// Largest inbound audio chunk forwarded as one frame
    pub max_chunk_bytes: Option<usize>,
}

/// Synthesis options
#[derive(Debug, Default, Deserialize)]
pub struct TtsFileConfig {
    pub sample_rate: Option<u32>,
    pub speed_ratio: Option<f32>,
}

/// Segmentation thresholds (characters)
#[derive(Debug, Default, Deserialize)]
pub struct SegmenterFileConfig {
    pub first_segment_chars: Option<usize>,
    pub next_segment_chars: Option<usize>,
}

/// LLM-related configuration
#[derive(Debug, Default, Deserialize)]
pub struct LlmFileConfig {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    /// Model identifier (e.g. "Qwen/Qwen2.5-32B-Instruct")
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub system_prompt: Option<String>,
    /// Number of past exchanges replayed to the model
    pub history_turns: Option<usize>,
}

/// Server/runtime configuration
#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    /// HTTP server port
    pub port: Option<u16>,
    /// Directory with the web client
    pub static_dir: Option<String>,
    /// Greeting spoken as text when a session opens
    pub greeting: Option<String>,
}

/// Load the TOML config file from `PARLEY_CONFIG` or the standard path
///
/// Returns `ParleyConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> ParleyConfigFile {
    let path = std::env::var("PARLEY_CONFIG")
        .ok()
        .map(PathBuf::from)
        .or_else(config_file_path);

    match path {
        Some(path) => load_config_from(&path),
        None => ParleyConfigFile::default(),
    }
}

/// Load a TOML config file from an explicit path
pub fn load_config_from(path: &Path) -> ParleyConfigFile {
    if !path.exists() {
        return ParleyConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                ParleyConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            ParleyConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/parley/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("parley").join("config.toml"))
}
