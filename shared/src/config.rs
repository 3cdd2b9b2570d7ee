use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub transcription: TranscriptionConfig,
    pub llm: LlmConfig,
    pub jobs: JobConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub upload_dir: PathBuf,
    pub max_upload_mb: usize,
    /// Empty means any origin.
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptionBackend {
    Local,
    Remote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptionConfig {
    pub backend: TranscriptionBackend,
    pub model_path: PathBuf,
    pub model_timeout_seconds: u64,
    pub language: Option<String>,
    pub beam_size: i32,
    pub remote: RemoteTranscriptionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteTranscriptionConfig {
    pub base_url: String,
    pub model: String,
    pub api_key_env: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    /// Model used when the prompt carries an audio attachment.
    pub audio_model: String,
    pub api_key_env: String,
    pub temperature: Option<f32>,
    pub summary_prompt: String,
    pub detail_prompt: String,
    pub audio_prompt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    pub stop_grace_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            upload_dir: PathBuf::from("uploads"),
            max_upload_mb: 512,
            cors_origins: Vec::new(),
        }
    }
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            backend: TranscriptionBackend::Remote,
            model_path: PathBuf::from("models/ggml-base.bin"),
            model_timeout_seconds: 300, // 5 minutes
            language: None,
            beam_size: 1,
            remote: RemoteTranscriptionConfig::default(),
        }
    }
}

impl Default for RemoteTranscriptionConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "whisper-1".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://dashscope.aliyuncs.com/compatible-mode/v1".to_string(),
            model: "qwen-plus".to_string(),
            audio_model: "qwen-audio-turbo-latest".to_string(),
            api_key_env: "DASHSCOPE_API_KEY".to_string(),
            temperature: None,
            summary_prompt: "Summarize the following content:".to_string(),
            detail_prompt: "Write a detailed summary of the following content. Cover every \
                            topic that was discussed, the conclusions reached and any action \
                            items, using short headed sections."
                .to_string(),
            audio_prompt: "Identify all of the dialogue in this recording. Follow-up questions \
                           will be based on it, so once you understand the content reply with \
                           one short guiding sentence, for example: It sounds like you are \
                           discussing X; I learned that Y; you can ask me about Z."
                .to_string(),
        }
    }
}

impl Default for JobConfig {
    fn default() -> Self {
        Self { stop_grace_ms: 500 }
    }
}

impl JobConfig {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

/// Reads an API key from the environment variable named in config.
fn key_from_env(var: &str) -> Option<String> {
    std::env::var(var)
        .ok()
        .map(|key| key.trim().to_string())
        .filter(|key| !key.is_empty())
}

impl RemoteTranscriptionConfig {
    pub fn api_key(&self) -> Option<String> {
        key_from_env(&self.api_key_env)
    }
}

impl LlmConfig {
    pub fn api_key(&self) -> Option<String> {
        key_from_env(&self.api_key_env)
    }
}

impl Config {
    /// `$XDG_CONFIG_HOME/scribe/config.yaml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("scribe").join("config.yaml"))
    }

    /// Loads from `path`, or from the default location when `None`.
    ///
    /// A missing default file yields the built-in defaults; a missing
    /// explicit path is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match Self::default_path() {
                Some(path) if path.exists() => path,
                _ => return Ok(Self::default()),
            },
        };

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {:?}", path))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)
            .with_context(|| format!("Failed to write config file {:?}", path))?;
        Ok(())
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.server.max_upload_mb.saturating_mul(1024 * 1024)
    }
}
