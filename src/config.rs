use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable consulted when the config has no transcription API key.
pub const API_KEY_ENV: &str = "TRANSCRIPTION_API_KEY";

/// Errors that can occur when loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    /// Failed to read the config file.
    ReadFile { path: PathBuf, source: std::io::Error },
    /// Failed to parse JSON.
    ParseJson { path: PathBuf, source: serde_json::Error },
    /// Validation error.
    Validation(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadFile { path, source } => {
                write!(f, "failed to read config file '{}': {}", path.display(), source)
            }
            Self::ParseJson { path, source } => {
                write!(f, "failed to parse config file '{}': {}", path.display(), source)
            }
            Self::Validation(msg) => write!(f, "config validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ReadFile { source, .. } => Some(source),
            Self::ParseJson { source, .. } => Some(source),
            Self::Validation(_) => None,
        }
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    /// Directory holding crops.json and sowing_times.json.
    data_dir: Option<String>,
    /// SQLite session database. Defaults to `<data_dir>/sessions.db`.
    session_db: Option<String>,
    #[serde(default = "default_session_ttl_secs")]
    session_ttl_secs: u64,
    #[serde(default = "default_transcription_timeout_secs")]
    transcription_timeout_secs: u64,
    /// Max edit distance for fuzzy crop/region names.
    #[serde(default = "default_fuzzy_threshold")]
    fuzzy_threshold: usize,
    /// How long a message waits behind another one from the same sender.
    #[serde(default = "default_session_lock_wait_ms")]
    session_lock_wait_ms: u64,
    #[serde(default = "default_sweep_interval_secs")]
    sweep_interval_secs: u64,
    ffmpeg_path: Option<String>,
    log_dir: Option<String>,
    /// Voice messages are refused when absent.
    transcription: Option<TranscriptionFile>,
}

#[derive(Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
enum TranscriptionFile {
    Api {
        endpoint: String,
        api_key: Option<String>,
        model: Option<String>,
        language: Option<String>,
    },
    Whisper {
        whisper_model_path: String,
        language: Option<String>,
    },
}

fn default_session_ttl_secs() -> u64 {
    300
}

fn default_transcription_timeout_secs() -> u64 {
    30
}

fn default_fuzzy_threshold() -> usize {
    2
}

fn default_session_lock_wait_ms() -> u64 {
    5000
}

fn default_sweep_interval_secs() -> u64 {
    60
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptionConfig {
    /// OpenAI-compatible HTTP endpoint.
    Api {
        endpoint: String,
        api_key: Option<String>,
        model: Option<String>,
        language: Option<String>,
    },
    /// Local whisper.cpp model.
    Whisper { model_path: PathBuf, language: Option<String> },
}

#[derive(Debug)]
pub struct Config {
    pub data_dir: PathBuf,
    pub session_db: PathBuf,
    pub session_ttl: Duration,
    pub transcription_timeout: Duration,
    pub fuzzy_threshold: usize,
    pub session_lock_wait: Duration,
    pub sweep_interval: Duration,
    pub ffmpeg_path: PathBuf,
    pub log_dir: PathBuf,
    pub transcription: Option<TranscriptionConfig>,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config_path = path.as_ref().to_path_buf();
        let content = std::fs::read_to_string(&config_path)
            .map_err(|e| ConfigError::ReadFile { path: config_path.clone(), source: e })?;
        let file: ConfigFile = serde_json::from_str(&content)
            .map_err(|e| ConfigError::ParseJson { path: config_path.clone(), source: e })?;

        if file.session_ttl_secs == 0 {
            return Err(ConfigError::Validation("session_ttl_secs must be greater than zero".into()));
        }
        if file.transcription_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "transcription_timeout_secs must be greater than zero".into(),
            ));
        }
        if file.fuzzy_threshold > 5 {
            return Err(ConfigError::Validation("fuzzy_threshold must be at most 5".into()));
        }
        if file.session_lock_wait_ms == 0 {
            return Err(ConfigError::Validation("session_lock_wait_ms must be greater than zero".into()));
        }
        if file.sweep_interval_secs == 0 {
            return Err(ConfigError::Validation("sweep_interval_secs must be greater than zero".into()));
        }

        let transcription = file.transcription.map(validate_transcription).transpose()?;

        let data_dir = file.data_dir.map(PathBuf::from).unwrap_or_else(|| PathBuf::from("data"));
        let session_db = file
            .session_db
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("sessions.db"));
        let log_dir = file.log_dir.map(PathBuf::from).unwrap_or_else(|| data_dir.join("logs"));

        Ok(Self {
            session_db,
            log_dir,
            data_dir,
            session_ttl: Duration::from_secs(file.session_ttl_secs),
            transcription_timeout: Duration::from_secs(file.transcription_timeout_secs),
            fuzzy_threshold: file.fuzzy_threshold,
            session_lock_wait: Duration::from_millis(file.session_lock_wait_ms),
            sweep_interval: Duration::from_secs(file.sweep_interval_secs),
            ffmpeg_path: PathBuf::from(file.ffmpeg_path.unwrap_or_else(|| "ffmpeg".into())),
            transcription,
        })
    }
}

fn validate_transcription(file: TranscriptionFile) -> Result<TranscriptionConfig, ConfigError> {
    match file {
        TranscriptionFile::Api { endpoint, api_key, model, language } => {
            if endpoint.trim().is_empty() {
                return Err(ConfigError::Validation("transcription.endpoint is required for the api backend".into()));
            }
            let api_key = api_key
                .filter(|k| !k.is_empty())
                .or_else(|| std::env::var(API_KEY_ENV).ok().filter(|k| !k.is_empty()));
            Ok(TranscriptionConfig::Api { endpoint, api_key, model, language })
        }
        TranscriptionFile::Whisper { whisper_model_path, language } => {
            if whisper_model_path.trim().is_empty() {
                return Err(ConfigError::Validation(
                    "transcription.whisper_model_path is required for the whisper backend".into(),
                ));
            }
            if !cfg!(feature = "whisper") {
                return Err(ConfigError::Validation(
                    "the whisper backend needs a build with the `whisper` feature".into(),
                ));
            }
            Ok(TranscriptionConfig::Whisper { model_path: PathBuf::from(whisper_model_path), language })
        }
    }
}
