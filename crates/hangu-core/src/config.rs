//! Configuration loading for the reader.
//!
//! Settings live in `conf/config.toml`. Missing or invalid entries fall back to
//! defaults so a session can always start.

use serde::{Deserialize, Deserializer, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

const MIN_TICK_MS: u64 = 10;
const MAX_TICK_MS: u64 = 1000;

/// High-level app configuration; deserializable from TOML.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub region: PollyRegion,
    #[serde(default = "default_voice")]
    pub voice: String,
    #[serde(default)]
    pub engine: PollyEngine,
    #[serde(default = "default_presign_expiry_secs")]
    pub presign_expiry_secs: u64,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default)]
    pub audio_dir: Option<String>,
    #[serde(default = "default_export_path")]
    pub export_path: String,
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,
    #[serde(default)]
    pub aws_access_key_id: Option<String>,
    #[serde(default)]
    pub aws_secret_access_key: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            region: PollyRegion::default(),
            voice: default_voice(),
            engine: PollyEngine::default(),
            presign_expiry_secs: default_presign_expiry_secs(),
            tick_interval_ms: default_tick_interval_ms(),
            audio_dir: None,
            export_path: default_export_path(),
            log_level: default_log_level(),
            aws_access_key_id: None,
            aws_secret_access_key: None,
        }
    }
}

impl AppConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.clamp(MIN_TICK_MS, MAX_TICK_MS))
    }

    pub fn presign_expiry(&self) -> Duration {
        Duration::from_secs(self.presign_expiry_secs.max(1))
    }

    /// Directory for transient synthesized audio.
    pub fn audio_dir(&self) -> PathBuf {
        match self.audio_dir.as_deref() {
            Some(dir) if !dir.trim().is_empty() => PathBuf::from(dir),
            _ => std::env::temp_dir().join("hangu-reader"),
        }
    }

    pub fn has_explicit_credentials(&self) -> bool {
        matches!(
            (&self.aws_access_key_id, &self.aws_secret_access_key),
            (Some(key), Some(secret)) if !key.is_empty() && !secret.is_empty()
        )
    }
}

/// Regions the reader knows how to reach; anything else maps to `us-east-1`.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PollyRegion {
    #[default]
    UsEast1,
    UsWest2,
    ApNortheast2,
}

impl PollyRegion {
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "us-west-2" => PollyRegion::UsWest2,
            "ap-northeast-2" => PollyRegion::ApNortheast2,
            "us-east-1" => PollyRegion::UsEast1,
            other => {
                warn!(region = other, "Unknown region; falling back to us-east-1");
                PollyRegion::UsEast1
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PollyRegion::UsEast1 => "us-east-1",
            PollyRegion::UsWest2 => "us-west-2",
            PollyRegion::ApNortheast2 => "ap-northeast-2",
        }
    }
}

impl<'de> Deserialize<'de> for PollyRegion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(PollyRegion::from_name(&name))
    }
}

impl std::fmt::Display for PollyRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PollyEngine {
    #[default]
    Standard,
    Neural,
}

impl std::fmt::Display for PollyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            PollyEngine::Standard => "standard",
            PollyEngine::Neural => "neural",
        };
        write!(f, "{}", label)
    }
}

/// Supported logging verbosity levels.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_filter_str())
    }
}

impl LogLevel {
    pub fn as_filter_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Load configuration from the given path, falling back to defaults on error.
pub fn load_config(path: &Path) -> AppConfig {
    let contents = match fs::read_to_string(path) {
        Ok(data) => {
            info!(path = %path.display(), "Loaded base config");
            data
        }
        Err(err) => {
            warn!(
                path = %path.display(),
                "Falling back to default config: {err}"
            );
            return AppConfig::default();
        }
    };

    match parse_config(&contents) {
        Ok(cfg) => {
            debug!("Parsed configuration from disk");
            cfg
        }
        Err(err) => {
            warn!(path = %path.display(), "Invalid config TOML: {err}");
            AppConfig::default()
        }
    }
}

pub fn parse_config(contents: &str) -> Result<AppConfig, toml::de::Error> {
    toml::from_str::<AppConfig>(contents)
}

fn default_voice() -> String {
    "Seoyeon".to_string()
}

fn default_presign_expiry_secs() -> u64 {
    900
}

fn default_tick_interval_ms() -> u64 {
    50
}

fn default_export_path() -> String {
    "vocabulary.txt".to_string()
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}
