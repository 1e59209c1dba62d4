//! Configuration for the interpretation engine
//!
//! Two-tier configuration:
//! 1. **TOML bootstrap**: optional config file with the same keys as the
//!    environment (static, read once at startup)
//! 2. **Environment**: every key can be supplied as an environment variable,
//!    overriding the file
//!
//! Command-line overrides (applied by the binary) take priority over both.
//! The validated result is an immutable [`SessionConfig`] snapshot shared
//! read-only by every pipeline component for the lifetime of the session.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

/// Audio pipeline sample rate: everything downstream of the conditioner is
/// 24 kHz mono PCM16, matching the wire format.
pub const PIPELINE_SAMPLE_RATE: u32 = 24_000;

/// Segmentation preset selected at session start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AudioPreset {
    Balanced,
    Aggressive,
    LowLatency,
    ServerVad,
}

impl AudioPreset {
    /// Segmenter scratch buffer size in samples at 24 kHz
    pub fn buffer_samples(self) -> usize {
        match self {
            AudioPreset::Balanced => 6000,
            AudioPreset::Aggressive => 8000,
            AudioPreset::LowLatency | AudioPreset::ServerVad => 4800,
        }
    }

    /// Minimum utterance length; shorter detections are dropped
    pub fn min_speech_ms(self) -> u32 {
        match self {
            AudioPreset::Balanced => 500,
            AudioPreset::Aggressive => 800,
            AudioPreset::LowLatency => 400,
            AudioPreset::ServerVad => 0,
        }
    }

    /// Silence debounce before a speech-end is final
    pub fn debounce_ms(self) -> u32 {
        match self {
            AudioPreset::Balanced => 400,
            AudioPreset::Aggressive => 500,
            AudioPreset::LowLatency => 250,
            AudioPreset::ServerVad => 0,
        }
    }

    /// In server-VAD mode the client detector emits no speech events;
    /// segmentation follows server turn-detection events instead.
    pub fn client_vad_enabled(self) -> bool {
        !matches!(self, AudioPreset::ServerVad)
    }
}

impl FromStr for AudioPreset {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "BALANCED" => Ok(AudioPreset::Balanced),
            "AGGRESSIVE" => Ok(AudioPreset::Aggressive),
            "LOW_LATENCY" => Ok(AudioPreset::LowLatency),
            "SERVER_VAD" => Ok(AudioPreset::ServerVad),
            other => Err(Error::Config(format!("unknown AUDIO_PRESET '{other}'"))),
        }
    }
}

/// Which capture source feeds the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VadMode {
    /// Default microphone input device
    Microphone,
    /// System audio loopback (interpret what the machine is playing)
    System,
}

impl FromStr for VadMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "MICROPHONE" => Ok(VadMode::Microphone),
            "SYSTEM" => Ok(VadMode::System),
            other => Err(Error::Config(format!("unknown VAD_MODE '{other}'"))),
        }
    }
}

/// Sensitivity scaling applied to the calibrated VAD threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VadSensitivity {
    Low,
    Medium,
    High,
}

impl VadSensitivity {
    /// Multiplier on the adaptive threshold: lower sensitivity raises the
    /// bar for speech, higher sensitivity lowers it.
    pub fn threshold_scale(self) -> f32 {
        match self {
            VadSensitivity::Low => 1.5,
            VadSensitivity::Medium => 1.0,
            VadSensitivity::High => 0.6,
        }
    }
}

impl FromStr for VadSensitivity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "LOW" => Ok(VadSensitivity::Low),
            "MEDIUM" => Ok(VadSensitivity::Medium),
            "HIGH" => Ok(VadSensitivity::High),
            other => Err(Error::Config(format!("unknown VAD_SENSITIVITY '{other}'"))),
        }
    }
}

/// Raw settings as read from file/environment, before validation.
///
/// Every field is optional here; defaults and required-key checks are
/// applied in [`EngineSettings::into_session_config`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EngineSettings {
    #[serde(rename = "REALTIME_URL")]
    pub realtime_url: Option<String>,
    #[serde(rename = "REALTIME_MODEL")]
    pub realtime_model: Option<String>,
    #[serde(rename = "CHAT_MODEL")]
    pub chat_model: Option<String>,
    #[serde(rename = "AUTH_TOKEN")]
    pub auth_token: Option<String>,
    #[serde(rename = "AUDIO_PRESET")]
    pub audio_preset: Option<String>,
    #[serde(rename = "VAD_MODE")]
    pub vad_mode: Option<String>,
    #[serde(rename = "VAD_SENSITIVITY")]
    pub vad_sensitivity: Option<String>,
    #[serde(rename = "TARGET_LANG")]
    pub target_lang: Option<String>,
    #[serde(rename = "INSTRUCTIONS")]
    pub instructions: Option<String>,
    #[serde(rename = "AEC_STEP_SIZE")]
    pub aec_step_size: Option<f32>,
    #[serde(rename = "AEC_FILTER_LEN")]
    pub aec_filter_len: Option<usize>,
    #[serde(rename = "OUTPUT_VOLUME")]
    pub output_volume: Option<f32>,
    #[serde(rename = "PLAYBACK_ENABLED")]
    pub playback_enabled: Option<bool>,
}

impl EngineSettings {
    /// Load settings from an optional TOML file, then let environment
    /// variables override file values.
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut settings = match config_file {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    Error::Config(format!("failed to read config file {path:?}: {e}"))
                })?;
                let parsed: EngineSettings = toml::from_str(&text)?;
                info!("Loaded configuration from {:?}", path);
                parsed
            }
            None => EngineSettings::default(),
        };
        settings.apply_env();
        Ok(settings)
    }

    /// Override file values with environment variables of the same name.
    pub fn apply_env(&mut self) {
        fn env_str(key: &str) -> Option<String> {
            std::env::var(key).ok().filter(|v| !v.is_empty())
        }

        if let Some(v) = env_str("REALTIME_URL") {
            self.realtime_url = Some(v);
        }
        if let Some(v) = env_str("REALTIME_MODEL") {
            self.realtime_model = Some(v);
        }
        if let Some(v) = env_str("CHAT_MODEL") {
            self.chat_model = Some(v);
        }
        if let Some(v) = env_str("AUTH_TOKEN") {
            self.auth_token = Some(v);
        }
        if let Some(v) = env_str("AUDIO_PRESET") {
            self.audio_preset = Some(v);
        }
        if let Some(v) = env_str("VAD_MODE") {
            self.vad_mode = Some(v);
        }
        if let Some(v) = env_str("VAD_SENSITIVITY") {
            self.vad_sensitivity = Some(v);
        }
        if let Some(v) = env_str("TARGET_LANG") {
            self.target_lang = Some(v);
        }
        if let Some(v) = env_str("INSTRUCTIONS") {
            self.instructions = Some(v);
        }
        if let Some(v) = env_str("AEC_STEP_SIZE").and_then(|v| v.parse().ok()) {
            self.aec_step_size = Some(v);
        }
        if let Some(v) = env_str("AEC_FILTER_LEN").and_then(|v| v.parse().ok()) {
            self.aec_filter_len = Some(v);
        }
        if let Some(v) = env_str("OUTPUT_VOLUME").and_then(|v| v.parse().ok()) {
            self.output_volume = Some(v);
        }
        if let Some(v) = env_str("PLAYBACK_ENABLED") {
            self.playback_enabled = Some(matches!(
                v.to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            ));
        }
    }

    /// Validate and freeze into an immutable session snapshot.
    pub fn into_session_config(self) -> Result<SessionConfig> {
        let realtime_url = self
            .realtime_url
            .ok_or_else(|| Error::Config("REALTIME_URL is required".into()))?;
        let auth_token = self
            .auth_token
            .ok_or_else(|| Error::Config("AUTH_TOKEN is required".into()))?;

        let preset = match self.audio_preset.as_deref() {
            Some(s) => s.parse()?,
            None => AudioPreset::Balanced,
        };
        let vad_mode = match self.vad_mode.as_deref() {
            Some(s) => s.parse()?,
            None => VadMode::Microphone,
        };
        let vad_sensitivity = match self.vad_sensitivity.as_deref() {
            Some(s) => s.parse()?,
            None => VadSensitivity::Medium,
        };

        let aec_step_size = self.aec_step_size.unwrap_or(0.5);
        if !(0.0..=1.0).contains(&aec_step_size) {
            return Err(Error::Config(format!(
                "AEC_STEP_SIZE {aec_step_size} out of range (0.0..=1.0)"
            )));
        }
        let aec_filter_len = self.aec_filter_len.unwrap_or(512);
        if !(64..=4096).contains(&aec_filter_len) {
            return Err(Error::Config(format!(
                "AEC_FILTER_LEN {aec_filter_len} out of range (64..=4096)"
            )));
        }
        let output_volume = self.output_volume.unwrap_or(1.0);
        if !(0.0..=2.0).contains(&output_volume) {
            return Err(Error::Config(format!(
                "OUTPUT_VOLUME {output_volume} out of range (0.0..=2.0)"
            )));
        }

        let target_lang = self.target_lang.unwrap_or_else(|| "en".to_string());
        let instructions = self.instructions.unwrap_or_else(|| {
            format!(
                "You are a professional simultaneous interpreter. Translate everything \
                 you hear into {target_lang}. Output only the translation."
            )
        });

        Ok(SessionConfig {
            realtime_url,
            realtime_model: self
                .realtime_model
                .unwrap_or_else(|| "gpt-4o-realtime-preview".to_string()),
            chat_model: self.chat_model.unwrap_or_else(|| "whisper-1".to_string()),
            auth_token,
            preset,
            vad_mode,
            vad_sensitivity,
            target_lang,
            instructions,
            aec_step_size,
            aec_filter_len,
            output_volume,
            playback_enabled: self.playback_enabled.unwrap_or(true),
        })
    }
}

/// Immutable snapshot of all session tunables.
///
/// Produced once at session start, then shared read-only (`Arc`) by every
/// component. Runtime-mutable state lives with the task that owns it.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Remote speech service endpoint (websocket URL)
    pub realtime_url: String,
    /// Bidirectional speech model name advertised in the session update
    pub realtime_model: String,
    /// Transcription model name for recognized-source text
    pub chat_model: String,
    /// Bearer token for the socket handshake
    pub auth_token: String,
    /// Segmentation preset
    pub preset: AudioPreset,
    /// Capture source selection
    pub vad_mode: VadMode,
    /// Threshold scaling for the detector
    pub vad_sensitivity: VadSensitivity,
    /// Translation target language code (e.g. "en", "ja")
    pub target_lang: String,
    /// Translation instructions sent with each response request
    pub instructions: String,
    /// NLMS step size μ
    pub aec_step_size: f32,
    /// NLMS filter length in taps
    pub aec_filter_len: usize,
    /// Playback gain applied before the output device
    pub output_volume: f32,
    /// When false, translated audio is drained but never rendered
    pub playback_enabled: bool,
}

impl SessionConfig {
    /// Response modalities derived from the playback switch: text always,
    /// audio only when playback is enabled.
    pub fn modalities(&self) -> Vec<String> {
        if self.playback_enabled {
            vec!["text".to_string(), "audio".to_string()]
        } else {
            vec!["text".to_string()]
        }
    }
}
