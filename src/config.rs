//! Configuration types for the voice-call client.

use crate::error::{CallError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration for one call pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// Audio capture/playback settings.
    pub audio: AudioConfig,
    /// Silence segmentation settings.
    pub segmenter: SegmenterConfig,
    /// Backend channel and reconnect settings.
    pub connection: ConnectionConfig,
    /// External STT/coach/TTS service endpoints.
    pub services: ServicesConfig,
    /// Session persistence settings.
    pub session: SessionConfig,
}

impl CallConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CallError::Config(format!("failed to read {}: {e}", path.display())))?;
        toml::from_str(&raw)
            .map_err(|e| CallError::Config(format!("invalid config {}: {e}", path.display())))
    }
}

/// Audio I/O configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Capture sample rate in Hz, agreed with the backend.
    pub capture_sample_rate: u32,
    /// Playback sample rate in Hz for synthesized replies.
    pub playback_sample_rate: u32,
    /// Input device name (None = system default).
    pub input_device: Option<String>,
    /// Output device name (None = system default).
    pub output_device: Option<String>,
    /// Request echo cancellation from the capture backend where supported.
    ///
    /// Advisory: cpal exposes no portable toggle, so this records the
    /// device-level agreement with the backend rather than switching DSP.
    pub echo_cancellation: bool,
    /// Request noise suppression from the capture backend where supported.
    pub noise_suppression: bool,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            capture_sample_rate: 16_000,
            playback_sample_rate: 24_000,
            input_device: None,
            output_device: None,
            echo_cancellation: true,
            noise_suppression: true,
        }
    }
}

/// Silence segmentation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmenterConfig {
    /// Silence duration in ms after which the buffered utterance is flushed.
    pub silence_threshold_ms: u64,
    /// Hard cap on buffered utterance duration in ms. A flush is forced at
    /// this point even during continuous speech, bounding turn latency.
    pub max_utterance_ms: u64,
    /// RMS energy threshold for counting a chunk as voiced.
    ///
    /// Samples are f32 in \[-1, 1\]. 0.01 suits most rooms; raise it for
    /// noisy environments.
    pub energy_threshold: f32,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            silence_threshold_ms: 1_500,
            max_utterance_ms: 15_000,
            energy_threshold: 0.01,
        }
    }
}

/// Backend channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// WebSocket URL of the voice service, e.g. `wss://host/voice-call`.
    pub socket_url: String,
    /// Base URL for the HTTP polling fallback.
    pub polling_url: String,
    /// Fixed polling interval in ms while in polling mode.
    pub poll_interval_ms: u64,
    /// Base reconnect delay in ms (doubled per attempt).
    pub reconnect_base_ms: u64,
    /// Upper bound on the reconnect delay in ms.
    pub reconnect_max_ms: u64,
    /// Reconnect attempts before giving up on the session's connection.
    pub max_reconnect_attempts: u32,
    /// Timeout in ms for a transcript to come back over the channel.
    pub request_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            socket_url: "ws://localhost:8787/voice-call".into(),
            polling_url: "http://localhost:8787".into(),
            poll_interval_ms: 3_000,
            reconnect_base_ms: 2_000,
            reconnect_max_ms: 32_000,
            max_reconnect_attempts: 5,
            request_timeout_ms: 15_000,
        }
    }
}

impl ConnectionConfig {
    /// Polling interval as a [`Duration`].
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Channel round-trip timeout as a [`Duration`].
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// External service endpoints (consumed as black boxes).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    /// Speech-to-text endpoint (`POST { audio: <base64> }` → `{ text }`).
    pub stt_url: String,
    /// Coach/LLM endpoint (`POST { text, sessionId, userId }` → `{ response }`).
    pub coach_url: String,
    /// Text-to-speech endpoint (`POST { text }` → `{ audioContent: <base64> }`).
    pub tts_url: String,
    /// Per-request timeout in ms for service calls.
    pub timeout_ms: u64,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            stt_url: "http://localhost:8787/speech-to-text".into(),
            coach_url: "http://localhost:8787/coach".into(),
            tts_url: "http://localhost:8787/text-to-speech".into(),
            timeout_ms: 30_000,
        }
    }
}

impl ServicesConfig {
    /// Service call timeout as a [`Duration`].
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Session persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// User id attached to sessions and wire messages.
    pub user_id: String,
    /// Endpoint the closed-session record is POSTed to. Empty disables
    /// persistence (the record is only logged).
    pub record_url: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            user_id: String::new(),
            record_url: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_backend_agreement() {
        let config = CallConfig::default();
        assert_eq!(config.segmenter.silence_threshold_ms, 1_500);
        assert_eq!(config.connection.poll_interval_ms, 3_000);
        assert_eq!(config.connection.max_reconnect_attempts, 5);
        assert_eq!(config.audio.capture_sample_rate, 16_000);
        assert!(config.audio.echo_cancellation);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let parsed: CallConfig = toml::from_str(
            r#"
[segmenter]
silence_threshold_ms = 800

[connection]
socket_url = "wss://coach.example/voice-call"
"#,
        )
        .expect("partial config should parse");

        assert_eq!(parsed.segmenter.silence_threshold_ms, 800);
        assert_eq!(parsed.segmenter.max_utterance_ms, 15_000);
        assert_eq!(parsed.connection.socket_url, "wss://coach.example/voice-call");
        assert_eq!(parsed.connection.reconnect_base_ms, 2_000);
    }

    #[test]
    fn from_file_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("voxcoach.toml");
        let config = CallConfig::default();
        let raw = toml::to_string(&config).expect("serialize");
        std::fs::write(&path, raw).expect("write");

        let loaded = CallConfig::from_file(&path).expect("load");
        assert_eq!(loaded.connection.reconnect_max_ms, config.connection.reconnect_max_ms);
    }

    #[test]
    fn from_file_missing_is_config_error() {
        let err = CallConfig::from_file(Path::new("/nonexistent/voxcoach.toml"))
            .expect_err("missing file should fail");
        assert!(matches!(err, CallError::Config(_)));
    }
}
