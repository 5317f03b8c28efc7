//! Configuration for the voicebot client
//!
//! Defaults are usable out of the box against a local backend. A TOML file at
//! `~/.config/omni/voicebot/config.toml` overlays the defaults, and
//! environment variables overlay the file.

use std::path::PathBuf;

use serde::Deserialize;

use crate::Result;

/// Default backend base URL (session credential + tool proxy endpoints)
const DEFAULT_API_BASE: &str = "http://localhost:8000";

/// Default realtime signaling endpoint
const DEFAULT_REALTIME_URL: &str = "https://api.openai.com/v1/realtime";

/// Default realtime model identifier
const DEFAULT_MODEL: &str = "gpt-4o-realtime-preview-2024-12-17";

/// Instructions sent with the greeting request once the event channel opens
const DEFAULT_GREETING: &str =
    "Greet the user warmly as 'Researcher Pro'. Keep it brief (1 sentence).";

/// Accepted wake phrase variants for barge-in.
///
/// Transcription of a short interjection is noisy, so common
/// mis-transcriptions of "hey bot" are accepted too.
const DEFAULT_WAKE_PHRASES: &[&str] = &["hey bot", "hey bought", "hey but", "a bot"];

/// Voicebot client configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Backend base URL serving `/session` and `/api/tools/*`
    pub api_base: String,

    /// Realtime signaling endpoint for the SDP offer/answer exchange
    pub realtime_url: String,

    /// Realtime model identifier (query parameter on the signaling POST)
    pub model: String,

    /// Greeting instructions sent when the event channel opens
    pub greeting_instructions: String,

    /// Wake phrase variants accepted for barge-in (lowercase)
    pub wake_phrases: Vec<String>,

    /// Microphone capture settings
    pub capture: CaptureSettings,
}

/// Microphone capture settings
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    /// Echo cancellation (suppress assistant playback picked up by the mic)
    pub echo_cancellation: bool,

    /// Noise suppression (gate frames below the speech energy floor)
    pub noise_suppression: bool,

    /// Automatic gain control (normalize toward a target peak)
    pub auto_gain_control: bool,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            realtime_url: DEFAULT_REALTIME_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            greeting_instructions: DEFAULT_GREETING.to_string(),
            wake_phrases: DEFAULT_WAKE_PHRASES
                .iter()
                .map(ToString::to_string)
                .collect(),
            capture: CaptureSettings::default(),
        }
    }
}

impl Config {
    /// Load configuration: defaults, overlaid by the config file (if any),
    /// overlaid by environment variables.
    ///
    /// # Errors
    ///
    /// Returns error if the config file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        let mut config = Self::default();

        if let Some(path) = Self::config_file_path() {
            if path.exists() {
                let raw = std::fs::read_to_string(&path)?;
                let file: ConfigFile = toml::from_str(&raw)?;
                config.apply_file(file);
                tracing::debug!(path = %path.display(), "loaded config file");
            }
        }

        config.apply_env();
        Ok(config)
    }

    /// Path to the TOML config file, if a config directory can be resolved
    #[must_use]
    pub fn config_file_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("dev", "omni", "voicebot")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Overlay values from the config file
    fn apply_file(&mut self, file: ConfigFile) {
        if let Some(v) = file.api_base {
            self.api_base = v;
        }
        if let Some(v) = file.realtime.url {
            self.realtime_url = v;
        }
        if let Some(v) = file.realtime.model {
            self.model = v;
        }
        if let Some(v) = file.realtime.greeting_instructions {
            self.greeting_instructions = v;
        }
        if let Some(v) = file.wake_phrases {
            self.set_wake_phrases(v);
        }
        if let Some(v) = file.capture.echo_cancellation {
            self.capture.echo_cancellation = v;
        }
        if let Some(v) = file.capture.noise_suppression {
            self.capture.noise_suppression = v;
        }
        if let Some(v) = file.capture.auto_gain_control {
            self.capture.auto_gain_control = v;
        }
    }

    /// Overlay values from environment variables
    fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("VOICEBOT_API_BASE") {
            self.api_base = v;
        }
        if let Ok(v) = std::env::var("VOICEBOT_REALTIME_URL") {
            self.realtime_url = v;
        }
        if let Ok(v) = std::env::var("VOICEBOT_MODEL") {
            self.model = v;
        }
        if let Ok(v) = std::env::var("VOICEBOT_WAKE_PHRASES") {
            self.set_wake_phrases(v.split(',').map(str::to_string).collect());
        }
    }

    /// Normalize and install wake phrases (lowercase, trimmed, non-empty)
    fn set_wake_phrases(&mut self, phrases: Vec<String>) {
        let normalized: Vec<String> = phrases
            .into_iter()
            .map(|p| p.to_lowercase().trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        if !normalized.is_empty() {
            self.wake_phrases = normalized;
        }
    }
}

/// TOML config file schema — all fields optional overlays
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    api_base: Option<String>,

    #[serde(default)]
    wake_phrases: Option<Vec<String>>,

    #[serde(default)]
    realtime: RealtimeFileConfig,

    #[serde(default)]
    capture: CaptureFileConfig,
}

/// Realtime endpoint configuration
#[derive(Debug, Default, Deserialize)]
struct RealtimeFileConfig {
    url: Option<String>,
    model: Option<String>,
    greeting_instructions: Option<String>,
}

/// Capture configuration
#[derive(Debug, Default, Deserialize)]
struct CaptureFileConfig {
    echo_cancellation: Option<bool>,
    noise_suppression: Option<bool>,
    auto_gain_control: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.api_base, "http://localhost:8000");
        assert!(config.wake_phrases.contains(&"hey bot".to_string()));
        assert!(config.capture.echo_cancellation);
    }

    #[test]
    fn file_overlay_applies() {
        let file: ConfigFile = toml::from_str(
            r#"
            api_base = "https://backend.example.com"
            wake_phrases = ["  Hey Bot ", "OK BOT"]

            [realtime]
            model = "gpt-4o-realtime-preview"

            [capture]
            auto_gain_control = false
            "#,
        )
        .unwrap();

        let mut config = Config::default();
        config.apply_file(file);

        assert_eq!(config.api_base, "https://backend.example.com");
        assert_eq!(config.model, "gpt-4o-realtime-preview");
        assert_eq!(config.wake_phrases, vec!["hey bot", "ok bot"]);
        assert!(!config.capture.auto_gain_control);
        // Untouched fields keep their defaults
        assert_eq!(config.realtime_url, DEFAULT_REALTIME_URL);
    }

    #[test]
    fn empty_wake_phrases_keep_defaults() {
        let mut config = Config::default();
        config.set_wake_phrases(vec!["  ".to_string()]);
        assert!(config.wake_phrases.contains(&"hey bot".to_string()));
    }
}
