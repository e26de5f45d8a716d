//! # Configuration Management
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `GEMINI_API_KEY` / `API_KEY` environment variables (API credential only)
//! 2. Environment variables (APP__SESSION__MODEL, APP__LOCATION__CITY, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Default Gemini Live bidirectional streaming endpoint.
pub const DEFAULT_ENDPOINT: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Main client configuration that contains all settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub session: SessionConfig,
    pub audio: AudioConfig,
    pub location: LocationConfig,
    pub weather: WeatherConfig,
}

/// Remote agent connection settings. `model` is sent without the `models/` prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub model: String,
    pub endpoint: String,
    pub api_key: String,
    pub greeting_prompt: String,
    pub setup_timeout_secs: u64,
}

/// Audio format settings for capture and playback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub channels: u16,
    pub capture_window: usize,
    pub max_queued_secs: f64,
}

/// City the assistant talks about.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocationConfig {
    pub city: String,
    pub latitude: f64,
    pub longitude: f64,
}

/// Weather lookup settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeatherConfig {
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig {
                model: "gemini-2.5-flash-native-audio-preview-09-2025".to_string(),
                endpoint: DEFAULT_ENDPOINT.to_string(),
                api_key: String::new(),
                greeting_prompt: "The user just started a new conversation. Introduce yourself \
                    and explain you can share weather, construction updates, or upcoming events. \
                    Ask which one they would like first."
                    .to_string(),
                setup_timeout_secs: 15,
            },
            audio: AudioConfig {
                input_sample_rate: 16_000,
                output_sample_rate: 24_000,
                channels: 1,
                capture_window: 4096,
                max_queued_secs: 30.0,
            },
            location: LocationConfig {
                city: "Brantford".to_string(),
                latitude: 43.1383,
                longitude: -80.2644,
            },
            weather: WeatherConfig {
                base_url: "https://api.open-meteo.com/v1/forecast".to_string(),
                timeout_secs: 10,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// e.g. `APP__LOCATION__CITY=Paris`, `GEMINI_API_KEY=...`
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("__")
                    .separator("__"),
            );

        // Credentials usually come from a plain variable rather than the APP__ tree
        for key in ["API_KEY", "GEMINI_API_KEY"] {
            if let Ok(value) = env::var(key) {
                settings = settings.set_override("session.api_key", value)?;
            }
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// The API key is not required here; `print-config` and `list-devices` run without one.
    pub fn validate(&self) -> Result<()> {
        if self.session.model.trim().is_empty() {
            return Err(anyhow::anyhow!("Session model cannot be empty"));
        }

        if self.session.endpoint.trim().is_empty() {
            return Err(anyhow::anyhow!("Session endpoint cannot be empty"));
        }

        if self.audio.input_sample_rate == 0 || self.audio.output_sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rates must be greater than 0"));
        }

        if self.audio.channels == 0 {
            return Err(anyhow::anyhow!("Channel count must be greater than 0"));
        }

        if self.audio.capture_window == 0 {
            return Err(anyhow::anyhow!("Capture window must be greater than 0"));
        }

        if !(self.audio.max_queued_secs > 0.0) {
            return Err(anyhow::anyhow!("Playback queue cap must be positive"));
        }

        if !(-90.0..=90.0).contains(&self.location.latitude)
            || !(-180.0..=180.0).contains(&self.location.longitude)
        {
            return Err(anyhow::anyhow!("Location coordinates are out of range"));
        }

        Ok(())
    }

    /// Render the effective configuration as TOML, with the API key masked.
    pub fn to_toml_string(&self) -> Result<String> {
        let mut printable = self.clone();
        if !printable.session.api_key.is_empty() {
            printable.session.api_key = "********".to_string();
        }
        Ok(toml::to_string_pretty(&printable)?)
    }

    /// MIME type attached to every captured audio frame.
    pub fn input_mime_type(&self) -> String {
        format!("audio/pcm;rate={}", self.audio.input_sample_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test that the default configuration is valid and has expected values.
    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.audio.input_sample_rate, 16_000);
        assert_eq!(config.audio.output_sample_rate, 24_000);
        assert_eq!(config.audio.capture_window, 4096);
        assert_eq!(config.location.city, "Brantford");
        assert!(config.validate().is_ok());
    }

    /// Test that validation catches invalid configurations.
    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.audio.capture_window = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.location.latitude = 123.0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.max_queued_secs = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_rendering_masks_api_key() {
        let mut config = AppConfig::default();
        config.session.api_key = "secret-key".to_string();
        let rendered = config.to_toml_string().unwrap();
        assert!(rendered.contains("[session]"));
        assert!(rendered.contains("********"));
        assert!(!rendered.contains("secret-key"));
    }

    #[test]
    fn test_input_mime_type() {
        let config = AppConfig::default();
        assert_eq!(config.input_mime_type(), "audio/pcm;rate=16000");
    }
}
