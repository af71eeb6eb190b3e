//! Runtime configuration. Defaults are the device constants; the environment
//! overlays integration credentials and a few tunables.

use std::path::PathBuf;
use std::time::Duration;

use crate::audio::{INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE};
use crate::location::LOCATION_URL;
use crate::registry::ModelParams;

const DEFAULT_HA_URL: &str = "http://homeassistant.local:8123";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?}")]
    Invalid { var: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct HomeAssistantConfig {
    pub url: String,
    pub token: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    /// LISTENING with no activity for this long reverts to WAKE_WORD.
    pub idle_timeout: Duration,
    pub watchdog_interval: Duration,
    pub playback_poll: Duration,
    pub playback_reopen_backoff: Duration,
    /// Per-thread bound when joining at shutdown.
    pub join_timeout: Duration,
    pub button_settle: Duration,
    pub wake_models: Vec<ModelParams>,
    pub settings_path: PathBuf,
    pub location_url: String,
    pub home_assistant: Option<HomeAssistantConfig>,
    pub spotify_token: Option<String>,
    /// Substrings naming the assistant's own music playback device.
    pub preferred_music_devices: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            input_sample_rate: INPUT_SAMPLE_RATE,
            output_sample_rate: OUTPUT_SAMPLE_RATE,
            idle_timeout: Duration::from_secs(7),
            watchdog_interval: Duration::from_secs(1),
            playback_poll: Duration::from_millis(100),
            playback_reopen_backoff: Duration::from_secs(2),
            join_timeout: Duration::from_secs(2),
            button_settle: Duration::from_millis(50),
            wake_models: vec![ModelParams::new("chohchkoh", 0.1, 1)],
            settings_path: PathBuf::from("config.json"),
            location_url: LOCATION_URL.to_string(),
            home_assistant: None,
            spotify_token: None,
            preferred_music_devices: vec!["chochko".into(), "raspotify".into()],
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Overlay variables from `lookup` onto the defaults. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut config = Config::default();

        if let Some(token) = get("HA_TOKEN").filter(|t| !t.starts_with("YOUR_")) {
            config.home_assistant = Some(HomeAssistantConfig {
                url: get("HA_URL").unwrap_or_else(|| DEFAULT_HA_URL.to_string()),
                token,
            });
        }
        config.spotify_token = get("SPOTIFY_ACCESS_TOKEN");
        if let Some(path) = get("VOICE_ASSIST_SETTINGS") {
            config.settings_path = PathBuf::from(path);
        }
        if let Some(raw) = get("VOICE_ASSIST_IDLE_TIMEOUT_SECS") {
            let secs: u64 = raw.parse().map_err(|_| ConfigError::Invalid {
                var: "VOICE_ASSIST_IDLE_TIMEOUT_SECS",
                value: raw.clone(),
            })?;
            config.idle_timeout = Duration::from_secs(secs);
        }
        Ok(config)
    }
}
