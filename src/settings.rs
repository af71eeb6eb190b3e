//! Persisted device settings: a small JSON key-value file.
//! Created with defaults when missing or unreadable; keys missing from an
//! older file are filled in and written back.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

pub const DEFAULT_VOICE_NAME: &str = "Ollie";
pub const DEFAULT_SPEAKER_VOLUME: u8 = 75;

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("settings io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("settings json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub voice_name: String,
    pub speaker_volume: u8,
    /// Keys this version does not know about, preserved on save.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            voice_name: DEFAULT_VOICE_NAME.to_string(),
            speaker_volume: DEFAULT_SPEAKER_VOLUME,
            extra: BTreeMap::new(),
        }
    }
}

/// Parse a settings document, filling defaults. Returns the settings and
/// whether any known key was missing.
fn parse(raw: &str) -> Result<(Settings, bool), SettingsError> {
    let mut map: BTreeMap<String, serde_json::Value> = serde_json::from_str(raw)?;
    let defaults = Settings::default();
    let mut filled = false;
    if !map.contains_key("voice_name") {
        map.insert("voice_name".into(), defaults.voice_name.clone().into());
        filled = true;
    }
    if !map.contains_key("speaker_volume") {
        map.insert("speaker_volume".into(), defaults.speaker_volume.into());
        filled = true;
    }
    let settings = serde_json::from_value(serde_json::Value::Object(map.into_iter().collect()))?;
    Ok((settings, filled))
}

pub struct SettingsStore {
    path: PathBuf,
    current: Mutex<Settings>,
}

impl SettingsStore {
    /// Load settings from `path`, creating or repairing the file as needed.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let (settings, needs_save) = match std::fs::read_to_string(&path) {
            Ok(raw) => match parse(&raw) {
                Ok((settings, filled)) => (settings, filled),
                Err(e) => {
                    error!(path = %path.display(), error = %e, "settings unreadable, using defaults");
                    (Settings::default(), true)
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "settings file not found, creating default");
                (Settings::default(), true)
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "settings unreadable, using defaults");
                (Settings::default(), true)
            }
        };

        let store = Self {
            path,
            current: Mutex::new(settings),
        };
        if needs_save {
            if let Err(e) = store.save() {
                error!(error = %e, "failed to save settings file");
            }
        }
        store
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self) -> Settings {
        self.current.lock().clone()
    }

    pub fn speaker_volume(&self) -> u8 {
        self.current.lock().speaker_volume
    }

    /// Update the speaker volume and write the file.
    pub fn set_speaker_volume(&self, volume: u8) -> Result<(), SettingsError> {
        self.current.lock().speaker_volume = volume;
        self.save()
    }

    pub fn save(&self) -> Result<(), SettingsError> {
        let body = serde_json::to_string_pretty(&*self.current.lock())?;
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(&self.path, body)?;
        debug!(path = %self.path.display(), "settings saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let store = SettingsStore::load(&path);
        assert_eq!(store.get(), Settings::default());
        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["speaker_volume"], 75);
        assert_eq!(written["voice_name"], "Ollie");
    }

    #[test]
    fn missing_keys_are_filled_and_unknown_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"speaker_volume": 40, "theme": "dark"}"#).unwrap();

        let store = SettingsStore::load(&path);
        assert_eq!(store.speaker_volume(), 40);
        assert_eq!(store.get().voice_name, DEFAULT_VOICE_NAME);

        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["theme"], "dark");
        assert_eq!(written["voice_name"], DEFAULT_VOICE_NAME);
    }

    #[test]
    fn corrupt_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        let store = SettingsStore::load(&path);
        assert_eq!(store.speaker_volume(), DEFAULT_SPEAKER_VOLUME);
    }

    #[test]
    fn volume_changes_are_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let store = SettingsStore::load(&path);
        store.set_speaker_volume(30).unwrap();
        assert_eq!(SettingsStore::load(&path).speaker_volume(), 30);
    }
}
