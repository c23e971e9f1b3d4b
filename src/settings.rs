use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const APP_DIR_NAME: &str = "shop-concierge";
const SETTINGS_FILE_NAME: &str = "settings.json";

pub const AUDIO_URL_ENV: &str = "CONCIERGE_AUDIO_URL";
pub const SEARCH_URL_ENV: &str = "CONCIERGE_SEARCH_URL";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// WebSocket endpoint of the audio server.
    pub audio_url: String,

    /// Base URL of the text-search backend (`/chat`, `/search`).
    pub search_url: String,

    /// Samples per outbound audio frame at 16kHz (1600 = 100ms).
    pub frame_samples: usize,

    /// Sample rate of speech audio sent by the server.
    pub playback_sample_rate: u32,

    /// Captured frames buffered ahead of the socket before new ones are dropped.
    pub frame_channel_capacity: usize,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            audio_url: "ws://localhost:8765".to_string(),
            search_url: "http://localhost:8000".to_string(),
            frame_samples: 1600,
            playback_sample_rate: 24000,
            frame_channel_capacity: 64,
        }
    }
}

impl AppSettings {
    /// Replace endpoints with values from the environment, when set
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(AUDIO_URL_ENV).filter(|v| !v.is_empty()) {
            log::info!("Settings: audio_url from {}", AUDIO_URL_ENV);
            self.audio_url = url;
        }
        if let Some(url) = lookup(SEARCH_URL_ENV).filter(|v| !v.is_empty()) {
            log::info!("Settings: search_url from {}", SEARCH_URL_ENV);
            self.search_url = url;
        }
    }
}

pub fn settings_path() -> Result<PathBuf, String> {
    let dir = dirs::config_dir().ok_or("Could not determine config directory")?;
    Ok(dir.join(APP_DIR_NAME).join(SETTINGS_FILE_NAME))
}

/// Load settings from the default location, then apply environment overrides
pub fn load_settings() -> AppSettings {
    let mut settings = match settings_path() {
        Ok(path) => load_settings_from(&path),
        Err(e) => {
            log::warn!("Settings: {}", e);
            AppSettings::default()
        }
    };
    settings.apply_env_overrides();
    settings
}

/// Missing or unreadable files fall back to defaults
pub fn load_settings_from(path: &Path) -> AppSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<AppSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                AppSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            AppSettings::default()
        }
    }
}

pub fn save_settings(settings: &AppSettings) -> Result<PathBuf, String> {
    let path = settings_path()?;
    save_settings_to(&path, settings)?;
    Ok(path)
}

pub fn save_settings_to(path: &Path, settings: &AppSettings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory {:?}: {}", parent, e))?;
    }

    let contents =
        serde_json::to_string_pretty(settings).map_err(|e| format!("Serialize settings: {}", e))?;

    // Temp file in the same directory, then rename over the target
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents)
        .map_err(|e| format!("Write temp settings {:?}: {}", tmp_path, e))?;

    // Windows rename fails when the destination exists
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(format!("Remove existing settings file {:?}: {}", path, e));
            }
        }
    }

    std::fs::rename(&tmp_path, path)
        .map_err(|e| format!("Rename temp settings {:?} to {:?}: {}", tmp_path, path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings_from(&dir.path().join("nope.json"));
        assert_eq!(settings, AppSettings::default());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"audio_url":"wss://shop.example/ws"}"#).unwrap();

        let settings = load_settings_from(&path);
        assert_eq!(settings.audio_url, "wss://shop.example/ws");
        assert_eq!(settings.frame_samples, 1600);
        assert_eq!(settings.search_url, "http://localhost:8000");
    }

    #[test]
    fn test_corrupt_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert_eq!(load_settings_from(&path), AppSettings::default());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let settings = AppSettings {
            frame_samples: 800,
            ..Default::default()
        };

        save_settings_to(&path, &settings).unwrap();
        assert!(!path.with_extension("json.tmp").exists());
        assert_eq!(load_settings_from(&path), settings);

        // Overwrite an existing file
        let updated = AppSettings {
            frame_samples: 3200,
            ..settings
        };
        save_settings_to(&path, &updated).unwrap();
        assert_eq!(load_settings_from(&path).frame_samples, 3200);
    }

    #[test]
    fn test_env_overrides() {
        let mut settings = AppSettings::default();
        settings.apply_overrides(|key| match key {
            AUDIO_URL_ENV => Some("ws://10.0.0.2:8765".to_string()),
            SEARCH_URL_ENV => Some(String::new()),
            _ => None,
        });
        assert_eq!(settings.audio_url, "ws://10.0.0.2:8765");
        // Empty values are ignored
        assert_eq!(settings.search_url, "http://localhost:8000");
    }
}
