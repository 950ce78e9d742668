use crate::protocol::KeyParamStyle;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Agent backend `host[:port]`; serves both `/ws` and the history endpoints.
    #[serde(default = "default_host")]
    pub host: String,
    /// Use `wss://` / `https://` instead of `ws://` / `http://`.
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub key_params: KeyParamStyle,
    /// Input device name; empty means the system default.
    #[serde(default)]
    pub mic_device: String,
    /// Rate assumed for reply audio that arrives as headerless PCM.
    #[serde(default = "default_playback_sample_rate")]
    pub playback_sample_rate: u32,
    /// Agent line shown before the first turn. Empty disables it.
    #[serde(default = "default_greeting")]
    pub greeting: String,
}

impl Settings {
    pub fn http_base(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{}://{}", scheme, self.host.trim().trim_end_matches('/'))
    }

    pub fn mic_device(&self) -> Option<&str> {
        let name = self.mic_device.trim();
        if name.is_empty() {
            None
        } else {
            Some(name)
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            host: default_host(),
            secure: false,
            key_params: KeyParamStyle::default(),
            mic_device: String::new(),
            playback_sample_rate: default_playback_sample_rate(),
            greeting: default_greeting(),
        }
    }
}

fn default_host() -> String {
    "localhost:8000".into()
}
fn default_playback_sample_rate() -> u32 {
    24000
}
fn default_greeting() -> String {
    "Hello! How can I help you today?".into()
}

pub fn settings_path() -> Result<PathBuf, String> {
    if let Some(dir) = dirs::data_local_dir() {
        return Ok(dir.join("Voxlink").join("settings.json"));
    }
    if let Some(home) = dirs::home_dir() {
        return Ok(home.join(".voxlink").join("settings.json"));
    }
    Err("Failed to resolve data directory".into())
}

/// Missing or unreadable settings fall back to defaults.
pub fn load_from(path: &Path) -> Settings {
    let mut settings: Settings = match fs::read_to_string(path) {
        Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
            log::warn!("[settings] ignoring invalid {}: {}", path.display(), e);
            Settings::default()
        }),
        Err(_) => return Settings::default(),
    };
    if settings.playback_sample_rate == 0 {
        settings.playback_sample_rate = default_playback_sample_rate();
    }
    settings
}

pub fn load() -> Settings {
    match settings_path() {
        Ok(p) => load_from(&p),
        Err(_) => Settings::default(),
    }
}

pub fn save_to(path: &Path, settings: &Settings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| format!("Failed to create settings dir: {}", e))?;
    }
    let json = serde_json::to_string_pretty(settings)
        .map_err(|e| format!("Failed to serialize settings: {}", e))?;
    fs::write(path, json).map_err(|e| format!("Failed to write settings: {}", e))?;
    Ok(())
}

pub fn save(settings: &Settings) -> Result<(), String> {
    save_to(&settings_path()?, settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{"host": "agent.local:9000", "key_params": "plain"}"#).unwrap();
        let settings = load_from(&path);
        assert_eq!(settings.host, "agent.local:9000");
        assert_eq!(settings.key_params, KeyParamStyle::Plain);
        assert!(!settings.secure);
        assert_eq!(settings.playback_sample_rate, 24000);
        assert!(settings.mic_device().is_none());
    }

    #[test]
    fn invalid_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "[]").unwrap();
        assert_eq!(load_from(&path).host, "localhost:8000");
    }

    #[test]
    fn save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a").join("settings.json");
        let settings = Settings {
            secure: true,
            mic_device: "USB Mic".into(),
            ..Settings::default()
        };
        save_to(&path, &settings).unwrap();
        let loaded = load_from(&path);
        assert!(loaded.secure);
        assert_eq!(loaded.mic_device(), Some("USB Mic"));
        assert_eq!(loaded.http_base(), "https://localhost:8000");
    }
}
