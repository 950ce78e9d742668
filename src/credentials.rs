use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const TRANSCRIPTION_KEY: &str = "assemblyai";
pub const REASONING_KEY: &str = "google_gemini";
pub const SYNTHESIS_KEY: &str = "murf_ai";

/// Environment overrides, checked after the secrets file.
const ENV_OVERRIDES: &[(&str, &str)] = &[
    (TRANSCRIPTION_KEY, "ASSEMBLYAI_API_KEY"),
    (REASONING_KEY, "GOOGLE_API_KEY"),
    (SYNTHESIS_KEY, "MURF_API_KEY"),
];

/// The three provider keys the agent backend needs for a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    /// Speech-to-text provider.
    pub assemblyai: String,
    /// Language model provider.
    pub google_gemini: String,
    /// Text-to-speech provider.
    pub murf_ai: String,
}

impl Credentials {
    pub fn from_map(keys: &HashMap<String, String>) -> Self {
        let get = |name: &str| keys.get(name).cloned().unwrap_or_default();
        Self {
            assemblyai: get(TRANSCRIPTION_KEY),
            google_gemini: get(REASONING_KEY),
            murf_ai: get(SYNTHESIS_KEY),
        }
    }

    /// Key names paired with their values, in wire order.
    pub fn entries(&self) -> [(&'static str, &str); 3] {
        [
            (TRANSCRIPTION_KEY, self.assemblyai.as_str()),
            (REASONING_KEY, self.google_gemini.as_str()),
            (SYNTHESIS_KEY, self.murf_ai.as_str()),
        ]
    }

    /// Names of keys that are missing or blank.
    pub fn missing(&self) -> Vec<&'static str> {
        self.entries()
            .iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(name, _)| *name)
            .collect()
    }

    fn set(&mut self, name: &str, value: String) {
        match name {
            TRANSCRIPTION_KEY => self.assemblyai = value,
            REASONING_KEY => self.google_gemini = value,
            SYNTHESIS_KEY => self.murf_ai = value,
            _ => {}
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SecretsFile {
    #[serde(default)]
    api_keys: HashMap<String, String>,
}

pub fn secrets_path() -> Result<PathBuf, String> {
    if let Some(dir) = dirs::data_local_dir() {
        return Ok(dir.join("Voxlink").join("secrets.json"));
    }
    if let Some(home) = dirs::home_dir() {
        return Ok(home.join(".voxlink").join("secrets.json"));
    }
    Err("Failed to resolve data directory".into())
}

/// Read keys from `path`. A missing file is an empty store.
pub fn load_from(path: &Path) -> Result<Credentials, String> {
    let text = match fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Credentials::default()),
        Err(e) => return Err(format!("Failed to read secrets file: {}", e)),
    };
    let parsed: SecretsFile =
        serde_json::from_str(&text).map_err(|e| format!("Failed to parse secrets file: {}", e))?;
    Ok(Credentials::from_map(&parsed.api_keys))
}

pub fn save_to(path: &Path, credentials: &Credentials) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| format!("Failed to create secrets dir: {}", e))?;
    }
    let api_keys: HashMap<String, String> = credentials
        .entries()
        .iter()
        .filter(|(_, value)| !value.trim().is_empty())
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect();
    let json = serde_json::to_string_pretty(&SecretsFile { api_keys })
        .map_err(|e| format!("Failed to serialize secrets file: {}", e))?;
    fs::write(path, json).map_err(|e| format!("Failed to write secrets file: {}", e))?;
    Ok(())
}

/// Write one key into the secrets file at `path`, keeping the others.
pub fn store_key(path: &Path, name: &str, value: &str) -> Result<(), String> {
    let known = Credentials::default()
        .entries()
        .iter()
        .any(|(key, _)| *key == name);
    if !known {
        return Err(format!(
            "Unknown key '{}' (expected {}, {} or {})",
            name, TRANSCRIPTION_KEY, REASONING_KEY, SYNTHESIS_KEY
        ));
    }
    let mut credentials = load_from(path)?;
    credentials.set(name, value.trim().to_string());
    save_to(path, &credentials)
}

/// Replace keys with non-empty values produced by `lookup`.
pub fn apply_overrides<F>(credentials: &mut Credentials, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    for (name, var) in ENV_OVERRIDES {
        if let Some(value) = lookup(var).filter(|v| !v.trim().is_empty()) {
            credentials.set(name, value);
        }
    }
}

/// Load the user's keys: secrets file first, then environment overrides.
pub fn load() -> Credentials {
    let mut credentials = match secrets_path().and_then(|p| load_from(&p)) {
        Ok(c) => c,
        Err(e) => {
            log::warn!("[credentials] {}", e);
            Credentials::default()
        }
    };
    apply_overrides(&mut credentials, |var| std::env::var(var).ok());
    credentials
}
