use std::{fs, io, path::PathBuf, time::Duration};

use orchix_util::{env_override, state_file_path, write_json_atomic, DEFAULT_BASE_URL};
use serde::{Deserialize, Serialize};
use tracing::warn;

const CLIENT_CONFIG_FILE: &str = "client-config.json";
pub const DEFAULT_PROBE_DEBOUNCE_MS: u64 = 400;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub base_url: String,
    pub session_token: String,
    pub csrf_token: String,
    pub probe_debounce_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.into(),
            session_token: String::new(),
            csrf_token: String::new(),
            probe_debounce_ms: DEFAULT_PROBE_DEBOUNCE_MS,
        }
    }
}

impl ClientConfig {
    /// Loads the persisted config, then applies `ORCHIX_URL`,
    /// `ORCHIX_SESSION_TOKEN` and `ORCHIX_CSRF_TOKEN` on top.
    pub fn load() -> Self {
        let mut cfg = Self::load_saved();
        cfg.apply_env();
        cfg
    }

    /// Persisted config only, for edits that are saved back.
    pub fn load_saved() -> Self {
        Self::load_file(&client_config_path())
    }

    fn load_file(path: &PathBuf) -> Self {
        match fs::read_to_string(path) {
            Ok(data) => match serde_json::from_str::<ClientConfig>(&data) {
                Ok(mut cfg) => {
                    if cfg.base_url.trim().is_empty() {
                        cfg.base_url = DEFAULT_BASE_URL.into();
                    }
                    cfg
                }
                Err(err) => {
                    warn!("Failed to parse {}: {err}", path.display());
                    ClientConfig::default()
                }
            },
            Err(err) => {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!("Failed to read {}: {err}", path.display());
                }
                ClientConfig::default()
            }
        }
    }

    fn apply_env(&mut self) {
        if let Some(url) = env_override("ORCHIX_URL") {
            self.base_url = url;
        }
        if let Some(token) = env_override("ORCHIX_SESSION_TOKEN") {
            self.session_token = token;
        }
        if let Some(token) = env_override("ORCHIX_CSRF_TOKEN") {
            self.csrf_token = token;
        }
    }

    pub fn save(&self) -> io::Result<()> {
        write_json_atomic(&client_config_path(), self)
    }

    pub fn probe_debounce(&self) -> Duration {
        Duration::from_millis(self.probe_debounce_ms)
    }
}

pub fn client_config_path() -> PathBuf {
    state_file_path(CLIENT_CONFIG_FILE)
}
